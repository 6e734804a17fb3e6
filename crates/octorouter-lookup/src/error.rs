//! Lookup error types.

use std::path::PathBuf;

use octorouter_core::ErrorCategory;

/// Errors raised while loading or querying lookup tables.
///
/// Every variant except [`LookupError::Csv`] and [`LookupError::Io`] points at a
/// deployment problem (a missing table or column) rather than bad input data.
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    /// A predicate or select referenced a column the table does not have.
    #[error("Unknown column '{column}' in lookup table '{table}'")]
    UnknownColumn {
        /// Table name.
        table: String,
        /// Requested column.
        column: String,
    },

    /// The header row names the same column twice.
    #[error("Duplicate column '{column}' in lookup table '{table}'")]
    DuplicateColumn {
        /// Table name.
        table: String,
        /// Duplicated column.
        column: String,
    },

    /// The source had no header row.
    #[error("Lookup table '{table}' has no header row")]
    EmptyTable {
        /// Table name.
        table: String,
    },

    /// A data row is wider or narrower than the header.
    #[error("Row {row} of lookup table '{table}' has {actual} values, expected {expected}")]
    RowWidth {
        /// Table name.
        table: String,
        /// 1-based data row number.
        row: usize,
        /// Header width.
        expected: usize,
        /// Row width.
        actual: usize,
    },

    /// The requested table or version is not registered.
    #[error("Lookup table not found: {name}{}", .version.map(|v| format!(" (version {v})")).unwrap_or_default())]
    TableNotFound {
        /// Table name.
        name: String,
        /// Requested version, if any.
        version: Option<u32>,
    },

    /// CSV decoding failed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Reading a table file failed.
    #[error("Failed to read lookup table {}: {source}", .path.display())]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl LookupError {
    /// Creates a new `UnknownColumn` error.
    #[must_use]
    pub fn unknown_column(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self::UnknownColumn {
            table: table.into(),
            column: column.into(),
        }
    }

    /// Creates a new `TableNotFound` error.
    #[must_use]
    pub fn table_not_found(name: impl Into<String>, version: Option<u32>) -> Self {
        Self::TableNotFound {
            name: name.into(),
            version,
        }
    }

    /// Creates a new `Io` error.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UnknownColumn { .. } | Self::TableNotFound { .. } => {
                ErrorCategory::Configuration
            }
            Self::DuplicateColumn { .. } | Self::EmptyTable { .. } | Self::RowWidth { .. } => {
                ErrorCategory::Validation
            }
            Self::Csv(_) => ErrorCategory::Parse,
            Self::Io { .. } => ErrorCategory::System,
        }
    }
}

/// Type alias for a lookup result.
pub type LookupResult<T> = Result<T, LookupError>;
