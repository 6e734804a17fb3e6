use thiserror::Error;

/// Core error types for OctoRouter operations
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid report ID: {0}")]
    InvalidId(String),

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("Digest mismatch for {location}: expected {expected}, computed {actual}")]
    DigestMismatch {
        location: String,
        expected: String,
        actual: String,
    },

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid lineage: {message}")]
    InvalidLineage { message: String },

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("UUID error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("URL parsing error: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl CoreError {
    /// Create a new InvalidId error
    pub fn invalid_id(id: impl Into<String>) -> Self {
        Self::InvalidId(id.into())
    }

    /// Create a new InvalidDigest error
    pub fn invalid_digest(digest: impl Into<String>) -> Self {
        Self::InvalidDigest(digest.into())
    }

    /// Create a new DigestMismatch error
    pub fn digest_mismatch(
        location: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::DigestMismatch {
            location: location.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a new UnsupportedFormat error
    pub fn unsupported_format(format: impl Into<String>) -> Self {
        Self::UnsupportedFormat(format.into())
    }

    /// Create a new InvalidLineage error
    pub fn invalid_lineage(message: impl Into<String>) -> Self {
        Self::InvalidLineage {
            message: message.into(),
        }
    }

    /// Create a new Configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Errors caused by the data itself. The pipeline skips the item and keeps going.
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidId(_)
                | Self::InvalidDigest(_)
                | Self::DigestMismatch { .. }
                | Self::UnsupportedFormat(_)
                | Self::JsonError(_)
        )
    }

    /// Errors that point at a deployment or programming problem.
    pub fn is_system_error(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::InvalidLineage { .. }
                | Self::UuidError(_)
                | Self::UrlError(_)
        )
    }

    /// Get error category for logging/monitoring
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidId(_) | Self::InvalidDigest(_) => ErrorCategory::Validation,
            Self::DigestMismatch { .. } => ErrorCategory::Integrity,
            Self::UnsupportedFormat(_) => ErrorCategory::Parse,
            Self::InvalidLineage { .. } => ErrorCategory::Storage,
            Self::JsonError(_) => ErrorCategory::Serialization,
            Self::UuidError(_) | Self::UrlError(_) => ErrorCategory::System,
            Self::Configuration(_) => ErrorCategory::Configuration,
        }
    }
}

/// Error categories for monitoring and classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Downloaded content does not match its digest
    Integrity,
    /// Malformed wire-format input
    Parse,
    /// Well-formed input that fails validation
    Validation,
    /// Missing table, column, schema or bad filter expression
    Configuration,
    NotFound,
    Serialization,
    Storage,
    System,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integrity => write!(f, "integrity"),
            Self::Parse => write!(f, "parse"),
            Self::Validation => write!(f, "validation"),
            Self::Configuration => write!(f, "configuration"),
            Self::NotFound => write!(f, "not_found"),
            Self::Serialization => write!(f, "serialization"),
            Self::Storage => write!(f, "storage"),
            Self::System => write!(f, "system"),
        }
    }
}

/// Convenience result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_mismatch_error() {
        let err = CoreError::digest_mismatch("memory://reports/a.fhir", "aa", "bb");
        assert_eq!(
            err.to_string(),
            "Digest mismatch for memory://reports/a.fhir: expected aa, computed bb"
        );
        assert!(err.is_data_error());
        assert!(!err.is_system_error());
        assert_eq!(err.category(), ErrorCategory::Integrity);
    }

    #[test]
    fn test_configuration_error() {
        let err = CoreError::configuration("missing table observation-mapping");
        assert_eq!(
            err.to_string(),
            "Configuration error: missing table observation-mapping"
        );
        assert!(err.is_system_error());
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }

    #[test]
    fn test_invalid_lineage_error() {
        let err = CoreError::invalid_lineage("cycle");
        assert_eq!(err.category(), ErrorCategory::Storage);
        assert!(!err.is_data_error());
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: CoreError = json_err.into();
        assert!(err.is_data_error());
        assert_eq!(err.category(), ErrorCategory::Serialization);
    }

    #[test]
    fn test_error_category_display() {
        assert_eq!(ErrorCategory::Integrity.to_string(), "integrity");
        assert_eq!(ErrorCategory::NotFound.to_string(), "not_found");
        assert_eq!(ErrorCategory::Configuration.to_string(), "configuration");
    }
}
