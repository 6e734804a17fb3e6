//! Storage error types for the pipeline storage abstraction layer.

use octorouter_core::{CoreError, ErrorCategory};

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The requested blob, report or delivery was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What was looked up ("blob", "report", "delivery").
        kind: &'static str,
        /// Identifier that was not found.
        id: String,
    },

    /// A write-once location already holds different content.
    #[error("Conflict: {message}")]
    Conflict {
        /// Description of the conflict.
        message: String,
    },

    /// Downloaded content does not hash to the expected digest.
    #[error("Digest mismatch for {url}: expected {expected}, computed {actual}")]
    DigestMismatch {
        /// Blob location.
        url: String,
        /// Digest carried by the message.
        expected: String,
        /// Digest of the bytes actually stored.
        actual: String,
    },

    /// Recording an edge would make the lineage graph cyclic.
    #[error("Lineage cycle: {parent} -> {child} would create a cycle")]
    LineageCycle {
        /// Parent report id.
        parent: String,
        /// Child report id.
        child: String,
    },

    /// A location could not be built or parsed.
    #[error("Invalid location: {message}")]
    InvalidLocation {
        /// Description of the problem.
        message: String,
    },

    /// A delivery lease expired before it was acknowledged.
    #[error("Lease expired for delivery {id}")]
    LeaseExpired {
        /// Delivery id.
        id: String,
    },

    /// An internal storage error occurred.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl StorageError {
    /// Creates a new `NotFound` error.
    #[must_use]
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Creates a new `Conflict` error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Creates a new `DigestMismatch` error.
    #[must_use]
    pub fn digest_mismatch(
        url: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::DigestMismatch {
            url: url.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Creates a new `LineageCycle` error.
    #[must_use]
    pub fn lineage_cycle(parent: impl ToString, child: impl ToString) -> Self {
        Self::LineageCycle {
            parent: parent.to_string(),
            child: child.to_string(),
        }
    }

    /// Creates a new `InvalidLocation` error.
    #[must_use]
    pub fn invalid_location(message: impl Into<String>) -> Self {
        Self::InvalidLocation {
            message: message.into(),
        }
    }

    /// Creates a new `LeaseExpired` error.
    #[must_use]
    pub fn lease_expired(id: impl Into<String>) -> Self {
        Self::LeaseExpired { id: id.into() }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns `true` if this is a not found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` if this is a digest mismatch.
    #[must_use]
    pub fn is_digest_mismatch(&self) -> bool {
        matches!(self, Self::DigestMismatch { .. })
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::DigestMismatch { .. } => ErrorCategory::Integrity,
            Self::InvalidLocation { .. } => ErrorCategory::Validation,
            Self::Conflict { .. } | Self::LineageCycle { .. } | Self::LeaseExpired { .. } => {
                ErrorCategory::Storage
            }
            Self::Internal { .. } => ErrorCategory::System,
        }
    }
}

impl From<CoreError> for StorageError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::DigestMismatch {
                location,
                expected,
                actual,
            } => Self::digest_mismatch(location, expected, actual),
            CoreError::UrlError(e) => Self::invalid_location(e.to_string()),
            other => Self::internal(other.to_string()),
        }
    }
}
