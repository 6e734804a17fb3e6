//! Pipeline error types.
//!
//! Errors are split by how far they reach: item-level errors (integrity, parse,
//! validation) are attached to one item and never stop its siblings, everything
//! else fails the stage run and leaves the message for redelivery.

use octorouter_core::{CoreError, ErrorCategory, TaskAction};
use octorouter_lookup::LookupError;
use octorouter_storage::StorageError;

use crate::expression::ExpressionError;
use crate::message::MessageError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Downloaded content does not match the digest carried by the message.
    #[error("Integrity check failed: {message}")]
    Integrity { message: String },

    #[error("Parse error: {message}")]
    Parse { message: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Conversion error: {message}")]
    Conversion { message: String },

    /// Missing table, column, schema or malformed settings.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The stage was handed a message of another stage.
    #[error("Stage {stage} cannot process a '{message_type}' message")]
    UnexpectedMessage {
        stage: TaskAction,
        message_type: &'static str,
    },

    #[error("Delivery to {receiver} failed: {message}")]
    Transport { receiver: String, message: String },

    #[error("Stage {stage} timed out after {seconds}s")]
    Timeout { stage: TaskAction, seconds: u64 },

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error(transparent)]
    Storage(StorageError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Core(CoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    #[must_use]
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn conversion(message: impl Into<String>) -> Self {
        Self::Conversion {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    #[must_use]
    pub fn unexpected_message(stage: TaskAction, message_type: &'static str) -> Self {
        Self::UnexpectedMessage {
            stage,
            message_type,
        }
    }

    #[must_use]
    pub fn transport(receiver: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            receiver: receiver.into(),
            message: message.into(),
        }
    }

    /// Returns the error category for logging/monitoring purposes.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Integrity { .. } => ErrorCategory::Integrity,
            Self::Parse { .. } | Self::Conversion { .. } => ErrorCategory::Parse,
            Self::Validation { .. } => ErrorCategory::Validation,
            // a broken reference table is a deployment problem, never the item's fault
            Self::Configuration { .. } | Self::Expression(_) | Self::Lookup(_) => {
                ErrorCategory::Configuration
            }
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::UnexpectedMessage { .. } | Self::Message(_) | Self::Json(_) => {
                ErrorCategory::Serialization
            }
            Self::Transport { .. } | Self::Timeout { .. } => ErrorCategory::System,
            Self::Storage(e) => e.category(),
            Self::Core(e) => e.category(),
        }
    }

    /// Errors that belong to one item and never stop its siblings or trigger a
    /// retry: the same bytes would fail the same way again.
    pub fn is_item_level(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Integrity | ErrorCategory::Parse | ErrorCategory::Validation
        )
    }
}

impl From<StorageError> for PipelineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::DigestMismatch {
                url,
                expected,
                actual,
            } => Self::integrity(format!(
                "digest of {url} is {actual}, message carries {expected}"
            )),
            other => Self::Storage(other),
        }
    }
}

impl From<CoreError> for PipelineError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::DigestMismatch { .. } | CoreError::InvalidDigest(_) => {
                Self::integrity(err.to_string())
            }
            CoreError::Configuration(message) => Self::configuration(message),
            other => Self::Core(other),
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
