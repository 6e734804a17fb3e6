//! Per-action log collection.
//!
//! Stages never abort on an item-level problem; they record it here against
//! the item's 1-based index and carry on. The runner persists the collected
//! logs on the action record of the stage run.

use crate::error::PipelineError;
use crate::filters::FilterType;

pub use octorouter_storage::{ActionLog, ErrorCode, LogLevel, LogScope};

/// "Item 3 in the report was not parseable. Reason: ..."
pub fn item_parse_message(index: usize, reason: &str) -> String {
    format!("Item {index} in the report was not parseable. Reason: {reason}")
}

pub fn item_validation_message(index: usize, reason: &str) -> String {
    format!("Item {index} in the report was not valid. Reason: {reason}")
}

pub fn item_conversion_message(index: usize, reason: &str) -> String {
    format!("Item {index} in the report was not convertible. Reason: {reason}")
}

pub fn filtered_message(receiver_full_name: &str, filter_type: FilterType, filter: &str) -> String {
    format!(
        "Item was not routed to {receiver_full_name} because it did not pass the {filter_type}. \
         Item failed on: {filter}"
    )
}

/// Log code for a pipeline error.
pub fn error_code(err: &PipelineError) -> ErrorCode {
    match err {
        PipelineError::Conversion { .. } => ErrorCode::InvalidMsgConversion,
        PipelineError::Parse { .. } => ErrorCode::InvalidMsgParse,
        PipelineError::Validation { .. } => ErrorCode::InvalidMsgValidation,
        PipelineError::Integrity { .. } => ErrorCode::InvalidDigest,
        _ => ErrorCode::Unknown,
    }
}

/// Collects the logs of one stage run.
#[derive(Debug, Clone, Default)]
pub struct ActionLogger {
    logs: Vec<ActionLog>,
}

impl ActionLogger {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, log: ActionLog) {
        match log.level {
            LogLevel::Error => tracing::warn!(
                code = %log.code,
                index = ?log.index,
                tracking_id = ?log.tracking_id,
                "{}",
                log.message
            ),
            LogLevel::Warning => tracing::debug!(
                code = %log.code,
                index = ?log.index,
                "{}",
                log.message
            ),
        }
        self.logs.push(log);
    }

    fn report_log(&mut self, level: LogLevel, code: ErrorCode, message: impl Into<String>) {
        self.push(ActionLog {
            scope: LogScope::Report,
            index: None,
            tracking_id: None,
            level,
            code,
            message: message.into(),
        });
    }

    /// A warning about the report as a whole.
    pub fn warn(&mut self, code: ErrorCode, message: impl Into<String>) {
        self.report_log(LogLevel::Warning, code, message);
    }

    /// An error about the report as a whole.
    pub fn error(&mut self, code: ErrorCode, message: impl Into<String>) {
        self.report_log(LogLevel::Error, code, message);
    }

    /// A logger scoped to item `index` (1-based).
    pub fn item_logger(&mut self, index: usize, tracking_id: Option<String>) -> ItemLogger<'_> {
        ItemLogger {
            parent: self,
            index,
            tracking_id,
        }
    }

    pub fn has_errors(&self) -> bool {
        self.logs.iter().any(|log| log.level == LogLevel::Error)
    }

    pub fn logs(&self) -> &[ActionLog] {
        &self.logs
    }

    pub fn into_logs(self) -> Vec<ActionLog> {
        self.logs
    }
}

/// Logs against a single item.
#[derive(Debug)]
pub struct ItemLogger<'a> {
    parent: &'a mut ActionLogger,
    index: usize,
    tracking_id: Option<String>,
}

impl ItemLogger<'_> {
    fn log(&mut self, level: LogLevel, code: ErrorCode, message: impl Into<String>) {
        self.parent.push(ActionLog {
            scope: LogScope::Item,
            index: Some(self.index),
            tracking_id: self.tracking_id.clone(),
            level,
            code,
            message: message.into(),
        });
    }

    pub fn warn(&mut self, code: ErrorCode, message: impl Into<String>) {
        self.log(LogLevel::Warning, code, message);
    }

    pub fn error(&mut self, code: ErrorCode, message: impl Into<String>) {
        self.log(LogLevel::Error, code, message);
    }

    /// Records an item-level pipeline error with the matching code and text.
    pub fn failure(&mut self, err: &PipelineError) {
        let message = match err {
            PipelineError::Conversion { message } => item_conversion_message(self.index, message),
            PipelineError::Parse { message } => item_parse_message(self.index, message),
            PipelineError::Validation { message } => item_validation_message(self.index, message),
            other => other.to_string(),
        };
        self.error(error_code(err), message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_scoping() {
        let mut logger = ActionLogger::new();
        logger.warn(ErrorCode::Unknown, "whole report");
        {
            let mut item = logger.item_logger(2, Some("MSG-2".into()));
            item.warn(ErrorCode::UnmappableCondition, "Missing mapping for code(s): 1234");
        }
        assert!(!logger.has_errors());

        let logs = logger.logs();
        assert_eq!(logs[0].scope, LogScope::Report);
        assert_eq!(logs[0].index, None);
        assert_eq!(logs[1].scope, LogScope::Item);
        assert_eq!(logs[1].index, Some(2));
        assert_eq!(logs[1].tracking_id.as_deref(), Some("MSG-2"));
    }

    #[test]
    fn test_failure_messages() {
        let mut logger = ActionLogger::new();
        logger
            .item_logger(1, None)
            .failure(&PipelineError::parse("unexpected end of input"));
        logger
            .item_logger(3, None)
            .failure(&PipelineError::validation("bundle has no entries"));
        logger
            .item_logger(4, None)
            .failure(&PipelineError::integrity("digest differs"));
        assert!(logger.has_errors());

        let logs = logger.into_logs();
        assert_eq!(logs[0].code, ErrorCode::InvalidMsgParse);
        assert_eq!(
            logs[0].message,
            "Item 1 in the report was not parseable. Reason: unexpected end of input"
        );
        assert_eq!(logs[1].code, ErrorCode::InvalidMsgValidation);
        assert!(logs[1].message.starts_with("Item 3 in the report was not valid."));
        assert_eq!(logs[2].code, ErrorCode::InvalidDigest);
    }

    #[test]
    fn test_filtered_message() {
        assert_eq!(
            filtered_message("ig-phd.elr", FilterType::Quality, "%messageId.exists()"),
            "Item was not routed to ig-phd.elr because it did not pass the QUALITY_FILTER. \
             Item failed on: %messageId.exists()"
        );
    }
}
