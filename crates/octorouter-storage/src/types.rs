//! Storage types for the pipeline storage abstraction layer.
//!
//! This module defines all data types used by the storage traits.

use std::fmt;

use octorouter_core::{Digest, MimeFormat, ReportId, TaskAction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use url::Url;

use crate::error::StorageError;

/// Top-level folder a blob is written to, one per producing action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlobFolder {
    /// Raw input as received.
    Receive,
    /// Convert output.
    Process,
    /// Destination-filter output.
    Route,
    ReceiverFilter,
    Translate,
    Batch,
    /// Send output.
    Ready,
    /// Terminal no-op reports.
    None,
}

impl BlobFolder {
    /// Folder that holds the output of `action`.
    #[must_use]
    pub fn for_action(action: TaskAction) -> Self {
        match action {
            TaskAction::Receive => Self::Receive,
            TaskAction::Convert => Self::Process,
            TaskAction::DestinationFilter => Self::Route,
            TaskAction::ReceiverFilter => Self::ReceiverFilter,
            TaskAction::Translate => Self::Translate,
            TaskAction::Batch => Self::Batch,
            TaskAction::Send => Self::Ready,
            TaskAction::None => Self::None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Receive => "receive",
            Self::Process => "process",
            Self::Route => "route",
            Self::ReceiverFilter => "receiver-filter",
            Self::Translate => "translate",
            Self::Batch => "batch",
            Self::Ready => "ready",
            Self::None => "none",
        }
    }
}

impl fmt::Display for BlobFolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds the location of a report body below `base`:
/// `<base>/<subfolder/>?<folder>/<report_id>.<ext>`.
///
/// # Errors
///
/// Returns `StorageError::InvalidLocation` if the subfolder contains empty,
/// `.` or `..` segments, or the result is not a valid URL.
pub fn blob_url(
    base: &Url,
    folder: BlobFolder,
    subfolder: Option<&str>,
    report_id: ReportId,
    format: MimeFormat,
) -> Result<Url, StorageError> {
    let mut path = String::new();
    if let Some(sub) = subfolder.map(|s| s.trim_matches('/')).filter(|s| !s.is_empty()) {
        if sub
            .split('/')
            .any(|seg| seg.is_empty() || seg == "." || seg == "..")
        {
            return Err(StorageError::invalid_location(format!(
                "invalid subfolder '{sub}'"
            )));
        }
        path.push_str(sub);
        path.push('/');
    }
    path.push_str(folder.as_str());
    path.push('/');
    path.push_str(&format!("{report_id}.{}", format.extension()));

    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(&path)
        .map_err(|e| StorageError::invalid_location(e.to_string()))
}

/// Where an uploaded body lives and what it hashes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobInfo {
    pub url: Url,
    pub digest: Digest,
    pub format: MimeFormat,
}

/// A message leased from a work queue.
///
/// The `receipt` identifies this particular lease; once the lease expires and
/// the message is handed out again, the old receipt can no longer ack it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: String,
    pub receipt: String,
    pub queue: String,
    pub payload: String,
    /// How many times the message has been handed out, including this time.
    pub dequeue_count: u32,
}

/// Name of the dead-letter queue for `queue`.
#[must_use]
pub fn poison_queue(queue: &str) -> String {
    format!("{queue}-poison")
}

/// Whether a log line concerns the whole report or one item in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogScope {
    Report,
    Item,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Warning,
    Error,
}

/// Machine-readable code attached to every action log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMsgParse,
    InvalidMsgValidation,
    InvalidMsgConversion,
    InvalidDigest,
    UnmappableCondition,
    ItemFiltered,
    Unknown,
}

impl ErrorCode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidMsgParse => "INVALID_MSG_PARSE",
            Self::InvalidMsgValidation => "INVALID_MSG_VALIDATION",
            Self::InvalidMsgConversion => "INVALID_MSG_CONVERSION",
            Self::InvalidDigest => "INVALID_DIGEST",
            Self::UnmappableCondition => "UNMAPPABLE_CONDITION",
            Self::ItemFiltered => "ITEM_FILTERED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured log line produced while a stage handled a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionLog {
    pub scope: LogScope,
    /// 1-based item index for item-scoped logs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracking_id: Option<String>,
    pub level: LogLevel,
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    /// The stage finished; item-level problems may still be logged.
    Success,
    /// The stage hit a stage-level error and the message will be retried.
    Failed,
    /// The input was refused outright and will not be retried.
    Rejected,
}

/// Audit record of one stage run over one input report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action: TaskAction,
    pub report_id: ReportId,
    pub outcome: ActionOutcome,
    #[serde(default)]
    pub logs: Vec<ActionLog>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    /// Free-form parameters, e.g. the queue message that was processed.
    #[serde(default)]
    pub params: Value,
}

impl ActionRecord {
    /// Creates a record that starts and finishes now.
    #[must_use]
    pub fn new(action: TaskAction, report_id: ReportId, outcome: ActionOutcome) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            action,
            report_id,
            outcome,
            logs: Vec::new(),
            started_at: now,
            finished_at: now,
            params: Value::Null,
        }
    }

    #[must_use]
    pub fn with_logs(mut self, logs: Vec<ActionLog>) -> Self {
        self.logs = logs;
        self
    }

    #[must_use]
    pub fn with_started_at(mut self, started_at: OffsetDateTime) -> Self {
        self.started_at = started_at;
        self
    }

    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Returns `true` if any log line is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.logs.iter().any(|l| l.level == LogLevel::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("memory://reports/").unwrap()
    }

    #[test]
    fn test_blob_folder_for_action() {
        assert_eq!(BlobFolder::for_action(TaskAction::Convert), BlobFolder::Process);
        assert_eq!(BlobFolder::for_action(TaskAction::Send), BlobFolder::Ready);
        assert_eq!(
            BlobFolder::for_action(TaskAction::ReceiverFilter).as_str(),
            "receiver-filter"
        );
    }

    #[test]
    fn test_blob_url_layout() {
        let id = ReportId::new();
        let url = blob_url(&base(), BlobFolder::Process, None, id, MimeFormat::Fhir).unwrap();
        assert_eq!(url.as_str(), format!("memory://reports/process/{id}.fhir"));

        let url = blob_url(
            &base(),
            BlobFolder::Receive,
            Some("/lab.sender/"),
            id,
            MimeFormat::Hl7,
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            format!("memory://reports/lab.sender/receive/{id}.hl7")
        );
    }

    #[test]
    fn test_blob_url_base_without_trailing_slash() {
        let id = ReportId::new();
        let base = Url::parse("memory://reports/root").unwrap();
        let url = blob_url(&base, BlobFolder::Ready, None, id, MimeFormat::Fhir).unwrap();
        assert_eq!(url.as_str(), format!("memory://reports/root/ready/{id}.fhir"));
    }

    #[test]
    fn test_blob_url_rejects_traversal() {
        let err = blob_url(
            &base(),
            BlobFolder::Receive,
            Some("a/../b"),
            ReportId::new(),
            MimeFormat::Fhir,
        )
        .unwrap_err();
        assert!(matches!(err, StorageError::InvalidLocation { .. }));
    }

    #[test]
    fn test_error_code_serialization() {
        let json = serde_json::to_string(&ErrorCode::UnmappableCondition).unwrap();
        assert_eq!(json, "\"UNMAPPABLE_CONDITION\"");
        assert_eq!(ErrorCode::ItemFiltered.to_string(), "ITEM_FILTERED");
    }

    #[test]
    fn test_action_record_has_errors() {
        let record = ActionRecord::new(TaskAction::Convert, ReportId::new(), ActionOutcome::Success)
            .with_logs(vec![ActionLog {
                scope: LogScope::Item,
                index: Some(2),
                tracking_id: None,
                level: LogLevel::Warning,
                code: ErrorCode::UnmappableCondition,
                message: "no mapping".into(),
            }]);
        assert!(!record.has_errors());
        assert_eq!(poison_queue("convert"), "convert-poison");
    }
}
