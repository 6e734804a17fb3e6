//! Reports and item lineage.
//!
//! A [`Report`] is one artifact at one pipeline step. Reports are values: the
//! builder methods consume `self` and hand back a new report, and nothing in the
//! pipeline mutates a report after its body has been uploaded. Every derived
//! report carries [`ItemLineage`] edges back to the report it came from.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use url::Url;

use crate::digest::Digest;
use crate::error::{CoreError, Result};
use crate::id::ReportId;

/// Wire format of a report body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MimeFormat {
    Hl7,
    Fhir,
    Csv,
}

impl MimeFormat {
    /// Resolve a `content-type` header value. Parameters after `;` are ignored.
    pub fn from_mime_type(mime: &str) -> Result<Self> {
        let base = mime.split(';').next().unwrap_or_default().trim();
        match base.to_ascii_lowercase().as_str() {
            "application/hl7-v2" | "x-application/hl7-v2+er7" => Ok(Self::Hl7),
            "application/fhir+ndjson" | "application/fhir+json" | "application/json" => {
                Ok(Self::Fhir)
            }
            "text/csv" => Ok(Self::Csv),
            _ => Err(CoreError::unsupported_format(mime)),
        }
    }

    /// Resolve a blob file extension.
    pub fn from_extension(ext: &str) -> Result<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "hl7" => Ok(Self::Hl7),
            "fhir" | "ndjson" | "json" => Ok(Self::Fhir),
            "csv" => Ok(Self::Csv),
            _ => Err(CoreError::unsupported_format(ext)),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Hl7 => "hl7",
            Self::Fhir => "fhir",
            Self::Csv => "csv",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Hl7 => "application/hl7-v2",
            Self::Fhir => "application/fhir+ndjson",
            Self::Csv => "text/csv",
        }
    }
}

impl fmt::Display for MimeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hl7 => write!(f, "HL7"),
            Self::Fhir => write!(f, "FHIR"),
            Self::Csv => write!(f, "CSV"),
        }
    }
}

/// Routing domain of a report, e.g. `covid-19` or `full-elr`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub fn new(topic: impl Into<String>) -> Self {
        Self(topic.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Topic {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Pipeline steps. A report's `next_action` names the step that consumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    Receive,
    Convert,
    DestinationFilter,
    ReceiverFilter,
    Translate,
    Batch,
    Send,
    /// Terminal: nothing further happens to the report.
    None,
}

impl TaskAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Receive => "receive",
            Self::Convert => "convert",
            Self::DestinationFilter => "destination_filter",
            Self::ReceiverFilter => "receiver_filter",
            Self::Translate => "translate",
            Self::Batch => "batch",
            Self::Send => "send",
            Self::None => "none",
        }
    }
}

impl fmt::Display for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskAction {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "receive" => Ok(Self::Receive),
            "convert" => Ok(Self::Convert),
            "destination_filter" => Ok(Self::DestinationFilter),
            "receiver_filter" => Ok(Self::ReceiverFilter),
            "translate" => Ok(Self::Translate),
            "batch" => Ok(Self::Batch),
            "send" => Ok(Self::Send),
            "none" => Ok(Self::None),
            other => Err(CoreError::configuration(format!("unknown task action '{other}'"))),
        }
    }
}

/// A parent item to child item edge. Indexes are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemLineage {
    pub parent_report_id: ReportId,
    pub parent_index: usize,
    pub child_report_id: ReportId,
    pub child_index: usize,
    /// Digest of the child item's content
    pub item_hash: Digest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_id: Option<String>,
}

/// One artifact at one pipeline step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: ReportId,
    pub format: MimeFormat,
    pub item_count: usize,
    pub topic: Topic,
    /// Full name (`org.name`) of the receiver this copy is addressed to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    /// Full name of the sender that submitted the root report
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    pub next_action: TaskAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_url: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    #[serde(default)]
    pub lineage: Vec<ItemLineage>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Report {
    /// A new single-item report with a fresh id.
    pub fn new(format: MimeFormat, topic: Topic, next_action: TaskAction) -> Self {
        Self::with_id(ReportId::new(), format, topic, next_action)
    }

    /// A report whose id was assigned elsewhere, e.g. by the ingestion front door.
    pub fn with_id(
        id: ReportId,
        format: MimeFormat,
        topic: Topic,
        next_action: TaskAction,
    ) -> Self {
        Self {
            id,
            format,
            item_count: 1,
            topic,
            receiver: None,
            sender: None,
            next_action,
            body_url: None,
            digest: None,
            lineage: Vec::new(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_item_count(mut self, item_count: usize) -> Self {
        self.item_count = item_count;
        self
    }

    pub fn with_receiver(mut self, receiver: impl Into<String>) -> Self {
        self.receiver = Some(receiver.into());
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Record where the body lives and what it hashes to.
    pub fn with_body(mut self, url: Url, digest: Digest) -> Self {
        self.body_url = Some(url);
        self.digest = Some(digest);
        self
    }

    /// Add a lineage edge from `parent_index` of `parent` to this report's item 1.
    pub fn with_parent(
        mut self,
        parent: ReportId,
        parent_index: usize,
        item_hash: Digest,
        tracking_id: Option<String>,
    ) -> Self {
        self.lineage.push(ItemLineage {
            parent_report_id: parent,
            parent_index,
            child_report_id: self.id,
            child_index: 1,
            item_hash,
            tracking_id,
        });
        self
    }

    pub fn is_root(&self) -> bool {
        self.lineage.is_empty()
    }

    pub fn parent_ids(&self) -> impl Iterator<Item = ReportId> + '_ {
        self.lineage.iter().map(|edge| edge.parent_report_id)
    }
}
