//! Queue messages passed between pipeline stages.
//!
//! Every message is a closed, tagged variant carrying only what the next stage
//! needs to resume work: the report id, where the body lives and its digest.
//! Bodies are never inlined. On the wire a message is wrapped in a versioned
//! envelope:
//!
//! ```text
//! {"version":1,"message":{"type":"convert","report_id":"...","blob_url":"...",...}}
//! ```
//!
//! Unknown `type` tags are rejected before any shape is inferred.

use std::collections::BTreeMap;

use octorouter_core::{Digest, ReportId, TaskAction, Topic};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Current envelope version.
pub const MESSAGE_VERSION: u32 = 1;

/// Names of the queues each stage consumes.
pub mod queues {
    use octorouter_core::TaskAction;

    pub const RECEIVE: &str = "receive";
    pub const CONVERT: &str = "convert";
    pub const DESTINATION_FILTER: &str = "destination-filter";
    pub const RECEIVER_FILTER: &str = "receiver-filter";
    pub const TRANSLATE: &str = "translate";
    pub const BATCH: &str = "batch";
    pub const SEND: &str = "send";

    /// All stage queues in pipeline order.
    pub const ALL: [&str; 7] = [
        RECEIVE,
        CONVERT,
        DESTINATION_FILTER,
        RECEIVER_FILTER,
        TRANSLATE,
        BATCH,
        SEND,
    ];

    /// Queue consumed by the stage performing `action`.
    pub fn for_action(action: TaskAction) -> Option<&'static str> {
        match action {
            TaskAction::Receive => Some(RECEIVE),
            TaskAction::Convert => Some(CONVERT),
            TaskAction::DestinationFilter => Some(DESTINATION_FILTER),
            TaskAction::ReceiverFilter => Some(RECEIVER_FILTER),
            TaskAction::Translate => Some(TRANSLATE),
            TaskAction::Batch => Some(BATCH),
            TaskAction::Send => Some(SEND),
            TaskAction::None => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Message of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },

    #[error("Unknown message type '{0}'")]
    UnknownType(String),

    #[error("Unsupported message version {0}")]
    UnsupportedVersion(u64),

    #[error("Malformed message: {0}")]
    Malformed(String),
}

/// Raw input handed over by the ingestion front door.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveMessage {
    pub report_id: ReportId,
    pub blob_url: Url,
    pub digest: Digest,
    #[serde(default)]
    pub blob_subfolder: Option<String>,
    /// Request headers; `client_id` names the sender and `content-type` the format.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertMessage {
    pub report_id: ReportId,
    pub blob_url: Url,
    pub digest: Digest,
    #[serde(default)]
    pub blob_subfolder: Option<String>,
    pub topic: Topic,
    #[serde(default)]
    pub schema_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationFilterMessage {
    pub report_id: ReportId,
    pub blob_url: Url,
    pub digest: Digest,
    #[serde(default)]
    pub blob_subfolder: Option<String>,
    pub topic: Topic,
}

/// Shape shared by the receiver-filter and translate messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverMessage {
    pub report_id: ReportId,
    pub blob_url: Url,
    pub digest: Digest,
    #[serde(default)]
    pub blob_subfolder: Option<String>,
    pub topic: Topic,
    pub receiver_full_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMessage {
    pub report_id: ReportId,
    pub receiver_full_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessage {
    pub report_id: ReportId,
    pub blob_url: Url,
    pub digest: Digest,
    pub receiver_full_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum QueueMessage {
    Receive(ReceiveMessage),
    Convert(ConvertMessage),
    DestinationFilter(DestinationFilterMessage),
    ReceiverFilter(ReceiverMessage),
    Translate(ReceiverMessage),
    Batch(BatchMessage),
    Send(SendMessage),
}

#[derive(Debug, Serialize)]
struct EnvelopeRef<'a> {
    version: u32,
    message: &'a QueueMessage,
}

impl QueueMessage {
    /// Wire tags of every variant.
    pub const TYPES: [&'static str; 7] = queues::ALL;

    /// The `type` tag of this message.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Receive(_) => queues::RECEIVE,
            Self::Convert(_) => queues::CONVERT,
            Self::DestinationFilter(_) => queues::DESTINATION_FILTER,
            Self::ReceiverFilter(_) => queues::RECEIVER_FILTER,
            Self::Translate(_) => queues::TRANSLATE,
            Self::Batch(_) => queues::BATCH,
            Self::Send(_) => queues::SEND,
        }
    }

    /// The queue consumed by the stage that handles this message.
    pub fn queue_name(&self) -> &'static str {
        self.type_name()
    }

    /// The action of the stage that handles this message.
    pub fn action(&self) -> TaskAction {
        match self {
            Self::Receive(_) => TaskAction::Receive,
            Self::Convert(_) => TaskAction::Convert,
            Self::DestinationFilter(_) => TaskAction::DestinationFilter,
            Self::ReceiverFilter(_) => TaskAction::ReceiverFilter,
            Self::Translate(_) => TaskAction::Translate,
            Self::Batch(_) => TaskAction::Batch,
            Self::Send(_) => TaskAction::Send,
        }
    }

    pub fn report_id(&self) -> ReportId {
        match self {
            Self::Receive(m) => m.report_id,
            Self::Convert(m) => m.report_id,
            Self::DestinationFilter(m) => m.report_id,
            Self::ReceiverFilter(m) | Self::Translate(m) => m.report_id,
            Self::Batch(m) => m.report_id,
            Self::Send(m) => m.report_id,
        }
    }

    /// Body location and digest, when the message references one.
    pub fn blob_ref(&self) -> Option<(&Url, &Digest)> {
        match self {
            Self::Receive(m) => Some((&m.blob_url, &m.digest)),
            Self::Convert(m) => Some((&m.blob_url, &m.digest)),
            Self::DestinationFilter(m) => Some((&m.blob_url, &m.digest)),
            Self::ReceiverFilter(m) | Self::Translate(m) => Some((&m.blob_url, &m.digest)),
            Self::Send(m) => Some((&m.blob_url, &m.digest)),
            Self::Batch(_) => None,
        }
    }

    pub fn topic(&self) -> Option<&Topic> {
        match self {
            Self::Convert(m) => Some(&m.topic),
            Self::DestinationFilter(m) => Some(&m.topic),
            Self::ReceiverFilter(m) | Self::Translate(m) => Some(&m.topic),
            Self::Receive(_) | Self::Batch(_) | Self::Send(_) => None,
        }
    }

    pub fn receiver_full_name(&self) -> Option<&str> {
        match self {
            Self::ReceiverFilter(m) | Self::Translate(m) => Some(&m.receiver_full_name),
            Self::Batch(m) => Some(&m.receiver_full_name),
            Self::Send(m) => Some(&m.receiver_full_name),
            Self::Receive(_) | Self::Convert(_) | Self::DestinationFilter(_) => None,
        }
    }

    /// Serializes the message into its versioned envelope.
    ///
    /// # Errors
    ///
    /// Returns `MessageError::TooLarge` if the result exceeds `max_bytes`.
    pub fn encode(&self, max_bytes: usize) -> Result<String, MessageError> {
        let json = serde_json::to_string(&EnvelopeRef {
            version: MESSAGE_VERSION,
            message: self,
        })
        .map_err(|e| MessageError::Malformed(e.to_string()))?;
        if json.len() > max_bytes {
            return Err(MessageError::TooLarge {
                size: json.len(),
                max: max_bytes,
            });
        }
        Ok(json)
    }

    /// Parses a versioned envelope.
    ///
    /// # Errors
    ///
    /// - `MessageError::TooLarge` if `raw` exceeds `max_bytes`
    /// - `MessageError::UnsupportedVersion` for any version but the current one
    /// - `MessageError::UnknownType` for an unrecognised `type` tag
    /// - `MessageError::Malformed` for anything else that does not fit
    pub fn decode(raw: &str, max_bytes: usize) -> Result<Self, MessageError> {
        if raw.len() > max_bytes {
            return Err(MessageError::TooLarge {
                size: raw.len(),
                max: max_bytes,
            });
        }

        let mut envelope: Value =
            serde_json::from_str(raw).map_err(|e| MessageError::Malformed(e.to_string()))?;

        let version = envelope
            .get("version")
            .and_then(Value::as_u64)
            .ok_or_else(|| MessageError::Malformed("missing envelope version".into()))?;
        if version != u64::from(MESSAGE_VERSION) {
            return Err(MessageError::UnsupportedVersion(version));
        }

        let message = envelope
            .get_mut("message")
            .map(Value::take)
            .ok_or_else(|| MessageError::Malformed("missing message body".into()))?;
        let tag = message
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| MessageError::Malformed("missing message type".into()))?;
        if !Self::TYPES.iter().any(|known| *known == tag) {
            return Err(MessageError::UnknownType(tag.to_string()));
        }

        serde_json::from_value(message).map_err(|e| MessageError::Malformed(e.to_string()))
    }
}
