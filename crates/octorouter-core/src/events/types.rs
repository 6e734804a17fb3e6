//! Event types emitted by pipeline stages.
//!
//! Events are fire-and-forget observability records. Nothing in the pipeline
//! depends on an event being delivered.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::ErrorCategory;
use crate::id::ReportId;
use crate::report::{TaskAction, Topic};

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEventKind {
    /// A raw submission was accepted for processing
    ReportReceived {
        report_id: ReportId,
        sender: String,
        topic: Topic,
    },
    /// A copy of an item was created for a receiver
    ItemRouted {
        report_id: ReportId,
        parent_report_id: ReportId,
        receiver: String,
        topic: Topic,
    },
    /// A receiver did not take an item
    ItemNotRouted {
        report_id: ReportId,
        receiver: String,
        topic: Topic,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
        reason: String,
    },
    /// No receiver matched; terminal and successful
    NoReceivers {
        report_id: ReportId,
        topic: Topic,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
    },
    /// A receiver-level filter rejected an item
    ItemFilteredOut {
        report_id: ReportId,
        receiver: String,
        filter_type: String,
        filter: String,
    },
    /// An item could not be processed
    ItemFailed {
        report_id: ReportId,
        index: Option<usize>,
        stage: TaskAction,
        category: ErrorCategory,
        message: String,
    },
    /// A report was handed to the transport
    ReportSent {
        report_id: ReportId,
        receiver: String,
    },
}

impl PipelineEventKind {
    /// Returns the event name as used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReportReceived { .. } => "report_received",
            Self::ItemRouted { .. } => "item_routed",
            Self::ItemNotRouted { .. } => "item_not_routed",
            Self::NoReceivers { .. } => "no_receivers",
            Self::ItemFilteredOut { .. } => "item_filtered_out",
            Self::ItemFailed { .. } => "item_failed",
            Self::ReportSent { .. } => "report_sent",
        }
    }

    pub fn report_id(&self) -> ReportId {
        match self {
            Self::ReportReceived { report_id, .. }
            | Self::ItemRouted { report_id, .. }
            | Self::ItemNotRouted { report_id, .. }
            | Self::NoReceivers { report_id, .. }
            | Self::ItemFilteredOut { report_id, .. }
            | Self::ItemFailed { report_id, .. }
            | Self::ReportSent { report_id, .. } => *report_id,
        }
    }
}

/// A timestamped pipeline event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    #[serde(flatten)]
    pub kind: PipelineEventKind,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl PipelineEvent {
    pub fn new(kind: PipelineEventKind) -> Self {
        Self {
            kind,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn report_received(report_id: ReportId, sender: impl Into<String>, topic: Topic) -> Self {
        Self::new(PipelineEventKind::ReportReceived {
            report_id,
            sender: sender.into(),
            topic,
        })
    }

    pub fn item_routed(
        report_id: ReportId,
        parent_report_id: ReportId,
        receiver: impl Into<String>,
        topic: Topic,
    ) -> Self {
        Self::new(PipelineEventKind::ItemRouted {
            report_id,
            parent_report_id,
            receiver: receiver.into(),
            topic,
        })
    }

    pub fn item_not_routed(
        report_id: ReportId,
        receiver: impl Into<String>,
        topic: Topic,
        sender: Option<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(PipelineEventKind::ItemNotRouted {
            report_id,
            receiver: receiver.into(),
            topic,
            sender,
            reason: reason.into(),
        })
    }

    pub fn no_receivers(report_id: ReportId, topic: Topic, sender: Option<String>) -> Self {
        Self::new(PipelineEventKind::NoReceivers {
            report_id,
            topic,
            sender,
        })
    }

    pub fn item_filtered_out(
        report_id: ReportId,
        receiver: impl Into<String>,
        filter_type: impl Into<String>,
        filter: impl Into<String>,
    ) -> Self {
        Self::new(PipelineEventKind::ItemFilteredOut {
            report_id,
            receiver: receiver.into(),
            filter_type: filter_type.into(),
            filter: filter.into(),
        })
    }

    pub fn item_failed(
        report_id: ReportId,
        index: Option<usize>,
        stage: TaskAction,
        category: ErrorCategory,
        message: impl Into<String>,
    ) -> Self {
        Self::new(PipelineEventKind::ItemFailed {
            report_id,
            index,
            stage,
            category,
            message: message.into(),
        })
    }

    pub fn report_sent(report_id: ReportId, receiver: impl Into<String>) -> Self {
        Self::new(PipelineEventKind::ReportSent {
            report_id,
            receiver: receiver.into(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn report_id(&self) -> ReportId {
        self.kind.report_id()
    }
}
