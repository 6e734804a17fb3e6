//! # octorouter-pipeline
//!
//! The report-routing pipeline: seven stages connected by named work queues.
//!
//! ```text
//! receive -> convert -> destination-filter -> receiver-filter -> translate -> batch -> send
//! ```
//!
//! Each stage reads one [`QueueMessage`], downloads and verifies the report
//! body it points to, writes its outputs to blob storage, records reports and
//! lineage, and hands successor messages to the next queue. A [`StageRunner`]
//! drives a stage from its queue and decides whether a failure is retried or
//! recorded as a rejection.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use octorouter_pipeline::prelude::*;
//!
//! async fn start(pipeline: Arc<PipelineContext>, shutdown: tokio::sync::watch::Receiver<bool>) {
//!     let runner = StageRunner::new(ConvertStage::new(pipeline.clone()), pipeline);
//!     runner.run(shutdown).await;
//! }
//! ```

pub mod action;
pub mod bundle;
pub mod context;
pub mod error;
pub mod expression;
pub mod filters;
pub mod hl7;
pub mod message;
pub mod runner;
pub mod settings;
pub mod stage;

#[cfg(test)]
mod test_support;

pub use action::{ActionLogger, ItemLogger};
pub use context::{PipelineContext, PipelineSettings};
pub use error::{PipelineError, PipelineResult};
pub use expression::{ExpressionEngine, ExpressionError};
pub use filters::{FilterEngine, FilterOutcome, FilterType, Routability};
pub use hl7::{BasicHl7Transcoder, Hl7Message, Hl7Transcoder};
pub use message::{MessageError, QueueMessage, queues};
pub use runner::StageRunner;
pub use settings::{InMemorySettings, Receiver, Sender, SettingsProvider, SettingsSnapshot};
pub use stage::{
    BatchStage, ConvertStage, DestinationFilterStage, LoggingTransport, ReceiveStage,
    ReceiverFilterStage, RecordingTransport, SendStage, Stage, StageContext, StageOutput,
    TranslateStage, Transport, Translator, Translators,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::context::{PipelineContext, PipelineSettings};
    pub use crate::error::{PipelineError, PipelineResult};
    pub use crate::message::QueueMessage;
    pub use crate::runner::StageRunner;
    pub use crate::settings::{InMemorySettings, SettingsProvider};
    pub use crate::stage::{
        BatchStage, ConvertStage, DestinationFilterStage, ReceiveStage, ReceiverFilterStage,
        SendStage, Stage, TranslateStage, Transport,
    };
}
