//! Pipeline stages.
//!
//! A stage consumes one queue message, does bounded work and returns the
//! reports it produced, each with the message for the next stage (if any).
//! Every produced body is uploaded and its lineage recorded before the
//! output is returned, so a successor message never points at a missing
//! artifact.

pub mod batch;
pub mod convert;
pub mod destination_filter;
pub mod receive;
pub mod receiver_filter;
pub mod send;
pub mod translate;

use std::sync::Arc;

use async_trait::async_trait;
use octorouter_core::{Digest, MimeFormat, PipelineEvent, Report, ReportId, TaskAction, Topic};
use octorouter_storage::{BlobFolder, BlobInfo};
use url::Url;

use crate::action::{ActionLogger, ItemLogger};
use crate::context::PipelineContext;
use crate::error::{PipelineError, PipelineResult};
use crate::message::QueueMessage;

pub use batch::BatchStage;
pub use convert::ConvertStage;
pub use destination_filter::DestinationFilterStage;
pub use receive::ReceiveStage;
pub use receiver_filter::ReceiverFilterStage;
pub use send::{Delivered, LoggingTransport, RecordingTransport, SendStage, Transport};
pub use translate::{
    FhirPassthroughTranslator, Hl7Translator, TranslateStage, Translator, Translators,
};

/// A report produced by a stage and the message that hands it on.
#[derive(Debug, Clone)]
pub struct StageOutput {
    pub report: Report,
    pub next: Option<QueueMessage>,
}

impl StageOutput {
    /// A report that ends its branch of the pipeline.
    pub fn terminal(report: Report) -> Self {
        Self { report, next: None }
    }
}

/// Per-run state: action logs, events and whether the input was refused.
#[derive(Debug, Default)]
pub struct StageContext {
    logger: ActionLogger,
    events: Vec<PipelineEvent>,
    rejected: bool,
}

impl StageContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn logger(&mut self) -> &mut ActionLogger {
        &mut self.logger
    }

    pub fn item_logger(&mut self, index: usize, tracking_id: Option<String>) -> ItemLogger<'_> {
        self.logger.item_logger(index, tracking_id)
    }

    pub fn push_event(&mut self, event: PipelineEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[PipelineEvent] {
        &self.events
    }

    /// Marks the input as refused. It is acknowledged and not retried.
    pub fn reject(&mut self) {
        self.rejected = true;
    }

    pub fn is_rejected(&self) -> bool {
        self.rejected
    }

    pub fn into_parts(self) -> (ActionLogger, Vec<PipelineEvent>, bool) {
        (self.logger, self.events, self.rejected)
    }
}

/// One step of the pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// The action this stage performs; its queue is named after it.
    fn action(&self) -> TaskAction;

    /// Processes one message.
    ///
    /// Problems with a single item are logged on `ctx` and do not fail the
    /// call.
    ///
    /// # Errors
    ///
    /// Item-level errors (`PipelineError::is_item_level`) reject the whole
    /// input without a retry; any other error leaves the message for
    /// redelivery.
    async fn process(
        &self,
        message: &QueueMessage,
        ctx: &mut StageContext,
    ) -> PipelineResult<Vec<StageOutput>>;
}

/// Shared stage handle.
pub type DynStage = Arc<dyn Stage>;

/// Downloads a body and checks it against the digest the message carries.
///
/// # Errors
///
/// Returns `PipelineError::Integrity` on a digest mismatch, before any
/// transformation has run.
pub async fn download_verified(
    pipeline: &PipelineContext,
    url: &Url,
    digest: &Digest,
) -> PipelineResult<Vec<u8>> {
    let bytes = pipeline.blobs.download_verified(url, digest).await?;
    tracing::debug!(blob_url = %url, size = bytes.len(), "Downloaded verified body");
    Ok(bytes)
}

/// Uploads `bytes` as the body of `report`, then records the report and its
/// lineage. Returns the report with its body location set.
///
/// # Errors
///
/// Returns a storage error if the upload or the lineage write fails.
pub async fn persist(
    pipeline: &PipelineContext,
    report: Report,
    bytes: &[u8],
    folder: BlobFolder,
    subfolder: Option<&str>,
) -> PipelineResult<(Report, BlobInfo)> {
    let info = pipeline
        .blobs
        .upload(bytes, report.format, folder, subfolder, report.id)
        .await?;
    let report = report.with_body(info.url.clone(), info.digest.clone());
    pipeline.lineage.record_report(&report).await?;
    pipeline.lineage.record_lineage(&report.lineage).await?;
    tracing::debug!(
        report_id = %report.id,
        blob_url = %info.url,
        next_action = %report.next_action,
        "Persisted report"
    );
    Ok((report, info))
}

/// [`persist`], then builds the successor message from the stored body.
pub async fn emit(
    pipeline: &PipelineContext,
    report: Report,
    bytes: &[u8],
    folder: BlobFolder,
    subfolder: Option<&str>,
    next: impl FnOnce(&Report, &BlobInfo) -> Option<QueueMessage> + Send,
) -> PipelineResult<StageOutput> {
    let (report, info) = persist(pipeline, report, bytes, folder, subfolder).await?;
    let next = next(&report, &info);
    Ok(StageOutput { report, next })
}

/// Records a body-less report that closes the lineage of `parent`.
///
/// # Errors
///
/// Returns a storage error if the lineage write fails.
pub async fn terminate(
    pipeline: &PipelineContext,
    parent: ReportId,
    format: MimeFormat,
    topic: Topic,
    sender: Option<String>,
) -> PipelineResult<StageOutput> {
    let mut report =
        Report::new(format, topic, TaskAction::None).with_parent(parent, 1, Digest::of(b""), None);
    report.sender = sender;
    let report = report.with_item_count(0);
    pipeline.lineage.record_report(&report).await?;
    pipeline.lineage.record_lineage(&report.lineage).await?;
    tracing::debug!(report_id = %report.id, parent = %parent, "Recorded terminal report");
    Ok(StageOutput::terminal(report))
}

/// The recorded report `id`.
///
/// # Errors
///
/// Returns `PipelineError::NotFound` if it was never recorded.
pub async fn recorded_report(pipeline: &PipelineContext, id: ReportId) -> PipelineResult<Report> {
    pipeline
        .lineage
        .report(id)
        .await?
        .ok_or_else(|| PipelineError::not_found("report", id.to_string()))
}

/// Sender recorded on report `id`. Every report carries the sender of its root.
pub async fn sender_of(pipeline: &PipelineContext, id: ReportId) -> PipelineResult<Option<String>> {
    Ok(pipeline
        .lineage
        .report(id)
        .await?
        .and_then(|report| report.sender))
}

pub(crate) fn unexpected(stage: TaskAction, message: &QueueMessage) -> PipelineError {
    PipelineError::unexpected_message(stage, message.type_name())
}
