//! Send: hands a batch to the receiver's transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use octorouter_core::{PipelineEvent, Report, TaskAction};
use octorouter_storage::BlobFolder;
use tokio::sync::Mutex;

use super::{Stage, StageContext, StageOutput, download_verified, emit, recorded_report, unexpected};
use crate::context::PipelineContext;
use crate::error::{PipelineError, PipelineResult};
use crate::message::QueueMessage;
use crate::settings::Receiver;

/// Delivers report bodies to receivers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// # Errors
    ///
    /// Returns `PipelineError::Transport` if the receiver did not take the
    /// report. The send is retried on redelivery.
    async fn deliver(
        &self,
        receiver: &Receiver,
        report: &Report,
        body: &[u8],
    ) -> PipelineResult<()>;
}

/// Accepts every report and only logs it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingTransport;

#[async_trait]
impl Transport for LoggingTransport {
    async fn deliver(
        &self,
        receiver: &Receiver,
        report: &Report,
        body: &[u8],
    ) -> PipelineResult<()> {
        let (kind, address) = receiver
            .transport
            .as_ref()
            .map(|t| (t.kind.as_str(), t.address.as_deref().unwrap_or("-")))
            .unwrap_or(("log", "-"));
        tracing::info!(
            report_id = %report.id,
            receiver = %receiver.full_name(),
            transport = kind,
            address,
            size = body.len(),
            "Delivered report"
        );
        Ok(())
    }
}

/// A delivery seen by [`RecordingTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub receiver: String,
    pub report_id: octorouter_core::ReportId,
    pub body: Vec<u8>,
}

/// Keeps every delivery in memory. Can be switched to refuse deliveries.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    deliveries: Mutex<Vec<Delivered>>,
    failing: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn deliveries(&self) -> Vec<Delivered> {
        self.deliveries.lock().await.clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn deliver(
        &self,
        receiver: &Receiver,
        report: &Report,
        body: &[u8],
    ) -> PipelineResult<()> {
        let full_name = receiver.full_name();
        if self.failing.load(Ordering::SeqCst) {
            return Err(PipelineError::transport(full_name, "receiver refused the report"));
        }
        self.deliveries.lock().await.push(Delivered {
            receiver: full_name,
            report_id: report.id,
            body: body.to_vec(),
        });
        Ok(())
    }
}

pub struct SendStage {
    pipeline: Arc<PipelineContext>,
}

impl SendStage {
    pub fn new(pipeline: Arc<PipelineContext>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl Stage for SendStage {
    fn name(&self) -> &'static str {
        "send"
    }

    fn action(&self) -> TaskAction {
        TaskAction::Send
    }

    async fn process(
        &self,
        message: &QueueMessage,
        ctx: &mut StageContext,
    ) -> PipelineResult<Vec<StageOutput>> {
        let QueueMessage::Send(message) = message else {
            return Err(unexpected(self.action(), message));
        };
        let pipeline = &self.pipeline;

        let receiver = pipeline
            .settings
            .find_receiver(&message.receiver_full_name)
            .ok_or_else(|| PipelineError::not_found("receiver", &message.receiver_full_name))?;
        let parent = recorded_report(pipeline, message.report_id).await?;
        let bytes = download_verified(pipeline, &message.blob_url, &message.digest).await?;

        pipeline.transport.deliver(&receiver, &parent, &bytes).await?;

        let tracking = parent.lineage.first().and_then(|e| e.tracking_id.clone());
        let mut sent = Report::new(parent.format, parent.topic.clone(), TaskAction::None)
            .with_receiver(message.receiver_full_name.clone())
            .with_parent(parent.id, 1, message.digest.clone(), tracking);
        sent.sender = parent.sender.clone();

        let output = emit(pipeline, sent, &bytes, BlobFolder::Ready, None, |_, _| None).await?;
        tracing::info!(
            report_id = %output.report.id,
            parent = %parent.id,
            receiver = %message.receiver_full_name,
            "Sent report"
        );
        ctx.push_event(PipelineEvent::report_sent(
            output.report.id,
            message.receiver_full_name.clone(),
        ));
        Ok(vec![output])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SendMessage;
    use crate::test_support::{TestPipeline, sample_bundle};
    use octorouter_core::PipelineEventKind;

    async fn send_message(test: &TestPipeline) -> QueueMessage {
        let upstream = test
            .receiver_filter_message(&sample_bundle("IG"), "ig-phd.elr")
            .await;
        let (url, digest) = upstream.blob_ref().unwrap();
        QueueMessage::Send(SendMessage {
            report_id: upstream.report_id(),
            blob_url: url.clone(),
            digest: digest.clone(),
            receiver_full_name: "ig-phd.elr".into(),
        })
    }

    #[tokio::test]
    async fn test_send_delivers_and_closes_lineage() {
        let test = TestPipeline::new();
        let message = send_message(&test).await;
        let stage = SendStage::new(test.pipeline.clone());
        let mut ctx = StageContext::new();
        let outputs = stage.process(&message, &mut ctx).await.unwrap();

        let output = &outputs[0];
        assert!(output.next.is_none());
        assert_eq!(output.report.next_action, TaskAction::None);
        assert!(output.report.body_url.as_ref().unwrap().path().contains("/ready/"));

        let deliveries = test.transport.deliveries().await;
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].receiver, "ig-phd.elr");
        assert_eq!(deliveries[0].report_id, message.report_id());
        assert!(matches!(
            &ctx.events()[0].kind,
            PipelineEventKind::ReportSent { receiver, .. } if receiver == "ig-phd.elr"
        ));
    }

    #[tokio::test]
    async fn test_transport_failure_is_retryable() {
        let test = TestPipeline::new();
        test.transport.set_failing(true);
        let message = send_message(&test).await;
        let stage = SendStage::new(test.pipeline.clone());
        let err = stage
            .process(&message, &mut StageContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Transport { .. }));
        assert!(!err.is_item_level());
        assert!(test.transport.deliveries().await.is_empty());
    }

    #[tokio::test]
    async fn test_logging_transport_accepts() {
        let receiver = Receiver::new("ig-phd", "elr", "covid-19".into());
        let report = Report::new(
            octorouter_core::MimeFormat::Fhir,
            "covid-19".into(),
            TaskAction::Send,
        );
        assert!(LoggingTransport.deliver(&receiver, &report, b"{}").await.is_ok());
    }
}
