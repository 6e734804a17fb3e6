//! Receive: accepts a raw submission from the ingestion front door.

use async_trait::async_trait;
use octorouter_core::{MimeFormat, PipelineEvent, Report, TaskAction};
use octorouter_storage::ErrorCode;

use super::{Stage, StageContext, StageOutput, download_verified, unexpected};
use crate::bundle::split_ndjson;
use crate::context::PipelineContext;
use crate::error::PipelineResult;
use crate::hl7::split_batch;
use crate::message::{ConvertMessage, QueueMessage, ReceiveMessage};
use crate::settings::CustomerStatus;

use std::sync::Arc;

/// Header naming the submitting sender as `organization.name`.
pub const CLIENT_ID_HEADER: &str = "client_id";
pub const CONTENT_TYPE_HEADER: &str = "content-type";

fn header<'a>(message: &'a ReceiveMessage, name: &str) -> Option<&'a str> {
    message
        .headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
}

fn count_items(format: MimeFormat, body: &[u8]) -> usize {
    let text = String::from_utf8_lossy(body);
    match format {
        MimeFormat::Hl7 => split_batch(&text).len(),
        MimeFormat::Fhir => split_ndjson(&text).count(),
        MimeFormat::Csv => text.lines().skip(1).filter(|l| !l.trim().is_empty()).count(),
    }
}

pub struct ReceiveStage {
    pipeline: Arc<PipelineContext>,
}

impl ReceiveStage {
    pub fn new(pipeline: Arc<PipelineContext>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl Stage for ReceiveStage {
    fn name(&self) -> &'static str {
        "receive"
    }

    fn action(&self) -> TaskAction {
        TaskAction::Receive
    }

    async fn process(
        &self,
        message: &QueueMessage,
        ctx: &mut StageContext,
    ) -> PipelineResult<Vec<StageOutput>> {
        let QueueMessage::Receive(message) = message else {
            return Err(unexpected(self.action(), message));
        };

        let Some(client_id) = header(message, CLIENT_ID_HEADER) else {
            ctx.logger()
                .error(ErrorCode::Unknown, "Submission has no client_id header");
            ctx.reject();
            return Ok(Vec::new());
        };
        let Some(sender) = self.pipeline.settings.find_sender(client_id) else {
            ctx.logger()
                .error(ErrorCode::Unknown, format!("Unknown sender '{client_id}'"));
            ctx.reject();
            return Ok(Vec::new());
        };
        if sender.customer_status == CustomerStatus::Inactive {
            ctx.logger()
                .error(ErrorCode::Unknown, format!("Sender '{client_id}' is inactive"));
            ctx.reject();
            return Ok(Vec::new());
        }

        let format = match header(message, CONTENT_TYPE_HEADER) {
            Some(content_type) => MimeFormat::from_mime_type(content_type)?,
            None => sender.format,
        };

        let body = download_verified(&self.pipeline, &message.blob_url, &message.digest).await?;
        let item_count = count_items(format, &body);

        let sender_name = sender.full_name();
        let report = Report::with_id(
            message.report_id,
            format,
            sender.topic.clone(),
            TaskAction::Convert,
        )
        .with_sender(sender_name.clone())
        .with_item_count(item_count)
        .with_body(message.blob_url.clone(), message.digest.clone());
        self.pipeline.lineage.record_report(&report).await?;

        tracing::info!(
            report_id = %report.id,
            sender = %sender_name,
            topic = %sender.topic,
            format = %format,
            item_count,
            "Received report"
        );
        ctx.push_event(PipelineEvent::report_received(
            report.id,
            sender_name,
            sender.topic.clone(),
        ));

        let next = QueueMessage::Convert(ConvertMessage {
            report_id: report.id,
            blob_url: message.blob_url.clone(),
            digest: message.digest.clone(),
            blob_subfolder: message.blob_subfolder.clone(),
            topic: sender.topic,
            schema_name: sender.schema_name,
        });
        Ok(vec![StageOutput {
            report,
            next: Some(next),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{SAMPLE_HL7, TestPipeline};
    use octorouter_core::{PipelineEventKind, ReportId};
    use octorouter_storage::{BlobFolder, BlobStore, LineageStore};

    #[tokio::test]
    async fn test_receive_forwards_to_convert() {
        let test = TestPipeline::new();
        let message = test
            .receive_message(SAMPLE_HL7.as_bytes(), MimeFormat::Hl7, "lab.default")
            .await;
        let stage = ReceiveStage::new(test.pipeline.clone());
        let mut ctx = StageContext::new();

        let outputs = stage.process(&message, &mut ctx).await.unwrap();
        assert_eq!(outputs.len(), 1);
        let output = &outputs[0];
        assert_eq!(output.report.id, message.report_id());
        assert_eq!(output.report.sender.as_deref(), Some("lab.default"));
        assert_eq!(output.report.item_count, 2);
        assert!(output.report.is_root());

        let Some(QueueMessage::Convert(next)) = &output.next else {
            panic!("expected a convert message");
        };
        assert_eq!(next.topic.as_str(), "covid-19");
        assert!(matches!(
            ctx.events()[0].kind,
            PipelineEventKind::ReportReceived { .. }
        ));

        let stored = test.stores.lineage.report(message.report_id()).await.unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn test_receive_rejects_unknown_sender() {
        let test = TestPipeline::new();
        let message = test
            .receive_message(SAMPLE_HL7.as_bytes(), MimeFormat::Hl7, "nobody.none")
            .await;
        let stage = ReceiveStage::new(test.pipeline.clone());
        let mut ctx = StageContext::new();

        let outputs = stage.process(&message, &mut ctx).await.unwrap();
        assert!(outputs.is_empty());
        assert!(ctx.is_rejected());
        let (logger, _, _) = ctx.into_parts();
        assert!(logger.logs()[0].message.contains("nobody.none"));
    }

    #[tokio::test]
    async fn test_receive_rejects_missing_client_id() {
        let test = TestPipeline::new();
        let info = test
            .stores
            .blobs
            .upload(
                SAMPLE_HL7.as_bytes(),
                MimeFormat::Hl7,
                BlobFolder::Receive,
                None,
                ReportId::new(),
            )
            .await
            .unwrap();
        let message = QueueMessage::Receive(ReceiveMessage {
            report_id: ReportId::new(),
            blob_url: info.url,
            digest: info.digest,
            blob_subfolder: None,
            headers: Default::default(),
        });
        let stage = ReceiveStage::new(test.pipeline.clone());
        let mut ctx = StageContext::new();

        assert!(stage.process(&message, &mut ctx).await.unwrap().is_empty());
        assert!(ctx.is_rejected());
    }

    #[tokio::test]
    async fn test_receive_rejects_inactive_sender() {
        let test = TestPipeline::new();
        let message = test
            .receive_message(SAMPLE_HL7.as_bytes(), MimeFormat::Hl7, "lab.retired")
            .await;
        let stage = ReceiveStage::new(test.pipeline.clone());
        let mut ctx = StageContext::new();

        assert!(stage.process(&message, &mut ctx).await.unwrap().is_empty());
        assert!(ctx.is_rejected());
    }
}
