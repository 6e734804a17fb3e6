//! Batch: groups translated reports per receiver before sending.
//!
//! Every report currently goes out as a batch of one, as soon as it arrives.
//! Receiver `timing` is read but not acted on.

use std::sync::Arc;

use async_trait::async_trait;
use octorouter_core::{Report, TaskAction};
use octorouter_storage::BlobFolder;

use super::{Stage, StageContext, StageOutput, download_verified, emit, recorded_report, unexpected};
use crate::context::PipelineContext;
use crate::error::{PipelineError, PipelineResult};
use crate::message::{QueueMessage, SendMessage};

pub struct BatchStage {
    pipeline: Arc<PipelineContext>,
}

impl BatchStage {
    pub fn new(pipeline: Arc<PipelineContext>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl Stage for BatchStage {
    fn name(&self) -> &'static str {
        "batch"
    }

    fn action(&self) -> TaskAction {
        TaskAction::Batch
    }

    async fn process(
        &self,
        message: &QueueMessage,
        _ctx: &mut StageContext,
    ) -> PipelineResult<Vec<StageOutput>> {
        let QueueMessage::Batch(message) = message else {
            return Err(unexpected(self.action(), message));
        };
        let pipeline = &self.pipeline;

        let parent = recorded_report(pipeline, message.report_id).await?;
        let (Some(url), Some(digest)) = (&parent.body_url, &parent.digest) else {
            return Err(PipelineError::not_found("report body", message.report_id.to_string()));
        };
        if let Some(timing) = pipeline
            .settings
            .find_receiver(&message.receiver_full_name)
            .and_then(|r| r.timing)
        {
            tracing::trace!(
                receiver = %message.receiver_full_name,
                batch_size = timing.batch_size,
                max_wait_secs = timing.max_wait_secs,
                "Receiver timing ignored, sending a batch of one"
            );
        }

        let bytes = download_verified(pipeline, url, digest).await?;
        let tracking = parent.lineage.first().and_then(|e| e.tracking_id.clone());
        let mut child = Report::new(parent.format, parent.topic.clone(), TaskAction::Send)
            .with_receiver(message.receiver_full_name.clone())
            .with_parent(parent.id, 1, digest.clone(), tracking);
        child.sender = parent.sender.clone();

        let receiver_full_name = message.receiver_full_name.clone();
        let output = emit(
            pipeline,
            child,
            &bytes,
            BlobFolder::Batch,
            None,
            move |report, info| {
                Some(QueueMessage::Send(SendMessage {
                    report_id: report.id,
                    blob_url: info.url.clone(),
                    digest: info.digest.clone(),
                    receiver_full_name,
                }))
            },
        )
        .await?;
        tracing::debug!(
            report_id = %output.report.id,
            receiver = %message.receiver_full_name,
            "Batched report"
        );
        Ok(vec![output])
    }
}
