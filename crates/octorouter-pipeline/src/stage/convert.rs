//! Convert: splits a submission into single-item canonical bundles.
//!
//! HL7 batches are split into messages and transcoded; FHIR NDJSON is split
//! by line. Each item is validated and stamped with condition codes on its
//! own, so one broken item never holds back its siblings.

use std::sync::Arc;

use async_trait::async_trait;
use octorouter_core::{Digest, MimeFormat, PipelineEvent, Report, TaskAction};
use octorouter_storage::{BlobFolder, ErrorCode};
use serde_json::Value;
use url::Url;

use super::{
    Stage, StageContext, StageOutput, download_verified, emit, sender_of, terminate, unexpected,
};
use crate::bundle::{split_ndjson, stamp_conditions, tracking_id, validate_bundle};
use crate::context::PipelineContext;
use crate::error::{PipelineError, PipelineResult};
use crate::hl7::{Hl7Message, split_batch};
use crate::message::{DestinationFilterMessage, QueueMessage};

/// Format of a body, from the extension of its blob name.
fn format_of(url: &Url) -> PipelineResult<MimeFormat> {
    let extension = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|file| file.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .ok_or_else(|| PipelineError::parse(format!("cannot tell the format of {url}")))?;
    Ok(MimeFormat::from_extension(extension)?)
}

pub struct ConvertStage {
    pipeline: Arc<PipelineContext>,
}

impl ConvertStage {
    pub fn new(pipeline: Arc<PipelineContext>) -> Self {
        Self { pipeline }
    }

    /// Decodes every item of the body. Results keep the 0-based item index.
    fn decode_items(
        &self,
        format: MimeFormat,
        text: &str,
    ) -> PipelineResult<Vec<(usize, PipelineResult<Value>)>> {
        let checked = |bundle: Value| -> PipelineResult<Value> {
            validate_bundle(&bundle)?;
            Ok(bundle)
        };
        match format {
            MimeFormat::Hl7 => Ok(split_batch(text)
                .into_iter()
                .enumerate()
                .map(|(index, item)| {
                    let bundle = item
                        .and_then(|raw| Hl7Message::parse(&raw))
                        .and_then(|message| self.pipeline.transcoder.decode(&message))
                        .and_then(checked);
                    (index, bundle)
                })
                .collect()),
            MimeFormat::Fhir => Ok(split_ndjson(text)
                .map(|(index, line)| {
                    let bundle = serde_json::from_str::<Value>(line)
                        .map_err(|e| PipelineError::parse(e.to_string()))
                        .and_then(checked);
                    (index, bundle)
                })
                .collect()),
            MimeFormat::Csv => Err(PipelineError::conversion(
                "CSV submissions cannot be converted to bundles",
            )),
        }
    }
}

#[async_trait]
impl Stage for ConvertStage {
    fn name(&self) -> &'static str {
        "convert"
    }

    fn action(&self) -> TaskAction {
        TaskAction::Convert
    }

    async fn process(
        &self,
        message: &QueueMessage,
        ctx: &mut StageContext,
    ) -> PipelineResult<Vec<StageOutput>> {
        let QueueMessage::Convert(message) = message else {
            return Err(unexpected(self.action(), message));
        };
        let pipeline = &self.pipeline;

        let body = download_verified(pipeline, &message.blob_url, &message.digest).await?;
        let format = format_of(&message.blob_url)?;
        let sender = sender_of(pipeline, message.report_id).await?;
        let route_invalid_items = sender
            .as_deref()
            .and_then(|name| pipeline.settings.find_sender(name))
            .is_none_or(|s| s.route_invalid_items);

        let text = String::from_utf8(body)
            .map_err(|e| PipelineError::parse(format!("body is not UTF-8: {e}")))?;
        if text.trim().is_empty() {
            ctx.logger()
                .error(ErrorCode::InvalidMsgParse, "Provided raw data is empty.");
            let output = terminate(
                pipeline,
                message.report_id,
                MimeFormat::Fhir,
                message.topic.clone(),
                sender,
            )
            .await?;
            return Ok(vec![output]);
        }

        let table = pipeline
            .tables
            .require(&pipeline.config.observation_mapping_table)?;
        let items = self.decode_items(format, &text)?;
        let total = items.len();

        let mut bundles = Vec::new();
        let mut failed = 0;
        for (index, item) in items {
            let position = index + 1;
            match item {
                Ok(bundle) => {
                    let stamped = stamp_conditions(bundle, &table)?;
                    let tracking = tracking_id(&stamped.bundle);
                    let mut logger = ctx.item_logger(position, tracking.clone());
                    for unmapped in &stamped.unmapped {
                        logger.warn(ErrorCode::UnmappableCondition, unmapped.message());
                    }
                    bundles.push((position, tracking, stamped.bundle));
                }
                Err(err) => {
                    failed += 1;
                    ctx.item_logger(position, None).failure(&err);
                    ctx.push_event(PipelineEvent::item_failed(
                        message.report_id,
                        Some(position),
                        TaskAction::Convert,
                        err.category(),
                        err.to_string(),
                    ));
                }
            }
        }

        if failed > 0 && !route_invalid_items {
            ctx.logger().error(
                ErrorCode::Unknown,
                format!(
                    "{failed} of {total} item(s) failed and the sender does not route partial \
                     submissions; no items were routed"
                ),
            );
            bundles.clear();
        }

        tracing::info!(
            report_id = %message.report_id,
            format = %format,
            items = total,
            converted = bundles.len(),
            failed,
            "Converted report"
        );

        if bundles.is_empty() {
            let output = terminate(
                pipeline,
                message.report_id,
                MimeFormat::Fhir,
                message.topic.clone(),
                sender,
            )
            .await?;
            return Ok(vec![output]);
        }

        let mut outputs = Vec::with_capacity(bundles.len());
        for (position, tracking, bundle) in bundles {
            let bytes = serde_json::to_vec(&bundle)?;
            let mut child = Report::new(
                MimeFormat::Fhir,
                message.topic.clone(),
                TaskAction::DestinationFilter,
            )
            .with_parent(message.report_id, position, Digest::of(&bytes), tracking);
            child.sender = sender.clone();

            let topic = message.topic.clone();
            let subfolder = message.blob_subfolder.clone();
            let output = emit(
                pipeline,
                child,
                &bytes,
                BlobFolder::Process,
                message.blob_subfolder.as_deref(),
                move |report, info| {
                    Some(QueueMessage::DestinationFilter(DestinationFilterMessage {
                        report_id: report.id,
                        blob_url: info.url.clone(),
                        digest: info.digest.clone(),
                        blob_subfolder: subfolder,
                        topic,
                    }))
                },
            )
            .await?;
            outputs.push(output);
        }
        Ok(outputs)
    }
}
