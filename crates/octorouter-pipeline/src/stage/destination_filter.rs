//! Destination filter: decides which receivers get a copy of an item.

use std::sync::Arc;

use async_trait::async_trait;
use octorouter_core::{Digest, MimeFormat, PipelineEvent, Report, TaskAction};
use octorouter_storage::{BlobFolder, ErrorCode};
use serde_json::Value;

use super::{
    Stage, StageContext, StageOutput, download_verified, emit, sender_of, terminate, unexpected,
};
use crate::action::filtered_message;
use crate::bundle::tracking_id;
use crate::context::PipelineContext;
use crate::error::{PipelineError, PipelineResult};
use crate::filters::{FilterOutcome, FilterType, Routability};
use crate::message::{QueueMessage, ReceiverMessage};
use crate::settings::Receiver;

/// Parses a canonical body. Bytes that are not a bundle are the item's fault.
pub(crate) fn parse_bundle(bytes: &[u8]) -> PipelineResult<Value> {
    serde_json::from_slice(bytes).map_err(|e| PipelineError::parse(e.to_string()))
}

pub struct DestinationFilterStage {
    pipeline: Arc<PipelineContext>,
}

impl DestinationFilterStage {
    pub fn new(pipeline: Arc<PipelineContext>) -> Self {
        Self { pipeline }
    }

    /// Receivers that take the item. Every same-topic receiver that does not
    /// gets an `ItemNotRouted` event.
    fn select_receivers(
        &self,
        bundle: &Value,
        report: &Report,
        ctx: &mut StageContext,
    ) -> Vec<Receiver> {
        let filters = &self.pipeline.filters;
        let mut routed = Vec::new();

        for receiver in self.pipeline.settings.receivers() {
            let full_name = receiver.full_name();
            let routability = filters.check_receiver_routable(&receiver, &report.topic);
            match routability {
                Routability::Routable => {}
                Routability::TopicMismatch { .. } => {
                    tracing::trace!(receiver = %full_name, "Skipping receiver on another topic");
                    continue;
                }
                Routability::Inactive => {
                    ctx.push_event(PipelineEvent::item_not_routed(
                        report.id,
                        full_name,
                        report.topic.clone(),
                        report.sender.clone(),
                        routability.reason(),
                    ));
                    continue;
                }
            }

            let outcome = filters.evaluate_group(
                &receiver.jurisdictional_filter,
                bundle,
                FilterType::Jurisdictional,
                false,
            );
            match outcome {
                Ok(FilterOutcome::Pass) => routed.push(receiver),
                Ok(FilterOutcome::Fail { failing }) => {
                    let reason = filtered_message(
                        &full_name,
                        FilterType::Jurisdictional,
                        &failing.join(", "),
                    );
                    tracing::debug!(report_id = %report.id, receiver = %full_name, "{reason}");
                    ctx.push_event(PipelineEvent::item_not_routed(
                        report.id,
                        full_name,
                        report.topic.clone(),
                        report.sender.clone(),
                        reason,
                    ));
                }
                Err(err) => {
                    ctx.logger().error(
                        ErrorCode::Unknown,
                        format!(
                            "Jurisdictional filter of {full_name} could not be evaluated: {err}"
                        ),
                    );
                    ctx.push_event(PipelineEvent::item_not_routed(
                        report.id,
                        full_name,
                        report.topic.clone(),
                        report.sender.clone(),
                        "filter error",
                    ));
                }
            }
        }
        routed
    }
}

#[async_trait]
impl Stage for DestinationFilterStage {
    fn name(&self) -> &'static str {
        "destination-filter"
    }

    fn action(&self) -> TaskAction {
        TaskAction::DestinationFilter
    }

    async fn process(
        &self,
        message: &QueueMessage,
        ctx: &mut StageContext,
    ) -> PipelineResult<Vec<StageOutput>> {
        let QueueMessage::DestinationFilter(message) = message else {
            return Err(unexpected(self.action(), message));
        };
        let pipeline = &self.pipeline;

        let bytes = download_verified(pipeline, &message.blob_url, &message.digest).await?;
        let bundle = parse_bundle(&bytes)?;
        let sender = sender_of(pipeline, message.report_id).await?;

        // the incoming report as it was routed, for event fields
        let mut current = Report::with_id(
            message.report_id,
            MimeFormat::Fhir,
            message.topic.clone(),
            TaskAction::DestinationFilter,
        );
        current.sender = sender.clone();

        let receivers = self.select_receivers(&bundle, &current, ctx);
        if receivers.is_empty() {
            tracing::info!(
                report_id = %message.report_id,
                topic = %message.topic,
                "No receivers for report"
            );
            ctx.push_event(PipelineEvent::no_receivers(
                message.report_id,
                message.topic.clone(),
                sender.clone(),
            ));
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

        let tracking = tracking_id(&bundle);
        let mut outputs = Vec::with_capacity(receivers.len());
        for receiver in receivers {
            let full_name = receiver.full_name();
            let mut child = Report::new(
                MimeFormat::Fhir,
                message.topic.clone(),
                TaskAction::ReceiverFilter,
            )
            .with_receiver(full_name.clone())
            .with_parent(message.report_id, 1, Digest::of(&bytes), tracking.clone());
            child.sender = sender.clone();

            let topic = message.topic.clone();
            let subfolder = message.blob_subfolder.clone();
            let receiver_full_name = full_name.clone();
            let output = emit(
                pipeline,
                child,
                &bytes,
                BlobFolder::Route,
                message.blob_subfolder.as_deref(),
                move |report, info| {
                    Some(QueueMessage::ReceiverFilter(ReceiverMessage {
                        report_id: report.id,
                        blob_url: info.url.clone(),
                        digest: info.digest.clone(),
                        blob_subfolder: subfolder,
                        topic,
                        receiver_full_name,
                    }))
                },
            )
            .await?;

            tracing::info!(
                report_id = %output.report.id,
                parent = %message.report_id,
                receiver = %full_name,
                "Routed item"
            );
            ctx.push_event(PipelineEvent::item_routed(
                output.report.id,
                message.report_id,
                full_name,
                message.topic.clone(),
            ));
            outputs.push(output);
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{SETTINGS, TestPipeline, sample_bundle};
    use octorouter_core::PipelineEventKind;

    async fn run(
        test: &TestPipeline,
        bundle: &Value,
    ) -> (QueueMessage, Vec<StageOutput>, StageContext) {
        let message = test.destination_filter_message(bundle).await;
        let stage = DestinationFilterStage::new(test.pipeline.clone());
        let mut ctx = StageContext::new();
        let outputs = stage.process(&message, &mut ctx).await.unwrap();
        (message, outputs, ctx)
    }

    fn not_routed(ctx: &StageContext) -> Vec<(String, String)> {
        ctx.events()
            .iter()
            .filter_map(|event| match &event.kind {
                PipelineEventKind::ItemNotRouted {
                    receiver, reason, ..
                } => Some((receiver.clone(), reason.clone())),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_routes_to_matching_receiver() {
        let test = TestPipeline::new();
        let (message, outputs, ctx) = run(&test, &sample_bundle("IG")).await;

        assert_eq!(outputs.len(), 1);
        let output = &outputs[0];
        assert_eq!(output.report.receiver.as_deref(), Some("ig-phd.elr"));
        assert_eq!(output.report.lineage[0].parent_report_id, message.report_id());
        assert_eq!(output.report.lineage[0].tracking_id.as_deref(), Some("MSG-100"));
        let Some(QueueMessage::ReceiverFilter(next)) = &output.next else {
            panic!("expected a receiver-filter message");
        };
        assert_eq!(next.receiver_full_name, "ig-phd.elr");
        // the copy is byte-identical
        assert_eq!(Some(&next.digest), message.blob_ref().map(|(_, d)| d));

        let skipped = not_routed(&ctx);
        assert_eq!(skipped.len(), 2);
        assert_eq!(skipped[0], ("ig-phd.old".into(), "receiver is inactive".into()));
        assert_eq!(skipped[1].0, "other-phd.elr");
        assert!(skipped[1].1.contains("JURISDICTIONAL_FILTER"));
        // the receiver on another topic is not mentioned
        assert!(skipped.iter().all(|(name, _)| name != "ig-phd.flu"));
    }

    #[tokio::test]
    async fn test_no_receivers_is_terminal() {
        let test = TestPipeline::new();
        let (_, outputs, ctx) = run(&test, &sample_bundle("ZZ")).await;

        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].next.is_none());
        assert_eq!(outputs[0].report.next_action, TaskAction::None);
        assert!(
            ctx.events()
                .iter()
                .any(|e| matches!(e.kind, PipelineEventKind::NoReceivers { .. }))
        );
    }

    #[tokio::test]
    async fn test_filter_error_skips_only_that_receiver() {
        let settings = format!(
            "{SETTINGS}\n[[receivers]]\nname = \"broken\"\norganization = \"ig-phd\"\n\
             topic = \"covid-19\"\njurisdictional_filter = [\"%nowhere = 'IG'\"]\n"
        );
        let test = TestPipeline::with_settings(&settings);
        let (_, outputs, ctx) = run(&test, &sample_bundle("IG")).await;

        assert_eq!(outputs.len(), 1);
        assert!(not_routed(&ctx).contains(&("ig-phd.broken".into(), "filter error".into())));
        let (logger, _, _) = ctx.into_parts();
        assert!(logger.has_errors());
    }

    #[tokio::test]
    async fn test_empty_jurisdiction_matches_everything() {
        let settings = r#"
[[receivers]]
name = "all"
organization = "everyone"
topic = "covid-19"
"#;
        let test = TestPipeline::with_settings(settings);
        let (_, outputs, _) = run(&test, &sample_bundle("ZZ")).await;
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].report.receiver.as_deref(), Some("everyone.all"));
    }
}
