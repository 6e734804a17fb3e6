//! Receiver filter: applies one receiver's quality, routing, processing-mode
//! and condition filters to its copy of an item.
//!
//! Groups run in that order and the first failing group ends evaluation.
//! Condition filters then prune the observations the receiver does not want.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use octorouter_core::{Digest, MimeFormat, PipelineEvent, Report, ReportId, TaskAction};
use octorouter_storage::{BlobFolder, ErrorCode};
use serde_json::Value;

use super::destination_filter::parse_bundle;
use super::{
    Stage, StageContext, StageOutput, download_verified, emit, sender_of, terminate, unexpected,
};
use crate::action::filtered_message;
use crate::bundle::{filter_observations, is_aoe_only, mapped_conditions, observations, tracking_id};
use crate::context::PipelineContext;
use crate::error::{PipelineError, PipelineResult};
use crate::filters::{FilterOutcome, FilterType};
use crate::message::{QueueMessage, ReceiverMessage};
use crate::settings::Receiver;

/// Why an item was filtered out.
struct Rejection {
    filter_type: FilterType,
    filter: String,
}

pub struct ReceiverFilterStage {
    pipeline: Arc<PipelineContext>,
}

impl ReceiverFilterStage {
    pub fn new(pipeline: Arc<PipelineContext>) -> Self {
        Self { pipeline }
    }

    fn check_groups(
        &self,
        receiver: &Receiver,
        bundle: &Value,
    ) -> PipelineResult<Option<Rejection>> {
        let groups = [
            (
                FilterType::Quality,
                &receiver.quality_filter,
                receiver.reverse_quality_filter,
            ),
            (FilterType::Routing, &receiver.routing_filter, false),
            (
                FilterType::ProcessingMode,
                &receiver.processing_mode_filter,
                false,
            ),
        ];
        for (filter_type, filters, reverse) in groups {
            let outcome = self
                .pipeline
                .filters
                .evaluate_group(filters, bundle, filter_type, reverse)?;
            if let FilterOutcome::Fail { failing } = outcome {
                return Ok(Some(Rejection {
                    filter_type,
                    filter: failing.join(", "),
                }));
            }
        }
        Ok(None)
    }

    /// Positions (among observations) of the observations the receiver keeps,
    /// or `None` when the receiver has no condition filter.
    fn kept_observations(
        &self,
        receiver: &Receiver,
        bundle: &Value,
    ) -> PipelineResult<Option<(FilterType, String, HashSet<usize>)>> {
        if !receiver.condition_filter.is_empty() {
            let mut keep = HashSet::new();
            for (position, observation) in observations(bundle).enumerate() {
                if self
                    .pipeline
                    .filters
                    .matches_any(&receiver.condition_filter, observation, bundle)?
                {
                    keep.insert(position);
                }
            }
            return Ok(Some((
                FilterType::Condition,
                receiver.condition_filter.join(", "),
                keep,
            )));
        }

        if !receiver.mapped_condition_filter.is_empty() {
            let wanted: HashSet<&str> = receiver
                .mapped_condition_filter
                .iter()
                .map(String::as_str)
                .collect();
            let keep = observations(bundle)
                .enumerate()
                .filter(|(_, observation)| {
                    mapped_conditions(observation)
                        .iter()
                        .any(|code| wanted.contains(code.as_str()))
                })
                .map(|(position, _)| position)
                .collect();
            return Ok(Some((
                FilterType::MappedCondition,
                receiver.mapped_condition_filter.join(", "),
                keep,
            )));
        }

        Ok(None)
    }

    async fn filtered_out(
        &self,
        report_id: ReportId,
        message: &ReceiverMessage,
        tracking: Option<String>,
        rejection: Rejection,
        ctx: &mut StageContext,
    ) -> PipelineResult<Vec<StageOutput>> {
        let receiver = &message.receiver_full_name;
        let text = filtered_message(receiver, rejection.filter_type, &rejection.filter);
        tracing::info!(report_id = %report_id, receiver = %receiver, "{text}");
        ctx.item_logger(1, tracking)
            .warn(ErrorCode::ItemFiltered, text);
        ctx.push_event(PipelineEvent::item_filtered_out(
            report_id,
            receiver.clone(),
            rejection.filter_type.as_str(),
            rejection.filter,
        ));

        let sender = sender_of(&self.pipeline, report_id).await?;
        let output = terminate(
            &self.pipeline,
            report_id,
            MimeFormat::Fhir,
            message.topic.clone(),
            sender,
        )
        .await?;
        Ok(vec![output])
    }
}

#[async_trait]
impl Stage for ReceiverFilterStage {
    fn name(&self) -> &'static str {
        "receiver-filter"
    }

    fn action(&self) -> TaskAction {
        TaskAction::ReceiverFilter
    }

    async fn process(
        &self,
        message: &QueueMessage,
        ctx: &mut StageContext,
    ) -> PipelineResult<Vec<StageOutput>> {
        let QueueMessage::ReceiverFilter(message) = message else {
            return Err(unexpected(self.action(), message));
        };
        let pipeline = &self.pipeline;

        let receiver = pipeline
            .settings
            .find_receiver(&message.receiver_full_name)
            .ok_or_else(|| PipelineError::not_found("receiver", &message.receiver_full_name))?;
        let bytes = download_verified(pipeline, &message.blob_url, &message.digest).await?;
        let bundle = parse_bundle(&bytes)?;
        let tracking = tracking_id(&bundle);

        if let Some(rejection) = self.check_groups(&receiver, &bundle)? {
            return self
                .filtered_out(message.report_id, message, tracking, rejection, ctx)
                .await;
        }

        let bundle = match self.kept_observations(&receiver, &bundle)? {
            None => bundle,
            Some((filter_type, filter, keep)) => {
                let kept: Vec<&Value> = observations(&bundle)
                    .enumerate()
                    .filter(|(position, _)| keep.contains(position))
                    .map(|(_, observation)| observation)
                    .collect();
                if kept.is_empty() || kept.iter().all(|o| is_aoe_only(o)) {
                    let rejection = Rejection {
                        filter_type,
                        filter,
                    };
                    return self
                        .filtered_out(message.report_id, message, tracking, rejection, ctx)
                        .await;
                }
                filter_observations(&bundle, &keep)
            }
        };

        let bytes = serde_json::to_vec(&bundle)?;
        let mut child = Report::new(MimeFormat::Fhir, message.topic.clone(), TaskAction::Translate)
            .with_receiver(message.receiver_full_name.clone())
            .with_parent(message.report_id, 1, Digest::of(&bytes), tracking);
        child.sender = sender_of(pipeline, message.report_id).await?;

        let next = ReceiverMessage {
            report_id: child.id,
            blob_url: message.blob_url.clone(),
            digest: message.digest.clone(),
            blob_subfolder: message.blob_subfolder.clone(),
            topic: message.topic.clone(),
            receiver_full_name: message.receiver_full_name.clone(),
        };
        let output = emit(
            pipeline,
            child,
            &bytes,
            BlobFolder::ReceiverFilter,
            message.blob_subfolder.as_deref(),
            move |report, info| {
                Some(QueueMessage::Translate(ReceiverMessage {
                    blob_url: info.url.clone(),
                    digest: info.digest.clone(),
                    report_id: report.id,
                    ..next
                }))
            },
        )
        .await?;
        tracing::debug!(
            report_id = %output.report.id,
            receiver = %message.receiver_full_name,
            "Item passed receiver filters"
        );
        Ok(vec![output])
    }
}
