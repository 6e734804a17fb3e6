//! Queue consumer that drives one stage.
//!
//! The runner leases messages from the stage's queue, runs the stage under a
//! timeout and commits the result: reports and lineage, the action record,
//! events, successor messages and finally the ack. Successors are encoded
//! before anything is recorded, so a result that cannot be queued never shows
//! up as a success. A crash anywhere before the ack leads to redelivery, so
//! every stage must be safe to re-run.

use std::sync::Arc;

use octorouter_storage::{ActionOutcome, ActionRecord, Delivery};
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, warn};

use crate::action::error_code;
use crate::context::PipelineContext;
use crate::error::{PipelineError, PipelineResult};
use crate::message::{QueueMessage, queues};
use crate::stage::{Stage, StageContext, StageOutput};
use octorouter_core::PipelineEvent;

/// Polls one queue and hands each message to its stage.
pub struct StageRunner<S: Stage> {
    stage: S,
    pipeline: Arc<PipelineContext>,
}

impl<S: Stage> StageRunner<S> {
    pub fn new(stage: S, pipeline: Arc<PipelineContext>) -> Self {
        Self { stage, pipeline }
    }

    pub fn stage(&self) -> &S {
        &self.stage
    }

    fn queue_name(&self) -> PipelineResult<&'static str> {
        queues::for_action(self.stage.action()).ok_or_else(|| {
            PipelineError::configuration(format!("stage {} has no queue", self.stage.name()))
        })
    }

    /// Polls until `shutdown` turns true or its sender goes away.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let config = &self.pipeline.config;
        let mut ticker = interval(config.poll_interval);

        info!(stage = self.stage.name(), "Stage runner started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.process_batch(config.batch_size).await {
                        Ok(processed) => {
                            if processed > 0 {
                                debug!(
                                    stage = self.stage.name(),
                                    count = processed,
                                    "Processed messages"
                                );
                            }
                        }
                        Err(e) => {
                            error!(
                                stage = self.stage.name(),
                                error = %e,
                                "Error processing messages"
                            );
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(stage = self.stage.name(), "Stage runner stopped");
    }

    /// Leases up to `limit` messages and handles each. Returns how many were
    /// handled, including dead-lettered and failed ones.
    ///
    /// A message whose handling hits a storage error is logged and left to
    /// its visibility timeout; the rest of the batch is still handled.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the queue cannot be read.
    pub async fn process_batch(&self, limit: usize) -> PipelineResult<usize> {
        let queue = self.queue_name()?;
        let deliveries = self
            .pipeline
            .queue
            .receive(queue, limit, self.pipeline.config.visibility_timeout)
            .await?;

        let mut processed = 0;
        for delivery in deliveries {
            let id = delivery.id.clone();
            match self.handle(delivery).await {
                Ok(()) => processed += 1,
                Err(e) => {
                    error!(
                        stage = self.stage.name(),
                        queue,
                        id = %id,
                        error = %e,
                        "Failed to handle message, it will be redelivered"
                    );
                }
            }
        }
        Ok(processed)
    }

    async fn handle(&self, delivery: Delivery) -> PipelineResult<()> {
        let config = &self.pipeline.config;
        let queue = &self.pipeline.queue;

        if delivery.dequeue_count > config.max_dequeue_count {
            warn!(
                queue = %delivery.queue,
                id = %delivery.id,
                dequeue_count = delivery.dequeue_count,
                "Message exceeded its delivery attempts"
            );
            queue
                .dead_letter(&delivery, "exceeded max dequeue count")
                .await?;
            return Ok(());
        }

        let message = match QueueMessage::decode(&delivery.payload, config.max_message_bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    queue = %delivery.queue,
                    id = %delivery.id,
                    error = %e,
                    "Undecodable message"
                );
                queue.dead_letter(&delivery, &e.to_string()).await?;
                return Ok(());
            }
        };
        if message.action() != self.stage.action() {
            let err = PipelineError::unexpected_message(self.stage.action(), message.type_name());
            warn!(queue = %delivery.queue, id = %delivery.id, error = %err, "Misrouted message");
            queue.dead_letter(&delivery, &err.to_string()).await?;
            return Ok(());
        }

        let started_at = OffsetDateTime::now_utc();
        let mut ctx = StageContext::new();
        let result = timeout(config.stage_timeout, self.stage.process(&message, &mut ctx))
            .await
            .unwrap_or_else(|_| {
                Err(PipelineError::Timeout {
                    stage: self.stage.action(),
                    seconds: config.stage_timeout.as_secs(),
                })
            });

        match result {
            Ok(outputs) => match self.encode_successors(&outputs) {
                Ok(payloads) => {
                    self.commit(&delivery, &message, outputs, payloads, ctx, started_at)
                        .await
                }
                Err(err) => self.abandon(&delivery, &message, err, ctx, started_at).await,
            },
            Err(err) if err.is_item_level() => {
                self.reject(&delivery, &message, err, ctx, started_at).await
            }
            Err(err) => self.fail(&delivery, &message, err, ctx, started_at).await,
        }
    }

    /// Queue name and wire form of every successor, in output order.
    fn encode_successors(
        &self,
        outputs: &[StageOutput],
    ) -> PipelineResult<Vec<(&'static str, String)>> {
        let max = self.pipeline.config.max_message_bytes;
        outputs
            .iter()
            .filter_map(|o| o.next.as_ref())
            .map(|next| -> PipelineResult<_> { Ok((next.queue_name(), next.encode(max)?)) })
            .collect()
    }

    async fn commit(
        &self,
        delivery: &Delivery,
        message: &QueueMessage,
        outputs: Vec<StageOutput>,
        payloads: Vec<(&'static str, String)>,
        ctx: StageContext,
        started_at: OffsetDateTime,
    ) -> PipelineResult<()> {
        let pipeline = &self.pipeline;
        let (logger, events, rejected) = ctx.into_parts();

        for output in &outputs {
            pipeline.lineage.record_report(&output.report).await?;
            pipeline.lineage.record_lineage(&output.report.lineage).await?;
        }

        let outcome = if rejected {
            ActionOutcome::Rejected
        } else {
            ActionOutcome::Success
        };
        let successors = payloads.len();
        let record = ActionRecord::new(self.stage.action(), message.report_id(), outcome)
            .with_started_at(started_at)
            .with_logs(logger.into_logs())
            .with_params(json!({
                "queue": delivery.queue,
                "reports": outputs.iter().map(|o| o.report.id.to_string()).collect::<Vec<_>>(),
                "successors": successors,
            }));
        pipeline.lineage.record_action(record).await?;
        pipeline.events.send_all(events);

        for (queue, payload) in payloads {
            pipeline.queue.send(queue, payload).await?;
        }
        pipeline.queue.ack(delivery).await?;

        info!(
            stage = self.stage.name(),
            report_id = %message.report_id(),
            blob_url = ?message.blob_ref().map(|(url, _)| url.as_str()),
            outcome = ?outcome,
            successors,
            "Stage completed"
        );
        Ok(())
    }

    /// The input can never succeed: record it, tell observers and drop it.
    async fn reject(
        &self,
        delivery: &Delivery,
        message: &QueueMessage,
        err: PipelineError,
        mut ctx: StageContext,
        started_at: OffsetDateTime,
    ) -> PipelineResult<()> {
        let pipeline = &self.pipeline;
        warn!(
            stage = self.stage.name(),
            report_id = %message.report_id(),
            blob_url = ?message.blob_ref().map(|(url, _)| url.as_str()),
            category = %err.category(),
            error = %err,
            "Rejected message"
        );
        ctx.logger().error(error_code(&err), err.to_string());
        ctx.push_event(PipelineEvent::item_failed(
            message.report_id(),
            None,
            self.stage.action(),
            err.category(),
            err.to_string(),
        ));
        let (logger, events, _) = ctx.into_parts();

        let record = ActionRecord::new(
            self.stage.action(),
            message.report_id(),
            ActionOutcome::Rejected,
        )
        .with_started_at(started_at)
        .with_logs(logger.into_logs())
        .with_params(json!({"queue": delivery.queue}));
        pipeline.lineage.record_action(record).await?;
        pipeline.events.send_all(events);
        pipeline.queue.ack(delivery).await?;
        Ok(())
    }

    /// The stage ran but its successors cannot be queued. Another attempt
    /// would build the same messages, so record the failure and dead-letter.
    async fn abandon(
        &self,
        delivery: &Delivery,
        message: &QueueMessage,
        err: PipelineError,
        mut ctx: StageContext,
        started_at: OffsetDateTime,
    ) -> PipelineResult<()> {
        let pipeline = &self.pipeline;
        error!(
            stage = self.stage.name(),
            report_id = %message.report_id(),
            error = %err,
            "Successor message cannot be queued, dead-lettering"
        );
        ctx.logger().error(error_code(&err), err.to_string());
        let (logger, _, _) = ctx.into_parts();

        let record = ActionRecord::new(
            self.stage.action(),
            message.report_id(),
            ActionOutcome::Failed,
        )
        .with_started_at(started_at)
        .with_logs(logger.into_logs())
        .with_params(json!({
            "queue": delivery.queue,
            "dead_lettered": true,
        }));
        pipeline.lineage.record_action(record).await?;
        pipeline.queue.dead_letter(delivery, &err.to_string()).await?;
        Ok(())
    }

    /// Something outside the input went wrong: record it and let the queue
    /// redeliver.
    async fn fail(
        &self,
        delivery: &Delivery,
        message: &QueueMessage,
        err: PipelineError,
        mut ctx: StageContext,
        started_at: OffsetDateTime,
    ) -> PipelineResult<()> {
        let pipeline = &self.pipeline;
        error!(
            stage = self.stage.name(),
            report_id = %message.report_id(),
            category = %err.category(),
            dequeue_count = delivery.dequeue_count,
            error = %err,
            "Stage failed, message will be redelivered"
        );
        ctx.logger().error(error_code(&err), err.to_string());
        let (logger, _, _) = ctx.into_parts();

        let record = ActionRecord::new(
            self.stage.action(),
            message.report_id(),
            ActionOutcome::Failed,
        )
        .with_started_at(started_at)
        .with_logs(logger.into_logs())
        .with_params(json!({
            "queue": delivery.queue,
            "dequeue_count": delivery.dequeue_count,
        }));
        pipeline.lineage.record_action(record).await?;
        pipeline.queue.release(delivery).await?;
        Ok(())
    }
}
