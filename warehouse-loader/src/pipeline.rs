use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use health::HealthHandle;
use tracing::{error, info, warn};

use crate::backpressure::AdmissionController;
use crate::batch::BatchAccumulator;
use crate::error::PipelineError;
use crate::fanout::FanoutCoordinator;
use crate::metrics::PipelineMetrics;
use crate::parse::parse_message;
use crate::queue::EventQueue;
use crate::staging::{self, StagingStore};
use crate::warehouse::WarehouseClient;

/// Pause after a failed step before polling the queue again.
const STEP_ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Receiving,
    Accumulating,
    Gating,
    Committing,
    /// A batch failed on the primary target; its messages sit un-acked until
    /// the queue's visibility timeout redelivers them.
    AwaitingRetry,
}

/// What one turn of the driver loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing received and no flush due.
    Idle,
    /// Messages buffered, batch not yet due.
    Buffered,
    /// A batch reached the primary target and was acknowledged.
    Committed,
    /// A batch failed on the primary target; messages retained for
    /// redelivery.
    Retained,
}

/// The top-level loop: receive, accumulate, gate, then commit or retain.
///
/// One logical driver runs per process. Scale-out is many processes competing
/// on the same queue; nothing here coordinates across processes beyond the
/// queue's own visibility mechanics. Retry is implicit: a failed batch is
/// simply never acknowledged.
pub struct PipelineDriver {
    queue: Arc<dyn EventQueue>,
    accumulator: BatchAccumulator,
    controller: AdmissionController,
    fanout: FanoutCoordinator,
    primary_client: Arc<dyn WarehouseClient>,
    metrics: Arc<PipelineMetrics>,
    receive_max_messages: u32,
    receive_max_wait: Duration,
    running: Arc<AtomicBool>,
    liveness: Option<HealthHandle>,
    state: DriverState,
}

impl PipelineDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<dyn EventQueue>,
        accumulator: BatchAccumulator,
        controller: AdmissionController,
        fanout: FanoutCoordinator,
        primary_client: Arc<dyn WarehouseClient>,
        metrics: Arc<PipelineMetrics>,
        receive_max_messages: u32,
        receive_max_wait: Duration,
        running: Arc<AtomicBool>,
        liveness: Option<HealthHandle>,
    ) -> Self {
        Self {
            queue,
            accumulator,
            controller,
            fanout,
            primary_client,
            metrics,
            receive_max_messages,
            receive_max_wait,
            running,
            liveness,
            state: DriverState::Idle,
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// One turn of the loop. Public so tests can drive the pipeline without
    /// the outer run loop.
    pub async fn step(&mut self) -> Result<StepOutcome, PipelineError> {
        self.state = DriverState::Receiving;
        let messages = self
            .queue
            .receive(self.receive_max_messages, self.receive_max_wait)
            .await?;

        if !messages.is_empty() {
            self.metrics.record_received(messages.len() as u64);
            self.state = DriverState::Accumulating;
            for message in messages {
                match parse_message(message) {
                    Ok(parsed) => self.accumulator.offer(parsed),
                    Err(e) => {
                        // Malformed messages are dropped and counted; they
                        // must never block the batch
                        warn!("dropping message: {e}");
                        self.metrics.record_dropped();
                    }
                }
            }
        }

        let Some(trigger) = self.accumulator.should_flush() else {
            self.state = DriverState::Idle;
            return Ok(if self.accumulator.is_empty() {
                StepOutcome::Idle
            } else {
                StepOutcome::Buffered
            });
        };
        let Some(batch) = self.accumulator.flush(trigger) else {
            self.state = DriverState::Idle;
            return Ok(StepOutcome::Idle);
        };
        self.metrics.record_flushed();
        info!(
            "flushed batch {} ({} items, {:?} trigger)",
            batch.id,
            batch.len(),
            trigger
        );

        self.state = DriverState::Gating;
        let delay = self.controller.admission_delay(&*self.primary_client).await;
        self.metrics.record_backpressure_delay(delay);
        if !delay.is_zero() {
            info!("backpressure: waiting {delay:?} before submitting");
            tokio::time::sleep(delay).await;
        }

        self.state = DriverState::Committing;
        let result = self.fanout.commit_batch(&batch).await;
        if result.is_committed() {
            let rows = result
                .primary
                .as_ref()
                .map(|job| job.rows_loaded)
                .unwrap_or_default();
            if let Err(e) = self.queue.delete(&batch.receipt_tokens()).await {
                // The load is durable; redelivered messages load again and
                // the warehouse's idempotent-friendly upserts absorb them
                warn!("failed to ack batch {}: {e}", batch.id);
            }
            self.metrics.record_committed(rows);
            self.state = DriverState::Idle;
            Ok(StepOutcome::Committed)
        } else {
            warn!(
                "batch {} failed on primary ({:?}); leaving {} messages for redelivery",
                batch.id,
                result.error,
                batch.len()
            );
            self.metrics.record_retained();
            self.state = DriverState::AwaitingRetry;
            Ok(StepOutcome::Retained)
        }
    }

    /// Run until shutdown. The flag is checked between steps, so an in-flight
    /// commit always finishes before the process exits: stopping mid-commit
    /// would orphan an un-acked-but-loaded batch.
    pub async fn run(&mut self) {
        info!("pipeline driver starting");
        while self.running.load(Ordering::SeqCst) {
            if let Some(liveness) = &self.liveness {
                liveness.report_healthy();
            }
            if let Err(e) = self.step().await {
                error!("pipeline step failed: {e}");
                tokio::time::sleep(STEP_ERROR_BACKOFF).await;
            }
            self.metrics.flush();
        }
        info!("pipeline driver stopped");
    }
}

/// Periodically deletes staged objects that outlived the retention window.
/// Only runs when a retention window is configured; with zero retention the
/// loader deletes staged files inline.
pub async fn run_staging_janitor(
    store: Arc<dyn StagingStore>,
    prefix: String,
    retention: Duration,
    interval: Duration,
    running: Arc<AtomicBool>,
    liveness: HealthHandle,
) {
    info!("staging janitor starting (retention {retention:?})");
    while running.load(Ordering::SeqCst) {
        liveness.report_healthy();
        match staging::sweep_expired(
            &*store,
            &prefix,
            retention.as_secs(),
            Utc::now().timestamp(),
        )
        .await
        {
            Ok(0) => {}
            Ok(swept) => info!("swept {swept} expired staged objects"),
            Err(e) => warn!("staging sweep failed: {e}"),
        }
        tokio::time::sleep(interval).await;
    }
    info!("staging janitor stopped");
}
