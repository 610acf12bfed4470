use std::sync::Arc;

use tracing::{info, warn};

use crate::batch::Batch;
use crate::bulk::{BulkLoader, LoadJob};
use crate::metrics::PipelineMetrics;
use crate::warehouse::{SinkTarget, WarehouseClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    /// Primary finished; secondary (if enabled) finished too.
    Success,
    /// Primary finished but the secondary diverged. Still acknowledged; the
    /// divergence is a monitoring signal, not a pipeline failure.
    PartialSuccess,
    /// Primary did not finish. The batch's messages stay un-acked.
    Failed,
}

#[derive(Debug)]
pub struct CommitResult {
    pub status: CommitStatus,
    pub primary: Option<LoadJob>,
    pub secondary: Option<LoadJob>,
    pub error: Option<String>,
}

impl CommitResult {
    /// Whether the batch should be acknowledged. Only the primary outcome
    /// matters.
    pub fn is_committed(&self) -> bool {
        matches!(
            self.status,
            CommitStatus::Success | CommitStatus::PartialSuccess
        )
    }
}

/// Drives the bulk loader against the primary target and, when enabled, an
/// independent secondary target in parallel. The secondary load runs on its
/// own task so that neither its errors nor its panics can reach the primary
/// path.
pub struct FanoutCoordinator {
    loader: BulkLoader,
    primary_target: SinkTarget,
    primary_client: Arc<dyn WarehouseClient>,
    secondary: Option<(SinkTarget, Arc<dyn WarehouseClient>)>,
    metrics: Arc<PipelineMetrics>,
}

impl FanoutCoordinator {
    pub fn new(
        loader: BulkLoader,
        primary_target: SinkTarget,
        primary_client: Arc<dyn WarehouseClient>,
        secondary: Option<(SinkTarget, Arc<dyn WarehouseClient>)>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            loader,
            primary_target,
            primary_client,
            secondary,
            metrics,
        }
    }

    pub async fn commit_batch(&self, batch: &Batch) -> CommitResult {
        let secondary_handle = self.secondary.as_ref().map(|(target, client)| {
            let loader = self.loader.clone();
            let target = target.clone();
            let client = client.clone();
            let batch = batch.clone();
            tokio::spawn(async move { loader.load(&batch, &target, &*client).await })
        });

        let primary_result = self
            .loader
            .load(batch, &self.primary_target, &*self.primary_client)
            .await;

        let mut secondary_job = None;
        let mut secondary_failed = false;
        if let Some(handle) = secondary_handle {
            match handle.await {
                Ok(Ok(job)) => {
                    if !job.status.is_success() {
                        warn!(
                            "secondary load of batch {} ended {:?}: {:?}",
                            batch.id, job.status, job.error
                        );
                        secondary_failed = true;
                    }
                    secondary_job = Some(job);
                }
                Ok(Err(e)) => {
                    warn!("secondary load of batch {} errored: {e}", batch.id);
                    secondary_failed = true;
                }
                Err(e) => {
                    warn!("secondary load of batch {} panicked: {e}", batch.id);
                    secondary_failed = true;
                }
            }
            if secondary_failed {
                self.metrics.record_secondary_failure();
            }
        }

        match primary_result {
            Ok(job) if job.status.is_success() => {
                let status = if secondary_failed {
                    CommitStatus::PartialSuccess
                } else {
                    CommitStatus::Success
                };
                info!(
                    "batch {} committed ({} rows, {:?})",
                    batch.id, job.rows_loaded, status
                );
                CommitResult {
                    status,
                    primary: Some(job),
                    secondary: secondary_job,
                    error: None,
                }
            }
            Ok(job) => {
                let error = job.error.clone();
                CommitResult {
                    status: CommitStatus::Failed,
                    primary: Some(job),
                    secondary: secondary_job,
                    error,
                }
            }
            Err(e) => CommitResult {
                status: CommitStatus::Failed,
                primary: None,
                secondary: secondary_job,
                error: Some(e.to_string()),
            },
        }
    }
}
