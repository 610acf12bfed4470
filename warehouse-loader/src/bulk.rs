use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::batch::Batch;
use crate::error::PipelineError;
use crate::metrics::PipelineMetrics;
use crate::schema::SchemaSynchronizer;
use crate::staging::{self, StagedBatch, StagingStore};
use crate::warehouse::{LoadStatement, RemoteJobState, SinkTarget, WarehouseClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadJobStatus {
    Pending,
    Staged,
    Submitted,
    Running,
    Finished,
    Failed,
    /// No terminal state before the maximum load wait. Treated identically to
    /// `Failed` by every caller.
    TimedOut,
}

impl LoadJobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LoadJobStatus::Finished | LoadJobStatus::Failed | LoadJobStatus::TimedOut
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, LoadJobStatus::Finished)
    }
}

/// One load attempt of one batch against one sink target.
#[derive(Debug, Clone)]
pub struct LoadJob {
    pub id: Uuid,
    pub target_name: String,
    pub batch_id: Uuid,
    pub item_count: usize,
    pub external_job_id: Option<String>,
    pub status: LoadJobStatus,
    pub rows_loaded: u64,
    /// False when the target reported no usable row count and `rows_loaded`
    /// is the submitted item count instead. Load completion is authoritative
    /// either way; the count is advisory.
    pub row_count_verified: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub poll_interval: Duration,
    pub max_load_wait: Duration,
    pub staging_prefix: String,
    /// Zero deletes staged objects as soon as their load finishes; otherwise
    /// the janitor sweeps them out after this window.
    pub staging_retention: Duration,
    pub max_rows_per_part: usize,
}

/// Drives one batch through the bulk-load protocol: stage, additive schema
/// sync for targets that want it, submit, poll to a terminal state, clean up.
///
/// Infrastructure failures (staging, schema, submission) return `Err` and the
/// batch's messages stay un-acked. A job the warehouse accepted always comes
/// back `Ok` with its terminal status; deciding what a non-`Finished` status
/// means is the fan-out coordinator's job.
#[derive(Clone)]
pub struct BulkLoader {
    staging: Arc<dyn StagingStore>,
    schema: Arc<SchemaSynchronizer>,
    metrics: Arc<PipelineMetrics>,
    config: LoaderConfig,
}

impl BulkLoader {
    pub fn new(
        staging: Arc<dyn StagingStore>,
        schema: Arc<SchemaSynchronizer>,
        metrics: Arc<PipelineMetrics>,
        config: LoaderConfig,
    ) -> Self {
        Self {
            staging,
            schema,
            metrics,
            config,
        }
    }

    pub async fn load(
        &self,
        batch: &Batch,
        target: &SinkTarget,
        client: &dyn WarehouseClient,
    ) -> Result<LoadJob, PipelineError> {
        let mut job = LoadJob {
            id: Uuid::now_v7(),
            target_name: target.name.clone(),
            batch_id: batch.id,
            item_count: batch.len(),
            external_job_id: None,
            status: LoadJobStatus::Pending,
            rows_loaded: 0,
            row_count_verified: false,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        };

        // Staged objects are namespaced per target: the same batch loads into
        // both targets concurrently, and each load owns its staged files.
        let prefix = format!("{}/{}", self.config.staging_prefix, target.name);
        let staged =
            staging::stage_batch(&*self.staging, &prefix, self.config.max_rows_per_part, batch)
                .await?;
        job.status = LoadJobStatus::Staged;
        debug!(
            "staged batch {} for {}: {} parts at {}",
            batch.id,
            target.name,
            staged.part_count,
            staged.location.uri()
        );

        if target.schema_evolution {
            if let Err(e) = self.sync_schema(batch, target, client).await {
                self.cleanup(&staged).await;
                return Err(e);
            }
        }

        let statement = LoadStatement {
            table: target.table.clone(),
            location: staged.location.uri().to_owned(),
            manifest: staged.location.is_manifest(),
        };
        let external_id = match client.submit(&statement).await {
            Ok(id) => id,
            Err(e) => {
                self.cleanup(&staged).await;
                return Err(PipelineError::Load {
                    target: target.name.clone(),
                    reason: e.to_string(),
                });
            }
        };
        job.external_job_id = Some(external_id.clone());
        job.status = LoadJobStatus::Submitted;

        self.poll_to_terminal(&mut job, target, client, &external_id)
            .await;
        job.finished_at = Some(Utc::now());

        match job.status {
            LoadJobStatus::Finished => {
                if self.config.staging_retention.is_zero() {
                    self.cleanup(&staged).await;
                } else {
                    debug!(
                        "retaining staged batch {} for {:?}",
                        batch.id, self.config.staging_retention
                    );
                }
            }
            _ => self.cleanup(&staged).await,
        }

        Ok(job)
    }

    async fn sync_schema(
        &self,
        batch: &Batch,
        target: &SinkTarget,
        client: &dyn WarehouseClient,
    ) -> Result<(), PipelineError> {
        let observed = batch.observed_fields();
        match self
            .schema
            .sync(&target.name, client, &target.table, &observed)
            .await
        {
            Ok(_) => Ok(()),
            Err(first) => {
                warn!("schema sync failed on {}, retrying once: {first}", target.name);
                self.schema
                    .sync(&target.name, client, &target.table, &observed)
                    .await
                    .map(|_| ())
            }
        }
    }

    async fn poll_to_terminal(
        &self,
        job: &mut LoadJob,
        target: &SinkTarget,
        client: &dyn WarehouseClient,
        external_id: &str,
    ) {
        let deadline = Instant::now() + self.config.max_load_wait;
        loop {
            match client.describe(external_id).await {
                Ok(description) => match description.state {
                    RemoteJobState::Success => {
                        self.finish(job, description.rows_affected);
                        return;
                    }
                    RemoteJobState::Failed => {
                        job.status = LoadJobStatus::Failed;
                        job.error = description
                            .error
                            .or_else(|| Some("load failed without detail".to_owned()));
                        return;
                    }
                    RemoteJobState::Queued | RemoteJobState::Running => {
                        job.status = LoadJobStatus::Running;
                    }
                },
                // Transient describe failures don't fail the job; the
                // deadline bounds how long we keep trying
                Err(e) => warn!("describe {external_id} on {} failed: {e}", target.name),
            }

            if Instant::now() >= deadline {
                job.status = LoadJobStatus::TimedOut;
                job.error = Some(format!(
                    "no terminal state after {}s",
                    self.config.max_load_wait.as_secs()
                ));
                return;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    fn finish(&self, job: &mut LoadJob, rows_affected: Option<u64>) {
        job.status = LoadJobStatus::Finished;
        match rows_affected {
            Some(rows) if rows > 0 => {
                job.rows_loaded = rows;
                job.row_count_verified = true;
            }
            // Bulk-load statements commonly report zero on success; the
            // terminal state is authoritative, so substitute the submitted
            // count rather than inferring data loss
            _ => {
                job.rows_loaded = job.item_count as u64;
                job.row_count_verified = false;
                info!(
                    "{} reported no row count for job {}, assuming {} rows",
                    job.target_name, job.id, job.item_count
                );
            }
        }
    }

    async fn cleanup(&self, staged: &StagedBatch) {
        let failures = staging::delete_staged(&*self.staging, staged).await;
        if failures > 0 {
            self.metrics.record_cleanup_failures(failures as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::FlushTrigger;
    use crate::parse::ParsedMessage;
    use crate::staging::MemoryStagingStore;
    use crate::warehouse::{JobScript, MockWarehouseClient};

    fn batch_of(n: usize) -> Batch {
        let items = (0..n)
            .map(|i| {
                let mut row = serde_json::Map::new();
                row.insert("event".to_string(), serde_json::json!("signup"));
                row.insert("seq".to_string(), serde_json::json!(i));
                ParsedMessage {
                    id: i.to_string(),
                    receipt_token: format!("token-{i}"),
                    row,
                    enqueued_at: Utc::now(),
                }
            })
            .collect();
        Batch {
            id: Uuid::now_v7(),
            items,
            created_at: Utc::now(),
            trigger: FlushTrigger::Size,
        }
    }

    fn target(schema_evolution: bool) -> SinkTarget {
        SinkTarget {
            name: "primary".to_string(),
            endpoint: "http://localhost:8123".to_string(),
            token: String::new(),
            table: "events".to_string(),
            schema_evolution,
        }
    }

    fn loader(staging: Arc<MemoryStagingStore>, retention: Duration) -> BulkLoader {
        BulkLoader::new(
            staging,
            Arc::new(SchemaSynchronizer::new()),
            Arc::new(PipelineMetrics::new()),
            LoaderConfig {
                poll_interval: Duration::from_millis(1),
                max_load_wait: Duration::from_millis(100),
                staging_prefix: "loads".to_string(),
                staging_retention: retention,
                max_rows_per_part: 1000,
            },
        )
    }

    #[tokio::test]
    async fn test_finished_with_zero_rows_substitutes_item_count() {
        let staging = Arc::new(MemoryStagingStore::new("staging"));
        let warehouse = MockWarehouseClient::new().with_table("events", &["event", "seq"]);
        let loader = loader(staging.clone(), Duration::ZERO);

        let job = loader
            .load(&batch_of(10), &target(true), &warehouse)
            .await
            .unwrap();

        assert_eq!(job.status, LoadJobStatus::Finished);
        assert!(job.status.is_success());
        assert_eq!(job.rows_loaded, 10);
        assert!(!job.row_count_verified);
        assert!(job.external_job_id.is_some());
        // Immediate cleanup with zero retention
        assert_eq!(staging.object_count(), 0);
    }

    #[tokio::test]
    async fn test_reported_rows_are_verified() {
        let staging = Arc::new(MemoryStagingStore::new("staging"));
        let warehouse = MockWarehouseClient::new().with_table("events", &["event", "seq"]);
        warehouse.script_job(JobScript::succeed_with_rows(10).after_polls(3));
        let loader = loader(staging, Duration::ZERO);

        let job = loader
            .load(&batch_of(10), &target(true), &warehouse)
            .await
            .unwrap();

        assert_eq!(job.status, LoadJobStatus::Finished);
        assert_eq!(job.rows_loaded, 10);
        assert!(job.row_count_verified);
    }

    #[tokio::test]
    async fn test_failed_load_cleans_staging_and_reports() {
        let staging = Arc::new(MemoryStagingStore::new("staging"));
        let warehouse = MockWarehouseClient::new().with_table("events", &["event", "seq"]);
        warehouse.script_job(JobScript::fail("disk full"));
        let loader = loader(staging.clone(), Duration::from_secs(3600));

        let job = loader
            .load(&batch_of(10), &target(true), &warehouse)
            .await
            .unwrap();

        assert_eq!(job.status, LoadJobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("disk full"));
        // Failure cleanup happens even with a retention window configured
        assert_eq!(staging.object_count(), 0);
    }

    #[tokio::test]
    async fn test_unfinished_job_times_out() {
        let staging = Arc::new(MemoryStagingStore::new("staging"));
        let warehouse = MockWarehouseClient::new().with_table("events", &["event", "seq"]);
        warehouse.script_job(JobScript::never_finish());
        let loader = loader(staging.clone(), Duration::ZERO);

        let job = loader
            .load(&batch_of(2), &target(true), &warehouse)
            .await
            .unwrap();

        assert_eq!(job.status, LoadJobStatus::TimedOut);
        assert!(job.status.is_terminal());
        assert!(!job.status.is_success());
        assert_eq!(staging.object_count(), 0);
    }

    #[tokio::test]
    async fn test_multi_part_batch_submits_manifest() {
        let staging = Arc::new(MemoryStagingStore::new("staging"));
        let warehouse = MockWarehouseClient::new().with_table("events", &["event", "seq"]);
        let mut loader = loader(staging, Duration::ZERO);
        loader.config.max_rows_per_part = 4;

        loader
            .load(&batch_of(10), &target(true), &warehouse)
            .await
            .unwrap();

        let submitted = warehouse.submitted();
        assert_eq!(submitted.len(), 1);
        assert!(submitted[0].manifest);
        assert!(submitted[0].location.contains("manifest.json"));
    }

    #[tokio::test]
    async fn test_schema_evolution_adds_columns_before_submit() {
        let staging = Arc::new(MemoryStagingStore::new("staging"));
        let warehouse = MockWarehouseClient::new().with_table("events", &["event"]);
        let loader = loader(staging, Duration::ZERO);

        loader
            .load(&batch_of(3), &target(true), &warehouse)
            .await
            .unwrap();

        let added = warehouse.added_columns();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].1, "seq");
    }

    #[tokio::test]
    async fn test_schema_evolution_disabled_never_touches_schema() {
        let staging = Arc::new(MemoryStagingStore::new("staging"));
        let warehouse = MockWarehouseClient::new();
        let loader = loader(staging, Duration::ZERO);

        loader
            .load(&batch_of(3), &target(false), &warehouse)
            .await
            .unwrap();

        assert!(warehouse.added_columns().is_empty());
    }

    #[tokio::test]
    async fn test_staging_failure_aborts_before_submission() {
        let staging = Arc::new(MemoryStagingStore::new("staging"));
        staging.set_fail_puts(true);
        let warehouse = MockWarehouseClient::new();
        let loader = loader(staging, Duration::ZERO);

        let result = loader.load(&batch_of(3), &target(false), &warehouse).await;
        assert!(matches!(result, Err(PipelineError::Stage(_))));
        assert_eq!(warehouse.submitted_count(), 0);
    }

    #[tokio::test]
    async fn test_submit_failure_cleans_staging() {
        let staging = Arc::new(MemoryStagingStore::new("staging"));
        let warehouse = MockWarehouseClient::new();
        warehouse.set_fail_submits(1);
        let loader = loader(staging.clone(), Duration::ZERO);

        let result = loader.load(&batch_of(3), &target(false), &warehouse).await;
        assert!(matches!(result, Err(PipelineError::Load { .. })));
        assert_eq!(staging.object_count(), 0);
    }

    #[tokio::test]
    async fn test_retention_defers_cleanup_on_success() {
        let staging = Arc::new(MemoryStagingStore::new("staging"));
        let warehouse = MockWarehouseClient::new().with_table("events", &["event", "seq"]);
        let loader = loader(staging.clone(), Duration::from_secs(3600));

        let job = loader
            .load(&batch_of(3), &target(true), &warehouse)
            .await
            .unwrap();

        assert_eq!(job.status, LoadJobStatus::Finished);
        assert_eq!(staging.object_count(), 1, "staged part kept for the janitor");
    }

    #[tokio::test]
    async fn test_schema_failure_retries_then_retains_batch() {
        let staging = Arc::new(MemoryStagingStore::new("staging"));
        let warehouse = MockWarehouseClient::new().with_table("events", &["event"]);
        warehouse.set_fail_add_columns(2);
        let loader = loader(staging.clone(), Duration::ZERO);

        let result = loader.load(&batch_of(3), &target(true), &warehouse).await;
        assert!(matches!(result, Err(PipelineError::Schema { .. })));
        assert_eq!(warehouse.submitted_count(), 0);
        assert_eq!(staging.object_count(), 0, "staged parts cleaned up");
    }

    #[tokio::test]
    async fn test_schema_retry_recovers_from_transient_failure() {
        let staging = Arc::new(MemoryStagingStore::new("staging"));
        let warehouse = MockWarehouseClient::new().with_table("events", &["event"]);
        warehouse.set_fail_add_columns(1);
        let loader = loader(staging, Duration::ZERO);

        let job = loader
            .load(&batch_of(3), &target(true), &warehouse)
            .await
            .unwrap();
        assert_eq!(job.status, LoadJobStatus::Finished);
    }
}
