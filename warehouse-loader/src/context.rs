use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use health::{HealthHandle, HealthRegistry};
use tracing::info;

use crate::backpressure::AdmissionController;
use crate::batch::BatchAccumulator;
use crate::bulk::BulkLoader;
use crate::config::Config;
use crate::fanout::FanoutCoordinator;
use crate::metrics::PipelineMetrics;
use crate::pipeline::PipelineDriver;
use crate::queue::{EventQueue, PgEventQueue};
use crate::schema::SchemaSynchronizer;
use crate::staging::{S3StagingStore, StagingStore};
use crate::warehouse::{HttpWarehouseClient, SinkTarget, WarehouseClient};

pub struct AppContext {
    pub config: Config,
    pub queue: Arc<dyn EventQueue>,
    pub staging: Arc<dyn StagingStore>,
    pub primary: (SinkTarget, Arc<dyn WarehouseClient>),
    pub secondary: Option<(SinkTarget, Arc<dyn WarehouseClient>)>,
    pub health_registry: HealthRegistry,
    pub metrics: Arc<PipelineMetrics>,
    running: Arc<AtomicBool>,
}

impl AppContext {
    pub async fn new(config: &Config) -> Result<Self, Error> {
        let health_registry = HealthRegistry::new("liveness");

        let queue = PgEventQueue::new(
            &config.queue_table,
            &config.queue_database_url,
            config.max_pg_connections,
            Duration::from_secs(config.queue_visibility_timeout_seconds),
        )
        .await?;

        let staging_endpoint = (!config.staging_endpoint.is_empty())
            .then_some(config.staging_endpoint.as_str());
        let staging = S3StagingStore::from_env(
            &config.aws_region,
            staging_endpoint,
            config.staging_bucket.clone(),
        )
        .await;

        let primary_target = config.primary_target();
        let primary_client: Arc<dyn WarehouseClient> =
            Arc::new(HttpWarehouseClient::new(&primary_target)?);

        let secondary = match config.secondary_target() {
            Some(target) => {
                let client: Arc<dyn WarehouseClient> =
                    Arc::new(HttpWarehouseClient::new(&target)?);
                Some((target, client))
            }
            None => None,
        };

        Ok(Self {
            config: config.clone(),
            queue: Arc::new(queue),
            staging: Arc::new(staging),
            primary: (primary_target, primary_client),
            secondary,
            health_registry,
            metrics: Arc::new(PipelineMetrics::new()),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Cooperative shutdown: the flag stops new receives, in-flight commits
    /// finish before the process exits.
    pub fn spawn_shutdown_listener(self: &Arc<Self>) {
        let running = self.running.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received, stopping after the current step");
            running.store(false, Ordering::SeqCst);
        });
    }

    pub fn build_driver(&self, liveness: HealthHandle) -> PipelineDriver {
        let loader = BulkLoader::new(
            self.staging.clone(),
            Arc::new(SchemaSynchronizer::new()),
            self.metrics.clone(),
            self.config.loader_config(),
        );
        let fanout = FanoutCoordinator::new(
            loader,
            self.primary.0.clone(),
            self.primary.1.clone(),
            self.secondary.clone(),
            self.metrics.clone(),
        );

        PipelineDriver::new(
            self.queue.clone(),
            BatchAccumulator::new(self.config.target_batch_size, self.config.max_batch_wait()),
            AdmissionController::new(self.config.backpressure_config()),
            fanout,
            self.primary.1.clone(),
            self.metrics.clone(),
            self.config.receive_max_messages,
            self.config.receive_max_wait(),
            self.running.clone(),
            Some(liveness),
        )
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
