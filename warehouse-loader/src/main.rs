use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use axum::{routing::get, Router};
use common_metrics::{serve, setup_metrics_routes};
use envconfig::Envconfig;
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use warehouse_loader::{config::Config, context::AppContext, pipeline};

fn setup_tracing() {
    let log_layer: tracing_subscriber::filter::Filtered<
        tracing_subscriber::fmt::Layer<tracing_subscriber::Registry>,
        EnvFilter,
        tracing_subscriber::Registry,
    > = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "warehouse loader"
}

fn start_health_liveness_server(config: &Config, context: Arc<AppContext>) -> JoinHandle<()> {
    let config = config.clone();
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route(
            "/_liveness",
            get(move || ready(context.health_registry.get_status())),
        );
    let router = setup_metrics_routes(router);
    let bind = format!("{}:{}", config.host, config.port);
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    })
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    setup_tracing();
    info!("starting up...");

    let config = Config::init_from_env()?;
    let context = Arc::new(AppContext::new(&config).await?);

    context.spawn_shutdown_listener();
    start_health_liveness_server(&config, context.clone());

    if config.staging_retention_seconds > 0 {
        let sweep_interval = Duration::from_secs(config.staging_sweep_interval_seconds);
        let janitor_liveness = context
            .health_registry
            .register("janitor", sweep_interval * 3);
        tokio::spawn(pipeline::run_staging_janitor(
            context.staging.clone(),
            config.staging_prefix.clone(),
            Duration::from_secs(config.staging_retention_seconds),
            sweep_interval,
            context.running_flag(),
            janitor_liveness,
        ));
    }

    // The driver must report at least once per receive long-poll plus a full
    // load attempt, so the deadline covers the slowest healthy iteration
    let driver_deadline = Duration::from_secs(
        config.receive_max_wait_seconds + config.load_max_wait_seconds + 60,
    );
    let driver_liveness = context.health_registry.register("driver", driver_deadline);
    let mut driver = context.build_driver(driver_liveness);

    driver.run().await;

    info!("shutting down");

    Ok(())
}
