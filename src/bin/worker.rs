use face_redact_pipeline::{
    app_state::AppState,
    config::AppConfig,
    db,
    routes::metrics::describe_metrics,
    services::worker,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const DEPTH_REPORT_INTERVAL: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting face redaction worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");
    config.validate().expect("Invalid configuration");

    let metrics_addr: SocketAddr = config
        .worker_metrics_addr
        .parse()
        .expect("Invalid WORKER_METRICS_ADDR");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("Failed to install Prometheus exporter");
    describe_metrics();

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    let state = AppState::from_config(&config, db_pool).expect("Failed to initialize services");

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();

    for worker_id in 0..config.processing_concurrency {
        tasks.spawn(worker::run_processing_worker(
            state.clone(),
            worker_id,
            cancel.clone(),
        ));
    }
    for worker_id in 0..config.webhook_concurrency {
        tasks.spawn(worker::run_webhook_worker(
            state.clone(),
            worker_id,
            cancel.clone(),
        ));
    }
    tasks.spawn(worker::report_queue_depths(
        state.clone(),
        DEPTH_REPORT_INTERVAL,
        cancel.clone(),
    ));

    tracing::info!(
        processing_workers = config.processing_concurrency,
        webhook_workers = config.webhook_concurrency,
        metrics_addr = %metrics_addr,
        "Worker ready"
    );

    shutdown_signal().await;
    cancel.cancel();

    // In-flight jobs finish before their tasks return.
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            tracing::error!(error = %e, "Worker task panicked");
        }
    }

    tracing::info!("Worker stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, draining workers"),
        () = terminate => tracing::info!("Received SIGTERM, draining workers"),
    }
}
