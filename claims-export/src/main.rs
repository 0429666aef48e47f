//! claims-export - bulk export worker daemon.
//!
//! Consumes beneficiary-slice queue entries, streams FHIR resources from the
//! upstream claims data service into NDJSON artifacts, and publishes
//! completed export jobs.

use std::sync::Arc;

use claims_export::config::Config;
use claims_export::database;
use claims_export::database::repositories::{
    QueueRepository, SqlxJobRepository, SqlxQueueRepository,
};
use claims_export::logging::init_logging;
use claims_export::metrics::LogMetricsSink;
use claims_export::pipeline::{ExportWorker, WorkerConfig, WorkerPool, WorkerPoolConfig};
use claims_export::upstream::{FhirClient, FhirClientConfig};
use claims_export::utils::fs;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_dir = std::env::var("LOG_DIR").unwrap_or_else(|_| "logs".to_string());
    let _guard = init_logging(&log_dir)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;
    claims_export::panic_hook::install(&log_dir);

    info!("Starting claims-export v{}", env!("CARGO_PKG_VERSION"));

    // Load environment variables
    dotenvy::dotenv().ok();
    let config = Config::from_env();

    info!("Connecting to database: {}", config.database_url);
    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    // Fail fast on unwritable artifact roots.
    fs::probe_writable(&config.staging_dir)?;
    fs::probe_writable(&config.payload_dir)?;

    let job_repo = Arc::new(SqlxJobRepository::new(pool.clone()));
    let queue: Arc<dyn QueueRepository> = Arc::new(SqlxQueueRepository::new(pool.clone()));

    // Entries claimed by a crashed process become claimable again.
    let recovered = queue.reset_claimed().await?;
    if recovered > 0 {
        info!(recovered, "Recovered queue entries from a previous process");
    }

    let upstream = Arc::new(FhirClient::new(FhirClientConfig {
        host: config.upstream_host.clone(),
        default_base_path: config.upstream_base_path.clone(),
        timeout_secs: config.upstream_timeout_secs,
    })?);

    let worker = Arc::new(ExportWorker::new(
        job_repo,
        upstream,
        WorkerConfig::from(&config),
    ));

    let worker_pool = WorkerPool::new(WorkerPoolConfig {
        workers: config.worker_pool_size,
        poll_interval_ms: config.worker_poll_interval_ms,
        deployment_target: config.deployment_target.clone(),
    });
    worker_pool.start(queue.clone(), worker, Arc::new(LogMetricsSink));

    info!("claims-export started successfully");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), initiating shutdown...");
        }
        _ = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    // Drain in-flight entries; unclaimed ones stay durable in the queue.
    worker_pool.stop().await;
    pool.close().await;

    info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
