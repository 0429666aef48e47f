//! Worker pool: long-running queue consumers.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::database::repositories::QueueRepository;
use crate::metrics::{JOB_QUEUE_COUNT, MetricsSink};
use crate::pipeline::worker::{Disposition, ExportWorker};

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of consumers; the pool's parallelism.
    pub workers: usize,
    /// Poll interval fallback in milliseconds.
    pub poll_interval_ms: u64,
    /// Non-empty enables the queue-depth gauge after each entry.
    pub deployment_target: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            poll_interval_ms: 100,
            deployment_target: String::new(),
        }
    }
}

/// A pool of queue consumers, each processing one entry at a time.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    /// Shutdown signal shared by every consumer.
    cancellation_token: CancellationToken,
    /// Task set for consumers.
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self {
            config,
            cancellation_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Start the consumers. Does not block; entries are dispatched
    /// synchronously on each consumer task.
    pub fn start(
        &self,
        queue: Arc<dyn QueueRepository>,
        worker: Arc<ExportWorker>,
        metrics: Arc<dyn MetricsSink>,
    ) {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let max_poll_interval = Duration::from_millis(
            self.config
                .poll_interval_ms
                .max(1)
                .saturating_mul(50)
                .max(1000),
        );

        info!(
            "Starting worker pool with {} consumers",
            self.config.workers
        );

        let mut tasks = self.tasks.lock();
        if let Some(ref mut join_set) = *tasks {
            for i in 0..self.config.workers {
                let cancellation_token = self.cancellation_token.clone();
                let queue = queue.clone();
                let worker = worker.clone();
                let metrics = metrics.clone();
                let notifier = queue.notifier();
                let deployment_target = self.config.deployment_target.clone();

                join_set.spawn(async move {
                    debug!("Consumer {} started", i);
                    let mut current_poll_interval = poll_interval;

                    loop {
                        if cancellation_token.is_cancelled() {
                            debug!("Consumer {} shutting down", i);
                            break;
                        }

                        // Wait for an enqueue or the poll fallback (covers
                        // cross-process enqueuers and missed notifies).
                        tokio::select! {
                            _ = cancellation_token.cancelled() => {
                                break;
                            }
                            _ = notifier.notified() => {}
                            _ = tokio::time::sleep(current_poll_interval) => {}
                        }

                        if cancellation_token.is_cancelled() {
                            break;
                        }

                        let entry = match queue.claim_next().await {
                            Ok(Some(entry)) => entry,
                            Ok(None) => {
                                current_poll_interval =
                                    backoff(current_poll_interval, max_poll_interval);
                                continue;
                            }
                            Err(e) => {
                                error!("Error claiming queue entry: {}", e);
                                current_poll_interval =
                                    backoff(current_poll_interval, max_poll_interval);
                                continue;
                            }
                        };
                        current_poll_interval = poll_interval;

                        let entry_id = entry.id;
                        debug!("Consumer {} processing queue entry {}", i, entry_id);

                        match worker.process(&entry).await {
                            Disposition::Ack => {
                                if let Err(e) = queue.ack(entry_id).await {
                                    error!(queue_id = entry_id, error = %e, "Could not ack queue entry");
                                }
                            }
                            Disposition::Retry(err) => {
                                warn!(
                                    queue_id = entry_id,
                                    attempts = entry.error_count,
                                    error = %err,
                                    "Entry failed; rescheduling with backoff"
                                );
                                if let Err(e) = queue.retry(&entry).await {
                                    error!(queue_id = entry_id, error = %e, "Could not reschedule queue entry");
                                }
                            }
                        }

                        publish_queue_depth(&queue, &metrics, &deployment_target).await;
                    }
                });
            }
        }
    }

    /// Signal shutdown and wait for in-flight entries to finish. Entries not
    /// yet claimed stay in the store for the next process.
    pub async fn stop(&self) {
        info!("Stopping worker pool");
        self.cancellation_token.cancel();

        // Take the join set out of the mutex before awaiting
        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };

        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }

        info!("Worker pool stopped");
    }

    /// Check if the pool is running.
    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }
}

fn backoff(current: Duration, max: Duration) -> Duration {
    let next_ms = (current.as_millis() as u64)
        .saturating_mul(2)
        .min(max.as_millis() as u64);
    Duration::from_millis(next_ms.max(1))
}

/// Gauge the outstanding queue depth; only published when an environment tag
/// is configured.
async fn publish_queue_depth(
    queue: &Arc<dyn QueueRepository>,
    metrics: &Arc<dyn MetricsSink>,
    deployment_target: &str,
) {
    if deployment_target.is_empty() {
        return;
    }

    match queue.depth().await {
        Ok(depth) => {
            if let Err(e) = metrics
                .put_gauge(
                    JOB_QUEUE_COUNT,
                    depth as f64,
                    &[("Environment", deployment_target)],
                )
                .await
            {
                warn!(error = %e, "Could not publish queue depth gauge");
            }
        }
        Err(e) => warn!(error = %e, "Could not read queue depth"),
    }
}
