//! Per-entry cancellation monitoring.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::database::repositories::JobRepository;
use crate::domain::JobStatus;

/// Background poller that watches a parent job while one of its queue
/// entries is in flight and fires the entry's cancellation token when the
/// job is observed `CANCELLED`.
///
/// Poll failures are logged and retried on the next tick; they never cancel
/// by themselves.
pub struct CancellationMonitor {
    repo: Arc<dyn JobRepository>,
    job_id: i64,
    poll_interval: Duration,
}

impl CancellationMonitor {
    pub fn new(repo: Arc<dyn JobRepository>, job_id: i64, poll_interval: Duration) -> Self {
        Self {
            repo,
            job_id,
            poll_interval,
        }
    }

    /// Spawn the monitor. It exits when it fires `cancel` or when `done`
    /// fires (the entry's processing completed).
    pub fn spawn(self, cancel: CancellationToken, done: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Consume the immediate first tick so polling starts one
            // interval after the entry.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = done.cancelled() => break,
                    _ = ticker.tick() => {
                        match self.repo.get_job(self.job_id).await {
                            Ok(job) => match job.parsed_status() {
                                Ok(JobStatus::Cancelled) => {
                                    info!(
                                        job_id = self.job_id,
                                        "Parent job cancelled; stopping in-flight entry"
                                    );
                                    cancel.cancel();
                                    break;
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    warn!(job_id = self.job_id, error = %e, "Unreadable job status");
                                }
                            },
                            Err(e) => {
                                warn!(
                                    job_id = self.job_id,
                                    error = %e,
                                    "Cancellation poll failed; retrying next tick"
                                );
                            }
                        }
                    }
                }
            }
        })
    }
}
