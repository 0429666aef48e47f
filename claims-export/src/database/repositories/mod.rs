//! Repositories over the SQLite pool.

pub mod job;
pub mod queue;

pub use job::{JobRepository, SqlxJobRepository};
pub use queue::{QueueRepository, SqlxQueueRepository};

use std::future::Future;
use std::time::Duration;

use rand::random;
use tokio::time::sleep;
use tracing::debug;

use crate::{Error, Result};

/// How repository operations behave when SQLite reports the database busy
/// or locked. Several queue consumers share one pool, so short write
/// collisions are expected under load and absorbed here instead of
/// surfacing as transient entry failures.
#[derive(Debug, Clone)]
pub struct BusyRetryPolicy {
    /// Attempts before the busy error is surfaced to the caller.
    pub max_attempts: u32,
    /// Delay before the first retry; later delays ramp quadratically.
    pub base_delay: Duration,
    /// Ceiling on any single delay.
    pub max_delay: Duration,
}

impl Default for BusyRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_millis(15),
            max_delay: Duration::from_millis(200),
        }
    }
}

impl BusyRetryPolicy {
    /// Quadratic ramp capped at `max_delay`, then jittered downward into
    /// `[delay/2, delay]` so concurrent consumers spread out instead of
    /// retrying in lockstep.
    fn delay_for(&self, attempt: u32) -> Duration {
        let ramp = self
            .base_delay
            .saturating_mul(attempt.saturating_add(1).pow(2))
            .min(self.max_delay);
        let ms = ramp.as_millis() as u64;
        let jittered = ms / 2 + random::<u64>() % (ms / 2 + 1);
        Duration::from_millis(jittered.max(1))
    }

    /// Run a repository operation, retrying while SQLite reports busy.
    /// Anything other than a busy/locked result code fails immediately.
    pub(crate) async fn run<T, F, Fut>(&self, op_name: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        for attempt in 0..self.max_attempts {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !is_busy(&err) || attempt + 1 == self.max_attempts {
                return Err(err);
            }

            let delay = self.delay_for(attempt);
            debug!(
                op = op_name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Database busy, backing off"
            );
            sleep(delay).await;
        }

        // max_attempts of zero gets a single try.
        op().await
    }
}

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6) arrive either as primary result
/// codes or, for some statements, only in the message text.
fn is_busy(err: &Error) -> bool {
    let Error::DatabaseSqlx(sqlx::Error::Database(db_err)) = err else {
        return false;
    };

    if matches!(db_err.code().as_deref(), Some("5") | Some("6")) {
        return true;
    }

    let message = db_err.message().to_ascii_lowercase();
    message.contains("database is locked") || message.contains("database is busy")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_stay_within_policy_bounds() {
        let policy = BusyRetryPolicy::default();
        for attempt in 0..12 {
            let delay = policy.delay_for(attempt);
            assert!(delay >= Duration::from_millis(1));
            assert!(delay <= policy.max_delay);
        }
    }

    #[test]
    fn first_delay_starts_from_base() {
        let policy = BusyRetryPolicy::default();
        let delay = policy.delay_for(0);
        // Jitter keeps the delay in the upper half of the ramp, with
        // integer-millisecond rounding.
        let floor = Duration::from_millis(policy.base_delay.as_millis() as u64 / 2);
        assert!(delay >= floor);
        assert!(delay <= policy.base_delay);
    }

    #[tokio::test]
    async fn success_passes_through() {
        let policy = BusyRetryPolicy::default();
        let value = policy.run("test_op", || async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn non_busy_errors_are_not_retried() {
        let policy = BusyRetryPolicy::default();
        let calls = AtomicU32::new(0);

        let result: Result<()> = policy
            .run("test_op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Other("not a lock".to_string())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
