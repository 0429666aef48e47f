//! Durable work queue repository.
//!
//! FIFO-ish: claiming honors priority, then insertion order, among entries
//! whose visibility timestamp has passed. Retry backoff is computed here so
//! every consumer reschedules identically.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use sqlx::SqlitePool;
use tokio::sync::Notify;

use super::BusyRetryPolicy;
use crate::Result;
use crate::database::models::QueueEntryDbModel;

/// Super-linear backoff for the given post-increment error count, so the
/// orphan-entry retry budget comfortably outlasts any legitimate admission
/// latency.
pub fn retry_backoff(error_count: i64) -> Duration {
    let count = error_count.max(0) as u64;
    Duration::from_secs(count.pow(4) + 3)
}

/// Timestamps compared in SQL use a fixed-width RFC 3339 form so that
/// lexicographic order is chronological order.
fn now_str() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Durable FIFO-ish work items with retry bookkeeping.
#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// Insert a new entry and wake a same-process consumer.
    async fn enqueue(&self, payload: &str, priority: i64) -> Result<i64>;
    /// Atomically claim the next due entry, if any.
    async fn claim_next(&self) -> Result<Option<QueueEntryDbModel>>;
    /// Acknowledge an entry as done (or unrecoverably bad): deletes it.
    async fn ack(&self, id: i64) -> Result<()>;
    /// Reschedule a failed entry: bumps `error_count`, clears the claim and
    /// pushes visibility out by [`retry_backoff`].
    async fn retry(&self, entry: &QueueEntryDbModel) -> Result<()>;
    /// Count of live entries (claimed or not); the queue-depth gauge input.
    async fn depth(&self) -> Result<u64>;
    /// Clear claims left behind by a crashed process. Startup recovery.
    async fn reset_claimed(&self) -> Result<u64>;
    /// Notifier fired on enqueue, letting same-process consumers skip the
    /// poll interval. Cross-process enqueues are covered by polling.
    fn notifier(&self) -> Arc<Notify>;
}

/// SQLx implementation of QueueRepository.
pub struct SqlxQueueRepository {
    pool: SqlitePool,
    notify: Arc<Notify>,
    busy_retry: BusyRetryPolicy,
}

impl SqlxQueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            notify: Arc::new(Notify::new()),
            busy_retry: BusyRetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: BusyRetryPolicy) -> Self {
        self.busy_retry = policy;
        self
    }
}

#[async_trait]
impl QueueRepository for SqlxQueueRepository {
    async fn enqueue(&self, payload: &str, priority: i64) -> Result<i64> {
        let id = self.busy_retry.run("enqueue", || async {
            let now = now_str();
            let result = sqlx::query(
                "INSERT INTO queue_jobs (payload, priority, error_count, visible_at, created_at)
                 VALUES (?, ?, 0, ?, ?)",
            )
            .bind(payload)
            .bind(priority)
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await?;
            Ok(result.last_insert_rowid())
        })
        .await?;

        self.notify.notify_one();
        Ok(id)
    }

    async fn claim_next(&self) -> Result<Option<QueueEntryDbModel>> {
        self.busy_retry.run("claim_next", || async {
            let now = now_str();

            // SQLite supports `RETURNING` in modern versions; this keeps the
            // claim atomic and avoids a list+update race between consumers.
            let entry = sqlx::query_as::<_, QueueEntryDbModel>(
                r#"
                UPDATE queue_jobs
                SET claimed_at = ?1
                WHERE id = (
                    SELECT id
                    FROM queue_jobs
                    WHERE claimed_at IS NULL AND visible_at <= ?1
                    ORDER BY priority DESC, id
                    LIMIT 1
                )
                RETURNING *
                "#,
            )
            .bind(&now)
            .fetch_optional(&self.pool)
            .await?;

            Ok(entry)
        })
        .await
    }

    async fn ack(&self, id: i64) -> Result<()> {
        self.busy_retry.run("ack", || async {
            sqlx::query("DELETE FROM queue_jobs WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn retry(&self, entry: &QueueEntryDbModel) -> Result<()> {
        let next_count = entry.error_count + 1;
        let visible_at = (Utc::now() + retry_backoff(next_count))
            .to_rfc3339_opts(SecondsFormat::Millis, true);

        self.busy_retry.run("retry", || async {
            sqlx::query(
                "UPDATE queue_jobs
                 SET error_count = error_count + 1, claimed_at = NULL, visible_at = ?
                 WHERE id = ?",
            )
            .bind(&visible_at)
            .bind(entry.id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn depth(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue_jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn reset_claimed(&self) -> Result<u64> {
        self.busy_retry.run("reset_claimed", || async {
            let result = sqlx::query("UPDATE queue_jobs SET claimed_at = NULL WHERE claimed_at IS NOT NULL")
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_superlinear() {
        assert_eq!(retry_backoff(0), Duration::from_secs(3));
        assert_eq!(retry_backoff(1), Duration::from_secs(4));
        assert_eq!(retry_backoff(2), Duration::from_secs(19));
        assert_eq!(retry_backoff(3), Duration::from_secs(84));
        assert_eq!(retry_backoff(4), Duration::from_secs(259));
    }

    #[test]
    fn timestamps_sort_lexicographically() {
        let earlier = now_str();
        std::thread::sleep(Duration::from_millis(5));
        let later = now_str();
        assert!(earlier < later);
        assert!(earlier.ends_with('Z'));
    }
}
