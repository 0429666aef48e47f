//! Work queue database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One durable queue entry.
///
/// The payload is JSON-encoded [`crate::domain::ExportArgs`]. `error_count`
/// and `visible_at` carry the retry bookkeeping; `claimed_at` marks the entry
/// as owned by a live consumer.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QueueEntryDbModel {
    pub id: i64,
    pub payload: String,
    pub priority: i64,
    pub error_count: i64,
    /// RFC 3339; the entry is eligible for claiming once this has passed.
    pub visible_at: String,
    pub claimed_at: Option<String>,
    pub created_at: String,
}
