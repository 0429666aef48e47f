//! Parent job, job key and ACO database models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::Result;
use crate::domain::JobStatus;

/// Parent export job database model.
///
/// `status` is stored as text; use [`JobDbModel::parsed_status`] to work with
/// the typed form.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobDbModel {
    pub id: i64,
    /// Owner/tenant identifier (ACO UUID).
    pub aco_id: String,
    /// PENDING, IN_PROGRESS, CANCELLED, FAILED or COMPLETED.
    pub status: String,
    /// Total number of queue entries this job was split into. Set at
    /// admission, immutable afterwards.
    pub job_count: i64,
    /// Advisory counter; never consulted to decide completion.
    pub completed_job_count: i64,
    /// RFC 3339 snapshot time the export was cut at.
    pub transaction_time: String,
    pub request_url: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl JobDbModel {
    pub fn parsed_status(&self) -> Result<JobStatus> {
        self.status.parse()
    }
}

/// Fields the admission layer provides when creating a parent job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub aco_id: String,
    pub job_count: i64,
    pub transaction_time: DateTime<Utc>,
    pub request_url: Option<String>,
}

/// Persistent record that an artifact file was produced for a parent job.
///
/// `que_job_id` ties the key to the queue entry that produced it; the unique
/// index on `(job_id, que_job_id)` makes re-delivered entries a no-op.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobKeyDbModel {
    pub job_id: i64,
    pub que_job_id: i64,
    pub file_name: String,
    pub resource_type: String,
}

/// Tenant record.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AcoDbModel {
    pub uuid: String,
    /// Identifier the upstream service knows this tenant by.
    pub cms_id: String,
    pub name: String,
}
