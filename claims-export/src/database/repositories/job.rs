//! Job repository: parent jobs, job keys, ACOs and beneficiaries.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use super::BusyRetryPolicy;
use crate::database::models::{AcoDbModel, CclfBeneficiaryDbModel, JobDbModel, JobKeyDbModel, NewJob};
use crate::domain::JobStatus;
use crate::{Error, Result};

/// Durable record of parent jobs, per-file completion keys and the
/// beneficiary lookup table.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Create a parent job in `PENDING`; returns its id. Admission-side
    /// operation, also used to seed tests.
    async fn create_job(&self, job: &NewJob) -> Result<i64>;
    async fn get_job(&self, id: i64) -> Result<JobDbModel>;
    async fn get_aco_by_uuid(&self, uuid: &str) -> Result<AcoDbModel>;
    /// Unconditional status update. Prefer [`update_job_status_checked`]
    /// anywhere a terminal status could be clobbered.
    ///
    /// [`update_job_status_checked`]: JobRepository::update_job_status_checked
    async fn update_job_status(&self, id: i64, status: JobStatus) -> Result<()>;
    /// Compare-and-set status transition. Returns false when no row matched
    /// (job missing or status was not `expected`).
    async fn update_job_status_checked(
        &self,
        id: i64,
        expected: JobStatus,
        new: JobStatus,
    ) -> Result<bool>;
    /// Idempotent on `(job_id, que_job_id)`: a re-delivered queue entry's
    /// insert is a conflict no-op.
    async fn create_job_key(&self, key: &JobKeyDbModel) -> Result<()>;
    async fn get_job_key_count(&self, job_id: i64) -> Result<i64>;
    /// Atomic increment of the advisory counter.
    async fn increment_completed_job_count(&self, job_id: i64) -> Result<()>;
    async fn get_beneficiary_by_id(&self, id: i64) -> Result<CclfBeneficiaryDbModel>;
    async fn create_aco(&self, aco: &AcoDbModel) -> Result<()>;
    async fn create_beneficiary(&self, beneficiary: &CclfBeneficiaryDbModel) -> Result<i64>;
}

/// SQLx implementation of JobRepository.
pub struct SqlxJobRepository {
    pool: SqlitePool,
    busy_retry: BusyRetryPolicy,
}

impl SqlxJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            busy_retry: BusyRetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: BusyRetryPolicy) -> Self {
        self.busy_retry = policy;
        self
    }
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn create_job(&self, job: &NewJob) -> Result<i64> {
        self.busy_retry.run("create_job", || async {
            let now = Utc::now().to_rfc3339();
            let result = sqlx::query(
                "INSERT INTO jobs (aco_id, status, job_count, completed_job_count, transaction_time, request_url, created_at, updated_at)
                 VALUES (?, ?, ?, 0, ?, ?, ?, ?)",
            )
            .bind(&job.aco_id)
            .bind(JobStatus::Pending.as_str())
            .bind(job.job_count)
            .bind(job.transaction_time.to_rfc3339())
            .bind(&job.request_url)
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await?;
            Ok(result.last_insert_rowid())
        })
        .await
    }

    async fn get_job(&self, id: i64) -> Result<JobDbModel> {
        sqlx::query_as::<_, JobDbModel>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))
    }

    async fn get_aco_by_uuid(&self, uuid: &str) -> Result<AcoDbModel> {
        sqlx::query_as::<_, AcoDbModel>("SELECT * FROM acos WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("ACO", uuid))
    }

    async fn update_job_status(&self, id: i64, status: JobStatus) -> Result<()> {
        self.busy_retry.run("update_job_status", || async {
            sqlx::query("UPDATE jobs SET status = ?, updated_at = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(Utc::now().to_rfc3339())
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn update_job_status_checked(
        &self,
        id: i64,
        expected: JobStatus,
        new: JobStatus,
    ) -> Result<bool> {
        self.busy_retry.run("update_job_status_checked", || async {
            let result =
                sqlx::query("UPDATE jobs SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
                    .bind(new.as_str())
                    .bind(Utc::now().to_rfc3339())
                    .bind(id)
                    .bind(expected.as_str())
                    .execute(&self.pool)
                    .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn create_job_key(&self, key: &JobKeyDbModel) -> Result<()> {
        self.busy_retry.run("create_job_key", || async {
            sqlx::query(
                "INSERT INTO job_keys (job_id, que_job_id, file_name, resource_type)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT (job_id, que_job_id) DO NOTHING",
            )
            .bind(key.job_id)
            .bind(key.que_job_id)
            .bind(&key.file_name)
            .bind(&key.resource_type)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get_job_key_count(&self, job_id: i64) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM job_keys WHERE job_id = ?")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn increment_completed_job_count(&self, job_id: i64) -> Result<()> {
        self.busy_retry.run("increment_completed_job_count", || async {
            // Clamped so a re-delivered entry can never push the advisory
            // counter past job_count.
            sqlx::query(
                "UPDATE jobs SET completed_job_count = MIN(completed_job_count + 1, job_count), updated_at = ? WHERE id = ?",
            )
            .bind(Utc::now().to_rfc3339())
            .bind(job_id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get_beneficiary_by_id(&self, id: i64) -> Result<CclfBeneficiaryDbModel> {
        sqlx::query_as::<_, CclfBeneficiaryDbModel>("SELECT * FROM cclf_beneficiaries WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("CclfBeneficiary", id))
    }

    async fn create_aco(&self, aco: &AcoDbModel) -> Result<()> {
        sqlx::query("INSERT INTO acos (uuid, cms_id, name) VALUES (?, ?, ?)")
            .bind(&aco.uuid)
            .bind(&aco.cms_id)
            .bind(&aco.name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_beneficiary(&self, beneficiary: &CclfBeneficiaryDbModel) -> Result<i64> {
        let result = sqlx::query("INSERT INTO cclf_beneficiaries (mbi, upstream_id) VALUES (?, ?)")
            .bind(&beneficiary.mbi)
            .bind(&beneficiary.upstream_id)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }
}
