//! End-to-end worker tests.
//!
//! These run the real repositories against a file-backed SQLite database
//! (the cancellation monitor polls concurrently with the worker, so the
//! database must be shared across connections) and substitute a stub
//! upstream client.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use claims_export::database::models::{
    AcoDbModel, CclfBeneficiaryDbModel, NewJob, QueueEntryDbModel,
};
use claims_export::database::repositories::{
    JobRepository, QueueRepository, SqlxJobRepository, SqlxQueueRepository,
};
use claims_export::database::{DbPool, init_pool, run_migrations};
use claims_export::domain::{ClaimsWindow, ExportArgs, JobStatus, ResourceType};
use claims_export::pipeline::{BLANK_ARTIFACT_NAME, Disposition, ExportWorker, WorkerConfig};
use claims_export::upstream::{Bundle, BundleEntry, RequestContext, UpstreamClient};
use claims_export::{Error, Result};
use serde_json::json;
use tempfile::TempDir;

/// Upstream stub: beneficiaries whose upstream id starts with "bad" fail,
/// everything else returns a single-resource bundle.
struct StubUpstream {
    delay: Duration,
    calls: AtomicUsize,
    lookups: AtomicUsize,
}

impl StubUpstream {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            lookups: AtomicUsize::new(0),
        })
    }

    fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            calls: AtomicUsize::new(0),
            lookups: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn bundle_for(&self, ctx: &RequestContext, resource_type: &str) -> Result<Bundle> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if ctx.upstream_id.starts_with("bad") {
            return Err(Error::upstream(format!(
                "synthetic upstream failure for {}",
                ctx.upstream_id
            )));
        }
        Ok(Bundle {
            entry: vec![BundleEntry {
                resource: Some(json!({
                    "resourceType": resource_type,
                    "id": format!("{}-{}", resource_type.to_lowercase(), ctx.upstream_id),
                })),
            }],
        })
    }
}

#[async_trait]
impl UpstreamClient for StubUpstream {
    async fn get_patient(&self, ctx: &RequestContext) -> Result<Bundle> {
        self.bundle_for(ctx, "Patient").await
    }

    async fn get_coverage(&self, ctx: &RequestContext) -> Result<Bundle> {
        self.bundle_for(ctx, "Coverage").await
    }

    async fn get_explanation_of_benefit(
        &self,
        ctx: &RequestContext,
        _window: ClaimsWindow,
    ) -> Result<Bundle> {
        self.bundle_for(ctx, "ExplanationOfBenefit").await
    }

    async fn lookup_upstream_id(&self, mbi: &str) -> Result<String> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(format!("resolved-{mbi}"))
    }
}

struct TestContext {
    _db_dir: TempDir,
    pool: DbPool,
    repo: Arc<SqlxJobRepository>,
    queue: SqlxQueueRepository,
    staging: TempDir,
    payload: TempDir,
}

impl TestContext {
    async fn new() -> Self {
        let db_dir = TempDir::new().expect("Failed to create db dir");
        let url = format!("sqlite:{}/test.db?mode=rwc", db_dir.path().display());
        let pool = init_pool(&url).await.expect("Failed to create test pool");
        run_migrations(&pool).await.expect("Failed to run migrations");

        Self {
            repo: Arc::new(SqlxJobRepository::new(pool.clone())),
            queue: SqlxQueueRepository::new(pool.clone()),
            pool,
            _db_dir: db_dir,
            staging: TempDir::new().expect("Failed to create staging dir"),
            payload: TempDir::new().expect("Failed to create payload dir"),
        }
    }

    fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            staging_root: self.staging.path().to_path_buf(),
            payload_root: self.payload.path().to_path_buf(),
            fail_threshold_pct: 50.0,
            max_not_found_retries: 3,
            // Fast cadence so cancellation scenarios finish in test time.
            cancellation_poll: Duration::from_millis(25),
        }
    }

    fn worker(&self, upstream: Arc<dyn UpstreamClient>) -> Arc<ExportWorker> {
        Arc::new(ExportWorker::new(
            self.repo.clone(),
            upstream,
            self.worker_config(),
        ))
    }

    async fn seed_aco(&self) -> String {
        let aco = AcoDbModel {
            uuid: uuid::Uuid::new_v4().to_string(),
            cms_id: "A9994".to_string(),
            name: "Test ACO".to_string(),
        };
        self.repo.create_aco(&aco).await.expect("Failed to create ACO");
        aco.uuid
    }

    async fn seed_job(&self, aco_id: &str, job_count: i64) -> i64 {
        self.repo
            .create_job(&NewJob {
                aco_id: aco_id.to_string(),
                job_count,
                transaction_time: Utc::now(),
                request_url: None,
            })
            .await
            .expect("Failed to create job")
    }

    async fn seed_beneficiary(&self, upstream_id: Option<&str>) -> String {
        let id = self
            .repo
            .create_beneficiary(&CclfBeneficiaryDbModel {
                id: 0,
                mbi: format!("mbi-{}", uuid::Uuid::new_v4()),
                upstream_id: upstream_id.map(str::to_string),
            })
            .await
            .expect("Failed to create beneficiary");
        id.to_string()
    }

    async fn enqueue(&self, args: &ExportArgs) -> QueueEntryDbModel {
        let payload = serde_json::to_string(args).expect("Failed to serialize args");
        self.queue
            .enqueue(&payload, 0)
            .await
            .expect("Failed to enqueue");
        self.queue
            .claim_next()
            .await
            .expect("Failed to claim")
            .expect("Entry should be claimable")
    }

    async fn job_status(&self, id: i64) -> JobStatus {
        self.repo
            .get_job(id)
            .await
            .expect("Failed to read job")
            .parsed_status()
            .expect("Unreadable status")
    }

    async fn job_keys(&self, id: i64) -> Vec<(String, String)> {
        sqlx::query_as("SELECT file_name, resource_type FROM job_keys WHERE job_id = ? ORDER BY id")
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .expect("Failed to read job keys")
    }

    fn staging_dir(&self, job_id: i64) -> std::path::PathBuf {
        self.staging.path().join(job_id.to_string())
    }

    fn payload_dir(&self, job_id: i64) -> std::path::PathBuf {
        self.payload.path().join(job_id.to_string())
    }
}

fn export_args(
    job_id: i64,
    aco_id: &str,
    resource_type: ResourceType,
    beneficiary_ids: Vec<String>,
) -> ExportArgs {
    ExportArgs {
        job_id,
        aco_id: aco_id.to_string(),
        resource_type,
        beneficiary_ids,
        upstream_base_path: "/v2/fhir".to_string(),
        since: None,
        transaction_time: Utc::now(),
        claims_window: ClaimsWindow::default(),
        service_date: None,
    }
}

fn list_files(dir: &Path) -> Vec<String> {
    match std::fs::read_dir(dir) {
        Ok(entries) => {
            let mut names: Vec<String> = entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names
        }
        Err(_) => Vec::new(),
    }
}

#[tokio::test]
async fn happy_path_single_entry() {
    let ctx = TestContext::new().await;
    let upstream = StubUpstream::new();

    let aco = ctx.seed_aco().await;
    let job_id = ctx.seed_job(&aco, 1).await;
    let bene = ctx.seed_beneficiary(Some("ok-42")).await;

    let entry = ctx
        .enqueue(&export_args(job_id, &aco, ResourceType::Patient, vec![bene]))
        .await;
    let worker = ctx.worker(upstream.clone());

    let disposition = worker.process(&entry).await;
    assert!(matches!(disposition, Disposition::Ack));

    assert_eq!(ctx.job_status(job_id).await, JobStatus::Completed);

    let keys = ctx.job_keys(job_id).await;
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].1, "Patient");

    // Every staged file was promoted and staging cleaned up.
    let published = list_files(&ctx.payload_dir(job_id));
    assert_eq!(published, vec![keys[0].0.clone()]);
    assert!(!ctx.staging_dir(job_id).exists());

    let content =
        std::fs::read_to_string(ctx.payload_dir(job_id).join(&keys[0].0)).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 1);
    let resource: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(resource["resourceType"], "Patient");
    assert_eq!(resource["id"], "patient-ok-42");
    assert!(content.ends_with('\n'));

    assert_eq!(upstream.calls(), 1);
}

#[tokio::test]
async fn cancellation_mid_flight_acks_without_job_key() {
    let ctx = TestContext::new().await;
    // Slow enough that cancellation lands mid-stream.
    let upstream = StubUpstream::with_delay(Duration::from_millis(30));

    let aco = ctx.seed_aco().await;
    let job_id = ctx.seed_job(&aco, 1).await;
    let mut benes = Vec::new();
    for _ in 0..50 {
        benes.push(ctx.seed_beneficiary(Some("ok")).await);
    }

    let entry = ctx
        .enqueue(&export_args(job_id, &aco, ResourceType::Coverage, benes))
        .await;
    let worker = ctx.worker(upstream.clone());

    let task = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.process(&entry).await })
    };

    // Let a few beneficiaries stream, then cancel externally.
    tokio::time::sleep(Duration::from_millis(150)).await;
    ctx.repo
        .update_job_status(job_id, JobStatus::Cancelled)
        .await
        .unwrap();

    let disposition = task.await.unwrap();
    assert!(
        matches!(disposition, Disposition::Ack),
        "a cancelled entry acks, it does not retry"
    );

    assert_eq!(ctx.job_status(job_id).await, JobStatus::Cancelled);
    assert!(ctx.job_keys(job_id).await.is_empty());

    // No promotion happened; partial artifacts stay in staging.
    assert!(list_files(&ctx.payload_dir(job_id)).is_empty());
    assert!(upstream.calls() < 50, "the beneficiary loop stopped early");
}

#[tokio::test]
async fn threshold_breach_fails_parent() {
    let ctx = TestContext::new().await;
    let upstream = StubUpstream::new();

    let aco = ctx.seed_aco().await;
    let job_id = ctx.seed_job(&aco, 1).await;

    // Failures first, so the 50% threshold trips on the 5th of 10.
    let mut benes = Vec::new();
    for _ in 0..6 {
        benes.push(ctx.seed_beneficiary(Some("bad")).await);
    }
    for _ in 0..4 {
        benes.push(ctx.seed_beneficiary(Some("ok")).await);
    }

    let entry = ctx
        .enqueue(&export_args(job_id, &aco, ResourceType::ExplanationOfBenefit, benes))
        .await;
    let worker = ctx.worker(upstream.clone());

    let disposition = worker.process(&entry).await;
    assert!(matches!(disposition, Disposition::Ack));

    assert_eq!(ctx.job_status(job_id).await, JobStatus::Failed);
    assert!(ctx.job_keys(job_id).await.is_empty());
    assert!(list_files(&ctx.payload_dir(job_id)).is_empty());

    // The error artifact carries one OperationOutcome per failed beneficiary
    // up to the threshold break.
    let staged = list_files(&ctx.staging_dir(job_id));
    let error_file = staged
        .iter()
        .find(|name| name.ends_with("-error.ndjson"))
        .expect("error artifact should be staged");
    let content = std::fs::read_to_string(ctx.staging_dir(job_id).join(error_file)).unwrap();
    let outcomes: Vec<serde_json::Value> = content
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(outcomes.len(), 5, "loop exits once the percentage is reached");
    for outcome in &outcomes {
        assert_eq!(outcome["resourceType"], "OperationOutcome");
        assert_eq!(outcome["issue"][0]["severity"], "error");
    }
}

#[tokio::test]
async fn missing_parent_retries_until_budget_then_acks() {
    let ctx = TestContext::new().await;
    let worker = ctx.worker(StubUpstream::new());

    let args = export_args(9999, "no-such-aco", ResourceType::Patient, vec![]);
    let payload = serde_json::to_string(&args).unwrap();

    let entry = |error_count: i64| QueueEntryDbModel {
        id: 1,
        payload: payload.clone(),
        priority: 0,
        error_count,
        visible_at: Utc::now().to_rfc3339(),
        claimed_at: None,
        created_at: Utc::now().to_rfc3339(),
    };

    for error_count in 0..3 {
        let disposition = worker.process(&entry(error_count)).await;
        assert!(
            matches!(disposition, Disposition::Retry(_)),
            "under budget the entry retries (error_count={error_count})"
        );
    }

    let disposition = worker.process(&entry(3)).await;
    assert!(
        matches!(disposition, Disposition::Ack),
        "over budget the orphan entry is discarded"
    );
}

#[tokio::test]
async fn corrupt_payload_acks_without_mutation() {
    let ctx = TestContext::new().await;
    let upstream = StubUpstream::new();
    let worker = ctx.worker(upstream.clone());

    ctx.queue.enqueue("{invalid_json", 0).await.unwrap();
    let entry = ctx.queue.claim_next().await.unwrap().unwrap();

    let disposition = worker.process(&entry).await;
    assert!(matches!(disposition, Disposition::Ack));
    assert_eq!(upstream.calls(), 0);

    let (jobs,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs")
        .fetch_one(&ctx.pool)
        .await
        .unwrap();
    assert_eq!(jobs, 0);
}

#[tokio::test]
async fn empty_base_path_is_discarded() {
    let ctx = TestContext::new().await;
    let upstream = StubUpstream::new();
    let worker = ctx.worker(upstream.clone());

    let aco = ctx.seed_aco().await;
    let job_id = ctx.seed_job(&aco, 1).await;
    let mut args = export_args(job_id, &aco, ResourceType::Patient, vec![]);
    args.upstream_base_path = String::new();

    let entry = ctx.enqueue(&args).await;
    let disposition = worker.process(&entry).await;
    assert!(matches!(disposition, Disposition::Ack));

    // Nothing ran: the parent is untouched.
    assert_eq!(ctx.job_status(job_id).await, JobStatus::Pending);
    assert_eq!(upstream.calls(), 0);
}

#[tokio::test]
async fn cancelled_parent_is_discarded_before_any_work() {
    let ctx = TestContext::new().await;
    let upstream = StubUpstream::new();
    let worker = ctx.worker(upstream.clone());

    let aco = ctx.seed_aco().await;
    let job_id = ctx.seed_job(&aco, 1).await;
    ctx.repo
        .update_job_status(job_id, JobStatus::Cancelled)
        .await
        .unwrap();

    let bene = ctx.seed_beneficiary(Some("ok")).await;
    let entry = ctx
        .enqueue(&export_args(job_id, &aco, ResourceType::Patient, vec![bene]))
        .await;

    let disposition = worker.process(&entry).await;
    assert!(matches!(disposition, Disposition::Ack));
    assert_eq!(upstream.calls(), 0);
    assert!(ctx.job_keys(job_id).await.is_empty());
}

#[tokio::test]
async fn blank_output_records_sentinel_key() {
    let ctx = TestContext::new().await;
    let upstream = StubUpstream::new();

    let aco = ctx.seed_aco().await;
    let job_id = ctx.seed_job(&aco, 1).await;

    let entry = ctx
        .enqueue(&export_args(job_id, &aco, ResourceType::Patient, vec![]))
        .await;
    let worker = ctx.worker(upstream.clone());

    let disposition = worker.process(&entry).await;
    assert!(matches!(disposition, Disposition::Ack));
    assert_eq!(upstream.calls(), 0, "upstream is never called for an empty slice");

    let keys = ctx.job_keys(job_id).await;
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].0, BLANK_ARTIFACT_NAME);

    // The sentinel still counts toward completion.
    assert_eq!(ctx.job_status(job_id).await, JobStatus::Completed);
    assert!(list_files(&ctx.payload_dir(job_id)).is_empty());
}

#[tokio::test]
async fn parent_completes_only_after_every_entry() {
    let ctx = TestContext::new().await;
    let upstream = StubUpstream::new();

    let aco = ctx.seed_aco().await;
    let job_id = ctx.seed_job(&aco, 2).await;
    let bene_a = ctx.seed_beneficiary(Some("ok-a")).await;
    let bene_b = ctx.seed_beneficiary(Some("ok-b")).await;

    let entry_a = ctx
        .enqueue(&export_args(job_id, &aco, ResourceType::Patient, vec![bene_a]))
        .await;
    let entry_b = ctx
        .enqueue(&export_args(job_id, &aco, ResourceType::Coverage, vec![bene_b]))
        .await;
    let worker = ctx.worker(upstream.clone());

    assert!(matches!(worker.process(&entry_a).await, Disposition::Ack));
    assert_eq!(ctx.job_status(job_id).await, JobStatus::InProgress);
    assert_eq!(ctx.job_keys(job_id).await.len(), 1);
    // First entry's artifact waits in staging until the job finishes.
    assert_eq!(list_files(&ctx.staging_dir(job_id)).len(), 1);
    assert!(list_files(&ctx.payload_dir(job_id)).is_empty());

    assert!(matches!(worker.process(&entry_b).await, Disposition::Ack));
    assert_eq!(ctx.job_status(job_id).await, JobStatus::Completed);
    assert_eq!(ctx.job_keys(job_id).await.len(), 2);
    assert_eq!(list_files(&ctx.payload_dir(job_id)).len(), 2);
    assert!(!ctx.staging_dir(job_id).exists());

    let job = ctx.repo.get_job(job_id).await.unwrap();
    assert!(job.completed_job_count <= job.job_count);
}

#[tokio::test]
async fn redelivery_does_not_duplicate_job_keys() {
    let ctx = TestContext::new().await;
    let upstream = StubUpstream::new();

    let aco = ctx.seed_aco().await;
    let job_id = ctx.seed_job(&aco, 1).await;
    let bene = ctx.seed_beneficiary(Some("ok")).await;

    let entry = ctx
        .enqueue(&export_args(job_id, &aco, ResourceType::Patient, vec![bene]))
        .await;
    let worker = ctx.worker(upstream.clone());

    assert!(matches!(worker.process(&entry).await, Disposition::Ack));
    // Crash between job-key insert and ack: the entry comes back.
    assert!(matches!(worker.process(&entry).await, Disposition::Ack));

    assert_eq!(ctx.job_keys(job_id).await.len(), 1);
    assert_eq!(ctx.job_status(job_id).await, JobStatus::Completed);

    let job = ctx.repo.get_job(job_id).await.unwrap();
    assert!(job.completed_job_count <= job.job_count);
}

#[tokio::test]
async fn completion_check_is_idempotent() {
    let ctx = TestContext::new().await;
    let upstream = StubUpstream::new();

    let aco = ctx.seed_aco().await;
    let job_id = ctx.seed_job(&aco, 1).await;
    let bene = ctx.seed_beneficiary(Some("ok")).await;

    let entry = ctx
        .enqueue(&export_args(job_id, &aco, ResourceType::Patient, vec![bene]))
        .await;
    let worker = ctx.worker(upstream.clone());
    assert!(matches!(worker.process(&entry).await, Disposition::Ack));

    let before = list_files(&ctx.payload_dir(job_id));
    worker.check_job_complete_and_promote(job_id).await.unwrap();
    worker.check_job_complete_and_promote(job_id).await.unwrap();

    assert_eq!(ctx.job_status(job_id).await, JobStatus::Completed);
    assert_eq!(list_files(&ctx.payload_dir(job_id)), before);
}

#[tokio::test]
async fn upstream_id_is_resolved_from_mbi_and_cached() {
    let ctx = TestContext::new().await;
    let upstream = StubUpstream::new();

    let aco = ctx.seed_aco().await;
    let job_id = ctx.seed_job(&aco, 1).await;
    // No stored upstream id: the worker must resolve it via MBI lookup.
    let bene = ctx.seed_beneficiary(None).await;

    let entry = ctx
        .enqueue(&export_args(
            job_id,
            &aco,
            ResourceType::Patient,
            vec![bene.clone(), bene],
        ))
        .await;
    let worker = ctx.worker(upstream.clone());

    assert!(matches!(worker.process(&entry).await, Disposition::Ack));
    assert_eq!(
        upstream.lookups.load(Ordering::SeqCst),
        1,
        "second occurrence hits the cache"
    );
    assert_eq!(upstream.calls(), 2);
}
