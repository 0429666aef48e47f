//! Per-entry export processing.
//!
//! A queue entry is one beneficiary slice of a parent export job: validate
//! the parent, stream the slice's resources from the upstream service into a
//! staging artifact, record a job key, and drive the parent to its terminal
//! status once every slice is accounted for.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::database::models::{JobDbModel, JobKeyDbModel, QueueEntryDbModel};
use crate::database::repositories::JobRepository;
use crate::domain::{ExportArgs, JobStatus, ResourceType};
use crate::pipeline::artifact::{self, ArtifactSummary, ArtifactWriter, BLANK_ARTIFACT_NAME};
use crate::pipeline::cancellation::CancellationMonitor;
use crate::upstream::{RequestContext, UpstreamClient};
use crate::utils::fs;
use crate::{Error, Result};

/// What the pool should do with a processed entry.
#[derive(Debug)]
pub enum Disposition {
    /// Entry is durably done or unrecoverably bad; delete it.
    Ack,
    /// Transient failure; reschedule with backoff.
    Retry(Error),
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub staging_root: PathBuf,
    pub payload_root: PathBuf,
    /// Percent of failed beneficiaries at which an entry is abandoned.
    pub fail_threshold_pct: f64,
    /// Budget before acking entries whose parent job is missing.
    pub max_not_found_retries: i64,
    /// Cadence of the cancellation monitor.
    pub cancellation_poll: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            staging_root: PathBuf::from("data/staging"),
            payload_root: PathBuf::from("data/payload"),
            fail_threshold_pct: 50.0,
            max_not_found_retries: 3,
            cancellation_poll: Duration::from_secs(15),
        }
    }
}

impl From<&crate::config::Config> for WorkerConfig {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            staging_root: config.staging_dir.clone(),
            payload_root: config.payload_dir.clone(),
            fail_threshold_pct: config.export_fail_pct,
            max_not_found_retries: config.max_job_not_found_retries,
            cancellation_poll: Duration::from_secs(config.cancellation_poll_secs),
        }
    }
}

struct StreamSummary {
    data_file_name: String,
    data_path: PathBuf,
    bytes_written: u64,
}

/// Executes one queue entry at a time.
pub struct ExportWorker {
    repo: Arc<dyn JobRepository>,
    upstream: Arc<dyn UpstreamClient>,
    config: WorkerConfig,
    /// MBI resolution is expensive upstream; cache per process.
    upstream_id_cache: DashMap<i64, String>,
}

impl ExportWorker {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        upstream: Arc<dyn UpstreamClient>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            repo,
            upstream,
            config,
            upstream_id_cache: DashMap::new(),
        }
    }

    /// Process one queue entry to a disposition. Never panics on bad input:
    /// corrupt payloads and unrecoverable validation outcomes ack so the
    /// entry is not redelivered forever.
    pub async fn process(&self, entry: &QueueEntryDbModel) -> Disposition {
        let args: ExportArgs = match serde_json::from_str(&entry.payload) {
            Ok(args) => args,
            Err(e) => {
                warn!(queue_id = entry.id, error = %e, "Discarding entry with undecodable payload");
                return Disposition::Ack;
            }
        };

        let job = match self.validate(entry, &args).await {
            Ok(Some(job)) => job,
            Ok(None) => return Disposition::Ack,
            Err(e) => return Disposition::Retry(e),
        };

        // Another entry for the same parent may already have advanced the
        // status, or the parent may have been cancelled since validation;
        // the monitor handles the latter.
        match self
            .repo
            .update_job_status_checked(job.id, JobStatus::Pending, JobStatus::InProgress)
            .await
        {
            Ok(true) => debug!(job_id = job.id, "Parent job moved to IN_PROGRESS"),
            Ok(false) => debug!(job_id = job.id, "Parent job already past PENDING"),
            Err(e) => warn!(job_id = job.id, error = %e, "Could not promote parent job status"),
        }

        let aco = match self.repo.get_aco_by_uuid(&args.aco_id).await {
            Ok(aco) => aco,
            Err(e) => return Disposition::Retry(e),
        };

        let staging_dir = self.config.staging_root.join(job.id.to_string());
        let payload_dir = self.config.payload_root.join(job.id.to_string());
        if let Err(e) = fs::ensure_dir_all(&staging_dir).await {
            return Disposition::Retry(e);
        }
        if let Err(e) = fs::ensure_dir_all(&payload_dir).await {
            return Disposition::Retry(e);
        }

        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let monitor =
            CancellationMonitor::new(self.repo.clone(), job.id, self.config.cancellation_poll)
                .spawn(cancel.clone(), done.clone());

        let streamed = self
            .stream_resources(&args, &aco.cms_id, &staging_dir, &cancel)
            .await;

        done.cancel();
        if let Err(e) = monitor.await {
            warn!(job_id = job.id, error = %e, "Cancellation monitor task failed");
        }

        let disposition = match streamed {
            Ok(summary) => self.record_success(entry, &args, &job, summary).await,
            Err(err) => self.record_failure(&job, err).await,
        };

        // Advisory progress only; the authoritative completion signal is the
        // job-key count.
        if let Err(e) = self.repo.increment_completed_job_count(job.id).await {
            warn!(job_id = job.id, error = %e, "Could not increment completed job count");
        }

        disposition
    }

    /// Step B: resolve and vet the parent job. `Ok(None)` means the entry is
    /// unrecoverable and must be acked; `Err` means retry.
    async fn validate(
        &self,
        entry: &QueueEntryDbModel,
        args: &ExportArgs,
    ) -> Result<Option<JobDbModel>> {
        if args.upstream_base_path.is_empty() {
            warn!(
                queue_id = entry.id,
                job_id = args.job_id,
                "Entry has no upstream base path; discarding"
            );
            return Ok(None);
        }

        let job = match self.repo.get_job(args.job_id).await {
            Ok(job) => job,
            Err(e) if e.is_not_found() => {
                // Admission may still be committing the parent; the queue's
                // super-linear backoff makes this budget generous.
                if entry.error_count >= self.config.max_not_found_retries {
                    error!(
                        queue_id = entry.id,
                        job_id = args.job_id,
                        attempts = entry.error_count,
                        "Parent job still missing after retry budget; discarding entry"
                    );
                    return Ok(None);
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if job.parsed_status()? == JobStatus::Cancelled {
            warn!(job_id = job.id, "Parent job is cancelled; discarding entry");
            return Ok(None);
        }

        Ok(Some(job))
    }

    /// Step E: the beneficiary loop. Strictly sequential and in input order;
    /// individual failures are counted and logged, not propagated. Only
    /// cancellation or a threshold breach ends the loop early.
    async fn stream_resources(
        &self,
        args: &ExportArgs,
        cms_id: &str,
        staging_dir: &std::path::Path,
        cancel: &CancellationToken,
    ) -> Result<StreamSummary> {
        let mut writer = ArtifactWriter::create(staging_dir).await?;

        let total = args.beneficiary_ids.len();
        let mut failed = 0usize;
        let mut cancelled = false;
        let mut threshold_reached = false;

        for raw_id in &args.beneficiary_ids {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            failed += self
                .export_beneficiary(&mut writer, raw_id, args, cms_id)
                .await;

            if total > 0 {
                let fail_pct = 100.0 * failed as f64 / total as f64;
                if fail_pct >= self.config.fail_threshold_pct {
                    warn!(
                        job_id = args.job_id,
                        failed, total, fail_pct, "Failure threshold reached; abandoning entry"
                    );
                    threshold_reached = true;
                    break;
                }
            }
        }

        let summary: ArtifactSummary = writer.finish().await?;

        if cancelled {
            return Err(Error::JobCancelled(args.job_id));
        }
        if threshold_reached {
            return Err(Error::FailureThreshold {
                job_id: args.job_id,
                failed,
                total,
            });
        }

        Ok(StreamSummary {
            data_file_name: summary.data_file_name,
            data_path: summary.data_path,
            bytes_written: summary.bytes_written,
        })
    }

    /// Export one beneficiary; returns the number of failure units to count
    /// against the entry's threshold. All failures are handled in here: the
    /// unparsable id is only logged, everything later also appends an
    /// OperationOutcome to the error artifact.
    async fn export_beneficiary(
        &self,
        writer: &mut ArtifactWriter,
        raw_id: &str,
        args: &ExportArgs,
        cms_id: &str,
    ) -> usize {
        let bene_id: i64 = match raw_id.trim().parse() {
            Ok(id) => id,
            Err(_) => {
                warn!(
                    job_id = args.job_id,
                    beneficiary = raw_id,
                    "Unparsable beneficiary id"
                );
                return 1;
            }
        };

        let upstream_id = match self.resolve_upstream_id(bene_id).await {
            Ok(id) => id,
            Err(e) => {
                warn!(job_id = args.job_id, beneficiary = bene_id, error = %e, "Could not resolve upstream id");
                self.write_outcome(
                    writer,
                    args.job_id,
                    &format!("Error retrieving upstream identifier for beneficiary {bene_id}"),
                )
                .await;
                return 1;
            }
        };

        let ctx = RequestContext {
            upstream_id,
            job_id: args.job_id,
            cms_id: cms_id.to_string(),
            base_path: args.upstream_base_path.clone(),
            since: args.since,
            transaction_time: args.transaction_time,
        };

        let fetched = match args.resource_type {
            ResourceType::Coverage => self.upstream.get_coverage(&ctx).await,
            ResourceType::Patient => self.upstream.get_patient(&ctx).await,
            ResourceType::ExplanationOfBenefit => {
                let window = args.claims_window.or_service_date(args.service_date);
                self.upstream.get_explanation_of_benefit(&ctx, window).await
            }
        };

        let bundle = match fetched {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(
                    job_id = args.job_id,
                    beneficiary = bene_id,
                    resource_type = %args.resource_type,
                    error = %e,
                    "Upstream fetch failed"
                );
                self.write_outcome(
                    writer,
                    args.job_id,
                    &format!(
                        "Error retrieving {} for beneficiary {bene_id}",
                        args.resource_type
                    ),
                )
                .await;
                return 1;
            }
        };

        let mut failures = 0;
        for entry in &bundle.entry {
            let Some(resource) = &entry.resource else {
                continue;
            };
            if let Err(e) = writer.write_resource(resource).await {
                warn!(job_id = args.job_id, beneficiary = bene_id, error = %e, "Could not write resource");
                failures += 1;
                self.write_outcome(
                    writer,
                    args.job_id,
                    &format!(
                        "Error writing {} for beneficiary {bene_id}",
                        args.resource_type
                    ),
                )
                .await;
            }
        }
        failures
    }

    async fn resolve_upstream_id(&self, bene_id: i64) -> Result<String> {
        if let Some(cached) = self.upstream_id_cache.get(&bene_id) {
            return Ok(cached.value().clone());
        }

        let beneficiary = self.repo.get_beneficiary_by_id(bene_id).await?;
        let upstream_id = match beneficiary.upstream_id {
            Some(id) if !id.is_empty() => id,
            _ => self.upstream.lookup_upstream_id(&beneficiary.mbi).await?,
        };

        self.upstream_id_cache.insert(bene_id, upstream_id.clone());
        Ok(upstream_id)
    }

    async fn write_outcome(&self, writer: &mut ArtifactWriter, job_id: i64, diagnostics: &str) {
        if let Err(e) = writer.write_operation_outcome(diagnostics).await {
            error!(job_id, error = %e, "Could not append to error artifact");
        }
    }

    /// Steps F and G for a successful stream: record the job key (with the
    /// blank sentinel when nothing was written) and run the completion check.
    async fn record_success(
        &self,
        entry: &QueueEntryDbModel,
        args: &ExportArgs,
        job: &JobDbModel,
        summary: StreamSummary,
    ) -> Disposition {
        let file_name = if summary.bytes_written == 0 {
            if let Err(e) = tokio::fs::remove_file(&summary.data_path).await {
                warn!(job_id = job.id, error = %e, "Could not remove empty artifact");
            }
            info!(job_id = job.id, queue_id = entry.id, "Entry produced no output");
            BLANK_ARTIFACT_NAME.to_string()
        } else {
            summary.data_file_name
        };

        let key = JobKeyDbModel {
            job_id: job.id,
            que_job_id: entry.id,
            file_name,
            resource_type: args.resource_type.as_str().to_string(),
        };
        if let Err(e) = self.repo.create_job_key(&key).await {
            return Disposition::Retry(e);
        }

        match self.check_job_complete_and_promote(job.id).await {
            Ok(()) => Disposition::Ack,
            Err(e) => Disposition::Retry(e),
        }
    }

    /// Step F for a failed stream: conditionally fail the parent without
    /// clobbering a terminal status, then pick the disposition.
    async fn record_failure(&self, job: &JobDbModel, err: Error) -> Disposition {
        match self
            .repo
            .update_job_status_checked(job.id, JobStatus::InProgress, JobStatus::Failed)
            .await
        {
            Ok(true) => warn!(job_id = job.id, error = %err, "Parent job marked FAILED"),
            Ok(false) => warn!(
                job_id = job.id,
                error = %err,
                "Parent job already terminal; leaving status untouched"
            ),
            Err(update_err) => {
                error!(job_id = job.id, error = %update_err, "Could not mark parent job FAILED");
            }
        }

        match err {
            Error::JobCancelled(_) => {
                info!(job_id = job.id, "Entry stopped by cancellation");
                Disposition::Ack
            }
            err @ Error::FailureThreshold { .. } => {
                error!(job_id = job.id, error = %err, "Entry abandoned");
                Disposition::Ack
            }
            other => Disposition::Retry(other),
        }
    }

    /// The completion check and commit point. Several entries may race to
    /// observe the full key count; promotion tolerates that (rename replaces
    /// an existing target) and the final status flip is a compare-and-set.
    pub async fn check_job_complete_and_promote(&self, job_id: i64) -> Result<()> {
        let job = self.repo.get_job(job_id).await?;
        match job.parsed_status()? {
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Failed => return Ok(()),
            JobStatus::Pending | JobStatus::InProgress => {}
        }

        let key_count = self.repo.get_job_key_count(job_id).await?;
        if key_count < job.job_count {
            debug!(
                job_id,
                key_count,
                job_count = job.job_count,
                "Parent job not finished yet"
            );
            return Ok(());
        }

        let moved = artifact::promote(
            &self.config.staging_root,
            &self.config.payload_root,
            job_id,
        )
        .await?;

        if self
            .repo
            .update_job_status_checked(job_id, JobStatus::InProgress, JobStatus::Completed)
            .await?
        {
            info!(job_id, moved, "Parent job completed; artifacts promoted");
        } else {
            debug!(job_id, "Lost the completion race");
        }
        Ok(())
    }
}
