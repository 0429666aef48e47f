//! NDJSON artifact streaming.
//!
//! Each queue entry writes one data artifact (`<uuid>.ndjson`) and, lazily,
//! one error artifact (`<uuid>-error.ndjson`) into the parent job's staging
//! directory. Completed jobs are promoted by renaming every staged file into
//! the payload directory; staging and payload must live on one filesystem so
//! the rename stays atomic per file.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;
use uuid::Uuid;

use crate::upstream::operation_outcome;
use crate::utils::fs;
use crate::{Error, Result};

/// Sentinel file name recorded for entries that produced no output, so the
/// completion bookkeeping still counts them.
pub const BLANK_ARTIFACT_NAME: &str = "blank.ndjson";

/// Buffered writer for one entry's artifacts.
pub struct ArtifactWriter {
    artifact_id: Uuid,
    data: BufWriter<File>,
    data_path: PathBuf,
    error: Option<BufWriter<File>>,
    error_path: PathBuf,
    bytes_written: u64,
    resource_count: u64,
    outcome_count: u64,
}

/// What an entry produced, reported after flush-and-close.
#[derive(Debug, Clone)]
pub struct ArtifactSummary {
    pub data_file_name: String,
    pub data_path: PathBuf,
    pub bytes_written: u64,
    pub resource_count: u64,
    pub outcome_count: u64,
}

impl ArtifactWriter {
    /// Open a fresh `<uuid>.ndjson` in `dir` for buffered append, creating
    /// the directory if needed. The error artifact is only created when the
    /// first OperationOutcome is written.
    pub async fn create(dir: &Path) -> Result<Self> {
        fs::ensure_dir_all(dir).await?;

        let artifact_id = Uuid::new_v4();
        let data_path = dir.join(format!("{artifact_id}.ndjson"));
        let error_path = dir.join(format!("{artifact_id}-error.ndjson"));

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&data_path)
            .await
            .map_err(|e| Error::io_path("opening artifact", &data_path, e))?;

        Ok(Self {
            artifact_id,
            data: BufWriter::new(file),
            data_path,
            error: None,
            error_path,
            bytes_written: 0,
            resource_count: 0,
            outcome_count: 0,
        })
    }

    pub fn data_file_name(&self) -> String {
        format!("{}.ndjson", self.artifact_id)
    }

    /// Append one resource as a compact JSON line.
    pub async fn write_resource(&mut self, resource: &Value) -> Result<()> {
        let mut line = serde_json::to_vec(resource)?;
        line.push(b'\n');

        self.data
            .write_all(&line)
            .await
            .map_err(|e| Error::io_path("writing artifact line", &self.data_path, e))?;

        self.bytes_written += line.len() as u64;
        self.resource_count += 1;
        Ok(())
    }

    /// Append one OperationOutcome line to the error artifact, creating it
    /// on first use.
    pub async fn write_operation_outcome(&mut self, diagnostics: &str) -> Result<()> {
        let writer = match self.error.as_mut() {
            Some(writer) => writer,
            None => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.error_path)
                    .await
                    .map_err(|e| Error::io_path("opening error artifact", &self.error_path, e))?;
                self.error.insert(BufWriter::new(file))
            }
        };

        let mut line = serde_json::to_vec(&operation_outcome(diagnostics))?;
        line.push(b'\n');
        writer
            .write_all(&line)
            .await
            .map_err(|e| Error::io_path("writing error artifact line", &self.error_path, e))?;

        self.outcome_count += 1;
        Ok(())
    }

    /// Flush and close both artifacts.
    pub async fn finish(mut self) -> Result<ArtifactSummary> {
        self.data
            .flush()
            .await
            .map_err(|e| Error::io_path("flushing artifact", &self.data_path, e))?;

        if let Some(error) = self.error.as_mut() {
            error
                .flush()
                .await
                .map_err(|e| Error::io_path("flushing error artifact", &self.error_path, e))?;
        }

        Ok(ArtifactSummary {
            data_file_name: self.data_file_name(),
            data_path: self.data_path,
            bytes_written: self.bytes_written,
            resource_count: self.resource_count,
            outcome_count: self.outcome_count,
        })
    }
}

/// Move every staged file of `job_id` into the payload directory and drop the
/// emptied staging directory. Idempotent: an already-promoted (missing)
/// staging directory moves nothing, and rename replaces a same-named target
/// left by a racing promoter.
pub async fn promote(staging_root: &Path, payload_root: &Path, job_id: i64) -> Result<u64> {
    let staging = staging_root.join(job_id.to_string());
    let payload = payload_root.join(job_id.to_string());

    let mut entries = match tokio::fs::read_dir(&staging).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(Error::io_path("reading staging directory", &staging, e)),
    };

    fs::ensure_dir_all(&payload).await?;

    let mut moved = 0u64;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::io_path("reading staging directory", &staging, e))?
    {
        let target = payload.join(entry.file_name());
        tokio::fs::rename(entry.path(), &target)
            .await
            .map_err(|e| Error::io_path("promoting artifact", &target, e))?;
        moved += 1;
    }
    drop(entries);

    if let Err(e) = tokio::fs::remove_dir(&staging).await {
        debug!(job_id, error = %e, "Staging directory not removed");
    }

    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn writes_resources_in_order() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut writer = ArtifactWriter::create(tmp.path()).await.unwrap();

        writer.write_resource(&json!({"id": "a"})).await.unwrap();
        writer.write_resource(&json!({"id": "b"})).await.unwrap();
        let summary = writer.finish().await.unwrap();

        let content = std::fs::read_to_string(&summary.data_path).unwrap();
        assert_eq!(content, "{\"id\":\"a\"}\n{\"id\":\"b\"}\n");
        assert_eq!(summary.resource_count, 2);
        assert_eq!(summary.bytes_written, content.len() as u64);
    }

    #[tokio::test]
    async fn error_artifact_is_created_lazily() {
        let tmp = tempfile::TempDir::new().unwrap();

        let writer = ArtifactWriter::create(tmp.path()).await.unwrap();
        let clean = writer.finish().await.unwrap();
        assert_eq!(clean.outcome_count, 0);
        let files: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().collect();
        assert_eq!(files.len(), 1, "no error artifact without failures");

        let mut writer = ArtifactWriter::create(tmp.path()).await.unwrap();
        writer.write_operation_outcome("boom").await.unwrap();
        let summary = writer.finish().await.unwrap();
        assert_eq!(summary.outcome_count, 1);

        let error_path = tmp
            .path()
            .join(summary.data_file_name.replace(".ndjson", "-error.ndjson"));
        let content = std::fs::read_to_string(error_path).unwrap();
        assert!(content.contains("OperationOutcome"));
        assert!(content.ends_with('\n'));
    }

    #[tokio::test]
    async fn promote_moves_everything_and_is_idempotent() {
        let staging_root = tempfile::TempDir::new().unwrap();
        let payload_root = tempfile::TempDir::new().unwrap();
        let job_dir = staging_root.path().join("7");
        std::fs::create_dir_all(&job_dir).unwrap();
        std::fs::write(job_dir.join("a.ndjson"), "{}\n").unwrap();
        std::fs::write(job_dir.join("a-error.ndjson"), "{}\n").unwrap();

        let moved = promote(staging_root.path(), payload_root.path(), 7)
            .await
            .unwrap();
        assert_eq!(moved, 2);
        assert!(!job_dir.exists());
        assert!(payload_root.path().join("7/a.ndjson").exists());
        assert!(payload_root.path().join("7/a-error.ndjson").exists());

        // Second promotion finds nothing to do.
        let moved = promote(staging_root.path(), payload_root.path(), 7)
            .await
            .unwrap();
        assert_eq!(moved, 0);
    }
}
