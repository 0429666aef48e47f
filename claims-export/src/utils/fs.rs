//! Filesystem helpers shared across modules.
//!
//! These helpers provide consistent error context (operation + path) and
//! reduce duplicated `create_dir_all` calls.

use std::path::Path;

use crate::{Error, Result};

/// Convert an IO error into an application error with operation + path context.
pub fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::io_path(op, path, source)
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all_with_op(op: &'static str, path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| io_error(op, path, e))
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all(path: &Path) -> Result<()> {
    ensure_dir_all_with_op("creating directory", path).await
}

/// Verify a directory is writable by creating (and dropping) an anonymous
/// temporary file inside it. The directory is created first if missing.
///
/// Used at startup so a misconfigured artifact root fails the process before
/// any queue entry is claimed.
pub fn probe_writable(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| io_error("creating directory", path, e))?;
    tempfile::tempfile_in(path).map_err(|e| io_error("probing writability of", path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_dir_all_is_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("a/b/c");
        ensure_dir_all(&dir).await.unwrap();
        ensure_dir_all(&dir).await.unwrap();
        assert!(dir.is_dir());
    }

    #[test]
    fn probe_writable_creates_missing_root() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("staging");
        probe_writable(&dir).unwrap();
        assert!(dir.is_dir());
    }
}
