//! Server-side deletion under the configured policy.
//!
//! `Disabled` succeeds without touching the filesystem. `LwwDelete` removes
//! a file only when the caller's deletion timestamp strictly beats the
//! file's current mtime; otherwise the server copy wins. Paths are all
//! validated before anything is deleted, so one bad path fails the whole
//! request with the dataset untouched.

use crate::config::DeleteStrategy;
use crate::error::SyncError;
use crate::path_guard;
use crate::protocol::DeleteRequest;
use chrono::{DateTime, Utc};
use std::path::PathBuf;

pub struct DeleteEngine {
    inbound_root: PathBuf,
    strategy: DeleteStrategy,
}

impl DeleteEngine {
    pub fn new(inbound_root: impl Into<PathBuf>, strategy: DeleteStrategy) -> Self {
        Self {
            inbound_root: inbound_root.into(),
            strategy,
        }
    }

    /// Apply one delete request. Returns the number of files removed.
    pub async fn apply(&self, req: &DeleteRequest) -> Result<usize, SyncError> {
        if self.strategy == DeleteStrategy::Disabled {
            tracing::debug!(
                dataset = %req.dataset_id,
                client = %req.client_id,
                paths = req.paths.len(),
                "delete request ignored; policy is disabled"
            );
            return Ok(0);
        }

        let deleted_at = req.deleted_at_utc.ok_or_else(|| {
            SyncError::BadRequest("deletedAtUtc is required under the LwwDelete policy".into())
        })?;

        path_guard::validate_id(&req.dataset_id)?;
        let dataset_root = self.inbound_root.join(&req.dataset_id);
        if !dataset_root.is_dir() {
            return Ok(0); // nothing published for this dataset yet
        }

        // Validate every path before deleting anything.
        let mut targets = Vec::with_capacity(req.paths.len());
        for path in &req.paths {
            targets.push((path.as_str(), path_guard::safe_join(&dataset_root, path)?));
        }

        let mut removed = 0usize;
        for (path, target) in targets {
            let mtime: DateTime<Utc> = match tokio::fs::metadata(&target).await {
                Ok(meta) => meta.modified()?.into(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(SyncError::Io(e)),
            };
            if deleted_at > mtime {
                match tokio::fs::remove_file(&target).await {
                    Ok(()) => {
                        tracing::info!(dataset = %req.dataset_id, path, "file deleted");
                        removed += 1;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(SyncError::Io(e)),
                }
            } else {
                tracing::debug!(
                    dataset = %req.dataset_id,
                    path,
                    "delete skipped; server copy is newer"
                );
            }
        }
        Ok(removed)
    }
}
