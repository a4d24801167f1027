//! Upload sessions: the server-side staging context for one file upload.
//!
//! A session is a directory under `temp_root/<dataset>/<upload_id>/` holding
//! a `session.json` metadata record plus the staged chunk files. Sessions
//! are minted at diff time so the client knows its upload id before any
//! bytes flow, and survive network blips until they are published, cleaned
//! up, or garbage-collected.

use crate::error::SyncError;
use crate::path_guard;
use crate::protocol::UploadInstruction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const SESSION_FILE: &str = "session.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub dataset_id: String,
    pub client_id: String,
    pub relative_path: String,
    pub created_utc: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub upload_id: Uuid,
    pub meta: SessionMeta,
    pub dir: PathBuf,
}

pub struct SessionStore {
    temp_root: PathBuf,
}

impl SessionStore {
    pub fn new(temp_root: impl Into<PathBuf>) -> Self {
        Self {
            temp_root: temp_root.into(),
        }
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    fn session_dir(&self, dataset_id: &str, upload_id: Uuid) -> PathBuf {
        self.temp_root.join(dataset_id).join(upload_id.to_string())
    }

    /// Mint a fresh session for one target file and persist its metadata.
    /// Upload ids are v4 UUIDs and are never reused across sessions.
    pub async fn create(
        &self,
        dataset_id: &str,
        client_id: &str,
        relative_path: &str,
    ) -> Result<UploadInstruction, SyncError> {
        let relative_path = path_guard::validate(relative_path)?;
        let upload_id = Uuid::new_v4();
        let dir = self.session_dir(dataset_id, upload_id);
        tokio::fs::create_dir_all(&dir).await?;

        let meta = SessionMeta {
            dataset_id: dataset_id.to_string(),
            client_id: client_id.to_string(),
            relative_path: relative_path.clone(),
            created_utc: Utc::now(),
        };
        let body = serde_json::to_vec_pretty(&meta).map_err(std::io::Error::other)?;
        tokio::fs::write(dir.join(SESSION_FILE), body).await?;

        tracing::debug!(
            dataset = dataset_id,
            client = client_id,
            path = %relative_path,
            upload_id = %upload_id,
            "upload session created"
        );
        Ok(UploadInstruction {
            path: relative_path,
            upload_id,
        })
    }

    /// Look up a session; fails `SessionNotFound` when absent and
    /// `SessionMismatch` when it belongs to a different dataset.
    pub async fn get(&self, dataset_id: &str, upload_id: Uuid) -> Result<Session, SyncError> {
        let dir = self.session_dir(dataset_id, upload_id);
        let raw = match tokio::fs::read(dir.join(SESSION_FILE)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SyncError::SessionNotFound(upload_id.to_string()))
            }
            Err(e) => return Err(SyncError::Io(e)),
        };
        let meta: SessionMeta = serde_json::from_slice(&raw).map_err(std::io::Error::other)?;
        if meta.dataset_id != dataset_id {
            return Err(SyncError::SessionMismatch(format!(
                "session {upload_id} belongs to dataset {}",
                meta.dataset_id
            )));
        }
        Ok(Session {
            upload_id,
            meta,
            dir,
        })
    }

    /// Deterministic chunk file path: `<session dir>/<relpath>.chunk<index>`.
    pub fn chunk_path(session: &Session, index: u32) -> PathBuf {
        let mut path = session.dir.clone();
        let mut segments = session.meta.relative_path.split('/').peekable();
        while let Some(segment) = segments.next() {
            if segments.peek().is_some() {
                path.push(segment);
            } else {
                path.push(format!("{segment}.chunk{index}"));
            }
        }
        path
    }

    /// Enumerate staged chunks ordered by parsed index. A file whose suffix
    /// does not parse sorts to the end (u64::MAX) and is caught by the
    /// chunk-count check in the complete step.
    pub fn staged_chunks(session: &Session) -> Result<Vec<(u64, PathBuf)>, SyncError> {
        let mut chunks = Vec::new();
        for entry in walkdir::WalkDir::new(&session.dir)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name == SESSION_FILE {
                continue;
            }
            let index = name
                .rsplit_once(".chunk")
                .and_then(|(_, suffix)| suffix.parse::<u64>().ok())
                .unwrap_or(u64::MAX);
            chunks.push((index, entry.path().to_path_buf()));
        }
        chunks.sort_by_key(|(index, _)| *index);
        Ok(chunks)
    }

    /// Remove a session directory. Idempotent: removing an absent session
    /// succeeds. A cleaned session is never resurrected.
    pub async fn cleanup(&self, dataset_id: &str, upload_id: Uuid) -> Result<(), SyncError> {
        let dir = self.session_dir(dataset_id, upload_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::Io(e)),
        }
    }

    /// Garbage-collect sessions older than `ttl_secs`, plus orphaned
    /// assembly temps left behind by a crash mid-complete. Returns the
    /// number of entries removed.
    pub async fn sweep_stale(&self, ttl_secs: u64) -> Result<usize, SyncError> {
        let horizon = Utc::now() - chrono::Duration::seconds(ttl_secs as i64);
        let mut removed = 0usize;

        let mut datasets = match tokio::fs::read_dir(&self.temp_root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(SyncError::Io(e)),
        };
        while let Some(dataset) = datasets.next_entry().await? {
            if !dataset.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = tokio::fs::read_dir(dataset.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    let created = match tokio::fs::read(path.join(SESSION_FILE)).await {
                        Ok(raw) => serde_json::from_slice::<SessionMeta>(&raw)
                            .ok()
                            .map(|m| m.created_utc),
                        Err(_) => None,
                    };
                    // A directory without readable metadata is judged by its
                    // own mtime so broken sessions still age out.
                    let created = match created {
                        Some(c) => c,
                        None => match entry.metadata().await.and_then(|m| m.modified()) {
                            Ok(t) => t.into(),
                            Err(_) => continue,
                        },
                    };
                    if created < horizon {
                        if tokio::fs::remove_dir_all(&path).await.is_ok() {
                            tracing::info!(path = %path.display(), "stale upload session removed");
                            removed += 1;
                        }
                    }
                } else if path.extension().is_some_and(|e| e == "tmp") {
                    let modified: Option<DateTime<Utc>> =
                        entry.metadata().await.and_then(|m| m.modified()).ok().map(Into::into);
                    if modified.is_some_and(|m| m < horizon)
                        && tokio::fs::remove_file(&path).await.is_ok()
                    {
                        tracing::info!(path = %path.display(), "orphaned assembly temp removed");
                        removed += 1;
                    }
                }
            }
        }
        Ok(removed)
    }
}
