//! Manifest diffing under the Last-Writer-Wins policy.
//!
//! The server enumerates its dataset, compares it against the client's
//! manifest, and answers with the set of files the client must upload and
//! (under LwwDelete) the set the client may ask the server to delete. Every
//! upload decision mints a fresh upload session so the client holds its
//! opaque upload id before any bytes flow.

use crate::config::DeleteStrategy;
use crate::error::SyncError;
use crate::path_guard;
use crate::protocol::{DiffResponse, FileEntry, ManifestRequest};
use crate::session::SessionStore;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// One file as currently published under the dataset root.
#[derive(Debug, Clone)]
pub struct ServerEntry {
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub size: u64,
    pub mtime: DateTime<Utc>,
}

/// What the version policy wants done with a manifest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadDecision {
    Upload,
    Skip,
    /// Equal mtime and size with a client hash present: only a content
    /// comparison can break the tie.
    CompareHash,
}

/// LWW on mtime with a size/hash tiebreak at equal mtime.
pub struct VersionPolicy;

impl VersionPolicy {
    pub fn should_upload(server: &ServerEntry, client: &FileEntry) -> UploadDecision {
        if client.last_write_utc > server.mtime {
            UploadDecision::Upload
        } else if client.last_write_utc == server.mtime {
            if client.size != server.size {
                UploadDecision::Upload
            } else if client.sha256.is_some() {
                UploadDecision::CompareHash
            } else {
                UploadDecision::Skip
            }
        } else {
            // Server is newer: server wins, even if sizes differ.
            UploadDecision::Skip
        }
    }

    /// Publish gate used by the merge engine: a complete request only
    /// replaces the target when its write time strictly beats the target's.
    pub fn should_overwrite(server_mtime: Option<DateTime<Utc>>, last_write: DateTime<Utc>) -> bool {
        match server_mtime {
            Some(current) => last_write > current,
            None => true,
        }
    }
}

pub struct DiffEngine {
    inbound_root: PathBuf,
    delete_strategy: DeleteStrategy,
}

impl DiffEngine {
    pub fn new(inbound_root: impl Into<PathBuf>, delete_strategy: DeleteStrategy) -> Self {
        Self {
            inbound_root: inbound_root.into(),
            delete_strategy,
        }
    }

    /// Compute the diff for one manifest and mint sessions for the upload
    /// set. Invalid or duplicate paths fail the whole request.
    pub async fn diff(
        &self,
        sessions: &SessionStore,
        req: &ManifestRequest,
    ) -> Result<DiffResponse, SyncError> {
        path_guard::validate_id(&req.dataset_id)?;
        path_guard::validate_id(&req.client_id)?;

        // Validate the whole manifest before touching anything.
        let mut client_keys: HashSet<String> = HashSet::with_capacity(req.files.len());
        let mut normalized: Vec<(String, &FileEntry)> = Vec::with_capacity(req.files.len());
        for entry in &req.files {
            let path = path_guard::validate(&entry.path)?;
            if !client_keys.insert(path_guard::fold_case(&path)) {
                return Err(SyncError::BadRequest(format!(
                    "manifest lists {path} more than once (case-insensitive)"
                )));
            }
            normalized.push((path, entry));
        }

        let dataset_root = self.inbound_root.join(&req.dataset_id);
        let server = scan_dataset(&dataset_root)?;

        let mut response = DiffResponse::default();
        for (path, client) in &normalized {
            let needed = match server.get(&path_guard::fold_case(path)) {
                None => true,
                Some(existing) => match VersionPolicy::should_upload(existing, client) {
                    UploadDecision::Upload => true,
                    UploadDecision::Skip => false,
                    UploadDecision::CompareHash => {
                        let server_hash = sha256_file_hex(&existing.abs_path)?;
                        let client_hash = client.sha256.as_deref().unwrap_or_default();
                        !client_hash.eq_ignore_ascii_case(&server_hash)
                    }
                },
            };
            if needed {
                let instruction = sessions
                    .create(&req.dataset_id, &req.client_id, path)
                    .await?;
                response.upload.push(instruction);
            }
        }

        if self.delete_strategy == DeleteStrategy::LwwDelete {
            let mut deletes: Vec<String> = server
                .iter()
                .filter(|(key, _)| !client_keys.contains(*key))
                .map(|(_, entry)| entry.rel_path.clone())
                .collect();
            deletes.sort();
            response.delete = deletes;
        }

        tracing::info!(
            dataset = %req.dataset_id,
            client = %req.client_id,
            manifest = req.files.len(),
            upload = response.upload.len(),
            delete = response.delete.len(),
            "manifest diffed"
        );
        Ok(response)
    }
}

/// Enumerate the dataset into a map keyed by case-folded relative path.
/// An absent dataset directory is an empty dataset.
pub fn scan_dataset(root: &Path) -> Result<HashMap<String, ServerEntry>, SyncError> {
    let mut map = HashMap::new();
    if !root.is_dir() {
        return Ok(map);
    }
    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let segments: Option<Vec<&str>> = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect();
        let Some(segments) = segments else { continue };
        let rel_path = segments.join("/");

        let metadata = entry.metadata().map_err(|e| {
            SyncError::Io(std::io::Error::other(format!(
                "stat {}: {e}",
                entry.path().display()
            )))
        })?;
        let mtime: DateTime<Utc> = metadata.modified()?.into();
        map.insert(
            path_guard::fold_case(&rel_path),
            ServerEntry {
                rel_path,
                abs_path: entry.path().to_path_buf(),
                size: metadata.len(),
                mtime,
            },
        );
    }
    Ok(map)
}

/// Lowercase hex SHA-256 of a file, streamed.
pub fn sha256_file_hex(path: &Path) -> Result<String, SyncError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
