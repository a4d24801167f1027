//! Client-local sync state, persisted between rounds as a JSON document.
//!
//! The state is advisory: it lets the manifest builder reuse a previously
//! computed hash when a file's size and mtime are unchanged. A missing file
//! yields an empty state; a corrupt file aborts the round so the operator
//! can decide whether to delete it.

use crate::error::ClientError;
use crate::protocol::FileEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub files: BTreeMap<String, FileEntry>,
}

pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Result<SyncState, ClientError> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SyncState::default())
            }
            Err(e) => return Err(ClientError::LocalIo(e)),
        };
        serde_json::from_slice(&raw).map_err(|e| {
            ClientError::Config(format!(
                "state file {} is corrupt: {e}",
                self.path.display()
            ))
        })
    }

    /// Atomic replace: write a sibling temp file, then rename over the old
    /// state so a crash never leaves a half-written document.
    pub fn save(&self, state: &SyncState) -> Result<(), ClientError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let temp = self.path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(state)
            .map_err(|e| ClientError::Config(format!("state serialization failed: {e}")))?;
        std::fs::write(&temp, body)?;
        std::fs::rename(&temp, &self.path)?;
        Ok(())
    }
}
