//! Wire contract: payload shapes and endpoint paths.
//!
//! Everything under `/api/sync`. JSON bodies are UTF-8, timestamps are
//! ISO-8601 UTC, and `{b64path}` segments carry the padless URL-safe base64
//! of the UTF-8 relative path.

use crate::path_guard;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const API_PREFIX: &str = "/api/sync";

/// Pre-shared key header, required on every endpoint except the health probe.
pub const API_KEY_HEADER: &str = "X-Api-Key";

/// One file as reported in a manifest (and persisted in client state).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// Normalized POSIX relative path.
    pub path: String,
    pub size: u64,
    pub last_write_utc: DateTime<Utc>,
    /// Lowercase hex SHA-256, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestRequest {
    pub dataset_id: String,
    pub client_id: String,
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadInstruction {
    pub path: String,
    pub upload_id: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffResponse {
    pub upload: Vec<UploadInstruction>,
    pub delete: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    pub dataset_id: String,
    pub client_id: String,
    pub expected_size: u64,
    /// Lowercase hex SHA-256 of the assembled file; empty/absent skips the check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Number of chunk PUTs issued; 0 skips the count check.
    pub chunk_count: u32,
    pub last_write_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest {
    pub dataset_id: String,
    pub client_id: String,
    pub paths: Vec<String>,
    /// Required when the server's policy is LwwDelete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at_utc: Option<DateTime<Utc>>,
}

/// Health probe body, no auth required.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

// Client-side URL construction. The server's router mirrors these shapes.

pub fn manifest_url(base: &str) -> String {
    format!("{}{}/manifest", base.trim_end_matches('/'), API_PREFIX)
}

pub fn chunk_url(base: &str, path: &str, upload_id: Uuid, index: u32) -> String {
    format!(
        "{}{}/files/{}/uploads/{}/chunks/{}",
        base.trim_end_matches('/'),
        API_PREFIX,
        path_guard::encode_path(path),
        upload_id,
        index
    )
}

pub fn complete_url(base: &str, path: &str, upload_id: Uuid) -> String {
    format!(
        "{}{}/files/{}/uploads/{}/complete",
        base.trim_end_matches('/'),
        API_PREFIX,
        path_guard::encode_path(path),
        upload_id
    )
}

pub fn delete_url(base: &str) -> String {
    format!("{}{}/delete", base.trim_end_matches('/'), API_PREFIX)
}
