//! Error taxonomy for both sides of the sync protocol.
//!
//! `SyncError` is the server-side taxonomy; it maps onto HTTP statuses and
//! serializes as a small JSON body. `ClientError` is the client-side
//! taxonomy surfaced by the sync runner.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Server-side protocol and storage errors.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Missing or wrong pre-shared key, or unknown dataset/client.
    #[error("unauthorized")]
    Unauthorized,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("upload session not found: {0}")]
    SessionNotFound(String),

    /// Session exists but is bound to a different dataset, client, or path.
    #[error("upload session mismatch: {0}")]
    SessionMismatch(String),

    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("chunk count mismatch: complete request says {expected}, {staged} staged")]
    ChunkCountMismatch { expected: u32, staged: u32 },

    #[error("size mismatch: expected {expected} bytes, assembled {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("hash mismatch: expected {expected}, computed {actual}")]
    HashMismatch { expected: String, actual: String },

    /// Publish could not replace the target (e.g. rename target in use).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SyncError::Unauthorized => StatusCode::UNAUTHORIZED,
            SyncError::InvalidPath(_)
            | SyncError::SessionNotFound(_)
            | SyncError::SessionMismatch(_)
            | SyncError::BadRequest(_) => StatusCode::BAD_REQUEST,
            SyncError::ChunkCountMismatch { .. }
            | SyncError::SizeMismatch { .. }
            | SyncError::HashMismatch { .. }
            | SyncError::Conflict(_) => StatusCode::CONFLICT,
            SyncError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON error body returned by every failing endpoint.
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: u16,
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Internal errors keep their detail in the log, not the response.
        let message = match &self {
            SyncError::Io(e) => {
                tracing::error!(error = %e, "request failed with I/O error");
                "internal I/O failure".to_string()
            }
            other => other.to_string(),
        };
        let body = ErrorResponse {
            error: message,
            status: status.as_u16(),
        };
        (status, axum::Json(body)).into_response()
    }
}

/// Client-side errors for a sync round.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("local I/O failure: {0}")]
    LocalIo(#[from] std::io::Error),

    /// Transport-level failure before any HTTP status was produced.
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server answered with a non-2xx status; the round is aborted.
    #[error("server rejected request: HTTP {status}: {body}")]
    ServerRejection { status: u16, body: String },

    #[error("integrity failure: {0}")]
    Integrity(String),

    #[error("cancelled")]
    Cancelled,
}

impl ClientError {
    /// Exit code for the CLI; cancellation is distinguishable from failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientError::Cancelled => 130,
            _ => 1,
        }
    }
}
