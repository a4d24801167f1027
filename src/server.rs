//! HTTP surface of the sync server: application state, router, handlers,
//! and the daemon entry point.
//!
//! Every endpoint authenticates through the pre-shared key gate before any
//! engine runs. Chunk bodies stream straight from the request body to the
//! staged chunk file; nothing buffers a whole chunk in memory.

use crate::auth::AuthGate;
use crate::config::ServerConfig;
use crate::delete::DeleteEngine;
use crate::diff::DiffEngine;
use crate::error::SyncError;
use crate::merge::MergeEngine;
use crate::path_guard;
use crate::protocol::{
    CompleteRequest, DeleteRequest, DiffResponse, HealthResponse, ManifestRequest, API_KEY_HEADER,
};
use crate::session::SessionStore;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

pub struct AppState {
    pub config: ServerConfig,
    pub auth: AuthGate,
    pub sessions: Arc<SessionStore>,
    pub diff: DiffEngine,
    pub merge: MergeEngine,
    pub delete: DeleteEngine,
}

impl AppState {
    pub fn new(config: ServerConfig) -> anyhow::Result<Self> {
        config.prepare()?;
        let sessions = Arc::new(SessionStore::new(&config.temp_root));
        let diff = DiffEngine::new(&config.inbound_root, config.delete_strategy);
        let merge = MergeEngine::new(
            &config.inbound_root,
            &config.temp_root,
            sessions.clone(),
            config.max_parallel_uploads,
        );
        let delete = DeleteEngine::new(&config.inbound_root, config.delete_strategy);
        let auth = AuthGate::new(config.dataset_keys.clone(), config.client_keys.clone());
        Ok(Self {
            config,
            auth,
            sessions,
            diff,
            merge,
            delete,
        })
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/sync/health", get(health))
        .route("/api/sync/manifest", post(post_manifest))
        .route(
            "/api/sync/files/:b64path/uploads/:upload_id/chunks/:index",
            put(put_chunk),
        )
        .route(
            "/api/sync/files/:b64path/uploads/:upload_id/complete",
            post(post_complete),
        )
        .route("/api/sync/delete", post(post_delete))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Run the daemon: bind, start the session sweeper, serve until killed.
pub async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let state = Arc::new(AppState::new(config)?);
    let router = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(state.config.bind.as_str()).await?;

    if state.config.session_ttl_secs > 0 {
        spawn_session_sweeper(state.clone());
    }

    tracing::info!(
        addr = %listener.local_addr()?,
        inbound = %state.config.inbound_root.display(),
        temp = %state.config.temp_root.display(),
        delete_strategy = ?state.config.delete_strategy,
        "mirsyncd listening"
    );
    axum::serve(listener, router).await?;
    Ok(())
}

/// Periodically garbage-collect sessions past the configured horizon.
fn spawn_session_sweeper(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    let ttl = state.config.session_ttl_secs;
    let period = Duration::from_secs((ttl / 4).clamp(60, 3600));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match state.sessions.sweep_stale(ttl).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(removed = n, "session sweep"),
                Err(e) => tracing::warn!(error = %e, "session sweep failed"),
            }
        }
    })
}

fn api_key(headers: &HeaderMap) -> Option<&str> {
    headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn post_manifest(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ManifestRequest>,
) -> Result<Json<DiffResponse>, SyncError> {
    state
        .auth
        .authorize(&req.dataset_id, &req.client_id, api_key(&headers))?;
    let diff = state.diff.diff(&state.sessions, &req).await?;
    Ok(Json(diff))
}

/// Scope of a chunk PUT; carried in the query string.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChunkScope {
    #[serde(default)]
    dataset_id: String,
    #[serde(default)]
    client_id: String,
}

async fn put_chunk(
    State(state): State<Arc<AppState>>,
    Path((b64path, upload_id, index)): Path<(String, String, u32)>,
    Query(scope): Query<ChunkScope>,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, SyncError> {
    state
        .auth
        .authorize(&scope.dataset_id, &scope.client_id, api_key(&headers))?;
    path_guard::validate_id(&scope.dataset_id)?;
    let relative_path = path_guard::decode_path(&b64path)?;
    let upload_id = parse_upload_id(&upload_id)?;

    state
        .merge
        .save_chunk(
            &scope.dataset_id,
            &scope.client_id,
            &relative_path,
            upload_id,
            index,
            body.into_data_stream(),
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn post_complete(
    State(state): State<Arc<AppState>>,
    Path((b64path, upload_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(req): Json<CompleteRequest>,
) -> Result<StatusCode, SyncError> {
    state
        .auth
        .authorize(&req.dataset_id, &req.client_id, api_key(&headers))?;
    path_guard::validate_id(&req.dataset_id)?;
    let relative_path = path_guard::decode_path(&b64path)?;
    let upload_id = parse_upload_id(&upload_id)?;

    state
        .merge
        .complete_upload(&relative_path, upload_id, &req)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn post_delete(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<DeleteRequest>,
) -> Result<StatusCode, SyncError> {
    state
        .auth
        .authorize(&req.dataset_id, &req.client_id, api_key(&headers))?;
    state.delete.apply(&req).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn parse_upload_id(raw: &str) -> Result<Uuid, SyncError> {
    Uuid::parse_str(raw).map_err(|_| SyncError::BadRequest(format!("bad upload id: {raw}")))
}
