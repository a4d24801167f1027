//! Router-level protocol tests: the literal end-to-end scenarios from the
//! sync contract, driven through the axum router without a socket.

use axum::body::Body;
use axum::Router;
use chrono::{DateTime, Utc};
use http::{Request, StatusCode};
use http_body_util::BodyExt;
use mirsync::config::{DeleteStrategy, ServerConfig};
use mirsync::protocol::{self, DiffResponse};
use mirsync::server::{build_router, AppState};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

const DATASET_KEY: &str = "ds-secret";
const CLIENT_KEY: &str = "laptop-secret";

fn test_state(strategy: DeleteStrategy) -> (TempDir, Arc<AppState>, Router) {
    let tmp = TempDir::new().expect("tempdir");
    let mut dataset_keys = HashMap::new();
    dataset_keys.insert("ds".to_string(), DATASET_KEY.to_string());
    let mut client_keys = HashMap::new();
    client_keys.insert("laptop".to_string(), CLIENT_KEY.to_string());

    let cfg = ServerConfig {
        bind: "127.0.0.1:0".to_string(),
        inbound_root: tmp.path().join("inbound"),
        temp_root: tmp.path().join("temp"),
        delete_strategy: strategy,
        max_parallel_uploads: 4,
        dataset_keys,
        client_keys,
        session_ttl_secs: 0,
    };
    let state = Arc::new(AppState::new(cfg).expect("AppState::new"));
    let router = build_router(state.clone());
    (tmp, state, router)
}

fn utc(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

fn sha_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn set_mtime(path: &Path, mtime: &str) {
    filetime::set_file_mtime(
        path,
        filetime::FileTime::from_system_time(utc(mtime).into()),
    )
    .unwrap();
}

fn file_mtime(path: &Path) -> DateTime<Utc> {
    std::fs::metadata(path).unwrap().modified().unwrap().into()
}

async fn send_json(
    app: &Router,
    method: &str,
    uri: &str,
    key: Option<&str>,
    body: serde_json::Value,
) -> http::Response<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header(protocol::API_KEY_HEADER, key);
    }
    app.clone()
        .oneshot(builder.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap()
}

async fn put_chunk(
    app: &Router,
    path: &str,
    upload_id: Uuid,
    index: u32,
    bytes: &[u8],
) -> StatusCode {
    let uri = format!(
        "{}?datasetId=ds&clientId=laptop",
        protocol::chunk_url("", path, upload_id, index)
    );
    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(uri)
                .header(protocol::API_KEY_HEADER, DATASET_KEY)
                .body(Body::from(bytes.to_vec()))
                .unwrap(),
        )
        .await
        .unwrap();
    resp.status()
}

fn manifest_body(files: serde_json::Value) -> serde_json::Value {
    serde_json::json!({ "datasetId": "ds", "clientId": "laptop", "files": files })
}

async fn diff(app: &Router, files: serde_json::Value) -> DiffResponse {
    let resp = send_json(app, "POST", "/api/sync/manifest", Some(DATASET_KEY), manifest_body(files)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn complete_body(size: u64, sha256: &str, chunks: u32, mtime: &str) -> serde_json::Value {
    serde_json::json!({
        "datasetId": "ds",
        "clientId": "laptop",
        "expectedSize": size,
        "sha256": sha256,
        "chunkCount": chunks,
        "lastWriteUtc": mtime,
    })
}

/// Scenario: fresh upload of a 9-byte file in 4-byte chunks.
#[tokio::test]
async fn fresh_upload_three_chunks() {
    let (tmp, _state, app) = test_state(DeleteStrategy::Disabled);
    let content = b"hello\nhi\n";

    let diff = diff(
        &app,
        serde_json::json!([{ "path": "a/b.txt", "size": 9, "lastWriteUtc": "2025-01-01T00:00:00Z" }]),
    )
    .await;
    assert_eq!(diff.upload.len(), 1);
    assert_eq!(diff.upload[0].path, "a/b.txt");
    let upload_id = diff.upload[0].upload_id;

    for (index, chunk) in content.chunks(4).enumerate() {
        assert_eq!(
            put_chunk(&app, "a/b.txt", upload_id, index as u32, chunk).await,
            StatusCode::NO_CONTENT
        );
    }

    let resp = send_json(
        &app,
        "POST",
        &protocol::complete_url("", "a/b.txt", upload_id),
        Some(DATASET_KEY),
        complete_body(9, &sha_hex(content), 3, "2025-01-01T00:00:00Z"),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let target = tmp.path().join("inbound/ds/a/b.txt");
    assert_eq!(std::fs::read(&target).unwrap(), content);
    assert_eq!(sha_hex(&std::fs::read(&target).unwrap()), sha_hex(content));
    assert_eq!(file_mtime(&target), utc("2025-01-01T00:00:00Z"));

    // The session directory is gone after publish.
    assert!(!tmp
        .path()
        .join("temp/ds")
        .join(upload_id.to_string())
        .exists());
}

/// Scenario: a complete that is older than the published file is a no-op.
#[tokio::test]
async fn lww_skip_on_older_client() {
    let (tmp, state, app) = test_state(DeleteStrategy::Disabled);
    let target = tmp.path().join("inbound/ds/x");
    std::fs::create_dir_all(target.parent().unwrap()).unwrap();
    std::fs::write(&target, b"OLDSERVER1").unwrap();
    set_mtime(&target, "2025-06-01T00:00:00Z");

    let instr = state.sessions.create("ds", "laptop", "x").await.unwrap();
    assert_eq!(
        put_chunk(&app, "x", instr.upload_id, 0, b"NEW").await,
        StatusCode::NO_CONTENT
    );

    let resp = send_json(
        &app,
        "POST",
        &protocol::complete_url("", "x", instr.upload_id),
        Some(DATASET_KEY),
        complete_body(3, &sha_hex(b"NEW"), 1, "2025-01-01T00:00:00Z"),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    assert_eq!(std::fs::read(&target).unwrap(), b"OLDSERVER1");
    assert_eq!(file_mtime(&target), utc("2025-06-01T00:00:00Z"));
    assert!(!tmp
        .path()
        .join("temp/ds")
        .join(instr.upload_id.to_string())
        .exists());
}

/// Scenario: a retransmitted chunk replaces the earlier body and the
/// assembled file still verifies.
#[tokio::test]
async fn resume_after_chunk_retransmit() {
    let (tmp, state, app) = test_state(DeleteStrategy::Disabled);
    let instr = state.sessions.create("ds", "laptop", "f.bin").await.unwrap();

    assert_eq!(put_chunk(&app, "f.bin", instr.upload_id, 0, b"aaaa").await, StatusCode::NO_CONTENT);
    // First attempt at chunk 1 "failed at the transport"; a torn body landed.
    assert_eq!(put_chunk(&app, "f.bin", instr.upload_id, 1, b"bb").await, StatusCode::NO_CONTENT);
    assert_eq!(put_chunk(&app, "f.bin", instr.upload_id, 2, b"cc").await, StatusCode::NO_CONTENT);
    // Retry chunk 1 with the full body.
    assert_eq!(put_chunk(&app, "f.bin", instr.upload_id, 1, b"bbbb").await, StatusCode::NO_CONTENT);

    let content = b"aaaabbbbcc";
    let resp = send_json(
        &app,
        "POST",
        &protocol::complete_url("", "f.bin", instr.upload_id),
        Some(DATASET_KEY),
        complete_body(10, &sha_hex(content), 3, "2025-01-01T00:00:00Z"),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        std::fs::read(tmp.path().join("inbound/ds/f.bin")).unwrap(),
        content
    );
}

/// Scenario: chunk-count mismatch is a 409 that leaves the target untouched
/// and the session retained for a retry.
#[tokio::test]
async fn chunk_count_mismatch_is_conflict() {
    let (tmp, state, app) = test_state(DeleteStrategy::Disabled);
    let instr = state.sessions.create("ds", "laptop", "f.bin").await.unwrap();

    assert_eq!(put_chunk(&app, "f.bin", instr.upload_id, 0, b"ab").await, StatusCode::NO_CONTENT);
    assert_eq!(put_chunk(&app, "f.bin", instr.upload_id, 1, b"cd").await, StatusCode::NO_CONTENT);

    let resp = send_json(
        &app,
        "POST",
        &protocol::complete_url("", "f.bin", instr.upload_id),
        Some(DATASET_KEY),
        complete_body(6, &sha_hex(b"abcdef"), 3, "2025-01-01T00:00:00Z"),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    assert!(!tmp.path().join("inbound/ds/f.bin").exists());
    // No assembly temp was left behind.
    let temps: Vec<_> = walkdir::WalkDir::new(tmp.path().join("temp"))
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|x| x == "tmp"))
        .collect();
    assert!(temps.is_empty());

    // Session survives; staging the missing chunk makes the retry succeed.
    assert_eq!(put_chunk(&app, "f.bin", instr.upload_id, 2, b"ef").await, StatusCode::NO_CONTENT);
    let resp = send_json(
        &app,
        "POST",
        &protocol::complete_url("", "f.bin", instr.upload_id),
        Some(DATASET_KEY),
        complete_body(6, &sha_hex(b"abcdef"), 3, "2025-01-01T00:00:00Z"),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
}

/// Scenario: mirror delete under LwwDelete, in both timestamp directions.
#[tokio::test]
async fn mirror_delete_under_lww() {
    let (tmp, _state, app) = test_state(DeleteStrategy::LwwDelete);
    let target = tmp.path().join("inbound/ds/old.txt");
    std::fs::create_dir_all(target.parent().unwrap()).unwrap();
    std::fs::write(&target, b"stale").unwrap();
    set_mtime(&target, "2025-01-01T00:00:00Z");

    let diff = diff(&app, serde_json::json!([])).await;
    assert_eq!(diff.delete, ["old.txt"]);

    // An older deletion timestamp retains the file.
    let resp = send_json(
        &app,
        "POST",
        "/api/sync/delete",
        Some(DATASET_KEY),
        serde_json::json!({
            "datasetId": "ds", "clientId": "laptop",
            "paths": ["old.txt"], "deletedAtUtc": "2024-12-01T00:00:00Z",
        }),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert!(target.exists());

    // A newer one removes it.
    let resp = send_json(
        &app,
        "POST",
        "/api/sync/delete",
        Some(DATASET_KEY),
        serde_json::json!({
            "datasetId": "ds", "clientId": "laptop",
            "paths": ["old.txt"], "deletedAtUtc": "2025-02-01T00:00:00Z",
        }),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert!(!target.exists());
}

#[tokio::test]
async fn delete_requires_timestamp_under_lww() {
    let (_tmp, _state, app) = test_state(DeleteStrategy::LwwDelete);
    let resp = send_json(
        &app,
        "POST",
        "/api/sync/delete",
        Some(DATASET_KEY),
        serde_json::json!({ "datasetId": "ds", "clientId": "laptop", "paths": ["x"] }),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn delete_disabled_is_a_successful_no_op() {
    let (tmp, _state, app) = test_state(DeleteStrategy::Disabled);
    let target = tmp.path().join("inbound/ds/keep.txt");
    std::fs::create_dir_all(target.parent().unwrap()).unwrap();
    std::fs::write(&target, b"keep").unwrap();
    set_mtime(&target, "2025-01-01T00:00:00Z");

    // Diff never lists deletes under the disabled policy.
    let diff = diff(&app, serde_json::json!([])).await;
    assert!(diff.delete.is_empty());

    let resp = send_json(
        &app,
        "POST",
        "/api/sync/delete",
        Some(DATASET_KEY),
        serde_json::json!({
            "datasetId": "ds", "clientId": "laptop",
            "paths": ["keep.txt"], "deletedAtUtc": "2026-01-01T00:00:00Z",
        }),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert!(target.exists());
}

/// Scenario: traversal in a manifest path is rejected before any disk access.
#[tokio::test]
async fn path_traversal_is_rejected() {
    let (_tmp, _state, app) = test_state(DeleteStrategy::Disabled);
    let resp = send_json(
        &app,
        "POST",
        "/api/sync/manifest",
        Some(DATASET_KEY),
        manifest_body(serde_json::json!([
            { "path": "../../etc/passwd", "size": 1, "lastWriteUtc": "2025-01-01T00:00:00Z" }
        ])),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn auth_rejections_and_client_key_fallback() {
    let (_tmp, _state, app) = test_state(DeleteStrategy::Disabled);

    // Missing key.
    let resp = send_json(&app, "POST", "/api/sync/manifest", None, manifest_body(serde_json::json!([]))).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    // Wrong key.
    let resp = send_json(
        &app,
        "POST",
        "/api/sync/manifest",
        Some("wrong"),
        manifest_body(serde_json::json!([])),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    // The client key does not override an existing dataset mapping.
    let resp = send_json(
        &app,
        "POST",
        "/api/sync/manifest",
        Some(CLIENT_KEY),
        manifest_body(serde_json::json!([])),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    // An unmapped dataset falls back to the client mapping.
    let resp = send_json(
        &app,
        "POST",
        "/api/sync/manifest",
        Some(CLIENT_KEY),
        serde_json::json!({ "datasetId": "other", "clientId": "laptop", "files": [] }),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn chunk_put_without_session_is_rejected() {
    let (_tmp, _state, app) = test_state(DeleteStrategy::Disabled);
    let status = put_chunk(&app, "f.bin", Uuid::new_v4(), 0, b"data").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn malformed_upload_id_is_rejected() {
    let (_tmp, _state, app) = test_state(DeleteStrategy::Disabled);
    let uri = format!(
        "/api/sync/files/{}/uploads/not-a-uuid/chunks/0?datasetId=ds&clientId=laptop",
        mirsync::path_guard::encode_path("f.bin")
    );
    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(uri)
                .header(protocol::API_KEY_HEADER, DATASET_KEY)
                .body(Body::from("data"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn health_needs_no_key() {
    let (_tmp, _state, app) = test_state(DeleteStrategy::Disabled);
    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/api/sync/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["status"], "ok");
}

/// Second diff after a publish sees the uploaded file as current.
#[tokio::test]
async fn diff_converges_after_upload() {
    let (_tmp, _state, app) = test_state(DeleteStrategy::Disabled);
    let content = b"stable content";
    let entry = serde_json::json!([{
        "path": "doc.txt", "size": content.len(), "lastWriteUtc": "2025-03-01T00:00:00Z"
    }]);

    let first = diff(&app, entry.clone()).await;
    let upload_id = first.upload[0].upload_id;
    assert_eq!(put_chunk(&app, "doc.txt", upload_id, 0, content).await, StatusCode::NO_CONTENT);
    let resp = send_json(
        &app,
        "POST",
        &protocol::complete_url("", "doc.txt", upload_id),
        Some(DATASET_KEY),
        complete_body(content.len() as u64, &sha_hex(content), 1, "2025-03-01T00:00:00Z"),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let second = diff(&app, entry).await;
    assert!(second.upload.is_empty());
}
