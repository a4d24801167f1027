//! Client side: the HTTP API wrapper and the round orchestrator.
//!
//! A round is build → diff → upload (bounded parallel) → delete → persist
//! state. Any failure aborts the round before the state file is written, so
//! the next round recomputes from scratch. Cancellation is checked at every
//! chunk boundary.

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::manifest;
use crate::protocol::{
    self, CompleteRequest, DeleteRequest, DiffResponse, FileEntry, ManifestRequest,
    UploadInstruction, API_KEY_HEADER,
};
use crate::state::{StateStore, SyncState};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

/// Thin wrapper over the wire endpoints.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ApiClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
        })
    }

    async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ClientError::ServerRejection {
            status: status.as_u16(),
            body,
        })
    }

    pub async fn post_manifest(&self, req: &ManifestRequest) -> Result<DiffResponse, ClientError> {
        let resp = self
            .http
            .post(protocol::manifest_url(&self.base_url))
            .header(API_KEY_HEADER, &self.api_key)
            .json(req)
            .send()
            .await?;
        Ok(Self::ensure_success(resp).await?.json().await?)
    }

    pub async fn put_chunk(
        &self,
        dataset_id: &str,
        client_id: &str,
        path: &str,
        upload_id: Uuid,
        index: u32,
        bytes: Vec<u8>,
    ) -> Result<(), ClientError> {
        let resp = self
            .http
            .put(protocol::chunk_url(&self.base_url, path, upload_id, index))
            .query(&[("datasetId", dataset_id), ("clientId", client_id)])
            .header(API_KEY_HEADER, &self.api_key)
            .body(bytes)
            .send()
            .await?;
        Self::ensure_success(resp).await?;
        Ok(())
    }

    pub async fn post_complete(
        &self,
        path: &str,
        upload_id: Uuid,
        req: &CompleteRequest,
    ) -> Result<(), ClientError> {
        let resp = self
            .http
            .post(protocol::complete_url(&self.base_url, path, upload_id))
            .header(API_KEY_HEADER, &self.api_key)
            .json(req)
            .send()
            .await?;
        Self::ensure_success(resp).await?;
        Ok(())
    }

    pub async fn post_delete(&self, req: &DeleteRequest) -> Result<(), ClientError> {
        let resp = self
            .http
            .post(protocol::delete_url(&self.base_url))
            .header(API_KEY_HEADER, &self.api_key)
            .json(req)
            .send()
            .await?;
        Self::ensure_success(resp).await?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct RoundSummary {
    pub scanned: usize,
    pub uploaded_files: u64,
    pub uploaded_bytes: u64,
    pub skipped_files: usize,
    pub deleted_paths: usize,
}

pub struct SyncRunner {
    config: ClientConfig,
    api: Arc<ApiClient>,
    state_store: StateStore,
    cancel: Arc<AtomicBool>,
}

impl SyncRunner {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let api = Arc::new(ApiClient::new(&config.server_base_url, &config.api_key)?);
        let state_store = StateStore::new(&config.state_file);
        Ok(Self {
            config,
            api,
            state_store,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag checked at every chunk boundary; set it to abort the round.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    fn check_cancelled(&self) -> Result<(), ClientError> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(ClientError::Cancelled);
        }
        Ok(())
    }

    /// Run one full sync round. State is persisted only on success.
    pub async fn run_round(&self) -> Result<RoundSummary, ClientError> {
        let prior = self.state_store.load()?;

        let root = self.config.root_path.clone();
        let prior_for_scan = prior.clone();
        let files = tokio::task::spawn_blocking(move || manifest::build(&root, &prior_for_scan))
            .await
            .map_err(|e| ClientError::LocalIo(std::io::Error::other(e)))??;
        self.check_cancelled()?;

        tracing::info!(
            dataset = %self.config.dataset_id,
            files = files.len(),
            "manifest built"
        );

        let diff = self
            .api
            .post_manifest(&ManifestRequest {
                dataset_id: self.config.dataset_id.clone(),
                client_id: self.config.client_id.clone(),
                files: files.clone(),
            })
            .await?;
        self.check_cancelled()?;

        let by_path: HashMap<&str, &FileEntry> =
            files.iter().map(|f| (f.path.as_str(), f)).collect();
        let mut plan = Vec::with_capacity(diff.upload.len());
        for instruction in &diff.upload {
            let entry = by_path.get(instruction.path.as_str()).ok_or_else(|| {
                ClientError::Integrity(format!(
                    "server requested upload of unknown path {}",
                    instruction.path
                ))
            })?;
            plan.push(((*entry).clone(), instruction.clone()));
        }

        tracing::info!(
            upload = plan.len(),
            delete = diff.delete.len(),
            "diff received"
        );

        let progress = self.config.progress.then(|| {
            let total: u64 = plan.iter().map(|(entry, _)| entry.size).sum();
            let bar = ProgressBar::new(total);
            bar.set_style(
                ProgressStyle::with_template(
                    "{bar:30} {bytes}/{total_bytes} ({bytes_per_sec}) {msg}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            bar
        });

        let uploaded = self.upload_phase(plan, progress.clone()).await?;
        if let Some(bar) = &progress {
            bar.finish_and_clear();
        }

        let deleted_paths = if self.config.enable_delete && !diff.delete.is_empty() {
            self.check_cancelled()?;
            self.api
                .post_delete(&DeleteRequest {
                    dataset_id: self.config.dataset_id.clone(),
                    client_id: self.config.client_id.clone(),
                    paths: diff.delete.clone(),
                    deleted_at_utc: Some(Utc::now()),
                })
                .await?;
            diff.delete.len()
        } else {
            0
        };

        // Full-round success: persist the new state, folding in the hashes
        // computed on the upload streams.
        let mut state = SyncState {
            last_sync_utc: Some(Utc::now()),
            ..Default::default()
        };
        for mut entry in files {
            if let Some(sha) = uploaded.hashes.get(&entry.path) {
                entry.sha256 = Some(sha.clone());
            }
            state.files.insert(entry.path.clone(), entry);
        }
        let scanned = state.files.len();
        self.state_store.save(&state)?;

        Ok(RoundSummary {
            scanned,
            uploaded_files: uploaded.files,
            uploaded_bytes: uploaded.bytes,
            skipped_files: scanned - uploaded.files as usize,
            deleted_paths,
        })
    }

    async fn upload_phase(
        &self,
        plan: Vec<(FileEntry, UploadInstruction)>,
        progress: Option<ProgressBar>,
    ) -> Result<UploadOutcome, ClientError> {
        let gate = Arc::new(Semaphore::new(self.config.max_parallel_uploads));
        let mut tasks: JoinSet<Result<(String, String, u64), ClientError>> = JoinSet::new();

        for (entry, instruction) in plan {
            let api = self.api.clone();
            let gate = gate.clone();
            let cancel = self.cancel.clone();
            let progress = progress.clone();
            let dataset_id = self.config.dataset_id.clone();
            let client_id = self.config.client_id.clone();
            let source = self.config.root_path.join(&entry.path);
            let chunk_size = self.config.chunk_size;

            tasks.spawn(async move {
                let _permit = gate
                    .acquire_owned()
                    .await
                    .map_err(|_| ClientError::Cancelled)?;
                upload_file(
                    &api,
                    &dataset_id,
                    &client_id,
                    &source,
                    &entry,
                    instruction.upload_id,
                    chunk_size,
                    &cancel,
                    progress.as_ref(),
                )
                .await
            });
        }

        let mut outcome = UploadOutcome::default();
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| {
                ClientError::LocalIo(std::io::Error::other(format!("upload task failed: {e}")))
            })?;
            match result {
                Ok((path, sha, bytes)) => {
                    outcome.files += 1;
                    outcome.bytes += bytes;
                    outcome.hashes.insert(path, sha);
                }
                Err(e) => {
                    // One failed file aborts the whole round.
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }
        Ok(outcome)
    }
}

#[derive(Default)]
struct UploadOutcome {
    files: u64,
    bytes: u64,
    hashes: HashMap<String, String>,
}

/// Upload one file: sequential chunk PUTs feeding an incremental SHA-256,
/// then the complete request carrying the finalized hash.
#[allow(clippy::too_many_arguments)]
async fn upload_file(
    api: &ApiClient,
    dataset_id: &str,
    client_id: &str,
    source: &std::path::Path,
    entry: &FileEntry,
    upload_id: Uuid,
    chunk_size: u64,
    cancel: &AtomicBool,
    progress: Option<&ProgressBar>,
) -> Result<(String, String, u64), ClientError> {
    let mut reader = tokio::fs::File::open(source).await?;
    let total_chunks = entry.size.div_ceil(chunk_size);

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; chunk_size as usize];
    let mut index = 0u32;
    let mut sent = 0u64;

    loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(ClientError::Cancelled);
        }
        let filled = fill_buffer(&mut reader, &mut buf).await?;
        if filled == 0 {
            break;
        }
        hasher.update(&buf[..filled]);
        api.put_chunk(
            dataset_id,
            client_id,
            &entry.path,
            upload_id,
            index,
            buf[..filled].to_vec(),
        )
        .await?;
        sent += filled as u64;
        index += 1;
        if let Some(bar) = progress {
            bar.inc(filled as u64);
            bar.set_message(entry.path.clone());
        }
        tracing::debug!(
            path = %entry.path,
            chunk = index,
            total = total_chunks,
            "chunk sent"
        );
        if filled < buf.len() {
            break;
        }
    }

    let sha256 = hex::encode(hasher.finalize());
    api.post_complete(
        &entry.path,
        upload_id,
        &CompleteRequest {
            dataset_id: dataset_id.to_string(),
            client_id: client_id.to_string(),
            expected_size: sent,
            sha256: Some(sha256.clone()),
            chunk_count: index,
            last_write_utc: entry.last_write_utc,
        },
    )
    .await?;

    tracing::info!(path = %entry.path, bytes = sent, chunks = index, "file uploaded");
    Ok((entry.path.clone(), sha256, sent))
}

/// Read until the buffer is full or EOF; short reads do not end a chunk.
async fn fill_buffer(
    reader: &mut tokio::fs::File,
    buf: &mut [u8],
) -> Result<usize, ClientError> {
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
