//! Chunk staging, assembly, verification, and atomic publish.
//!
//! Two operations form the upload state machine: `save_chunk` stages one
//! byte range into the session directory, and `complete_upload` assembles
//! the staged chunks into a temp file, verifies size and hash, and renames
//! it over the target. Completes run under a process-wide semaphore plus a
//! per-target-path mutex, so publishes for one path are linearized while
//! distinct paths proceed independently.

use crate::diff::VersionPolicy;
use crate::error::SyncError;
use crate::path_guard;
use crate::protocol::CompleteRequest;
use crate::session::{Session, SessionStore};
use chrono::{DateTime, Utc};
use filetime::FileTime;
use futures_util::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

pub struct MergeEngine {
    inbound_root: PathBuf,
    temp_root: PathBuf,
    sessions: Arc<SessionStore>,
    /// Bounds concurrent complete operations process-wide.
    complete_gate: Semaphore,
    /// Per-target-path publish locks, keyed `dataset + "/" + folded relpath`.
    /// Entries are created lazily and retained for the process lifetime; the
    /// keyspace is bounded by the dataset's working set.
    path_locks: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MergeEngine {
    pub fn new(
        inbound_root: impl Into<PathBuf>,
        temp_root: impl Into<PathBuf>,
        sessions: Arc<SessionStore>,
        max_parallel_uploads: usize,
    ) -> Self {
        Self {
            inbound_root: inbound_root.into(),
            temp_root: temp_root.into(),
            sessions,
            complete_gate: Semaphore::new(max_parallel_uploads.max(1)),
            path_locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Stage one chunk. The body is streamed straight to the chunk file
    /// with create-or-truncate semantics, so a resend of the same index
    /// overwrites the earlier body cleanly. A write that dies mid-stream
    /// leaves only this chunk file indeterminate.
    pub async fn save_chunk<S, B, E>(
        &self,
        dataset_id: &str,
        client_id: &str,
        relative_path: &str,
        upload_id: Uuid,
        index: u32,
        mut body: S,
    ) -> Result<u64, SyncError>
    where
        S: Stream<Item = Result<B, E>> + Unpin,
        B: AsRef<[u8]>,
        E: std::fmt::Display,
    {
        let session = self.resolve(dataset_id, client_id, relative_path, upload_id).await?;

        let chunk_path = SessionStore::chunk_path(&session, index);
        if let Some(parent) = chunk_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&chunk_path).await?;
        let mut written = 0u64;
        while let Some(piece) = body.next().await {
            let piece = piece
                .map_err(|e| SyncError::Io(std::io::Error::other(format!("body stream: {e}"))))?;
            file.write_all(piece.as_ref()).await?;
            written += piece.as_ref().len() as u64;
        }
        file.flush().await?;

        tracing::debug!(
            dataset = dataset_id,
            client = client_id,
            path = relative_path,
            upload_id = %upload_id,
            index,
            bytes = written,
            "chunk staged"
        );
        Ok(written)
    }

    /// Assemble, verify, and publish one upload.
    ///
    /// Under the global gate and the per-path lock: an older writer is a
    /// successful no-op (LWW), a chunk-count/size/hash problem fails without
    /// touching the target, and a verified assembly replaces the target by a
    /// same-filesystem rename. After the rename the operation is committed:
    /// mtime or cleanup failures are logged, never surfaced.
    pub async fn complete_upload(
        &self,
        relative_path: &str,
        upload_id: Uuid,
        req: &CompleteRequest,
    ) -> Result<(), SyncError> {
        let _permit = self
            .complete_gate
            .acquire()
            .await
            .map_err(|_| SyncError::Conflict("upload gate closed".into()))?;

        let session = self
            .resolve(&req.dataset_id, &req.client_id, relative_path, upload_id)
            .await?;

        let dataset_root = self.inbound_root.join(&req.dataset_id);
        tokio::fs::create_dir_all(&dataset_root).await?;
        let target = path_guard::safe_join(&dataset_root, &session.meta.relative_path)?;

        let lock = self.path_lock(&format!(
            "{}/{}",
            req.dataset_id,
            path_guard::fold_case(&session.meta.relative_path)
        ));
        let _guard = lock.lock().await;

        let server_mtime: Option<DateTime<Utc>> = match tokio::fs::metadata(&target).await {
            Ok(meta) => Some(meta.modified()?.into()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(SyncError::Io(e)),
        };

        if !VersionPolicy::should_overwrite(server_mtime, req.last_write_utc) {
            tracing::info!(
                dataset = %req.dataset_id,
                client = %req.client_id,
                path = %session.meta.relative_path,
                upload_id = %upload_id,
                "complete is older than the published file; keeping server copy"
            );
            self.cleanup_session(&session).await;
            return Ok(());
        }

        let chunks = SessionStore::staged_chunks(&session)?;
        if req.chunk_count > 0 && chunks.len() as u32 != req.chunk_count {
            return Err(SyncError::ChunkCountMismatch {
                expected: req.chunk_count,
                staged: chunks.len() as u32,
            });
        }

        let temp = self
            .temp_root
            .join(&req.dataset_id)
            .join(format!("{}.tmp", Uuid::new_v4()));
        if let Some(parent) = temp.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let assembled = match assemble(&chunks, &temp).await {
            Ok(n) => n,
            Err(e) => {
                discard(&temp).await;
                return Err(e);
            }
        };

        if assembled != req.expected_size {
            discard(&temp).await;
            return Err(SyncError::SizeMismatch {
                expected: req.expected_size,
                actual: assembled,
            });
        }

        if let Some(expected_hash) = req.sha256.as_deref().filter(|h| !h.is_empty()) {
            let actual = match sha256_file_hex(&temp).await {
                Ok(h) => h,
                Err(e) => {
                    discard(&temp).await;
                    return Err(e);
                }
            };
            if !expected_hash.eq_ignore_ascii_case(&actual) {
                discard(&temp).await;
                return Err(SyncError::HashMismatch {
                    expected: expected_hash.to_string(),
                    actual,
                });
            }
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            discard(&temp).await;
            return Err(SyncError::Conflict(format!(
                "publishing {} failed: {e}",
                session.meta.relative_path
            )));
        }

        // Committed from here on; the remaining steps are best-effort.
        let mtime = FileTime::from_system_time(req.last_write_utc.into());
        if let Err(e) = filetime::set_file_mtime(&target, mtime) {
            tracing::warn!(
                path = %target.display(),
                error = %e,
                "published file kept, but setting its mtime failed"
            );
        }
        self.cleanup_session(&session).await;

        tracing::info!(
            dataset = %req.dataset_id,
            client = %req.client_id,
            path = %session.meta.relative_path,
            upload_id = %upload_id,
            bytes = assembled,
            "upload published"
        );
        Ok(())
    }

    /// Resolve the session and check the caller-supplied identity against it.
    async fn resolve(
        &self,
        dataset_id: &str,
        client_id: &str,
        relative_path: &str,
        upload_id: Uuid,
    ) -> Result<Session, SyncError> {
        let session = self.sessions.get(dataset_id, upload_id).await?;
        if session.meta.client_id != client_id {
            return Err(SyncError::SessionMismatch(format!(
                "session {upload_id} belongs to another client"
            )));
        }
        let supplied = path_guard::validate(relative_path)?;
        if path_guard::fold_case(&supplied) != path_guard::fold_case(&session.meta.relative_path) {
            return Err(SyncError::SessionMismatch(format!(
                "session {upload_id} is for {}, not {supplied}",
                session.meta.relative_path
            )));
        }
        Ok(session)
    }

    fn path_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.path_locks.lock();
        locks.entry(key.to_string()).or_default().clone()
    }

    async fn cleanup_session(&self, session: &Session) {
        if let Err(e) = self
            .sessions
            .cleanup(&session.meta.dataset_id, session.upload_id)
            .await
        {
            tracing::warn!(
                upload_id = %session.upload_id,
                error = %e,
                "session cleanup failed"
            );
        }
    }
}

/// Stream-copy the ordered chunks into `temp`, returning the byte total.
async fn assemble(chunks: &[(u64, PathBuf)], temp: &Path) -> Result<u64, SyncError> {
    let mut out = tokio::fs::File::create(temp).await?;
    let mut total = 0u64;
    for (_, chunk) in chunks {
        let mut input = tokio::fs::File::open(chunk).await?;
        total += tokio::io::copy(&mut input, &mut out).await?;
    }
    out.sync_all().await?;
    Ok(total)
}

async fn discard(temp: &Path) {
    if let Err(e) = tokio::fs::remove_file(temp).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %temp.display(), error = %e, "assembly temp removal failed");
        }
    }
}

async fn sha256_file_hex(path: &Path) -> Result<String, SyncError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use tempfile::TempDir;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn body(pieces: &[&[u8]]) -> impl Stream<Item = Result<Vec<u8>, Infallible>> + Unpin {
        futures_util::stream::iter(pieces.iter().map(|p| Ok(p.to_vec())).collect::<Vec<_>>())
    }

    struct Fixture {
        _tmp: TempDir,
        inbound: PathBuf,
        engine: MergeEngine,
        sessions: Arc<SessionStore>,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let inbound = tmp.path().join("inbound");
        let temp = tmp.path().join("temp");
        std::fs::create_dir_all(&inbound).unwrap();
        std::fs::create_dir_all(&temp).unwrap();
        let sessions = Arc::new(SessionStore::new(&temp));
        Fixture {
            engine: MergeEngine::new(&inbound, &temp, sessions.clone(), 4),
            sessions,
            inbound,
            _tmp: tmp,
        }
    }

    fn complete_req(size: u64, sha256: Option<String>, chunks: u32, mtime: &str) -> CompleteRequest {
        CompleteRequest {
            dataset_id: "ds".into(),
            client_id: "cli".into(),
            expected_size: size,
            sha256,
            chunk_count: chunks,
            last_write_utc: utc(mtime),
        }
    }

    #[tokio::test]
    async fn publish_assembles_in_index_order_and_sets_mtime() {
        let fx = fixture();
        let instr = fx.sessions.create("ds", "cli", "a/b.txt").await.unwrap();

        // Stage out of order; assembly must follow the parsed index.
        for (index, piece) in [(2u32, b"hi\n" as &[u8]), (0, b"hell"), (1, b"o\n")] {
            fx.engine
                .save_chunk("ds", "cli", "a/b.txt", instr.upload_id, index, body(&[piece]))
                .await
                .unwrap();
        }

        let content = b"hello\nhi\n";
        let req = complete_req(
            content.len() as u64,
            Some(hex::encode(Sha256::digest(content))),
            3,
            "2025-01-01T00:00:00Z",
        );
        fx.engine
            .complete_upload("a/b.txt", instr.upload_id, &req)
            .await
            .unwrap();

        let target = fx.inbound.join("ds/a/b.txt");
        assert_eq!(std::fs::read(&target).unwrap(), content);
        let mtime: DateTime<Utc> = std::fs::metadata(&target).unwrap().modified().unwrap().into();
        assert_eq!(mtime, utc("2025-01-01T00:00:00Z"));

        // Session is gone after publish.
        assert!(matches!(
            fx.sessions.get("ds", instr.upload_id).await,
            Err(SyncError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn resend_overwrites_the_prior_chunk_body() {
        let fx = fixture();
        let instr = fx.sessions.create("ds", "cli", "f.bin").await.unwrap();

        fx.engine
            .save_chunk("ds", "cli", "f.bin", instr.upload_id, 0, body(&[b"XXXX"]))
            .await
            .unwrap();
        fx.engine
            .save_chunk("ds", "cli", "f.bin", instr.upload_id, 0, body(&[b"good"]))
            .await
            .unwrap();

        let req = complete_req(
            4,
            Some(hex::encode(Sha256::digest(b"good"))),
            1,
            "2025-01-01T00:00:00Z",
        );
        fx.engine
            .complete_upload("f.bin", instr.upload_id, &req)
            .await
            .unwrap();
        assert_eq!(std::fs::read(fx.inbound.join("ds/f.bin")).unwrap(), b"good");
    }

    #[tokio::test]
    async fn older_complete_is_a_no_op_that_cleans_the_session() {
        let fx = fixture();
        let target = fx.inbound.join("ds/x");
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&target, b"OLDSERVER1").unwrap();
        filetime::set_file_mtime(
            &target,
            FileTime::from_system_time(utc("2025-06-01T00:00:00Z").into()),
        )
        .unwrap();

        let instr = fx.sessions.create("ds", "cli", "x").await.unwrap();
        fx.engine
            .save_chunk("ds", "cli", "x", instr.upload_id, 0, body(&[b"NEW"]))
            .await
            .unwrap();

        let req = complete_req(3, None, 1, "2025-01-01T00:00:00Z");
        fx.engine
            .complete_upload("x", instr.upload_id, &req)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"OLDSERVER1");
        let mtime: DateTime<Utc> = std::fs::metadata(&target).unwrap().modified().unwrap().into();
        assert_eq!(mtime, utc("2025-06-01T00:00:00Z"));
        assert!(matches!(
            fx.sessions.get("ds", instr.upload_id).await,
            Err(SyncError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn chunk_count_mismatch_keeps_session_and_target() {
        let fx = fixture();
        let instr = fx.sessions.create("ds", "cli", "f.bin").await.unwrap();
        fx.engine
            .save_chunk("ds", "cli", "f.bin", instr.upload_id, 0, body(&[b"ab"]))
            .await
            .unwrap();
        fx.engine
            .save_chunk("ds", "cli", "f.bin", instr.upload_id, 1, body(&[b"cd"]))
            .await
            .unwrap();

        let req = complete_req(4, None, 3, "2025-01-01T00:00:00Z");
        let err = fx
            .engine
            .complete_upload("f.bin", instr.upload_id, &req)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ChunkCountMismatch { expected: 3, staged: 2 }));

        assert!(!fx.inbound.join("ds/f.bin").exists());
        // The caller may stage the missing chunk and retry.
        fx.sessions.get("ds", instr.upload_id).await.unwrap();
    }

    #[tokio::test]
    async fn size_and_hash_mismatches_delete_the_temp() {
        let fx = fixture();
        let instr = fx.sessions.create("ds", "cli", "f.bin").await.unwrap();
        fx.engine
            .save_chunk("ds", "cli", "f.bin", instr.upload_id, 0, body(&[b"abcd"]))
            .await
            .unwrap();

        let req = complete_req(9, None, 1, "2025-01-01T00:00:00Z");
        assert!(matches!(
            fx.engine.complete_upload("f.bin", instr.upload_id, &req).await,
            Err(SyncError::SizeMismatch { expected: 9, actual: 4 })
        ));

        let req = complete_req(4, Some("ab".repeat(32)), 1, "2025-01-01T00:00:00Z");
        assert!(matches!(
            fx.engine.complete_upload("f.bin", instr.upload_id, &req).await,
            Err(SyncError::HashMismatch { .. })
        ));

        assert!(!fx.inbound.join("ds/f.bin").exists());
        // No assembly temp survives a failed verification.
        let leftovers: Vec<_> = walkdir::WalkDir::new(fx.sessions.temp_root())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn wrong_client_or_path_is_a_mismatch() {
        let fx = fixture();
        let instr = fx.sessions.create("ds", "cli", "f.bin").await.unwrap();

        let err = fx
            .engine
            .save_chunk("ds", "other", "f.bin", instr.upload_id, 0, body(&[b"x"]))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::SessionMismatch(_)));

        let err = fx
            .engine
            .save_chunk("ds", "cli", "other.bin", instr.upload_id, 0, body(&[b"x"]))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::SessionMismatch(_)));

        // Case-insensitive path match is accepted.
        fx.engine
            .save_chunk("ds", "cli", "F.BIN", instr.upload_id, 0, body(&[b"x"]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn empty_file_publishes_with_zero_chunks() {
        let fx = fixture();
        let instr = fx.sessions.create("ds", "cli", "empty.txt").await.unwrap();
        let req = complete_req(
            0,
            Some(hex::encode(Sha256::digest(b""))),
            0,
            "2025-01-01T00:00:00Z",
        );
        fx.engine
            .complete_upload("empty.txt", instr.upload_id, &req)
            .await
            .unwrap();
        assert_eq!(
            std::fs::metadata(fx.inbound.join("ds/empty.txt")).unwrap().len(),
            0
        );
    }
}
