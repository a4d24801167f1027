//! Server and client configuration.
//!
//! Loading is done by the binaries (clap, with env fallbacks); this module
//! owns the validated shapes and the startup checks that must fail fast —
//! most importantly the same-filesystem requirement for the temp and
//! inbound roots, which atomic publish depends on.

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;
pub const DEFAULT_SERVER_PARALLEL_UPLOADS: usize = 4;
pub const DEFAULT_CLIENT_PARALLEL_UPLOADS: usize = 2;
pub const DEFAULT_SESSION_TTL_SECS: u64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeleteStrategy {
    /// Never delete anything server-side.
    Disabled,
    /// Delete iff the caller's deletion timestamp beats the file's mtime.
    LwwDelete,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// Published files live under `inbound_root/<dataset>/`.
    pub inbound_root: PathBuf,
    /// Upload sessions and assembly temps live under `temp_root/<dataset>/`.
    pub temp_root: PathBuf,
    pub delete_strategy: DeleteStrategy,
    /// Bound on concurrent complete operations; ≥ 1.
    pub max_parallel_uploads: usize,
    pub dataset_keys: HashMap<String, String>,
    pub client_keys: HashMap<String, String>,
    /// Upload sessions older than this are garbage-collected; 0 disables.
    pub session_ttl_secs: u64,
}

impl ServerConfig {
    /// Create the roots and verify the invariants the engines rely on.
    pub fn prepare(&self) -> Result<()> {
        if self.max_parallel_uploads < 1 {
            bail!("max-parallel-uploads must be at least 1");
        }
        std::fs::create_dir_all(&self.inbound_root)
            .with_context(|| format!("creating inbound root {}", self.inbound_root.display()))?;
        std::fs::create_dir_all(&self.temp_root)
            .with_context(|| format!("creating temp root {}", self.temp_root.display()))?;

        // Publish is a rename from the temp root into the inbound root; a
        // cross-device rename would silently degrade to copy-then-delete,
        // which is not atomic, so refuse to start that way.
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let inbound_dev = std::fs::metadata(&self.inbound_root)?.dev();
            let temp_dev = std::fs::metadata(&self.temp_root)?.dev();
            if inbound_dev != temp_dev {
                bail!(
                    "inbound root {} and temp root {} are on different filesystems; \
                     atomic publish requires one volume",
                    self.inbound_root.display(),
                    self.temp_root.display()
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub dataset_id: String,
    pub client_id: String,
    pub api_key: String,
    pub server_base_url: String,
    pub root_path: PathBuf,
    pub state_file: PathBuf,
    pub chunk_size: u64,
    pub max_parallel_uploads: usize,
    pub enable_delete: bool,
    pub progress: bool,
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), crate::error::ClientError> {
        use crate::error::ClientError;
        if self.dataset_id.is_empty() || self.client_id.is_empty() {
            return Err(ClientError::Config(
                "dataset id and client id are required".into(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(ClientError::Config("chunk size must be positive".into()));
        }
        if self.max_parallel_uploads < 1 {
            return Err(ClientError::Config(
                "max-parallel-uploads must be at least 1".into(),
            ));
        }
        if !self.root_path.is_dir() {
            return Err(ClientError::Config(format!(
                "sync root {} is not a directory",
                self.root_path.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn server_config(tmp: &TempDir) -> ServerConfig {
        ServerConfig {
            bind: "127.0.0.1:0".into(),
            inbound_root: tmp.path().join("inbound"),
            temp_root: tmp.path().join("temp"),
            delete_strategy: DeleteStrategy::Disabled,
            max_parallel_uploads: 4,
            dataset_keys: HashMap::new(),
            client_keys: HashMap::new(),
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
        }
    }

    #[test]
    fn prepare_creates_roots() {
        let tmp = TempDir::new().unwrap();
        let cfg = server_config(&tmp);
        cfg.prepare().unwrap();
        assert!(cfg.inbound_root.is_dir());
        assert!(cfg.temp_root.is_dir());
    }

    #[test]
    fn prepare_rejects_zero_parallelism() {
        let tmp = TempDir::new().unwrap();
        let cfg = ServerConfig {
            max_parallel_uploads: 0,
            ..server_config(&tmp)
        };
        assert!(cfg.prepare().is_err());
    }

    #[test]
    fn client_validation() {
        let tmp = TempDir::new().unwrap();
        let good = ClientConfig {
            dataset_id: "ds".into(),
            client_id: "cli".into(),
            api_key: "k".into(),
            server_base_url: "http://127.0.0.1:9040".into(),
            root_path: tmp.path().to_path_buf(),
            state_file: tmp.path().join("state.json"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_parallel_uploads: 2,
            enable_delete: false,
            progress: false,
        };
        good.validate().unwrap();

        let bad = ClientConfig {
            chunk_size: 0,
            ..good.clone()
        };
        assert!(bad.validate().is_err());

        let bad = ClientConfig {
            root_path: tmp.path().join("missing"),
            ..good
        };
        assert!(bad.validate().is_err());
    }
}
