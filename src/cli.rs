//! Clap argument surfaces for the client binary and the daemon.

use crate::config::{
    ClientConfig, DeleteStrategy, ServerConfig, DEFAULT_CHUNK_SIZE,
    DEFAULT_CLIENT_PARALLEL_UPLOADS, DEFAULT_SERVER_PARALLEL_UPLOADS, DEFAULT_SESSION_TTL_SECS,
};
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;

/// One `id=key` mapping from the command line.
#[derive(Clone, Debug)]
pub struct KeyMapping {
    pub id: String,
    pub key: String,
}

pub fn parse_key_mapping(raw: &str) -> Result<KeyMapping, String> {
    match raw.split_once('=') {
        Some((id, key)) if !id.is_empty() && !key.is_empty() => Ok(KeyMapping {
            id: id.to_string(),
            key: key.to_string(),
        }),
        _ => Err(format!("expected <id>=<key>, got {raw:?}")),
    }
}

/// Daemon options for `mirsyncd`.
#[derive(Debug, Parser)]
#[command(name = "mirsyncd", version, about = "Mirror-sync server daemon")]
pub struct DaemonOpts {
    /// Bind address (host:port)
    #[arg(long, default_value = "127.0.0.1:9040", env = "MIRSYNC_BIND")]
    pub bind: String,

    /// Root for published dataset files
    #[arg(long, env = "MIRSYNC_INBOUND_ROOT")]
    pub inbound_root: PathBuf,

    /// Root for upload sessions and assembly temps (same filesystem as the inbound root)
    #[arg(long, env = "MIRSYNC_TEMP_ROOT")]
    pub temp_root: PathBuf,

    /// Delete policy applied to /api/sync/delete and manifest diffs
    #[arg(long, value_enum, default_value = "disabled", env = "MIRSYNC_DELETE_STRATEGY")]
    pub delete_strategy: DeleteStrategy,

    /// Bound on concurrent upload completes
    #[arg(long, default_value_t = DEFAULT_SERVER_PARALLEL_UPLOADS, env = "MIRSYNC_MAX_PARALLEL_UPLOADS")]
    pub max_parallel_uploads: usize,

    /// Dataset API key as <datasetId>=<key>; repeatable
    #[arg(long = "dataset-key", value_parser = parse_key_mapping)]
    pub dataset_keys: Vec<KeyMapping>,

    /// Client API key as <clientId>=<key>; repeatable, used when no dataset key matches
    #[arg(long = "client-key", value_parser = parse_key_mapping)]
    pub client_keys: Vec<KeyMapping>,

    /// Upload sessions older than this are garbage-collected; 0 disables
    #[arg(long, default_value_t = DEFAULT_SESSION_TTL_SECS, env = "MIRSYNC_SESSION_TTL_SECS")]
    pub session_ttl_secs: u64,
}

impl DaemonOpts {
    pub fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind: self.bind,
            inbound_root: self.inbound_root,
            temp_root: self.temp_root,
            delete_strategy: self.delete_strategy,
            max_parallel_uploads: self.max_parallel_uploads,
            dataset_keys: collect_keys(self.dataset_keys),
            client_keys: collect_keys(self.client_keys),
            session_ttl_secs: self.session_ttl_secs,
        }
    }
}

fn collect_keys(mappings: Vec<KeyMapping>) -> HashMap<String, String> {
    mappings.into_iter().map(|m| (m.id, m.key)).collect()
}

/// Client options for `mirsync`: one sync round per invocation.
#[derive(Debug, Parser)]
#[command(name = "mirsync", version, about = "Mirror a directory onto a mirsyncd dataset")]
pub struct ClientOpts {
    /// Dataset to mirror into
    #[arg(long, env = "MIRSYNC_DATASET_ID")]
    pub dataset_id: String,

    /// Identity of this client
    #[arg(long, env = "MIRSYNC_CLIENT_ID")]
    pub client_id: String,

    /// Pre-shared API key
    #[arg(long, env = "MIRSYNC_API_KEY")]
    pub api_key: String,

    /// Server base URL, e.g. http://backup-host:9040
    #[arg(long = "server", env = "MIRSYNC_SERVER")]
    pub server_base_url: String,

    /// Local directory to mirror
    #[arg(long = "root", env = "MIRSYNC_ROOT")]
    pub root_path: PathBuf,

    /// Where to persist sync state between rounds
    #[arg(long, env = "MIRSYNC_STATE_FILE")]
    pub state_file: PathBuf,

    /// Upload chunk size in bytes
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE, env = "MIRSYNC_CHUNK_SIZE")]
    pub chunk_size: u64,

    /// Files uploaded concurrently
    #[arg(long, default_value_t = DEFAULT_CLIENT_PARALLEL_UPLOADS, env = "MIRSYNC_MAX_PARALLEL_UPLOADS")]
    pub max_parallel_uploads: usize,

    /// Ask the server to delete files missing from the local tree
    #[arg(long = "delete")]
    pub enable_delete: bool,

    /// Show a progress bar during the upload phase
    #[arg(short, long)]
    pub progress: bool,
}

impl ClientOpts {
    pub fn into_config(self) -> ClientConfig {
        ClientConfig {
            dataset_id: self.dataset_id,
            client_id: self.client_id,
            api_key: self.api_key,
            server_base_url: self.server_base_url,
            root_path: self.root_path,
            state_file: self.state_file,
            chunk_size: self.chunk_size,
            max_parallel_uploads: self.max_parallel_uploads,
            enable_delete: self.enable_delete,
            progress: self.progress,
        }
    }
}
