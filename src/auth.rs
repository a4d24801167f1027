//! Pre-shared key gate.
//!
//! Keys are mapped per dataset, with a per-client mapping as the fallback
//! when no dataset mapping exists. The comparison is constant-time so a
//! probing client learns nothing from response latency. Rejections log the
//! reason; the response body stays generic.

use crate::error::SyncError;
use std::collections::HashMap;

pub struct AuthGate {
    dataset_keys: HashMap<String, String>,
    client_keys: HashMap<String, String>,
}

impl AuthGate {
    pub fn new(dataset_keys: HashMap<String, String>, client_keys: HashMap<String, String>) -> Self {
        Self {
            dataset_keys,
            client_keys,
        }
    }

    /// Authorize a request. The dataset mapping is authoritative when it
    /// exists; otherwise the client mapping decides. Missing ids or key,
    /// or no mapping at all, are unauthorized.
    pub fn authorize(
        &self,
        dataset_id: &str,
        client_id: &str,
        presented: Option<&str>,
    ) -> Result<(), SyncError> {
        let Some(presented) = presented.filter(|k| !k.is_empty()) else {
            tracing::warn!(dataset = dataset_id, client = client_id, "missing api key");
            return Err(SyncError::Unauthorized);
        };
        if dataset_id.is_empty() || client_id.is_empty() {
            tracing::warn!("request without dataset or client id");
            return Err(SyncError::Unauthorized);
        }

        let expected = self
            .dataset_keys
            .get(dataset_id)
            .or_else(|| self.client_keys.get(client_id));
        match expected {
            Some(expected) if constant_time_eq(expected.as_bytes(), presented.as_bytes()) => Ok(()),
            Some(_) => {
                tracing::warn!(dataset = dataset_id, client = client_id, "api key mismatch");
                Err(SyncError::Unauthorized)
            }
            None => {
                tracing::warn!(
                    dataset = dataset_id,
                    client = client_id,
                    "no key mapping for dataset or client"
                );
                Err(SyncError::Unauthorized)
            }
        }
    }
}

/// Timing-independent byte equality: XOR-fold the whole buffer, never
/// short-circuit on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
