//! Top-level configuration, loadable from a JSON file.
//!
//! Every field has a default, so a file only needs the values it changes:
//!
//! ```json
//! { "data_dir": "/var/lib/sides", "cache": { "version": "29" } }
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::cache::CacheConfig;
use crate::outbox::{OutboxConfig, CLAIM_TTL};
use crate::storage::StoreConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// RocksDB directory shared by every instance of the origin.
    pub data_dir: PathBuf,
    pub claim_ttl_secs: u64,
    /// Where queued payloads are POSTed.
    pub upload_endpoint: Option<String>,
    pub wake_channel_capacity: usize,
    pub cache: CacheConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: StoreConfig::default().path,
            claim_ttl_secs: CLAIM_TTL.as_secs(),
            upload_endpoint: None,
            wake_channel_capacity: 64,
            cache: CacheConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            path: self.data_dir.clone(),
            ..StoreConfig::default()
        }
    }

    pub fn outbox_config(&self) -> OutboxConfig {
        OutboxConfig {
            claim_ttl: Duration::from_secs(self.claim_ttl_secs),
        }
    }
}
