//! Server configuration.
//!
//! Every struct deserializes from JSON with per-field defaults, so a config
//! file only needs the values it changes:
//!
//! ```json
//! { "bind_addr": "0.0.0.0:9090",
//!   "coordination": { "url": "redis://cache:6379" },
//!   "runtime": { "max_document_bytes": 2097152 } }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StoreConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Top-level configuration of a `duet-server` process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind the WebSocket listener to
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    /// Shared coordination store (None = in-process, single node)
    #[serde(default)]
    pub coordination: Option<CoordinationConfig>,
    /// Durable snapshot store (None = in-memory only)
    #[serde(default)]
    pub storage: Option<StoreConfig>,
}

fn default_bind_addr() -> String {
    "127.0.0.1:9090".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            runtime: RuntimeConfig::default(),
            maintenance: MaintenanceConfig::default(),
            coordination: None,
            storage: None,
        }
    }
}

impl ServerConfig {
    /// Load a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Ephemeral port, in-memory stores, small limits.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            runtime: RuntimeConfig::for_testing(),
            maintenance: MaintenanceConfig::default(),
            coordination: None,
            storage: None,
        }
    }
}

/// Per-document runtime limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Durable snapshot + log + incoming update must stay within this (default: 10MB)
    #[serde(default = "default_max_document_bytes")]
    pub max_document_bytes: u64,
    /// Messages buffered per connection before a slow peer lags (default: 256)
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

fn default_max_document_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_broadcast_capacity() -> usize {
    256
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_document_bytes: default_max_document_bytes(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

impl RuntimeConfig {
    pub fn for_testing() -> Self {
        Self {
            max_document_bytes: 64 * 1024,
            broadcast_capacity: 64,
        }
    }
}

/// Scheduled cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Seconds between maintenance passes (default: 60)
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Close documents with no connections after this many idle seconds (default: 300)
    #[serde(default = "default_idle_close_secs")]
    pub idle_close_secs: u64,
    /// Compact logs holding at least this many bytes (default: 256KB)
    #[serde(default = "default_compaction_threshold_bytes")]
    pub compaction_threshold_bytes: u64,
    /// Forget removed awareness entries after this many seconds (default: 30)
    #[serde(default = "default_awareness_grace_secs")]
    pub awareness_grace_secs: u64,
}

fn default_interval_secs() -> u64 {
    60
}

fn default_idle_close_secs() -> u64 {
    300
}

fn default_compaction_threshold_bytes() -> u64 {
    256 * 1024
}

fn default_awareness_grace_secs() -> u64 {
    30
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            idle_close_secs: default_idle_close_secs(),
            compaction_threshold_bytes: default_compaction_threshold_bytes(),
            awareness_grace_secs: default_awareness_grace_secs(),
        }
    }
}

impl MaintenanceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_close_secs)
    }

    pub fn awareness_grace(&self) -> Duration {
        Duration::from_secs(self.awareness_grace_secs)
    }
}

/// Redis coordination store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Redis URL (e.g. "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Command connection pool size (default: 16)
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Prefix for every key and channel (default: "duet")
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Buffered notifications before slow dispatchers lag (default: 1024)
    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pool_size() -> usize {
    16
}

fn default_key_prefix() -> String {
    "duet".to_string()
}

fn default_notification_capacity() -> usize {
    1024
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            key_prefix: default_key_prefix(),
            notification_capacity: default_notification_capacity(),
        }
    }
}
