use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::configuration::{DEFAULT_GROUP_NAME, EVENT_QUEUE, EVENT_TOPIC};
use crate::error::{CellarError, Result};

/// Bootstrap settings of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CellarConfig {
    /// Advertised host.
    pub host: String,
    /// Advertised port.
    pub port: u16,
    /// Directory of the node-local configuration store; in memory when unset.
    pub storage_dir: Option<PathBuf>,
    /// Per-node bound on command execution.
    pub rpc_timeout_ms: u64,
    /// Bound on one blocking queue poll.
    pub poll_interval_ms: u64,
    /// Groups joined on first start, before any node configuration exists.
    pub groups: Vec<String>,
    /// Broadcast event topic.
    pub topic: String,
    /// Point-to-point event queue.
    pub queue: String,
}

impl Default for CellarConfig {
    fn default() -> Self {
        Self {
            host: String::from("127.0.0.1"),
            port: 5701,
            storage_dir: None,
            rpc_timeout_ms: 60_000,
            poll_interval_ms: 5_000,
            groups: vec![DEFAULT_GROUP_NAME.to_string()],
            topic: EVENT_TOPIC.to_string(),
            queue: EVENT_QUEUE.to_string(),
        }
    }
}

impl CellarConfig {
    /// Loads a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| CellarError::Config(e.to_string())),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => Err(CellarError::Config(format!(
                "unsupported config file extension: {}",
                ext
            ))),
        }
    }

    /// Command execution timeout.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Queue poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
