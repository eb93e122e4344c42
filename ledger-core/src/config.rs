//! Configuration for the ledger

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Accountant-facing RPC listen address
    pub listen_addr: String,

    /// How long a posting group waits for its next posting (milliseconds);
    /// `None` waits forever
    pub group_timeout_ms: Option<u64>,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Reference data registered at startup
    pub seed: SeedConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/ledger"),
            service_name: "ledger-core".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            listen_addr: "127.0.0.1:4050".to_string(),
            group_timeout_ms: Some(10_000),
            rocksdb: RocksDBConfig::default(),
            seed: SeedConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            max_background_jobs: 4,
            enable_statistics: false,
        }
    }
}

/// Users and contracts to register if missing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedConfig {
    /// Usernames
    pub users: Vec<String>,

    /// Contract tickers
    pub contracts: Vec<String>,
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn with_env_overrides(mut self) -> anyhow::Result<Self> {
        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            self.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(addr) = std::env::var("LEDGER_LISTEN_ADDR") {
            self.listen_addr = addr;
        }

        if let Ok(timeout) = std::env::var("LEDGER_GROUP_TIMEOUT_MS") {
            self.group_timeout_ms = match timeout.as_str() {
                "" | "none" => None,
                ms => Some(ms.parse().map_err(|e| {
                    anyhow::anyhow!("Invalid LEDGER_GROUP_TIMEOUT_MS {:?}: {}", ms, e)
                })?),
            };
        }

        Ok(self)
    }

    /// Group timeout as a duration
    pub fn group_timeout(&self) -> Option<Duration> {
        self.group_timeout_ms.map(Duration::from_millis)
    }
}
