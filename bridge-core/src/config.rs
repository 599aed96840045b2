//! Configuration for the transfer store

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Writer actor configuration
    pub writer: WriterConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/bridge"),
            rocksdb: RocksDBConfig::default(),
            writer: WriterConfig::default(),
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

    /// Sync every write to disk
    pub sync_writes: bool,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 3,
            max_background_jobs: 2,
            sync_writes: true,
            enable_statistics: false,
        }
    }
}

/// Single-writer actor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Bounded mailbox capacity (backpressure)
    pub mailbox_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1000,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("BRIDGE_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(sync) = std::env::var("BRIDGE_SYNC_WRITES") {
            config.rocksdb.sync_writes = sync
                .parse()
                .map_err(|_| crate::Error::Config(format!("BRIDGE_SYNC_WRITES: {}", sync)))?;
        }

        Ok(config)
    }
}
