//! Pipeline configuration with TOML file support.

use std::path::{Path, PathBuf};

use bitcoin::Network;
use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    logging::LogFormat,
    prefilter::{FilterLimits, OUTPOINT_BATCH, TX_BATCH},
};

/// Default number of transaction ids kept by the dedupe cache.
pub const DEFAULT_DEDUPE_CAPACITY: usize = 100_000;

/// Default number of transaction ids per "mark confirmed" store call.
pub const DEFAULT_CONFIRM_BATCH: usize = 100;

/// Settings for the chunk coordinator, its workers and the mempool processor.
///
/// Every field has a default, so an empty TOML document is a valid config.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Number of block workers; also the largest chunk the coordinator accepts.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Network whose address encoding is used when matching outputs.
    #[serde(default = "default_network")]
    pub network: Network,

    /// Transactions per concurrently filtered sub-batch.
    #[serde(default = "default_tx_batch")]
    pub tx_batch_size: usize,

    /// Outpoints per known-outpoint store query.
    #[serde(default = "default_outpoint_batch")]
    pub outpoint_batch_size: usize,

    /// Transaction ids per confirmation store call.
    #[serde(default = "default_confirm_batch")]
    pub confirm_batch_size: usize,

    /// Capacity of the shared dedupe cache.
    #[serde(default = "default_dedupe_capacity")]
    pub dedupe_capacity: usize,

    /// Path of the SQLite database.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,

    /// Log filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_network() -> Network {
    Network::Bitcoin
}

fn default_tx_batch() -> usize {
    TX_BATCH
}

fn default_outpoint_batch() -> usize {
    OUTPOINT_BATCH
}

fn default_confirm_batch() -> usize {
    DEFAULT_CONFIRM_BATCH
}

fn default_dedupe_capacity() -> usize {
    DEFAULT_DEDUPE_CAPACITY
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./cedazo.sqlite")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl PipelineConfig {
    /// Load and validate configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject sizes that would stall the pipeline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("worker_count", self.worker_count),
            ("tx_batch_size", self.tx_batch_size),
            ("outpoint_batch_size", self.outpoint_batch_size),
            ("confirm_batch_size", self.confirm_batch_size),
            ("dedupe_capacity", self.dedupe_capacity),
        ];
        for (field, value) in sizes {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Batch limits handed to the prefilter.
    pub fn filter_limits(&self) -> FilterLimits {
        FilterLimits {
            tx_batch: self.tx_batch_size,
            outpoint_batch: self.outpoint_batch_size,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            network: default_network(),
            tx_batch_size: default_tx_batch(),
            outpoint_batch_size: default_outpoint_batch(),
            confirm_batch_size: default_confirm_batch(),
            dedupe_capacity: default_dedupe_capacity(),
            store_path: default_store_path(),
            log_format: LogFormat::default(),
            log_level: default_log_level(),
        }
    }
}
