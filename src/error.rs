//! Error types for the block pipeline.
//!
//! Collaborator traits ([`crate::Store`], [`crate::NodeSource`],
//! [`crate::NotificationSink`]) return `anyhow::Result`; the pipeline wraps
//! those failures in the typed errors below where a caller needs to tell them apart.

use crate::worker::{OpKind, WorkerState};

/// Failure reported by a block worker for one operation.
///
/// Every variant is turned into a failed reply that still counts toward the
/// phase barrier; none of them stops the worker.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The operation is not valid from the worker's current state.
    #[error("operation not allowed. {op} is invalid in state {state}")]
    InvalidTransition {
        /// State the worker was in when the operation arrived.
        state: WorkerState,
        /// Operation that was rejected.
        op: OpKind,
    },
    /// A store or node call failed while running the operation.
    #[error("store error. {0:#}")]
    Store(#[from] anyhow::Error),
    /// The worker panicked while running the operation.
    #[error("worker crashed. {0}")]
    Crashed(String),
    /// The worker task is gone and could not take the operation.
    #[error("worker {0} is unavailable")]
    Unavailable(usize),
    /// The slot failed an earlier phase of this chunk and was skipped.
    #[error("slot {0} skipped after an earlier failure")]
    Fenced(usize),
}

/// Failures of a [`crate::ChunkCoordinator::process_chunk`] call as a whole.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChunkError {
    /// No headers were supplied.
    #[error("chunk is empty")]
    Empty,
    /// More headers than workers; each block needs its own worker slot.
    #[error("chunk of {len} headers exceeds the worker pool of {workers}")]
    TooLarge {
        /// Number of headers supplied.
        len: usize,
        /// Size of the worker pool.
        workers: usize,
    },
    /// The task running the chunk panicked or was cancelled by runtime shutdown.
    #[error("chunk task aborted. {0}")]
    Aborted(String),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file. {0}")]
    Io(#[from] std::io::Error),
    /// The config file is not valid TOML for [`crate::PipelineConfig`].
    #[error("failed to parse config. {0}")]
    Parse(#[from] toml::de::Error),
    /// A value parsed but is out of range.
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}
