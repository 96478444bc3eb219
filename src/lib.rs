#![forbid(unsafe_code)]
#![deny(missing_docs)]
//! cedazo: keeps only the Bitcoin transactions that touch tracked addresses.
//!
//! ## What you implement
//! - [`Store`]: the database holding tracked addresses, registered blocks and
//!   the relevant transaction subset (a SQLite one ships as [`SqliteStore`]).
//! - [`NodeSource`]: raw block bytes by hash.
//! - [`NotificationSink`]: where `"block"` and `"transaction"` JSON goes
//!   ([`ChannelSink`] for in-process fan-out).
//!
//! ## What the crate does
//! - [`ChunkCoordinator`] spreads a chunk of consecutive headers over a pool of
//!   block workers, one block each, and walks them in lockstep through decode,
//!   output matching, input matching, confirmation and reset. Blocks are
//!   registered in height order between the input and confirm phases.
//! - [`TransactionsBundle`] is the prefilter both the workers and
//!   [`MempoolProcessor`] use: one store query per sub-batch tells which
//!   addresses are tracked and which outpoints are known.
//! - [`DedupeCache`] lets transactions already found irrelevant skip the
//!   output pass.
//!
//! ## Minimal usage
//! ```rust,ignore
//! use cedazo::prelude::*;
//! use std::sync::Arc;
//!
//! async fn run(node: Arc<impl NodeSource + 'static>, headers: Vec<BlockHeader>) -> anyhow::Result<()> {
//!     let config = PipelineConfig::from_toml_file("cedazo.toml")?;
//!     init_logging(config.log_format, &config.log_level);
//!
//!     let store = Arc::new(SqliteStore::new(&config.store_path)?);
//!     let sink = Arc::new(ChannelSink::new(1024));
//!     let cache = Arc::new(DedupeCache::new(config.dedupe_capacity));
//!
//!     let coordinator = ChunkCoordinator::initialize(&config, store, node, sink, cache);
//!     for chunk in headers.chunks(coordinator.worker_count()) {
//!         let report = coordinator.process_chunk(chunk.to_vec()).await?;
//!         // report.rescan lists blocks whose data has a gap
//!     }
//!     Ok(())
//! }
//! ```

/// Decoded block: prefilter over its transactions plus persistence and confirmation.
pub mod block;

/// De-duplicated accumulator of transactions to announce.
pub mod broadcast;

/// TOML configuration.
pub mod config;

/// Worker pool and per-chunk phase protocol.
pub mod coordinator;

/// Shared LRU cache of already evaluated transaction ids.
pub mod dedupe;

/// Typed errors.
pub mod error;

/// Block header as supplied by the chain walker.
pub mod headers;

/// `tracing` subscriber setup.
pub mod logging;

/// Prefiltering of unconfirmed transactions.
pub mod mempool;

/// Raw block source (full node).
pub mod node;

/// Outbound notification topics and sinks.
pub mod notify;

/// Batched transaction prefilter.
pub mod prefilter;

/// Persistence layer (traits and SQLite implementation).
pub mod store;

/// Decoded transaction model.
pub mod tx;

/// Block worker state machine and task.
pub mod worker;

// Public re-exports
pub use block::Block;
pub use config::PipelineConfig;
pub use coordinator::{ChunkCoordinator, ChunkReport, RegisteredBlock};
pub use dedupe::DedupeCache;
pub use error::{ChunkError, ConfigError, WorkerError};
pub use headers::BlockHeader;
pub use logging::{init_logging, LogFormat};
pub use mempool::MempoolProcessor;
pub use node::NodeSource;
pub use notify::{ChannelSink, NotificationSink, Topic};
pub use prefilter::TransactionsBundle;
#[cfg(feature = "store-sqlite")]
pub use store::SqliteStore;
pub use store::Store;
pub use tx::DecodedTransaction;
pub use worker::{BlockWorker, Op, Reply, WorkerState};

/// Convenience prelude for end users.
pub mod prelude {
    #[cfg(feature = "store-sqlite")]
    pub use crate::SqliteStore;
    pub use crate::{
        init_logging, BlockHeader, ChannelSink, ChunkCoordinator, DedupeCache, MempoolProcessor,
        NodeSource, NotificationSink, PipelineConfig, Store, Topic,
    };
}
