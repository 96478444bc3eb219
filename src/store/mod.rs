//! Store collaborator: the relational database holding tracked entities,
//! registered blocks and the relevant transaction subset.
//!
//! Implementations own their retry discipline for transient lock/timeout
//! errors; the pipeline never retries a failed call itself.
use async_trait::async_trait;
use bitcoin::{BlockHash, OutPoint, Txid};

/// A block row already present in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredBlock {
    /// Store id.
    pub id: i64,
    /// Block height.
    pub height: u32,
}

/// Block row to insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewBlock {
    /// Block height.
    pub height: u32,
    /// Block hash.
    pub hash: BlockHash,
    /// Block timestamp.
    pub time: u32,
    /// Store id of the previous block, if it is registered.
    pub parent_id: Option<i64>,
}

/// An address the store reports as tracked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedAddress {
    /// The address string.
    pub address: String,
    /// Owning account, when tracked through one.
    pub account_id: Option<i64>,
}

/// An outpoint that funds an output the store already knows about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundedOutpoint {
    /// The known output.
    pub outpoint: OutPoint,
    /// Address the output pays to.
    pub address: String,
}

/// A matched output to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRow {
    /// Creating transaction.
    pub txid: Txid,
    /// Output index.
    pub vout: u32,
    /// Tracked address it pays to.
    pub address: String,
    /// Value in satoshis.
    pub value: u64,
    /// Account owning `address`, if any.
    pub account_id: Option<i64>,
}

/// A matched input to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRow {
    /// Spending transaction.
    pub txid: Txid,
    /// Input index.
    pub vin: u32,
    /// Known output being spent.
    pub prevout: OutPoint,
    /// Address of the spent output.
    pub address: String,
}

/// Store operations the pipeline consumes.
#[async_trait]
pub trait Store: Send + Sync {
    /// Registered block with this hash, if any.
    async fn get_block_by_hash(&self, hash: BlockHash) -> anyhow::Result<Option<StoredBlock>>;

    /// Insert a block row and return its id.
    async fn add_block(&self, block: NewBlock) -> anyhow::Result<i64>;

    /// Which of `addresses` are tracked, directly or through a tracked
    /// account. Denylisted addresses are never returned.
    async fn find_tracked_addresses(
        &self,
        addresses: &[String],
    ) -> anyhow::Result<Vec<TrackedAddress>>;

    /// Which of `outpoints` fund an output the store already knows about.
    async fn find_known_outpoints(
        &self,
        outpoints: &[OutPoint],
    ) -> anyhow::Result<Vec<FundedOutpoint>>;

    /// Persist matched outputs (and their transactions, unconfirmed).
    async fn save_outputs(&self, rows: &[OutputRow]) -> anyhow::Result<()>;

    /// Persist matched inputs (and their transactions, unconfirmed).
    async fn save_inputs(&self, rows: &[InputRow]) -> anyhow::Result<()>;

    /// Mark transactions as confirmed in block `block_id`.
    async fn confirm_transactions(&self, ids: &[Txid], block_id: i64) -> anyhow::Result<()>;
}

#[cfg(feature = "store-sqlite")]
pub mod sqlite_store;
#[cfg(feature = "store-sqlite")]
pub use sqlite_store::SqliteStore;
