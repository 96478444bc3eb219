//! Full-node access used by block workers.
use async_trait::async_trait;
use bitcoin::BlockHash;

/// Provider of raw blocks (RPC, REST or P2P; the wire format is the implementor's concern).
#[async_trait]
pub trait NodeSource: Send + Sync {
    /// Fetch the raw consensus-encoded bytes of block `hash`.
    async fn get_raw_block(&self, hash: BlockHash) -> anyhow::Result<Vec<u8>>;
}
