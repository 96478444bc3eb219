//! Block headers handed in by the chain walker.
use bitcoin::BlockHash;
use serde::{Deserialize, Serialize};

/// A block's identity as supplied by the chain walker, before the block is decoded.
///
/// Published as-is (JSON) on the `"block"` topic once its chunk completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block hash.
    pub hash: BlockHash,
    /// Height in the best chain.
    pub height: u32,
    /// Hash of the previous block, used to resolve the parent's store id.
    pub prev_hash: BlockHash,
    /// Block timestamp (seconds since the epoch).
    pub time: u32,
}

impl BlockHeader {
    /// Header of an already decoded block at `height`.
    pub fn from_block(block: &bitcoin::Block, height: u32) -> Self {
        Self {
            hash: block.block_hash(),
            height,
            prev_hash: block.header.prev_blockhash,
            time: block.header.time,
        }
    }
}
