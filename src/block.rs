//! One decoded block: the prefilter specialized to a block's transactions,
//! plus the writes that follow a match and confirmation.
use std::sync::Arc;

use bitcoin::{consensus, Network, Txid};
use tracing::{debug, warn};

use crate::{
    dedupe::DedupeCache,
    headers::BlockHeader,
    prefilter::{FilterLimits, InputHit, Matched, OutputHit, TransactionsBundle},
    store::{InputRow, OutputRow, Store},
    tx::DecodedTransaction,
};

/// A block owned by a single worker between INIT and RESET.
#[derive(Debug, Clone)]
pub struct Block {
    header: BlockHeader,
    bundle: TransactionsBundle,
    degraded: bool,
}

impl Block {
    /// Decode consensus bytes for `header`.
    ///
    /// A block that fails to parse, or whose hash does not match `header`, is
    /// logged and becomes an empty block flagged as degraded instead of failing.
    pub fn decode(raw: &[u8], header: BlockHeader, network: Network, limits: FilterLimits) -> Self {
        match consensus::encode::deserialize::<bitcoin::Block>(raw) {
            Ok(block) if block.block_hash() == header.hash => {
                debug!(height = header.height, txs = block.txdata.len(), "decoded block");
                Self {
                    header,
                    bundle: TransactionsBundle::from_transactions(&block.txdata, network)
                        .with_limits(limits),
                    degraded: false,
                }
            }
            Ok(block) => {
                warn!(
                    height = header.height,
                    expected = %header.hash,
                    got = %block.block_hash(),
                    "block hash mismatch, indexing as empty"
                );
                Self::empty(header)
            }
            Err(e) => {
                warn!(height = header.height, hash = %header.hash, "block decode failed, indexing as empty: {e}");
                Self::empty(header)
            }
        }
    }

    /// Empty, degraded block, used when the raw bytes can't be obtained or parsed.
    pub fn empty(header: BlockHeader) -> Self {
        Self {
            header,
            bundle: TransactionsBundle::default(),
            degraded: true,
        }
    }

    /// Header this block was decoded for.
    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    /// Transactions in block order.
    pub fn transactions(&self) -> &[Arc<DecodedTransaction>] {
        self.bundle.transactions()
    }

    /// True if decoding failed and the block was indexed as empty.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Filter outputs, persist the matched ones, return the candidates.
    pub async fn process_outputs<S>(
        &self,
        store: &S,
        cache: &DedupeCache,
    ) -> anyhow::Result<Vec<Arc<DecodedTransaction>>>
    where
        S: Store + ?Sized,
    {
        let matched = self.bundle.filter_outputs(store, cache).await?;
        persist_outputs(store, &matched).await?;
        Ok(matched.into_iter().map(|m| m.tx).collect())
    }

    /// Filter inputs, persist the matched ones, return the candidates.
    pub async fn process_inputs<S>(&self, store: &S) -> anyhow::Result<Vec<Arc<DecodedTransaction>>>
    where
        S: Store + ?Sized,
    {
        let matched = self.bundle.filter_inputs(store).await?;
        persist_inputs(store, &matched).await?;
        Ok(matched.into_iter().map(|m| m.tx).collect())
    }

    /// Mark `ids` confirmed in `block_id`, `batch` ids per store call.
    pub async fn confirm_transactions<S>(
        &self,
        store: &S,
        ids: &[Txid],
        block_id: i64,
        batch: usize,
    ) -> anyhow::Result<()>
    where
        S: Store + ?Sized,
    {
        for chunk in ids.chunks(batch.max(1)) {
            store.confirm_transactions(chunk, block_id).await?;
        }
        Ok(())
    }
}

pub(crate) async fn persist_outputs<S>(store: &S, matched: &[Matched<OutputHit>]) -> anyhow::Result<()>
where
    S: Store + ?Sized,
{
    let rows: Vec<OutputRow> = matched
        .iter()
        .flat_map(|m| {
            m.hits.iter().map(|hit| OutputRow {
                txid: m.tx.id,
                vout: hit.vout,
                address: hit.address.clone(),
                value: hit.value,
                account_id: hit.account_id,
            })
        })
        .collect();
    if rows.is_empty() {
        return Ok(());
    }
    store.save_outputs(&rows).await
}

pub(crate) async fn persist_inputs<S>(store: &S, matched: &[Matched<InputHit>]) -> anyhow::Result<()>
where
    S: Store + ?Sized,
{
    let rows: Vec<InputRow> = matched
        .iter()
        .flat_map(|m| {
            m.hits.iter().map(|hit| InputRow {
                txid: m.tx.id,
                vin: hit.vin,
                prevout: hit.prevout,
                address: hit.address.clone(),
            })
        })
        .collect();
    if rows.is_empty() {
        return Ok(());
    }
    store.save_inputs(&rows).await
}
