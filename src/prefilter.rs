//! Transaction prefilter: narrows a batch of decoded transactions to those
//! touching a tracked entity, with one batched store lookup per sub-batch
//! instead of a round trip per output or input.
//!
//! Output pass: index every output address, ask the store which addresses
//! are tracked, select the transactions that pay to them.
//! Input pass: index every spent outpoint, ask the store which outpoints fund
//! an output it already knows, select the transactions that spend them.
//!
//! Both passes only read from the store.
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use bitcoin::{Network, OutPoint, Transaction};
use futures::future::try_join_all;
use tracing::trace;

use crate::{dedupe::DedupeCache, store::Store, tx::DecodedTransaction};

/// Transactions per concurrently filtered sub-batch.
pub const TX_BATCH: usize = 5_000;

/// Outpoints per known-outpoint store query.
pub const OUTPOINT_BATCH: usize = 1_000;

/// Sub-batch sizes used by the prefilter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterLimits {
    /// Transactions per sub-batch.
    pub tx_batch: usize,
    /// Outpoints per store query in the input pass.
    pub outpoint_batch: usize,
}

impl Default for FilterLimits {
    fn default() -> Self {
        Self {
            tx_batch: TX_BATCH,
            outpoint_batch: OUTPOINT_BATCH,
        }
    }
}

/// An output paying to a tracked address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputHit {
    /// Output index.
    pub vout: u32,
    /// Tracked address.
    pub address: String,
    /// Value in satoshis.
    pub value: u64,
    /// Account the address is tracked through, if any.
    pub account_id: Option<i64>,
}

/// An input spending an output the store already knows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputHit {
    /// Input index.
    pub vin: u32,
    /// The spent outpoint.
    pub prevout: OutPoint,
    /// Address of the spent output.
    pub address: String,
}

/// A selected transaction with the outputs or inputs that made it relevant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matched<H> {
    /// The transaction.
    pub tx: Arc<DecodedTransaction>,
    /// Matching outputs or inputs, in index order.
    pub hits: Vec<H>,
}

/// A batch of decoded transactions to prefilter.
#[derive(Debug, Clone, Default)]
pub struct TransactionsBundle {
    txs: Vec<Arc<DecodedTransaction>>,
    limits: FilterLimits,
}

impl TransactionsBundle {
    /// Bundle already decoded transactions.
    pub fn new(txs: Vec<DecodedTransaction>) -> Self {
        Self {
            txs: txs.into_iter().map(Arc::new).collect(),
            limits: FilterLimits::default(),
        }
    }

    /// Decode consensus transactions, deriving addresses on `network`.
    pub fn from_transactions(txs: &[Transaction], network: Network) -> Self {
        Self::new(
            txs.iter()
                .map(|tx| DecodedTransaction::from_bitcoin(tx, network))
                .collect(),
        )
    }

    /// Override the sub-batch sizes.
    pub fn with_limits(mut self, limits: FilterLimits) -> Self {
        self.limits = FilterLimits {
            tx_batch: limits.tx_batch.max(1),
            outpoint_batch: limits.outpoint_batch.max(1),
        };
        self
    }

    /// Transactions in batch order.
    pub fn transactions(&self) -> &[Arc<DecodedTransaction>] {
        &self.txs
    }

    /// Number of transactions.
    pub fn len(&self) -> usize {
        self.txs.len()
    }

    /// True for an empty bundle.
    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    /// Transactions with at least one output paying to a tracked address.
    ///
    /// Transactions whose id is in `cache` are not indexed. The result keeps
    /// batch order and holds each transaction at most once.
    ///
    /// # Errors
    /// Returns the first store error from any sub-batch.
    pub async fn filter_outputs<S>(
        &self,
        store: &S,
        cache: &DedupeCache,
    ) -> anyhow::Result<Vec<Matched<OutputHit>>>
    where
        S: Store + ?Sized,
    {
        let passes = self
            .txs
            .chunks(self.limits.tx_batch)
            .map(|batch| filter_output_batch(batch, store, cache));
        let parts = try_join_all(passes).await?;
        Ok(parts.into_iter().flatten().collect())
    }

    /// Transactions with at least one input spending an output the store knows.
    ///
    /// The result keeps batch order and holds each transaction at most once.
    ///
    /// # Errors
    /// Returns the first store error from any sub-batch.
    pub async fn filter_inputs<S>(&self, store: &S) -> anyhow::Result<Vec<Matched<InputHit>>>
    where
        S: Store + ?Sized,
    {
        let passes = self
            .txs
            .chunks(self.limits.tx_batch)
            .map(|batch| filter_input_batch(batch, store, self.limits.outpoint_batch));
        let parts = try_join_all(passes).await?;
        Ok(parts.into_iter().flatten().collect())
    }
}

async fn filter_output_batch<S>(
    batch: &[Arc<DecodedTransaction>],
    store: &S,
    cache: &DedupeCache,
) -> anyhow::Result<Vec<Matched<OutputHit>>>
where
    S: Store + ?Sized,
{
    // address -> (position in batch, vout)
    let mut index: HashMap<&str, Vec<(usize, u32)>> = HashMap::new();
    for (pos, tx) in batch.iter().enumerate() {
        if cache.contains(&tx.id) {
            trace!(txid = %tx.id, "already handled, skipping outputs");
            continue;
        }
        for (vout, output) in tx.outputs.iter().enumerate() {
            match output.address.as_deref() {
                Some(address) => index.entry(address).or_default().push((pos, vout as u32)),
                None => trace!(txid = %tx.id, vout, "output has no address"),
            }
        }
    }
    if index.is_empty() {
        return Ok(Vec::new());
    }

    let candidates: Vec<String> = index.keys().map(|a| a.to_string()).collect();
    let tracked = store.find_tracked_addresses(&candidates).await?;

    let mut selected: BTreeMap<usize, Vec<OutputHit>> = BTreeMap::new();
    for row in tracked {
        let Some(occurrences) = index.remove(row.address.as_str()) else {
            continue;
        };
        for (pos, vout) in occurrences {
            selected.entry(pos).or_default().push(OutputHit {
                vout,
                address: row.address.clone(),
                value: batch[pos].outputs[vout as usize].value,
                account_id: row.account_id,
            });
        }
    }

    Ok(collect_selected(batch, selected, |hit| hit.vout))
}

async fn filter_input_batch<S>(
    batch: &[Arc<DecodedTransaction>],
    store: &S,
    outpoint_batch: usize,
) -> anyhow::Result<Vec<Matched<InputHit>>>
where
    S: Store + ?Sized,
{
    // outpoint -> (position in batch, vin)
    let mut index: HashMap<OutPoint, Vec<(usize, u32)>> = HashMap::new();
    for (pos, tx) in batch.iter().enumerate() {
        for (vin, input) in tx.inputs.iter().enumerate() {
            if input.is_coinbase() {
                continue;
            }
            index
                .entry(input.outpoint())
                .or_default()
                .push((pos, vin as u32));
        }
    }
    if index.is_empty() {
        return Ok(Vec::new());
    }

    let outpoints: Vec<OutPoint> = index.keys().copied().collect();
    let lookups = outpoints
        .chunks(outpoint_batch)
        .map(|chunk| store.find_known_outpoints(chunk));
    let known = try_join_all(lookups).await?;

    let mut selected: BTreeMap<usize, Vec<InputHit>> = BTreeMap::new();
    for row in known.into_iter().flatten() {
        let Some(occurrences) = index.remove(&row.outpoint) else {
            continue;
        };
        for (pos, vin) in occurrences {
            selected.entry(pos).or_default().push(InputHit {
                vin,
                prevout: row.outpoint,
                address: row.address.clone(),
            });
        }
    }

    Ok(collect_selected(batch, selected, |hit| hit.vin))
}

fn collect_selected<H>(
    batch: &[Arc<DecodedTransaction>],
    selected: BTreeMap<usize, Vec<H>>,
    key: impl Fn(&H) -> u32,
) -> Vec<Matched<H>> {
    selected
        .into_iter()
        .map(|(pos, mut hits)| {
            hits.sort_by_key(|h| key(h));
            Matched {
                tx: Arc::clone(&batch[pos]),
                hits,
            }
        })
        .collect()
}
