//! Per-chunk accumulator of the transactions to announce once the chunk completes.
use std::{collections::HashSet, sync::Arc};

use bitcoin::Txid;

use crate::tx::DecodedTransaction;

/// Transactions to announce after a chunk, de-duplicated by id and kept in
/// first-seen order.
#[derive(Debug, Default)]
pub struct BroadcastSet {
    seen: HashSet<Txid>,
    txs: Vec<Arc<DecodedTransaction>>,
}

impl BroadcastSet {
    /// Add `tx` unless a transaction with the same id is already present.
    pub fn insert(&mut self, tx: Arc<DecodedTransaction>) -> bool {
        let fresh = self.seen.insert(tx.id);
        if fresh {
            self.txs.push(tx);
        }
        fresh
    }

    /// Whether `txid` is in the set.
    pub fn contains(&self, txid: &Txid) -> bool {
        self.seen.contains(txid)
    }

    /// Number of transactions.
    pub fn len(&self) -> usize {
        self.txs.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    /// Members in first-seen order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<DecodedTransaction>> {
        self.txs.iter()
    }

    /// Drop every member.
    pub fn clear(&mut self) {
        self.seen.clear();
        self.txs.clear();
    }

    /// Members in first-seen order.
    pub fn into_vec(self) -> Vec<Arc<DecodedTransaction>> {
        self.txs
    }
}

impl Extend<Arc<DecodedTransaction>> for BroadcastSet {
    fn extend<I: IntoIterator<Item = Arc<DecodedTransaction>>>(&mut self, iter: I) {
        for tx in iter {
            self.insert(tx);
        }
    }
}
