//! Mempool processing: the same prefilter applied to unconfirmed transactions.
//!
//! This is the only writer of the dedupe cache. A mempool transaction is
//! usually seen again when it leaves the mempool and once more inside its
//! block; remembering the irrelevant ones lets those sightings skip the
//! output pass.
use std::sync::Arc;

use bitcoin::{Network, Transaction};
use tracing::{debug, warn};

use crate::{
    block::{persist_inputs, persist_outputs},
    broadcast::BroadcastSet,
    config::PipelineConfig,
    dedupe::DedupeCache,
    notify::{NotificationSink, Topic},
    prefilter::{FilterLimits, TransactionsBundle},
    store::Store,
    tx::DecodedTransaction,
};

/// Filters, persists and announces batches of mempool transactions.
pub struct MempoolProcessor<S: ?Sized, P: ?Sized> {
    store: Arc<S>,
    sink: Arc<P>,
    cache: Arc<DedupeCache>,
    network: Network,
    limits: FilterLimits,
}

impl<S, P> MempoolProcessor<S, P>
where
    S: Store + ?Sized,
    P: NotificationSink + ?Sized,
{
    /// Processor sharing `cache` with the block pipeline.
    pub fn new(config: &PipelineConfig, store: Arc<S>, sink: Arc<P>, cache: Arc<DedupeCache>) -> Self {
        Self {
            store,
            sink,
            cache,
            network: config.network,
            limits: config.filter_limits(),
        }
    }

    /// Filter `txs`, persist matched outputs and inputs as unconfirmed, publish
    /// the relevant transactions and remember the rest as handled.
    ///
    /// Returns the relevant transactions in batch order.
    ///
    /// # Errors
    /// Store failures. Nothing is added to the cache when the batch fails.
    pub async fn process(&self, txs: &[Transaction]) -> anyhow::Result<Vec<Arc<DecodedTransaction>>> {
        let bundle =
            TransactionsBundle::from_transactions(txs, self.network).with_limits(self.limits);

        let outputs = bundle.filter_outputs(&*self.store, &self.cache).await?;
        persist_outputs(&*self.store, &outputs).await?;
        let inputs = bundle.filter_inputs(&*self.store).await?;
        persist_inputs(&*self.store, &inputs).await?;

        let mut relevant = BroadcastSet::default();
        relevant.extend(outputs.into_iter().map(|m| m.tx));
        relevant.extend(inputs.into_iter().map(|m| m.tx));

        let mut ordered = Vec::with_capacity(relevant.len());
        for tx in bundle.transactions() {
            if relevant.contains(&tx.id) {
                ordered.push(Arc::clone(tx));
            } else {
                self.cache.insert(tx.id);
            }
        }
        debug!(
            seen = bundle.len(),
            relevant = ordered.len(),
            cached = self.cache.len(),
            "mempool batch filtered"
        );

        for tx in &ordered {
            match serde_json::to_string(tx.as_ref()) {
                Ok(payload) => {
                    if let Err(e) = self.sink.publish(Topic::Transaction, payload).await {
                        warn!(txid = %tx.id, "failed to publish mempool transaction: {e:#}");
                    }
                }
                Err(e) => warn!(txid = %tx.id, "failed to serialize mempool transaction: {e}"),
            }
        }

        Ok(ordered)
    }
}
