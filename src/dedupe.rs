//! Process-wide cache of transaction ids that were already evaluated.
use std::{
    num::NonZeroUsize,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use bitcoin::Txid;
use lru::LruCache;

use crate::config::DEFAULT_DEDUPE_CAPACITY;

/// Bounded LRU set of transaction ids. Entries never expire by time; they are
/// evicted only when the cache is full.
///
/// The prefilter only reads it: a txid found here is skipped by the output
/// pass. A miss merely costs a redundant filter pass. The mempool processor
/// inserts ids it found irrelevant.
pub struct DedupeCache {
    inner: RwLock<LruCache<Txid, ()>>,
}

impl DedupeCache {
    /// Create a cache holding at most `capacity` ids (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: RwLock::new(LruCache::new(capacity)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, LruCache<Txid, ()>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, LruCache<Txid, ()>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether `txid` was already handled. Does not change recency, so
    /// concurrent readers never wait on each other.
    pub fn contains(&self, txid: &Txid) -> bool {
        self.read().contains(txid)
    }

    /// Record `txid` as handled, evicting the least recently used id when full.
    pub fn insert(&self, txid: Txid) {
        self.write().put(txid, ());
    }

    /// Number of cached ids.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DedupeCache {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUPE_CAPACITY)
    }
}
