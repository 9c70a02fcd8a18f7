//! Block Cache Module
//!
//! A byte-bounded LRU cache of verified SSTable block payloads, shared by
//! every table reader in a store. Blocks are keyed by
//! `(table id, offset, length)` so a recompacted table id can never alias a
//! stale block.
//!
//! A hit moves the block to the MRU position; a put evicts from the LRU tail
//! until the cache fits its byte budget again. A zero-capacity cache is
//! disabled entirely — every read goes to disk and counts as a miss.
//!
//! The cache is internally synchronized; readers on any thread share one
//! instance through an `Arc`.


use std::sync::{Arc, Mutex};

use lru::LruCache;
use uuid::Uuid;

/// Identifies one block of one table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockKey {
    /// Owning table.
    pub table: Uuid,

    /// Block offset within the file.
    pub offset: u64,

    /// Block length including the CRC trailer.
    pub length: u64,
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Lookups that found the block.
    pub hits: u64,

    /// Lookups that missed (including all lookups when disabled).
    pub misses: u64,

    /// Resident blocks.
    pub items: usize,

    /// Resident payload bytes.
    pub bytes: u64,
}

struct CacheInner {
    map: LruCache<BlockKey, Arc<Vec<u8>>>,
    used: u64,
    hits: u64,
    misses: u64,
}

/// Bounded LRU cache of block payloads.
pub struct BlockCache {
    capacity: u64,
    inner: Mutex<CacheInner>,
}

impl BlockCache {
    /// Creates a cache with the given byte budget; `0` disables caching.
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            inner: Mutex::new(CacheInner {
                map: LruCache::unbounded(),
                used: 0,
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Looks up a block, promoting it to MRU on a hit.
    pub fn get(&self, key: &BlockKey) -> Option<Arc<Vec<u8>>> {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        if self.capacity == 0 {
            inner.misses += 1;
            return None;
        }
        let found = inner.map.get(key).map(Arc::clone);
        match found {
            Some(block) => {
                inner.hits += 1;
                Some(block)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Inserts a block, evicting LRU entries until the byte budget holds.
    pub fn put(&self, key: BlockKey, block: Arc<Vec<u8>>) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.inner.lock().expect("cache mutex poisoned");

        if let Some(old) = inner.map.put(key, Arc::clone(&block)) {
            inner.used -= old.len() as u64;
        }
        inner.used += block.len() as u64;

        while inner.used > self.capacity {
            match inner.map.pop_lru() {
                Some((_, evicted)) => inner.used -= evicted.len() as u64,
                None => break,
            }
        }
    }

    /// Drops every block belonging to `table` (used when a table is retired).
    pub fn evict_table(&self, table: &Uuid) {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        let keys: Vec<BlockKey> = inner
            .map
            .iter()
            .filter(|(k, _)| &k.table == table)
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            if let Some(block) = inner.map.pop(&key) {
                inner.used -= block.len() as u64;
            }
        }
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("cache mutex poisoned");
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            items: inner.map.len(),
            bytes: inner.used,
        }
    }

    /// Resets the hit/miss counters (resident blocks stay).
    pub fn reset_stats(&self) {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        inner.hits = 0;
        inner.misses = 0;
    }
}
