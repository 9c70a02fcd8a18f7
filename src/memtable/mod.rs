//! Memtable Module
//!
//! The in-memory sorted buffer of committed-but-unflushed writes. Entries
//! are `(key, value?, seq)` tuples keyed by the base (suffix-less) key; a
//! key may hold several versions at different sequences and the highest
//! sequence is authoritative. Deletes are tombstones (`value = None`), not
//! physical removals — flushing must materialize them so older SSTable
//! versions stay shadowed.
//!
//! ## Design invariants
//!
//! - Entries only enter through the store, *after* their WAL frames are
//!   durable.
//! - `drain` returns every version sorted by `(key, seq)` and resets the
//!   buffer; the store turns them into sequence-suffixed SSTable keys.
//! - The capacity limit counts versions, not bytes (default 1024,
//!   configurable through the store options).
//!
//! ## Flush hooks
//!
//! Waiters (the store's collections, tests) can register a callback invoked
//! with the drained entries once a flush has fully published its SSTable.


use std::cmp::Reverse;
use std::collections::BTreeMap;

use tracing::trace;

/// One buffered version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemtableEntry {
    /// Base key (`collection || 0x00 || idJSON`).
    pub key: Vec<u8>,

    /// Encoded document; `None` is a tombstone.
    pub value: Option<Vec<u8>>,

    /// Commit sequence of this version.
    pub seq: u64,
}

/// Callback invoked with the drained entries after a flush completes.
pub type FlushHook = Box<dyn Fn(&[MemtableEntry]) + Send + Sync>;

/// Sorted multi-version write buffer.
pub struct Memtable {
    /// Versions per key, newest first.
    tree: BTreeMap<Vec<u8>, BTreeMap<Reverse<u64>, Option<Vec<u8>>>>,

    /// Total buffered versions.
    entries: usize,

    /// Version-count limit before a flush is required.
    limit: usize,

    /// Flush waiters.
    hooks: Vec<FlushHook>,
}

impl Memtable {
    /// Creates an empty memtable with the given version-count limit.
    pub fn new(limit: usize) -> Self {
        Self {
            tree: BTreeMap::new(),
            entries: 0,
            limit,
            hooks: Vec::new(),
        }
    }

    /// Buffers one version.
    pub fn put(&mut self, key: Vec<u8>, value: Option<Vec<u8>>, seq: u64) {
        let versions = self.tree.entry(key).or_default();
        if versions.insert(Reverse(seq), value).is_none() {
            self.entries += 1;
        }
    }

    /// Latest version for `key`, if buffered.
    pub fn get(&self, key: &[u8]) -> Option<(Option<&[u8]>, u64)> {
        let versions = self.tree.get(key)?;
        let (Reverse(seq), value) = versions.iter().next()?;
        Some((value.as_deref(), *seq))
    }

    /// Latest version with `seq ≤ max_seq`, for snapshot reads.
    pub fn get_at(&self, key: &[u8], max_seq: u64) -> Option<(Option<&[u8]>, u64)> {
        let versions = self.tree.get(key)?;
        versions
            .range(Reverse(max_seq)..)
            .next()
            .map(|(Reverse(seq), value)| (value.as_deref(), *seq))
    }

    /// Every buffered version whose key starts with `prefix` (all versions,
    /// key order, newest first within a key).
    pub fn scan(&self, prefix: Option<&[u8]>) -> Vec<MemtableEntry> {
        let mut out = Vec::new();
        for (key, versions) in &self.tree {
            if let Some(p) = prefix {
                if !key.starts_with(p) {
                    continue;
                }
            }
            for (Reverse(seq), value) in versions {
                out.push(MemtableEntry {
                    key: key.clone(),
                    value: value.clone(),
                    seq: *seq,
                });
            }
        }
        out
    }

    /// Total buffered versions.
    pub fn len(&self) -> usize {
        self.entries
    }

    /// `true` when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// `true` once the buffer has reached its configured limit.
    pub fn is_over_limit(&self) -> bool {
        self.entries >= self.limit
    }

    /// Returns every version sorted by `(key, seq)` and resets the buffer.
    pub fn drain(&mut self) -> Vec<MemtableEntry> {
        let tree = std::mem::take(&mut self.tree);
        self.entries = 0;

        let mut out = Vec::new();
        for (key, versions) in tree {
            // Reverse the newest-first version order so sequences ascend.
            let mut ascending: Vec<(u64, Option<Vec<u8>>)> = versions
                .into_iter()
                .map(|(Reverse(seq), value)| (seq, value))
                .collect();
            ascending.reverse();
            for (seq, value) in ascending {
                out.push(MemtableEntry {
                    key: key.clone(),
                    value,
                    seq,
                });
            }
        }

        trace!(entries = out.len(), "memtable drained");
        out
    }

    /// Registers a flush waiter.
    pub fn on_flush(&mut self, hook: FlushHook) {
        self.hooks.push(hook);
    }

    /// Invokes every flush waiter with the drained entries.
    pub fn notify_flush(&self, entries: &[MemtableEntry]) {
        for hook in &self.hooks {
            hook(entries);
        }
    }
}
