//! Snapshots and the live-snapshot registry.
//!
//! A snapshot is a read view bound to a sequence number: reads through it
//! return the latest version with `seq ≤ snapshot.sequence()`. Snapshots are
//! process-local handles, but the sequence they carry stays meaningful
//! across restarts because SSTable keys embed sequences.
//!
//! The registry tracks which snapshot sequences are still alive so
//! compaction never discards a version some reader can still observe. A
//! snapshot deregisters itself on drop.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Shared registry of live snapshot sequences (refcounted per sequence).
#[derive(Debug, Default)]
pub struct SnapshotRegistry {
    live: Mutex<BTreeMap<u64, usize>>,
}

impl SnapshotRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one live snapshot at `seq`.
    pub(crate) fn register(&self, seq: u64) {
        let mut live = self.live.lock().expect("snapshot registry poisoned");
        *live.entry(seq).or_insert(0) += 1;
    }

    /// Releases one live snapshot at `seq`.
    pub(crate) fn release(&self, seq: u64) {
        let mut live = self.live.lock().expect("snapshot registry poisoned");
        if let Some(count) = live.get_mut(&seq) {
            *count -= 1;
            if *count == 0 {
                live.remove(&seq);
            }
        }
    }

    /// The oldest live snapshot sequence, if any snapshot is held.
    pub fn min_live(&self) -> Option<u64> {
        let live = self.live.lock().expect("snapshot registry poisoned");
        live.keys().next().copied()
    }
}

/// An MVCC read view at a fixed sequence.
///
/// Cloning shares the registration; the sequence is released once the last
/// clone drops.
#[derive(Debug, Clone)]
pub struct Snapshot {
    inner: Arc<SnapshotHold>,
}

#[derive(Debug)]
struct SnapshotHold {
    seq: u64,
    registry: Arc<SnapshotRegistry>,
}

impl Snapshot {
    pub(crate) fn new(seq: u64, registry: Arc<SnapshotRegistry>) -> Self {
        registry.register(seq);
        Self {
            inner: Arc::new(SnapshotHold { seq, registry }),
        }
    }

    /// The sequence this view reads at.
    pub fn sequence(&self) -> u64 {
        self.inner.seq
    }
}

impl Drop for SnapshotHold {
    fn drop(&mut self) {
        self.registry.release(self.seq);
    }
}
