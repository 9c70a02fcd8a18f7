//! Store Module
//!
//! The orchestrator of the whole engine: it owns the WAL, the memtable, the
//! manifest, the live table set, the block cache, the compactor, and the
//! per-collection hooks, and it is the **single logical writer** every
//! mutation serializes through.
//!
//! ## Write path
//!
//! ```text
//! batch → backpressure → sequence guard → unique validation
//!       → allocate sequences → WAL BEGIN/OP…/COMMIT → fsync
//!       → memtable + collection apply hooks → flush when over limit
//! ```
//!
//! A batch is atomic: it either becomes durable as a whole (its COMMIT frame
//! synced) or leaves no durable effect. Single-document put/delete uses a
//! legacy one-frame WAL record and is equivalent to a one-op batch.
//!
//! ## Read path
//!
//! Reads resolve from per-collection in-memory history (bootstrapped from
//! SSTables at open and kept current by apply hooks); the memtable and the
//! Bloom-gated SSTable stack back a fallback for ids that never entered
//! history. MVCC picks the newest version with `seq ≤ snapshot`.
//!
//! ## Recovery
//!
//! Open loads the manifest (corrupt ⇒ fatal), removes orphan tables, scans
//! the live tables into per-collection bootstrap buffers, replays the WAL —
//! buffering transactional frames until their COMMIT, discarding sequences
//! the manifest already covers — and seeds the sequence counter past
//! everything it saw.
//!
//! ## Concurrency model
//!
//! The WAL + memtable pair lives behind one mutex (the write half); readers
//! share `RwLock`'d history maps and lock-free immutable tables. Compaction
//! runs on a dedicated worker thread fed through a crossbeam channel and
//! swaps the manifest/table set under the store's serialization points.

pub(crate) mod crash;
pub mod snapshot;

mod backup;

#[cfg(test)]
mod tests;

pub use backup::BackupInfo;
pub use snapshot::Snapshot;

use std::{
    any::Any,
    collections::{BTreeMap, HashMap},
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
    thread,
    time::Duration,
};

use crossbeam::channel::{self, Sender};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{BlockCache, CacheStats};
use crate::collection::{Collection, CollectionCore, CollectionHooks, Document};
use crate::compaction::{CompactionError, CompactionStatus, Compactor};
use crate::index::{value_projector, IndexDef, KeyPath};
use crate::keys;
use crate::manifest::{Manifest, ManifestError};
use crate::memtable::Memtable;
use crate::sstable::{SSTable, SstError, SstWriter};
use crate::wal::{LegacyOp, TxFrame, Wal, WalError, WalFrame, WalPayload};
use snapshot::SnapshotRegistry;

/// Backpressure engages above this much compaction debt.
const BACKPRESSURE_DEBT_BYTES: u64 = 512 * 1024;

/// Cooperative delay ceiling.
const BACKPRESSURE_MAX: Duration = Duration::from_millis(5);

// ------------------------------------------------------------------------------------------------
// Error taxonomy
// ------------------------------------------------------------------------------------------------

/// Unified error type of the store surface.
#[derive(Debug, Error)]
pub enum StoreError {
    /// On-disk damage: manifest that fails to decode, SSTable block CRC
    /// mismatch, short footer. (Corrupt WAL tails are *not* errors — replay
    /// silently truncates them.)
    #[error("corrupt: {0}")]
    Corrupt(String),

    /// The referenced entity does not exist (unknown backup id, missing
    /// collection on drop).
    #[error("not found: {0}")]
    NotFound(String),

    /// A unique index would hold the same key for two live documents.
    #[error("unique constraint violation on index {index:?} for key {key:?}")]
    UniqueConstraint {
        /// Index name.
        index: String,
        /// Conflicting key (lossy UTF-8).
        key: String,
    },

    /// The batch guard `require_sequence_at_least` failed.
    #[error("sequence too low: required {required}, current {current}")]
    SequenceTooLow {
        /// Guard value the caller demanded.
        required: u64,
        /// Sequence the store was actually at.
        current: u64,
    },

    /// The named index is not defined (or not queryable this way).
    #[error("unknown index: {0}")]
    UnknownIndex(String),

    /// Underlying filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Document or catalog (de)serialization failure.
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// WAL failure.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Internal invariant violation (poisoned lock, injected crash).
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ManifestError> for StoreError {
    fn from(e: ManifestError) -> Self {
        match e {
            ManifestError::Corrupt(msg) => Self::Corrupt(msg),
            ManifestError::Io(e) => Self::Io(e),
            ManifestError::Encoding(e) => Self::Encoding(e),
            ManifestError::Internal(msg) => Self::Internal(msg),
        }
    }
}

impl From<SstError> for StoreError {
    fn from(e: SstError) -> Self {
        match e {
            SstError::Corrupt(msg) => Self::Corrupt(msg),
            SstError::Io(e) => Self::Io(e),
            SstError::Internal(msg) => Self::Internal(msg),
        }
    }
}

impl From<CompactionError> for StoreError {
    fn from(e: CompactionError) -> Self {
        match e {
            CompactionError::Io(e) => Self::Io(e),
            CompactionError::Manifest(e) => e.into(),
            CompactionError::Sst(e) => e.into(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Options, batch ops, metrics
// ------------------------------------------------------------------------------------------------

/// Store configuration, passed to [`Store::open`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Store directory (created when absent).
    pub path: PathBuf,

    /// Block cache budget in bytes; `0` disables caching.
    pub cache_bytes: u64,

    /// Default `limit` for scans that pass `None`.
    pub default_scan_limit: usize,

    /// WAL segment rotation threshold; `0` disables rotation.
    pub wal_segment_bytes: u64,

    /// Memtable version-count limit before a flush.
    pub memtable_limit: usize,

    /// Schedule a background compaction tick after each flush. Disable to
    /// drive compaction explicitly (tests, maintenance windows).
    pub auto_compact: bool,
}

impl StoreOptions {
    /// Options rooted at `path` with the documented defaults.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Re-roots the options at `path` (builder style).
    pub fn with_path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = path.as_ref().to_path_buf();
        self
    }
}

/// The documented defaults, rooted at the current directory until
/// [`with_path`](StoreOptions::with_path) re-roots them.
impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            path: PathBuf::from("."),
            cache_bytes: 64 * 1024 * 1024,
            default_scan_limit: 100,
            wal_segment_bytes: 4 * 1024 * 1024,
            memtable_limit: 1024,
            auto_compact: true,
        }
    }
}

/// One operation of a batch, created through
/// [`Collection::put_op`]/[`Collection::delete_op`].
#[derive(Debug, Clone)]
pub struct RawOp {
    /// Target collection.
    pub(crate) collection: String,

    /// JSON-encoded document id.
    pub(crate) id_json: Vec<u8>,

    /// Encoded document, `None` for deletes.
    pub(crate) value: Option<Vec<u8>>,
}

/// Point-in-time counters, including cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    /// Committed batches (including single-op commits).
    pub batches: u64,

    /// Committed put operations.
    pub puts: u64,

    /// Committed delete operations.
    pub deletes: u64,

    /// Memtable flushes that produced a table.
    pub flushes: u64,

    /// Writes delayed by compaction backpressure.
    pub backpressure_waits: u64,

    /// Block cache counters.
    pub cache: CacheStats,
}

#[derive(Default)]
struct Metrics {
    batches: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
    flushes: AtomicU64,
    backpressure_waits: AtomicU64,
}

// ------------------------------------------------------------------------------------------------
// Inner state
// ------------------------------------------------------------------------------------------------

/// WAL + memtable: the single-writer serialization point.
struct WriteHalf {
    wal: Wal,
    memtable: Memtable,
}

struct RegisteredCollection {
    hooks: Arc<dyn CollectionHooks>,
    /// `Arc<CollectionCore<T>>` behind `Any`, downcast on handle lookup.
    core: Box<dyn Any + Send + Sync>,
}

/// An entry recovered at open time, waiting for its collection handle.
pub(crate) struct BootstrapEntry {
    pub(crate) id_json: Vec<u8>,
    pub(crate) value: Option<Vec<u8>>,
    pub(crate) seq: u64,
}

pub(crate) struct StoreInner {
    options: StoreOptions,
    write: Mutex<WriteHalf>,
    manifest: Arc<Manifest>,
    tables: RwLock<BTreeMap<Uuid, Arc<SSTable>>>,
    cache: Arc<BlockCache>,
    seq: AtomicU64,
    snapshots: Arc<SnapshotRegistry>,
    collections: Mutex<HashMap<String, RegisteredCollection>>,
    bootstrap: Mutex<HashMap<String, Vec<BootstrapEntry>>>,
    compactor: Arc<Compactor>,
    compaction_tx: Mutex<Option<Sender<()>>>,
    compaction_worker: Mutex<Option<thread::JoinHandle<()>>>,
    metrics: Metrics,
}

/// The storage engine handle. Clone freely; all clones share one engine.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

// ------------------------------------------------------------------------------------------------
// Open / recovery
// ------------------------------------------------------------------------------------------------

impl Store {
    /// Opens (or creates) a store at `options.path`, recovering state from
    /// the manifest, the live SSTables, and the WAL.
    pub fn open(options: StoreOptions) -> Result<Self, StoreError> {
        fs::create_dir_all(&options.path)?;

        let manifest = Arc::new(Manifest::open(&options.path)?);
        let cache = Arc::new(BlockCache::new(options.cache_bytes));
        let snapshots = Arc::new(SnapshotRegistry::new());

        let data = manifest.read();
        remove_orphan_tables(&options.path, &data.tables)?;

        // Load live tables and materialize their entries into per-collection
        // bootstrap buffers. Keys without a sequence suffix predate MVCC
        // persistence and inherit the manifest sequence.
        let mut tables = BTreeMap::new();
        let mut bootstrap: HashMap<String, Vec<BootstrapEntry>> = HashMap::new();
        let mut max_seq = data.sequence;

        for (id, path) in &data.tables {
            let table = Arc::new(SSTable::open(path, *id, Arc::clone(&cache))?);
            for (key, value) in table.scan()? {
                let Some(parsed) = keys::parse_key(&key) else {
                    warn!(table = %id, "skipping undecodable key during bootstrap");
                    continue;
                };
                let seq = parsed.seq.unwrap_or(data.sequence);
                max_seq = max_seq.max(seq);
                let collection = String::from_utf8_lossy(parsed.collection).into_owned();
                bootstrap
                    .entry(collection)
                    .or_default()
                    .push(BootstrapEntry {
                        id_json: parsed.id_json.to_vec(),
                        value: if value.is_empty() { None } else { Some(value) },
                        seq,
                    });
            }
            tables.insert(*id, table);
        }

        // WAL replay: committed transactions and legacy ops newer than the
        // manifest sequence land in the memtable and the bootstrap buffers.
        let wal = Wal::open(&options.path, options.wal_segment_bytes)?;
        let mut memtable = Memtable::new(options.memtable_limit);
        let replayed = wal.replay()?;
        max_seq = max_seq.max(replay_frames(
            replayed,
            data.sequence,
            &mut memtable,
            &mut bootstrap,
        ));

        let compactor = Arc::new(Compactor::new(
            &options.path,
            Arc::clone(&manifest),
            Arc::clone(&cache),
            Arc::clone(&snapshots),
        ));

        let inner = Arc::new(StoreInner {
            write: Mutex::new(WriteHalf { wal, memtable }),
            manifest,
            tables: RwLock::new(tables),
            cache,
            seq: AtomicU64::new(max_seq),
            snapshots,
            collections: Mutex::new(HashMap::new()),
            bootstrap: Mutex::new(bootstrap),
            compactor,
            compaction_tx: Mutex::new(None),
            compaction_worker: Mutex::new(None),
            metrics: Metrics::default(),
            options,
        });

        start_compaction_worker(&inner);

        info!(
            path = %inner.options.path.display(),
            sequence = max_seq,
            tables = inner.tables.read().expect("tables lock poisoned").len(),
            "store opened"
        );

        Ok(Self { inner })
    }

    /// Graceful shutdown: flush, final WAL sync, stop the compaction worker.
    pub fn close(&self) -> Result<(), StoreError> {
        {
            let mut write = self.inner.write_half()?;
            self.inner.flush_locked(&mut write)?;
            write.wal.sync()?;
        }
        self.inner.stop_compaction_worker();
        info!(path = %self.inner.options.path.display(), "store closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Collections
    // --------------------------------------------------------------------------------------------

    /// Returns the typed handle for `name`, creating and bootstrapping the
    /// collection on first use. Repeat calls must use the same `T`.
    pub fn collection<T: Document>(&self, name: &str) -> Result<Collection<T>, StoreError> {
        let core = self.inner.collection_core::<T>(name)?;
        Ok(Collection {
            core,
            store: Arc::clone(&self.inner),
        })
    }

    /// The untyped JSON-document collection the HTTP surface builds on.
    /// Key-path indexes recorded in the catalog are rebuilt here after a
    /// restart.
    pub fn documents(&self, name: &str) -> Result<Collection<serde_json::Value>, StoreError> {
        let handle = self.collection::<serde_json::Value>(name)?;

        let catalog = self.inner.manifest.read().index_catalog;
        if let Some(defs) = catalog.get(name) {
            for def in handle.core.missing_defs(defs) {
                let field = def.field.clone().expect("missing_defs yields field defs");
                let path = KeyPath::parse(&field)
                    .map_err(|e| StoreError::Internal(format!("catalog key path: {e}")))?;
                let spec = crate::index::IndexSpec {
                    name: def.name.clone(),
                    projector: value_projector(def.kind, path),
                    field: Some(field),
                };
                handle.core.define_index(spec)?;
            }
        }
        Ok(handle)
    }

    /// Names of every known collection: registered, cataloged, or present
    /// in recovered data.
    pub fn list_collections(&self) -> Vec<String> {
        let mut names: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
        names.extend(self.inner.manifest.read().index_catalog.keys().cloned());
        names.extend(
            self.inner
                .collections
                .lock()
                .expect("collections lock poisoned")
                .keys()
                .cloned(),
        );
        names.extend(
            self.inner
                .bootstrap
                .lock()
                .expect("bootstrap lock poisoned")
                .keys()
                .cloned(),
        );
        names.into_iter().collect()
    }

    /// Removes a collection from the catalog and the registry. Records stay
    /// on disk until overwritten or compacted away.
    pub fn drop_collection(&self, name: &str) -> Result<(), StoreError> {
        self.inner.manifest.update(|m| {
            m.index_catalog.remove(name);
        })?;
        self.inner
            .collections
            .lock()
            .expect("collections lock poisoned")
            .remove(name);
        self.inner
            .bootstrap
            .lock()
            .expect("bootstrap lock poisoned")
            .remove(name);
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Commits a transactional batch across any mix of collections.
    ///
    /// Returns the last committed sequence. With `require_sequence_at_least`
    /// set, fails with [`StoreError::SequenceTooLow`] before any effect when
    /// the store has not yet reached that sequence.
    pub fn batch(
        &self,
        ops: Vec<RawOp>,
        require_sequence_at_least: Option<u64>,
    ) -> Result<u64, StoreError> {
        self.inner.commit_batch(ops, require_sequence_at_least)
    }

    /// A read view at the current sequence. Compaction will not reclaim
    /// versions this snapshot can still observe.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(
            self.inner.seq.load(Ordering::SeqCst),
            Arc::clone(&self.inner.snapshots),
        )
    }

    /// A read view at an explicit sequence — typically one remembered from
    /// a snapshot taken before a restart. Sequences stay meaningful across
    /// restarts because SSTable keys embed them.
    pub fn snapshot_at(&self, sequence: u64) -> Snapshot {
        Snapshot::new(sequence, Arc::clone(&self.inner.snapshots))
    }

    /// Flushes the memtable to an SSTable (no-op when empty).
    pub fn flush(&self) -> Result<(), StoreError> {
        let mut write = self.inner.write_half()?;
        self.inner.flush_locked(&mut write)
    }

    /// Runs one synchronous compaction tick.
    pub fn compact_now(&self) -> Result<bool, StoreError> {
        let merged = self.inner.compactor.tick()?;
        if merged {
            self.inner.sync_tables_with_manifest()?;
        }
        Ok(merged)
    }

    /// Current compactor status: levels, eligible groups, debt.
    pub fn compaction_status(&self) -> CompactionStatus {
        self.inner.compactor.status()
    }

    /// Current counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        let m = &self.inner.metrics;
        MetricsSnapshot {
            batches: m.batches.load(Ordering::Relaxed),
            puts: m.puts.load(Ordering::Relaxed),
            deletes: m.deletes.load(Ordering::Relaxed),
            flushes: m.flushes.load(Ordering::Relaxed),
            backpressure_waits: m.backpressure_waits.load(Ordering::Relaxed),
            cache: self.inner.cache.stats(),
        }
    }

    /// Zeroes the counters (cache contents stay).
    pub fn reset_metrics(&self) {
        let m = &self.inner.metrics;
        m.batches.store(0, Ordering::Relaxed);
        m.puts.store(0, Ordering::Relaxed);
        m.deletes.store(0, Ordering::Relaxed);
        m.flushes.store(0, Ordering::Relaxed);
        m.backpressure_waits.store(0, Ordering::Relaxed);
        self.inner.cache.reset_stats();
    }

    /// Current sequence counter (the value the next snapshot would read at).
    pub fn sequence(&self) -> u64 {
        self.inner.seq.load(Ordering::SeqCst)
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        self.stop_compaction_worker();
    }
}

// ------------------------------------------------------------------------------------------------
// Inner implementation
// ------------------------------------------------------------------------------------------------

impl StoreInner {
    pub(crate) fn default_scan_limit(&self) -> usize {
        self.options.default_scan_limit
    }

    fn write_half(&self) -> Result<std::sync::MutexGuard<'_, WriteHalf>, StoreError> {
        self.write
            .lock()
            .map_err(|_| StoreError::Internal("write lock poisoned".into()))
    }

    /// Looks up (or creates) the typed core for `name`, consuming its
    /// bootstrap buffer on creation.
    fn collection_core<T: Document>(
        &self,
        name: &str,
    ) -> Result<Arc<CollectionCore<T>>, StoreError> {
        let mut registry = self
            .collections
            .lock()
            .map_err(|_| StoreError::Internal("collections lock poisoned".into()))?;

        if let Some(existing) = registry.get(name) {
            return existing
                .core
                .downcast_ref::<Arc<CollectionCore<T>>>()
                .cloned()
                .ok_or_else(|| {
                    StoreError::Internal(format!(
                        "collection {name:?} already opened with a different type"
                    ))
                });
        }

        let core = Arc::new(CollectionCore::<T>::new(name));

        // Feed recovered entries through the ordinary apply hook, oldest
        // sequence first, so history and indexes come up exactly as they
        // would have through live commits.
        let pending = self
            .bootstrap
            .lock()
            .map_err(|_| StoreError::Internal("bootstrap lock poisoned".into()))?
            .remove(name);
        if let Some(mut entries) = pending {
            entries.sort_by_key(|e| e.seq);
            for entry in entries {
                core.apply(&entry.id_json, entry.value.as_deref(), entry.seq)?;
            }
        }

        registry.insert(
            name.to_string(),
            RegisteredCollection {
                hooks: Arc::clone(&core) as Arc<dyn CollectionHooks>,
                core: Box::new(Arc::clone(&core)),
            },
        );
        debug!(collection = name, "collection registered");
        Ok(core)
    }

    fn hooks_for(&self, name: &str) -> Result<Arc<dyn CollectionHooks>, StoreError> {
        self.collections
            .lock()
            .map_err(|_| StoreError::Internal("collections lock poisoned".into()))?
            .get(name)
            .map(|r| Arc::clone(&r.hooks))
            .ok_or_else(|| StoreError::Internal(format!("collection {name:?} is not open")))
    }

    /// Contiguously allocates `n` sequences, returning the first.
    fn allocate_sequences(&self, n: u64) -> u64 {
        self.seq.fetch_add(n, Ordering::SeqCst) + 1
    }

    /// Cooperative slowdown when compaction is behind.
    fn apply_backpressure(&self) {
        let debt = self.compactor.debt_bytes();
        if debt > BACKPRESSURE_DEBT_BYTES {
            let delay = Duration::from_micros(debt / 1024).min(BACKPRESSURE_MAX);
            self.metrics.backpressure_waits.fetch_add(1, Ordering::Relaxed);
            debug!(debt, ?delay, "backpressure");
            thread::sleep(delay);
        }
    }

    /// The transactional commit path (§ write path in the module docs).
    fn commit_batch(
        &self,
        ops: Vec<RawOp>,
        require_sequence_at_least: Option<u64>,
    ) -> Result<u64, StoreError> {
        if ops.is_empty() {
            return Ok(self.seq.load(Ordering::SeqCst));
        }

        self.apply_backpressure();

        let mut write = self.write_half()?;

        if let Some(required) = require_sequence_at_least {
            let current = self.seq.load(Ordering::SeqCst);
            if current < required {
                return Err(StoreError::SequenceTooLow { required, current });
            }
        }

        // Validate unique constraints per collection, under the batch's
        // cumulative effect, before anything is written.
        let mut by_collection: BTreeMap<&str, Vec<RawOp>> = BTreeMap::new();
        for op in &ops {
            by_collection
                .entry(op.collection.as_str())
                .or_default()
                .push(op.clone());
        }
        for (name, collection_ops) in &by_collection {
            self.hooks_for(name)?.validate(collection_ops)?;
        }

        let first_seq = self.allocate_sequences(ops.len() as u64);
        let txid = Uuid::new_v4();

        write
            .wal
            .append(0, &WalPayload::Tx(TxFrame::Begin { txid }))?;
        for (i, op) in ops.iter().enumerate() {
            let seq = first_seq + i as u64;
            let key = keys::base_key(&op.collection, &op.id_json);
            write.wal.append(
                seq,
                &WalPayload::Tx(TxFrame::Op {
                    txid,
                    key,
                    value: Some(op.value.clone()),
                }),
            )?;
        }
        crash::check("wal_append")?;
        write
            .wal
            .append(0, &WalPayload::Tx(TxFrame::Commit { txid }))?;
        write.wal.sync()?;
        crash::check("wal_fsync")?;

        self.apply_ops(&mut write, &ops, first_seq)?;

        self.metrics.batches.fetch_add(1, Ordering::Relaxed);
        let last_seq = first_seq + ops.len() as u64 - 1;

        if write.memtable.is_over_limit() {
            self.flush_locked(&mut write)?;
        }

        Ok(last_seq)
    }

    /// Single-operation commit through a legacy one-frame WAL record.
    pub(crate) fn commit_single(
        &self,
        collection: &str,
        id_json: Vec<u8>,
        value: Option<Vec<u8>>,
    ) -> Result<u64, StoreError> {
        self.apply_backpressure();

        let mut write = self.write_half()?;

        let op = RawOp {
            collection: collection.to_string(),
            id_json,
            value,
        };
        self.hooks_for(collection)?.validate(std::slice::from_ref(&op))?;

        let seq = self.allocate_sequences(1);
        let key = keys::base_key(collection, &op.id_json);
        write.wal.append(
            seq,
            &WalPayload::Legacy(LegacyOp {
                key,
                value: op.value.clone(),
            }),
        )?;
        crash::check("wal_append")?;
        write.wal.sync()?;
        crash::check("wal_fsync")?;

        self.apply_ops(&mut write, std::slice::from_ref(&op), seq)?;
        self.metrics.batches.fetch_add(1, Ordering::Relaxed);

        if write.memtable.is_over_limit() {
            self.flush_locked(&mut write)?;
        }
        Ok(seq)
    }

    /// Applies committed ops to the memtable and the collection hooks.
    fn apply_ops(
        &self,
        write: &mut WriteHalf,
        ops: &[RawOp],
        first_seq: u64,
    ) -> Result<(), StoreError> {
        for (i, op) in ops.iter().enumerate() {
            let seq = first_seq + i as u64;
            let key = keys::base_key(&op.collection, &op.id_json);
            write.memtable.put(key, op.value.clone(), seq);
            self.hooks_for(&op.collection)?
                .apply(&op.id_json, op.value.as_deref(), seq)?;

            match &op.value {
                Some(_) => self.metrics.puts.fetch_add(1, Ordering::Relaxed),
                None => self.metrics.deletes.fetch_add(1, Ordering::Relaxed),
            };
        }
        Ok(())
    }

    /// Drains the memtable into a new SSTable and publishes it.
    pub(crate) fn flush_locked(&self, write: &mut WriteHalf) -> Result<(), StoreError> {
        crash::check("memtable_flush")?;
        if write.memtable.is_empty() {
            return Ok(());
        }

        let drained = write.memtable.drain();

        // Composite keys carry the sequence so every version survives.
        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = drained
            .iter()
            .map(|e| {
                (
                    keys::versioned_key(&e.key, e.seq),
                    e.value.clone().unwrap_or_default(),
                )
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let table_id = Uuid::new_v4();
        let table_path = self.options.path.join(format!("{table_id}.sst"));
        SstWriter::new(&table_path).build(&entries)?;

        crash::check("manifest_save")?;
        let current_seq = self.seq.load(Ordering::SeqCst);
        self.manifest.update(|m| {
            m.sequence = current_seq;
            m.tables
                .insert(table_id, table_path.to_string_lossy().into_owned());
        })?;

        let table = Arc::new(SSTable::open(
            &table_path,
            table_id,
            Arc::clone(&self.cache),
        )?);
        self.tables
            .write()
            .map_err(|_| StoreError::Internal("tables lock poisoned".into()))?
            .insert(table_id, table);

        if let Err(e) = write.wal.gc(current_seq) {
            warn!(error = %e, "WAL gc failed after flush");
        }

        write.memtable.notify_flush(&drained);
        self.metrics.flushes.fetch_add(1, Ordering::Relaxed);
        self.schedule_compaction();

        info!(
            table = %table_id,
            entries = entries.len(),
            sequence = current_seq,
            "memtable flushed"
        );
        Ok(())
    }

    /// Raw versioned lookup for ids that never entered in-memory history:
    /// memtable first, then every table, newest visible version wins.
    pub(crate) fn lookup_raw(
        &self,
        collection: &str,
        id_json: &[u8],
        max_seq: u64,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let base = keys::base_key(collection, id_json);

        let mut best: Option<(u64, Option<Vec<u8>>)> = None;
        {
            let write = self.write_half()?;
            if let Some((value, seq)) = write.memtable.get_at(&base, max_seq) {
                best = Some((seq, value.map(<[u8]>::to_vec)));
            }
        }

        let mut prefix = base.clone();
        prefix.push(0x00);
        let tables = self
            .tables
            .read()
            .map_err(|_| StoreError::Internal("tables lock poisoned".into()))?;
        for table in tables.values() {
            for (key, value) in table.scan_prefix(&prefix)? {
                let (_, seq) = keys::strip_seq(&key);
                let Some(seq) = seq else { continue };
                if seq > max_seq {
                    continue;
                }
                if best.as_ref().map_or(true, |(s, _)| seq > *s) {
                    best = Some((seq, if value.is_empty() { None } else { Some(value) }));
                }
            }
        }

        Ok(best.and_then(|(_, value)| value))
    }

    /// Persists (or replaces) an index definition in the manifest catalog.
    pub(crate) fn persist_index_def(&self, collection: &str, def: IndexDef) -> Result<(), StoreError> {
        self.manifest.update(|m| {
            let defs = m.index_catalog.entry(collection.to_string()).or_default();
            defs.retain(|d| d.name != def.name);
            defs.push(def);
        })?;
        Ok(())
    }

    /// Reconciles the open-table map with the manifest after a table swap:
    /// retired tables are dropped, newly merged ones are opened.
    fn sync_tables_with_manifest(&self) -> Result<(), StoreError> {
        let mut tables = self
            .tables
            .write()
            .map_err(|_| StoreError::Internal("tables lock poisoned".into()))?;
        // Manifest is read under the table lock: a concurrent flush updates
        // the manifest before it inserts its table, so reading here can
        // never observe a map entry the manifest does not yet know about.
        let data = self.manifest.read();

        tables.retain(|id, _| data.tables.contains_key(id));
        for (id, path) in &data.tables {
            if !tables.contains_key(id) {
                tables.insert(*id, Arc::new(SSTable::open(path, *id, Arc::clone(&self.cache))?));
            }
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Compaction worker
    // --------------------------------------------------------------------------------------------

    fn schedule_compaction(&self) {
        if !self.options.auto_compact {
            return;
        }
        if let Some(tx) = self
            .compaction_tx
            .lock()
            .expect("compaction tx lock poisoned")
            .as_ref()
        {
            let _ = tx.send(());
        }
    }

    fn stop_compaction_worker(&self) {
        self.compaction_tx
            .lock()
            .expect("compaction tx lock poisoned")
            .take();
        if let Some(handle) = self
            .compaction_worker
            .lock()
            .expect("compaction worker lock poisoned")
            .take()
        {
            // The worker's transient Arc upgrade can make it the thread
            // that runs this drop; never join ourselves.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

/// Spawns the dedicated compaction worker. It holds only a `Weak` back
/// reference: ticks must not keep a closed store alive.
fn start_compaction_worker(inner: &Arc<StoreInner>) {
    let (tx, rx) = channel::unbounded::<()>();
    let compactor = Arc::clone(&inner.compactor);
    let weak = Arc::downgrade(inner);

    let handle = thread::Builder::new()
        .name("codexdb-compaction".into())
        .spawn(move || {
            while rx.recv().is_ok() {
                // Collapse a burst of ticks into one pass.
                while rx.try_recv().is_ok() {}
                match compactor.tick() {
                    Ok(true) => {
                        if let Some(inner) = weak.upgrade() {
                            if let Err(e) = inner.sync_tables_with_manifest() {
                                warn!(error = %e, "table sync after compaction failed");
                            }
                        }
                    }
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "compaction tick failed"),
                }
            }
        })
        .expect("failed to spawn compaction worker");

    *inner
        .compaction_tx
        .lock()
        .expect("compaction tx lock poisoned") = Some(tx);
    *inner
        .compaction_worker
        .lock()
        .expect("compaction worker lock poisoned") = Some(handle);
}

// ------------------------------------------------------------------------------------------------
// Recovery helpers
// ------------------------------------------------------------------------------------------------

/// Applies replayed WAL frames: transactional frames buffer until their
/// COMMIT, sequences the manifest already covers are discarded, legacy
/// frames apply immediately. Returns the highest applied sequence.
fn replay_frames(
    frames: Vec<WalFrame>,
    manifest_seq: u64,
    memtable: &mut Memtable,
    bootstrap: &mut HashMap<String, Vec<BootstrapEntry>>,
) -> u64 {
    let mut pending: HashMap<Uuid, Vec<(u64, Vec<u8>, Option<Vec<u8>>)>> = HashMap::new();
    let mut max_seq = manifest_seq;

    let mut apply = |key: &[u8], value: Option<Vec<u8>>, seq: u64,
                     memtable: &mut Memtable,
                     max_seq: &mut u64| {
        let Some(parsed) = keys::parse_key(key) else {
            warn!("skipping undecodable key during WAL replay");
            return;
        };
        let collection = String::from_utf8_lossy(parsed.collection).into_owned();
        bootstrap
            .entry(collection)
            .or_default()
            .push(BootstrapEntry {
                id_json: parsed.id_json.to_vec(),
                value: value.clone(),
                seq,
            });
        memtable.put(key.to_vec(), value, seq);
        *max_seq = (*max_seq).max(seq);
    };

    for frame in frames {
        match frame.payload {
            WalPayload::Tx(TxFrame::Begin { txid }) => {
                pending.insert(txid, Vec::new());
            }
            WalPayload::Tx(TxFrame::Op { txid, key, value }) => {
                if frame.seq <= manifest_seq {
                    continue; // already materialized in an SSTable
                }
                let value = value.flatten();
                match pending.get_mut(&txid) {
                    Some(buffer) => buffer.push((frame.seq, key, value)),
                    // No live BEGIN: treat as committed (legacy path).
                    None => apply(&key, value, frame.seq, memtable, &mut max_seq),
                }
            }
            WalPayload::Tx(TxFrame::Commit { txid }) => {
                if let Some(mut buffer) = pending.remove(&txid) {
                    buffer.sort_by_key(|(seq, _, _)| *seq);
                    for (seq, key, value) in buffer {
                        apply(&key, value, seq, memtable, &mut max_seq);
                    }
                }
            }
            WalPayload::Legacy(op) => {
                if frame.seq > manifest_seq {
                    apply(&op.key, op.value, frame.seq, memtable, &mut max_seq);
                }
            }
        }
    }

    // Un-committed buffers in `pending` are dropped: they contribute no
    // visible state.
    max_seq
}

/// Unlinks `.sst` files the manifest does not reference (in-flight flush
/// output from a crash, or tables retired without unlink).
fn remove_orphan_tables(
    dir: &Path,
    referenced: &BTreeMap<Uuid, String>,
) -> Result<(), StoreError> {
    let referenced_paths: std::collections::BTreeSet<PathBuf> =
        referenced.values().map(PathBuf::from).collect();

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|e| e == "sst") && !referenced_paths.contains(&path) {
            warn!(path = %path.display(), "removing orphan SSTable");
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}
