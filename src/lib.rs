//! # CodexDB
//!
//! An embeddable, ACID **document store** built on a **log-structured merge
//! tree (LSM)**: typed documents grouped into named collections, durable
//! through a write-ahead log, readable through MVCC snapshots that survive
//! restarts, with secondary indexes maintained atomically alongside base
//! writes.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                          Store                            │
//! │  ┌────────────┐   ┌───────────┐   ┌────────────────────┐  │
//! │  │    WAL     │──►│ Memtable  │──►│  SSTables (disk)   │  │
//! │  │ (segments) │   │ (sorted)  │   │  blocks+bloom+CRC  │  │
//! │  └────────────┘   └───────────┘   └─────────┬──────────┘  │
//! │        ▲                │  flush            │ block cache │
//! │        │ batch commit   ▼                   ▼             │
//! │  ┌─────┴──────────────────────┐   ┌────────────────────┐  │
//! │  │ Collections: history, MVCC │   │ Compactor (2-mode, │  │
//! │  │ unique/multi/fts/vector    │   │ debt, backpressure)│  │
//! │  └────────────────────────────┘   └────────────────────┘  │
//! │  ┌─────────────────────────────────────────────────────┐  │
//! │  │   Manifest (sequence, live tables, index catalog)   │  │
//! │  └─────────────────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`store`] | Orchestrator — open/recover, batch commit, snapshots, flush, backup/restore |
//! | [`collection`] | Typed views — MVCC history, secondary-index maintenance, scans |
//! | [`wal`] | CRC-framed write-ahead log with size-based segment rotation |
//! | [`memtable`] | In-memory sorted multi-version buffer |
//! | [`sstable`] | Immutable sorted tables — 4 KiB CRC blocks, block index, bloom, footer |
//! | [`bloom`] | Compact probabilistic membership filter, serialized per table |
//! | [`cache`] | Byte-bounded LRU block cache |
//! | [`manifest`] | Atomic JSON catalog of tables, sequence, and index definitions |
//! | [`compaction`] | Two-mode background merging with status and debt |
//! | [`index`] | Index kinds, typed projectors, JSON key-path extraction |
//! | [`keys`] | Composite key encoding (`collection ∥ 0x00 ∥ idJSON ∥ 0x00 ∥ seq`) |
//!
//! ## Guarantees
//!
//! - **Atomic batches** — a multi-collection batch is durable as a whole or
//!   leaves no durable effect; WAL frames BEGIN/OP…/COMMIT are synced before
//!   any in-memory apply.
//! - **Crash recovery** — replay truncates torn WAL tails silently, discards
//!   uncommitted transactions, and heals the gap between WAL sync and
//!   memtable apply.
//! - **Persistent MVCC** — SSTable keys embed commit sequences, so a
//!   snapshot's sequence means the same thing after a restart.
//! - **Index atomicity** — unique/multi index versions advance in the same
//!   commit as the base write; unique violations fail the whole batch.
//! - **Corruption detection** — every data block and WAL frame is
//!   CRC-protected; damaged SSTable blocks surface as errors, never as
//!   silently wrong data.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use codexdb::{Document, IndexSpec, Store, StoreOptions};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! struct User {
//!     id: u64,
//!     email: String,
//! }
//!
//! impl Document for User {
//!     type Id = u64;
//!     fn id(&self) -> u64 {
//!         self.id
//!     }
//! }
//!
//! let store = Store::open(StoreOptions::new("/tmp/my_db")).unwrap();
//! let users = store.collection::<User>("users").unwrap();
//!
//! users
//!     .define_index(IndexSpec::unique("email", |u: &User| {
//!         u.email.as_bytes().to_vec()
//!     }))
//!     .unwrap();
//!
//! users
//!     .put(&User { id: 1, email: "a@example.com".into() })
//!     .unwrap();
//!
//! let snap = store.snapshot();
//! users.put(&User { id: 1, email: "b@example.com".into() }).unwrap();
//!
//! // The snapshot still sees the first version.
//! assert_eq!(users.get(&1, Some(&snap)).unwrap().unwrap().email, "a@example.com");
//!
//! store.close().unwrap();
//! ```

pub mod bloom;
pub mod cache;
pub mod collection;
pub mod compaction;
pub mod index;
pub mod keys;
pub mod manifest;
pub mod memtable;
pub mod sstable;
pub mod store;
pub mod wal;

pub use collection::{Collection, Document};
pub use index::{IndexDef, IndexKind, IndexSpec, KeyPath, Projector};
pub use store::{
    BackupInfo, MetricsSnapshot, RawOp, Snapshot, Store, StoreError, StoreOptions,
};
