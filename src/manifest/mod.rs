//! Manifest Component
//!
//! The manifest is the durable catalog of the store: the last durable
//! sequence number, the set of live SSTables, and the secondary-index
//! catalog per collection. It is the authority that recovery, flushes, WAL
//! garbage collection, and compaction all coordinate through.
//!
//! ## Durability strategy
//!
//! The manifest is a single JSON document, kept human-readable on purpose —
//! its format is part of the store's external interface:
//!
//! ```json
//! {
//!   "sequence": 42,
//!   "tables": { "<uuid>": "<path>.sst" },
//!   "indexCatalog": { "users": [ { "name": "email", "kind": "unique" } ] }
//! }
//! ```
//!
//! Every save is atomic: serialize, write `MANIFEST.json.tmp`, fsync, unlink
//! any prior `MANIFEST.json`, rename the temporary into place. Readers see
//! either the old or the new catalog, never a torn one.
//!
//! A missing manifest on open yields the initial empty state; a manifest
//! that fails to decode is a fatal [`ManifestError::Corrupt`].
//!
//! ## Thread safety
//!
//! The in-memory copy sits behind a `Mutex`; the store and the compactor
//! share one [`Manifest`] through an `Arc` and mutate it only through
//! [`Manifest::update`], which persists atomically before returning.


use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::index::IndexDef;

/// Manifest file name inside the store directory.
pub const MANIFEST_FILE: &str = "MANIFEST.json";

const MANIFEST_TMP: &str = "MANIFEST.json.tmp";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by manifest operations.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The on-disk manifest exists but does not decode.
    #[error("corrupt manifest: {0}")]
    Corrupt(String),

    /// JSON serialization failure on save.
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Catalog data
// ------------------------------------------------------------------------------------------------

/// The manifest document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ManifestData {
    /// Last durable sequence: ≥ the max sequence materialized in SSTables.
    pub sequence: u64,

    /// Live tables: id → path (relative to the store directory or absolute).
    #[serde(default)]
    pub tables: BTreeMap<Uuid, String>,

    /// Secondary-index catalog per collection.
    #[serde(default, rename = "indexCatalog")]
    pub index_catalog: BTreeMap<String, Vec<IndexDef>>,
}

/// Durable manifest handle shared by the store and the compactor.
#[derive(Debug)]
pub struct Manifest {
    /// Store directory; the manifest lives at `dir/MANIFEST.json`.
    dir: PathBuf,

    /// In-memory copy of the catalog.
    data: Mutex<ManifestData>,
}

impl Manifest {
    /// Opens the manifest in `dir`, loading the existing document or
    /// starting from the empty state when none exists.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let dir = dir.as_ref().to_path_buf();
        let path = dir.join(MANIFEST_FILE);

        let data = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<ManifestData>(&bytes)
                .map_err(|e| ManifestError::Corrupt(e.to_string()))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(dir = %dir.display(), "no manifest found, starting empty");
                ManifestData::default()
            }
            Err(e) => return Err(ManifestError::Io(e)),
        };

        debug!(
            sequence = data.sequence,
            tables = data.tables.len(),
            "manifest loaded"
        );

        Ok(Self {
            dir,
            data: Mutex::new(data),
        })
    }

    /// Returns a copy of the current catalog.
    pub fn read(&self) -> ManifestData {
        self.data.lock().expect("manifest mutex poisoned").clone()
    }

    /// Current durable sequence.
    pub fn sequence(&self) -> u64 {
        self.data.lock().expect("manifest mutex poisoned").sequence
    }

    /// Applies a mutation and persists the result atomically. The in-memory
    /// copy is only updated once the rename has succeeded, so a failed save
    /// leaves the previous catalog in force.
    pub fn update<F>(&self, mutate: F) -> Result<ManifestData, ManifestError>
    where
        F: FnOnce(&mut ManifestData),
    {
        let mut guard = self
            .data
            .lock()
            .map_err(|_| ManifestError::Internal("manifest mutex poisoned".into()))?;

        let mut next = guard.clone();
        mutate(&mut next);
        save_atomic(&self.dir, &next)?;
        *guard = next.clone();
        Ok(next)
    }

    /// Replaces the whole catalog (backup restore) and persists it.
    pub fn replace(&self, data: ManifestData) -> Result<(), ManifestError> {
        let mut guard = self
            .data
            .lock()
            .map_err(|_| ManifestError::Internal("manifest mutex poisoned".into()))?;
        save_atomic(&self.dir, &data)?;
        *guard = data;
        Ok(())
    }

    /// Path of the manifest document.
    pub fn path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }
}

/// Serialize → write tmp → fsync → unlink prior → rename into place.
fn save_atomic(dir: &Path, data: &ManifestData) -> Result<(), ManifestError> {
    let bytes = serde_json::to_vec_pretty(data)?;

    let tmp = dir.join(MANIFEST_TMP);
    let target = dir.join(MANIFEST_FILE);

    {
        use std::io::Write;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }

    if target.exists() {
        fs::remove_file(&target)?;
    }
    fs::rename(&tmp, &target)?;

    debug!(sequence = data.sequence, tables = data.tables.len(), "manifest saved");
    Ok(())
}
