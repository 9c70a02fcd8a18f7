//! Backup and restore.
//!
//! A backup is a self-contained bundle under `backups/<uuid>/`: the
//! manifest, the active WAL file, every SSTable the manifest references,
//! and a `backup.json` descriptor. Creation quiesces the store (the write
//! half serializes everything), syncs and flushes so the manifest covers
//! all committed state, then copies files.
//!
//! Restore is the inverse: current tables are dropped, the bundle's tables
//! are copied back in, the manifest is rewritten with table paths repointed
//! to their restored locations (ids, sequence, and index catalog
//! preserved), the active WAL is replaced verbatim, and in-memory state —
//! memtable, bootstrap buffers, every registered collection — is rebuilt
//! from the restored files.

use std::{
    fs,
    path::PathBuf,
    sync::{atomic::Ordering, Arc},
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::{BootstrapEntry, Store, StoreError, StoreInner};
use crate::keys;
use crate::manifest::{ManifestData, MANIFEST_FILE};
use crate::memtable::Memtable;
use crate::sstable::SSTable;
use crate::wal;

/// Directory (under the store path) that holds backup bundles.
pub const BACKUPS_DIR: &str = "backups";

const BACKUP_DESCRIPTOR: &str = "backup.json";

/// Descriptor of one backup bundle (`backup.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupInfo {
    /// Backup id (the bundle directory name).
    pub id: Uuid,

    /// Creation time, ISO-8601.
    #[serde(rename = "createdAt")]
    pub created_at: String,

    /// Optional operator note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,

    /// Total bytes copied into the bundle.
    #[serde(rename = "sizeBytes")]
    pub size_bytes: u64,
}

impl Store {
    /// Creates a backup of the current durable state and returns its
    /// descriptor.
    pub fn create_backup(&self, note: Option<&str>) -> Result<BackupInfo, StoreError> {
        let inner = &self.inner;
        let mut write = inner.write_half()?;

        // Quiesce: everything committed becomes table-covered state.
        write.wal.sync()?;
        inner.flush_locked(&mut write)?;
        write.wal.sync()?;

        let id = Uuid::new_v4();
        let bundle = inner.options.path.join(BACKUPS_DIR).join(id.to_string());
        fs::create_dir_all(&bundle)?;

        let mut size_bytes = 0u64;
        size_bytes += copy_into(&inner.manifest.path(), &bundle)?;
        size_bytes += copy_into(&write.wal.active_path(), &bundle)?;
        for (table_id, path) in &inner.manifest.read().tables {
            size_bytes += copy_as(path.as_ref(), &bundle, &format!("{table_id}.sst"))?;
        }

        let info = BackupInfo {
            id,
            created_at: Utc::now().to_rfc3339(),
            note: note.map(str::to_string),
            size_bytes,
        };
        fs::write(
            bundle.join(BACKUP_DESCRIPTOR),
            serde_json::to_vec_pretty(&info)?,
        )?;

        info!(backup = %id, size_bytes, "backup created");
        Ok(info)
    }

    /// Descriptors of every backup bundle on disk.
    pub fn list_backups(&self) -> Result<Vec<BackupInfo>, StoreError> {
        let root = self.inner.options.path.join(BACKUPS_DIR);
        let mut out = Vec::new();

        let entries = match fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(StoreError::Io(e)),
        };
        for entry in entries {
            let descriptor = entry?.path().join(BACKUP_DESCRIPTOR);
            if !descriptor.exists() {
                continue;
            }
            let bytes = fs::read(&descriptor)?;
            match serde_json::from_slice::<BackupInfo>(&bytes) {
                Ok(info) => out.push(info),
                Err(e) => {
                    warn!(path = %descriptor.display(), error = %e, "skipping undecodable backup descriptor")
                }
            }
        }

        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    /// Restores the store to the state captured by backup `id`.
    ///
    /// Process-local snapshots taken before the restore are void; documents
    /// and index definitions come back exactly as the backup saw them.
    pub fn restore_backup(&self, id: Uuid) -> Result<(), StoreError> {
        let inner = &self.inner;
        let bundle = inner.options.path.join(BACKUPS_DIR).join(id.to_string());
        if !bundle.join(BACKUP_DESCRIPTOR).exists() {
            return Err(StoreError::NotFound(format!("backup {id}")));
        }

        let backup_manifest: ManifestData =
            serde_json::from_slice(&fs::read(bundle.join(MANIFEST_FILE))?)
                .map_err(|e| StoreError::Corrupt(format!("backup manifest: {e}")))?;

        let mut write = inner.write_half()?;

        // 1. Drop the current table set.
        {
            let mut tables = inner
                .tables
                .write()
                .map_err(|_| StoreError::Internal("tables lock poisoned".into()))?;
            for (table_id, table) in tables.iter() {
                inner.cache.evict_table(table_id);
                if let Err(e) = fs::remove_file(table.path()) {
                    warn!(table = %table_id, error = %e, "failed to unlink table during restore");
                }
            }
            tables.clear();
        }

        // 2. Copy the bundle's tables back and repoint the manifest.
        let mut restored = backup_manifest.clone();
        restored.tables.clear();
        for (table_id, _) in &backup_manifest.tables {
            let file_name = format!("{table_id}.sst");
            let source = bundle.join(&file_name);
            let target = inner.options.path.join(&file_name);
            fs::copy(&source, &target)?;
            restored
                .tables
                .insert(*table_id, target.to_string_lossy().into_owned());
        }
        inner.manifest.replace(restored.clone())?;

        // 3. Replace the active WAL verbatim.
        let wal_bytes = fs::read(bundle.join(wal::ACTIVE_FILE))?;
        write.wal.replace_active(&wal_bytes)?;

        // 4. Rebuild in-memory state from the restored files.
        inner.rebuild_after_restore(&mut write, &restored)?;

        info!(backup = %id, sequence = restored.sequence, "backup restored");
        Ok(())
    }
}

impl StoreInner {
    /// Re-runs the open-time recovery pipeline against restored files and
    /// re-feeds every registered collection.
    fn rebuild_after_restore(
        &self,
        write: &mut std::sync::MutexGuard<'_, super::WriteHalf>,
        restored: &ManifestData,
    ) -> Result<(), StoreError> {
        let mut max_seq = restored.sequence;
        let mut bootstrap: std::collections::HashMap<String, Vec<BootstrapEntry>> =
            std::collections::HashMap::new();

        {
            let mut tables = self
                .tables
                .write()
                .map_err(|_| StoreError::Internal("tables lock poisoned".into()))?;
            for (table_id, path) in &restored.tables {
                let table = Arc::new(SSTable::open(path, *table_id, Arc::clone(&self.cache))?);
                for (key, value) in table.scan()? {
                    let Some(parsed) = keys::parse_key(&key) else {
                        continue;
                    };
                    let seq = parsed.seq.unwrap_or(restored.sequence);
                    max_seq = max_seq.max(seq);
                    bootstrap
                        .entry(String::from_utf8_lossy(parsed.collection).into_owned())
                        .or_default()
                        .push(BootstrapEntry {
                            id_json: parsed.id_json.to_vec(),
                            value: if value.is_empty() { None } else { Some(value) },
                            seq,
                        });
                }
                tables.insert(*table_id, table);
            }
        }

        write.memtable = Memtable::new(self.options.memtable_limit);
        let frames = write.wal.replay()?;
        max_seq = max_seq.max(super::replay_frames(
            frames,
            restored.sequence,
            &mut write.memtable,
            &mut bootstrap,
        ));
        self.seq.store(max_seq, Ordering::SeqCst);

        *self
            .bootstrap
            .lock()
            .map_err(|_| StoreError::Internal("bootstrap lock poisoned".into()))? = bootstrap;

        // Registered collections reload through their ordinary hooks; index
        // declarations (typed projectors included) survive the reset.
        let registry = self
            .collections
            .lock()
            .map_err(|_| StoreError::Internal("collections lock poisoned".into()))?;
        for (name, registered) in registry.iter() {
            registered.hooks.clear();
            let pending = self
                .bootstrap
                .lock()
                .map_err(|_| StoreError::Internal("bootstrap lock poisoned".into()))?
                .remove(name);
            if let Some(mut entries) = pending {
                entries.sort_by_key(|e| e.seq);
                for entry in entries {
                    registered
                        .hooks
                        .apply(&entry.id_json, entry.value.as_deref(), entry.seq)?;
                }
            }
        }

        Ok(())
    }
}

/// Copies `source` into `dir` keeping its file name; returns bytes copied.
fn copy_into(source: &std::path::Path, dir: &std::path::Path) -> Result<u64, StoreError> {
    let name = source
        .file_name()
        .ok_or_else(|| StoreError::Internal(format!("unnamed path {}", source.display())))?;
    Ok(fs::copy(source, dir.join(name))?)
}

/// Copies `source` into `dir` under `name`; returns bytes copied.
fn copy_as(source: &std::path::Path, dir: &std::path::Path, name: &str) -> Result<u64, StoreError> {
    let source = PathBuf::from(source);
    Ok(fs::copy(&source, dir.join(name))?)
}
