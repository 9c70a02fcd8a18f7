//! Compaction Module
//!
//! Background merging of overlapping SSTables into fewer, larger runs,
//! bounding read amplification and reclaiming obsolete versions.
//!
//! ## Policy
//!
//! Each table is assigned a **virtual level** from its file size
//! (`⌊log₂(max(1, size / 256 KiB))⌋`, clamped to 0), tables are grouped by
//! overlapping key ranges, and one of two modes picks up to two groups per
//! tick:
//!
//! - **L0 pressure mode** — when more than four L0 tables exist and at least
//!   one group is L0-only, take such groups largest first (singleton groups
//!   included).
//! - **Default mode** — take overlapping groups with more than one member.
//!
//! A chosen group is merged by reading every entry, stable-sorting by
//! composite key (exact duplicates keep the later input), writing one new
//! table, swapping the manifest, and unlinking the inputs.
//!
//! ## Version retention
//!
//! Composite keys embed sequences, so merging never collapses distinct
//! versions of a document. Whole ids are coalesced away only when no live
//! snapshot is registered, the id's newest merged version is a tombstone
//! with `seq ≤ manifest.sequence`, and no table outside the group can still
//! hold versions of that id.
//!
//! ## Debt and backpressure
//!
//! `debt_bytes` is zero until L0 holds more than four tables, then the sum
//! of L0 sizes excluding the four smallest. The store consults it before
//! admitting writes and sleeps briefly when the compactor is behind.
//!
//! Ticks are single-flight: a re-entry guard makes concurrent `tick` calls
//! no-ops, and the store feeds ticks to a dedicated worker thread through a
//! crossbeam channel.


use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::BlockCache;
use crate::keys;
use crate::manifest::{Manifest, ManifestError};
use crate::sstable::{SSTable, SstError, SstWriter};
use crate::store::snapshot::SnapshotRegistry;

/// Size of one virtual level step.
const LEVEL_BASE_BYTES: u64 = 256 * 1024;

/// L0 table count above which debt accrues and pressure mode may engage.
const L0_HEALTHY_TABLES: usize = 4;

/// Groups merged per tick, at most.
const GROUPS_PER_TICK: usize = 2;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by compaction.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Manifest load/save failure.
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// SSTable read/write failure.
    #[error("SSTable error: {0}")]
    Sst(#[from] SstError),
}

// ------------------------------------------------------------------------------------------------
// Status types
// ------------------------------------------------------------------------------------------------

/// Per-level table statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelStatus {
    /// Virtual level number.
    pub level: u32,

    /// Tables at this level.
    pub tables: usize,

    /// Total file bytes at this level.
    pub size_bytes: u64,
}

/// Snapshot of compactor state.
#[derive(Debug, Clone)]
pub struct CompactionStatus {
    /// `true` while a tick is merging.
    pub running: bool,

    /// Tables sitting in currently-eligible merge groups.
    pub pending_tables: usize,

    /// Level breakdown of the live table set.
    pub levels: Vec<LevelStatus>,

    /// Backpressure debt (see module docs).
    pub debt_bytes: u64,
}

// ------------------------------------------------------------------------------------------------
// Compactor
// ------------------------------------------------------------------------------------------------

/// Background merger of overlapping SSTables.
pub struct Compactor {
    /// Store directory (new tables are written here).
    dir: PathBuf,

    /// Shared catalog; table swaps happen through it.
    manifest: Arc<Manifest>,

    /// Shared block cache (retired tables are evicted).
    cache: Arc<BlockCache>,

    /// Live snapshots; bounds version reclamation.
    snapshots: Arc<SnapshotRegistry>,

    /// Re-entry guard.
    running: AtomicBool,

    /// Completed merge-producing ticks.
    runs: AtomicU64,
}

/// One live table with the metadata grouping needs.
struct TableInfo {
    table: SSTable,
    size: u64,
    level: u32,
    first_key: Vec<u8>,
    last_key: Vec<u8>,
}

impl Compactor {
    /// Creates a compactor over the given store directory and shared state.
    pub fn new(
        dir: impl AsRef<Path>,
        manifest: Arc<Manifest>,
        cache: Arc<BlockCache>,
        snapshots: Arc<SnapshotRegistry>,
    ) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            manifest,
            cache,
            snapshots,
            running: AtomicBool::new(false),
            runs: AtomicU64::new(0),
        }
    }

    /// Runs one compaction tick. Returns `true` when at least one group was
    /// merged; concurrent calls are no-ops.
    pub fn tick(&self) -> Result<bool, CompactionError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        let result = self.tick_inner();
        self.running.store(false, Ordering::SeqCst);
        result
    }

    fn tick_inner(&self) -> Result<bool, CompactionError> {
        let data = self.manifest.read();
        if data.tables.len() < 2 {
            return Ok(false);
        }

        let infos = self.load_tables(&data.tables)?;
        let groups = overlapping_groups(&infos);
        let chosen = choose_groups(&infos, &groups);
        if chosen.is_empty() {
            debug!(tables = infos.len(), "compaction tick found nothing to do");
            return Ok(false);
        }

        let mut merged_any = false;
        for group in chosen {
            self.merge_group(&infos, &group, data.sequence)?;
            merged_any = true;
        }

        if merged_any {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
        Ok(merged_any)
    }

    /// Merges one group: read → stable sort → dedup → retention → write →
    /// manifest swap → unlink inputs.
    fn merge_group(
        &self,
        infos: &[TableInfo],
        group: &[usize],
        manifest_seq: u64,
    ) -> Result<(), CompactionError> {
        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        for &idx in group {
            entries.extend(infos[idx].table.scan()?);
        }

        // Stable sort keeps input order among exact duplicates; last-in wins.
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let mut deduped: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(entries.len());
        for entry in entries {
            match deduped.last() {
                Some(last) if last.0 == entry.0 => {
                    *deduped.last_mut().expect("non-empty") = entry;
                }
                _ => deduped.push(entry),
            }
        }

        let outside: Vec<&TableInfo> = infos
            .iter()
            .enumerate()
            .filter(|(i, _)| !group.contains(i))
            .map(|(_, info)| info)
            .collect();
        let output = self.apply_retention(deduped, &outside, manifest_seq);
        let removed: Vec<Uuid> = group.iter().map(|&i| infos[i].table.id).collect();

        // Retention can empty a group outright (every id tombstoned and
        // covered); the inputs are then simply retired.
        if output.is_empty() {
            self.manifest.update(|m| {
                for id in &removed {
                    m.tables.remove(id);
                }
            })?;
        } else {
            let new_id = Uuid::new_v4();
            let new_path = self.dir.join(format!("{new_id}.sst"));
            SstWriter::new(&new_path).build(&output)?;
            self.manifest.update(|m| {
                for id in &removed {
                    m.tables.remove(id);
                }
                m.tables
                    .insert(new_id, new_path.to_string_lossy().into_owned());
            })?;
        }

        for &idx in group {
            let info = &infos[idx];
            self.cache.evict_table(&info.table.id);
            if let Err(e) = fs::remove_file(info.table.path()) {
                warn!(path = %info.table.path().display(), error = %e, "failed to unlink retired table");
            }
        }

        info!(
            inputs = group.len(),
            entries = output.len(),
            "compaction group merged"
        );
        Ok(())
    }

    /// Drops ids that are provably dead: newest merged version is a
    /// tombstone at or below the manifest sequence, no snapshot is live,
    /// and no table outside the group may still hold the id.
    fn apply_retention(
        &self,
        merged: Vec<(Vec<u8>, Vec<u8>)>,
        outside: &[&TableInfo],
        manifest_seq: u64,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        if self.snapshots.min_live().is_some() {
            return merged;
        }

        // Newest version per base key. Versioned keys sort by sequence
        // within an id, so the last entry of a base-key run is newest.
        let mut dead_ids: Vec<Vec<u8>> = Vec::new();
        let mut i = 0;
        while i < merged.len() {
            let (base, _) = keys::strip_seq(&merged[i].0);
            let base = base.to_vec();
            let mut last = i;
            while last + 1 < merged.len() {
                let (next_base, _) = keys::strip_seq(&merged[last + 1].0);
                if next_base != base.as_slice() {
                    break;
                }
                last += 1;
            }

            let (_, newest_seq) = keys::strip_seq(&merged[last].0);
            let newest_is_tombstone = merged[last].1.is_empty();
            let covered = newest_seq.map_or(false, |s| s <= manifest_seq);
            let escapes_group = outside.iter().any(|info| {
                let mut probe_hi = base.clone();
                probe_hi.push(0x01);
                info.first_key.as_slice() <= probe_hi.as_slice()
                    && base.as_slice() <= info.last_key.as_slice()
            });

            if newest_is_tombstone && covered && !escapes_group {
                dead_ids.push(base);
            }
            i = last + 1;
        }

        if dead_ids.is_empty() {
            return merged;
        }

        debug!(ids = dead_ids.len(), "coalescing fully-tombstoned ids");
        merged
            .into_iter()
            .filter(|(key, _)| {
                let (base, _) = keys::strip_seq(key);
                dead_ids.iter().all(|dead| dead.as_slice() != base)
            })
            .collect()
    }

    /// Current status: levels, eligible groups, debt.
    pub fn status(&self) -> CompactionStatus {
        let data = self.manifest.read();
        let running = self.running.load(Ordering::SeqCst);

        let (levels, debt_bytes) = levels_and_debt(&data.tables);

        let pending_tables = match self.load_tables(&data.tables) {
            Ok(infos) => {
                let groups = overlapping_groups(&infos);
                choose_groups(&infos, &groups)
                    .iter()
                    .map(|g| g.len())
                    .sum()
            }
            Err(_) => 0,
        };

        CompactionStatus {
            running,
            pending_tables,
            levels,
            debt_bytes,
        }
    }

    /// Backpressure debt, computed from file metadata only.
    pub fn debt_bytes(&self) -> u64 {
        let data = self.manifest.read();
        levels_and_debt(&data.tables).1
    }

    /// Completed merge-producing ticks.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }

    /// Opens every live table that has a non-empty key range.
    fn load_tables(
        &self,
        tables: &std::collections::BTreeMap<Uuid, String>,
    ) -> Result<Vec<TableInfo>, CompactionError> {
        let mut infos = Vec::with_capacity(tables.len());
        for (id, path) in tables {
            let table = SSTable::open(path, *id, Arc::clone(&self.cache))?;
            let size = table.file_size();
            let Some((first_key, last_key)) = table.key_range()? else {
                continue;
            };
            infos.push(TableInfo {
                table,
                size,
                level: level_for_size(size),
                first_key,
                last_key,
            });
        }
        Ok(infos)
    }
}

// ------------------------------------------------------------------------------------------------
// Policy helpers
// ------------------------------------------------------------------------------------------------

/// Virtual level from file size: `⌊log₂(max(1, size / 256 KiB))⌋`.
fn level_for_size(size: u64) -> u32 {
    (size / LEVEL_BASE_BYTES).max(1).ilog2()
}

/// Groups table indices by overlapping key ranges, after sorting by lower
/// bound.
fn overlapping_groups(infos: &[TableInfo]) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..infos.len()).collect();
    order.sort_by(|&a, &b| infos[a].first_key.cmp(&infos[b].first_key));

    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut current_max: Vec<u8> = Vec::new();

    for idx in order {
        if current.is_empty() || infos[idx].first_key <= current_max {
            if infos[idx].last_key > current_max {
                current_max = infos[idx].last_key.clone();
            }
            current.push(idx);
        } else {
            groups.push(std::mem::take(&mut current));
            current_max = infos[idx].last_key.clone();
            current.push(idx);
        }
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

/// Applies the two-mode policy, returning up to two groups to merge.
fn choose_groups(infos: &[TableInfo], groups: &[Vec<usize>]) -> Vec<Vec<usize>> {
    let l0_count = infos.iter().filter(|t| t.level == 0).count();

    // Unlike default mode, pressure mode has no member floor: singleton L0
    // groups are rewritten too, so a pile-up of disjoint tiny tables still
    // drains (and reclaims tombstoned ids on the way).
    let mut l0_only: Vec<Vec<usize>> = groups
        .iter()
        .filter(|g| g.iter().all(|&i| infos[i].level == 0))
        .cloned()
        .collect();

    if l0_count > L0_HEALTHY_TABLES && !l0_only.is_empty() {
        // Pressure mode: biggest L0 pile-ups first.
        l0_only.sort_by_key(|g| {
            std::cmp::Reverse(g.iter().map(|&i| infos[i].size).sum::<u64>())
        });
        l0_only.truncate(GROUPS_PER_TICK);
        return l0_only;
    }

    groups
        .iter()
        .filter(|g| g.len() > 1)
        .take(GROUPS_PER_TICK)
        .cloned()
        .collect()
}

/// Level breakdown plus debt from file sizes alone.
fn levels_and_debt(
    tables: &std::collections::BTreeMap<Uuid, String>,
) -> (Vec<LevelStatus>, u64) {
    let mut sizes: Vec<u64> = Vec::with_capacity(tables.len());
    for path in tables.values() {
        if let Ok(meta) = fs::metadata(path) {
            sizes.push(meta.len());
        }
    }

    let mut by_level: std::collections::BTreeMap<u32, (usize, u64)> =
        std::collections::BTreeMap::new();
    let mut l0_sizes: Vec<u64> = Vec::new();
    for &size in &sizes {
        let level = level_for_size(size);
        let entry = by_level.entry(level).or_insert((0, 0));
        entry.0 += 1;
        entry.1 += size;
        if level == 0 {
            l0_sizes.push(size);
        }
    }

    let levels = by_level
        .into_iter()
        .map(|(level, (tables, size_bytes))| LevelStatus {
            level,
            tables,
            size_bytes,
        })
        .collect();

    let debt = if l0_sizes.len() > L0_HEALTHY_TABLES {
        l0_sizes.sort_unstable();
        l0_sizes[L0_HEALTHY_TABLES..].iter().sum()
    } else {
        0
    };

    (levels, debt)
}
