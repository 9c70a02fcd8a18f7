pub mod helpers;
mod tests_backup;
mod tests_compaction;
mod tests_snapshots;
mod tests_wal_rotation;
