use std::path::Path;
use std::sync::Arc;

use uuid::Uuid;

use crate::cache::BlockCache;
use crate::sstable::{SSTable, SstWriter};

/// Builds a table from `(key, value)` string pairs and opens it with a
/// generous cache.
pub fn build_table(path: &Path, entries: &[(&str, &str)]) -> SSTable {
    let mut owned: Vec<(Vec<u8>, Vec<u8>)> = entries
        .iter()
        .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec()))
        .collect();
    owned.sort();

    SstWriter::new(path).build(&owned).expect("build");
    SSTable::open(path, Uuid::new_v4(), Arc::new(BlockCache::new(1 << 20))).expect("open")
}

/// Entries large enough that a handful of them span multiple 4 KiB blocks.
pub fn multi_block_entries(count: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
    (0..count)
        .map(|i| {
            (
                format!("key-{i:05}").into_bytes(),
                vec![b'v'; 512 + (i % 7) * 64],
            )
        })
        .collect()
}
