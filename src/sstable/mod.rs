//! Sorted String Table (SSTable) Module
//!
//! An **immutable**, **disk-backed** sorted run of key-value pairs. SSTables
//! are produced by memtable flushes and compaction, published through the
//! manifest, and never modified in place.
//!
//! Keys at this layer are composite (`collection || 0x00 || idJSON || 0x00 ||
//! seq BE`), so multiple versions of one document sort adjacently and MVCC
//! survives restarts. An empty value is a tombstone.
//!
//! # On-disk layout
//!
//! ```text
//! [DATA_BLOCK_0] ... [DATA_BLOCK_n-1] [BLOCK_INDEX] [BLOOM] [FOOTER_32B]
//! ```
//!
//! - **Data block** — up to 4 KiB of `klen(4 LE) | key | vlen(4 LE) | value`
//!   entries followed by a 4-byte CRC32 trailer over the payload.
//! - **Block index** — `count(4 LE)` then per block
//!   `klen(4 LE) | first_key | offset(8 LE) | length(8 LE)`, where `length`
//!   includes the CRC trailer.
//! - **Bloom** — the serialized filter (see [`crate::bloom`]).
//! - **Footer** — `index_off(8 LE) | index_len(8 LE) | bloom_off(8 LE) |
//!   bloom_len(8 LE)`.
//!
//! # Concurrency model
//!
//! SSTables are immutable, so reads are lock-free; the whole file is
//! memory-mapped read-only and block fetches go through the shared
//! [`BlockCache`](crate::cache::BlockCache).
//!
//! # Guarantees
//!
//! - **Integrity:** every data block carries a CRC32; a mismatch surfaces as
//!   [`SstError::Corrupt`], never as silently wrong data.
//! - **Atomic publication:** the writer builds into a temporary file and
//!   renames it into place.

pub mod builder;

#[cfg(test)]
mod tests;

pub use builder::SstWriter;

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::bloom::BloomFilter;
use crate::cache::{BlockCache, BlockKey};

/// Maximum data-block payload size (excluding the CRC trailer).
pub(crate) const BLOCK_PAYLOAD_MAX: usize = 4096;

/// CRC trailer size appended to each data block.
pub(crate) const BLOCK_TRAILER: usize = 4;

/// Footer size: four 8-byte little-endian fields.
pub(crate) const FOOTER_SIZE: usize = 32;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by SSTable operations.
#[derive(Debug, Error)]
pub enum SstError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// On-disk damage: block CRC mismatch, short footer, malformed index.
    #[error("corrupt SSTable: {0}")]
    Corrupt(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Block index
// ------------------------------------------------------------------------------------------------

/// One block index entry: the block's first key and its file extent.
#[derive(Debug, Clone)]
pub(crate) struct BlockIndexEntry {
    /// First key stored in the block.
    pub(crate) first_key: Vec<u8>,

    /// Byte offset of the block in the file.
    pub(crate) offset: u64,

    /// Block length in bytes, including the CRC trailer.
    pub(crate) length: u64,
}

// ------------------------------------------------------------------------------------------------
// SSTable — immutable reader
// ------------------------------------------------------------------------------------------------

/// A memory-mapped, immutable sorted run.
pub struct SSTable {
    /// Table id assigned by the store (the manifest key and file stem).
    pub id: Uuid,

    /// Path of the backing file.
    path: PathBuf,

    /// Read-only map of the full file.
    mmap: Mmap,

    /// Decoded block index.
    index: Vec<BlockIndexEntry>,

    /// Decoded bloom filter.
    bloom: BloomFilter,

    /// Shared block cache.
    cache: Arc<BlockCache>,
}

impl SSTable {
    /// Opens an SSTable, validating the footer and loading the block index
    /// and bloom filter.
    ///
    /// # Safety
    ///
    /// The `unsafe` mmap is sound because published tables are immutable:
    /// nothing writes to the file after the writer's rename.
    pub fn open(
        path: impl AsRef<Path>,
        id: Uuid,
        cache: Arc<BlockCache>,
    ) -> Result<Self, SstError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < FOOTER_SIZE {
            return Err(SstError::Corrupt(format!(
                "file too short for footer: {} bytes",
                mmap.len()
            )));
        }

        let footer = &mmap[mmap.len() - FOOTER_SIZE..];
        let index_off = read_u64_le(footer, 0);
        let index_len = read_u64_le(footer, 8);
        let bloom_off = read_u64_le(footer, 16);
        let bloom_len = read_u64_le(footer, 24);

        let file_len = mmap.len() as u64;
        if index_off + index_len > file_len || bloom_off + bloom_len > file_len {
            return Err(SstError::Corrupt("footer extents out of range".into()));
        }

        let index = decode_index(&mmap[index_off as usize..(index_off + index_len) as usize])?;
        let bloom = BloomFilter::from_bytes(
            &mmap[bloom_off as usize..(bloom_off + bloom_len) as usize],
        )
        .map_err(|e| SstError::Corrupt(e.to_string()))?;

        debug!(id = %id, path = %path.display(), blocks = index.len(), "SSTable opened");

        Ok(Self {
            id,
            path,
            mmap,
            index,
            bloom,
            cache,
        })
    }

    /// On-disk file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bloom pre-check; `false` means the key is definitely absent.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.bloom.may_contain(key)
    }

    /// Point lookup by exact (composite) key.
    ///
    /// Pipeline: bloom gate → binary search for the greatest block whose
    /// first key ≤ `key` → cached block fetch with CRC verification → linear
    /// scan inside the block, short-circuiting once entries sort past the
    /// target. Corruption is reported, never skipped.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, SstError> {
        if !self.bloom.may_contain(key) {
            return Ok(None);
        }
        let Some(block_idx) = self.block_for_key(key) else {
            return Ok(None);
        };

        let block = self.read_block(block_idx)?;
        for entry in BlockEntries::new(&block) {
            let (entry_key, value) = entry?;
            match entry_key.cmp(key) {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Equal => return Ok(Some(value.to_vec())),
                std::cmp::Ordering::Greater => break,
            }
        }
        Ok(None)
    }

    /// Full scan: every `(key, value)` pair in order, validating each block.
    pub fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, SstError> {
        let mut out = Vec::new();
        for block_idx in 0..self.index.len() {
            let block = self.read_block(block_idx)?;
            for entry in BlockEntries::new(&block) {
                let (key, value) = entry?;
                out.push((key.to_vec(), value.to_vec()));
            }
        }
        Ok(out)
    }

    /// Prefix scan that uses the block index to skip blocks entirely below
    /// or above the prefix range.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, SstError> {
        let mut out = Vec::new();
        if self.index.is_empty() {
            return Ok(out);
        }

        let start = self.block_for_key(prefix).unwrap_or(0);
        for block_idx in start..self.index.len() {
            // A block whose first key already sorts past every key with this
            // prefix cannot contribute.
            let first = &self.index[block_idx].first_key;
            if first.as_slice() > prefix.as_ref() && !first.starts_with(prefix) {
                break;
            }

            let block = self.read_block(block_idx)?;
            for entry in BlockEntries::new(&block) {
                let (key, value) = entry?;
                if key < prefix.as_ref() {
                    continue;
                }
                if !key.starts_with(prefix) {
                    return Ok(out);
                }
                out.push((key.to_vec(), value.to_vec()));
            }
        }
        Ok(out)
    }

    /// First and last keys of the table, for compaction range grouping.
    pub fn key_range(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>, SstError> {
        if self.index.is_empty() {
            return Ok(None);
        }

        let first = self.index[0].first_key.clone();
        let last_block = self.read_block(self.index.len() - 1)?;
        let mut last = None;
        for entry in BlockEntries::new(&last_block) {
            let (key, _) = entry?;
            last = Some(key.to_vec());
        }

        match last {
            Some(last) => Ok(Some((first, last))),
            None => Err(SstError::Corrupt("empty trailing block".into())),
        }
    }

    /// Index of the greatest block whose first key ≤ `key`, or `None` when
    /// the key sorts before the first block.
    fn block_for_key(&self, key: &[u8]) -> Option<usize> {
        if self.index.is_empty() {
            return None;
        }
        match self
            .index
            .binary_search_by(|entry| entry.first_key.as_slice().cmp(key))
        {
            Ok(i) => Some(i),
            Err(0) => None,
            Err(i) => Some(i - 1),
        }
    }

    /// Fetches a block payload through the cache, verifying the CRC trailer
    /// on a miss.
    fn read_block(&self, block_idx: usize) -> Result<Arc<Vec<u8>>, SstError> {
        let entry = &self.index[block_idx];
        let key = BlockKey {
            table: self.id,
            offset: entry.offset,
            length: entry.length,
        };

        if let Some(block) = self.cache.get(&key) {
            return Ok(block);
        }

        let start = entry.offset as usize;
        let end = start + entry.length as usize;
        if end > self.mmap.len() || entry.length < BLOCK_TRAILER as u64 {
            return Err(SstError::Corrupt("block extent out of range".into()));
        }

        let raw = &self.mmap[start..end];
        let payload = &raw[..raw.len() - BLOCK_TRAILER];
        let stored_crc = u32::from_le_bytes(
            raw[raw.len() - BLOCK_TRAILER..]
                .try_into()
                .expect("sliced 4"),
        );

        let mut hasher = Crc32::new();
        hasher.update(payload);
        if hasher.finalize() != stored_crc {
            return Err(SstError::Corrupt(format!(
                "block {} CRC mismatch in {}",
                block_idx,
                self.path.display()
            )));
        }

        let block = Arc::new(payload.to_vec());
        self.cache.put(key, Arc::clone(&block));
        Ok(block)
    }
}

// ------------------------------------------------------------------------------------------------
// In-block entry iteration
// ------------------------------------------------------------------------------------------------

/// Iterator over `klen | key | vlen | value` entries in a block payload.
struct BlockEntries<'a> {
    payload: &'a [u8],
    cursor: usize,
}

impl<'a> BlockEntries<'a> {
    fn new(payload: &'a [u8]) -> Self {
        Self { payload, cursor: 0 }
    }
}

impl<'a> Iterator for BlockEntries<'a> {
    type Item = Result<(&'a [u8], &'a [u8]), SstError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.payload.len() {
            return None;
        }

        let read_len = |buf: &[u8], at: usize| -> Option<usize> {
            let bytes: [u8; 4] = buf.get(at..at + 4)?.try_into().ok()?;
            Some(u32::from_le_bytes(bytes) as usize)
        };

        let Some(klen) = read_len(self.payload, self.cursor) else {
            self.cursor = self.payload.len();
            return Some(Err(SstError::Corrupt("truncated entry header".into())));
        };
        let key_start = self.cursor + 4;
        let Some(vlen) = read_len(self.payload, key_start + klen) else {
            self.cursor = self.payload.len();
            return Some(Err(SstError::Corrupt("truncated entry header".into())));
        };
        let value_start = key_start + klen + 4;

        if value_start + vlen > self.payload.len() {
            self.cursor = self.payload.len();
            return Some(Err(SstError::Corrupt("entry overruns block".into())));
        }

        let key = &self.payload[key_start..key_start + klen];
        let value = &self.payload[value_start..value_start + vlen];
        self.cursor = value_start + vlen;
        Some(Ok((key, value)))
    }
}

// ------------------------------------------------------------------------------------------------
// Index codec
// ------------------------------------------------------------------------------------------------

fn decode_index(bytes: &[u8]) -> Result<Vec<BlockIndexEntry>, SstError> {
    if bytes.len() < 4 {
        return Err(SstError::Corrupt("block index too short".into()));
    }
    let count = u32::from_le_bytes(bytes[..4].try_into().expect("sliced 4")) as usize;

    let mut entries = Vec::with_capacity(count);
    let mut cursor = 4usize;
    for _ in 0..count {
        if cursor + 4 > bytes.len() {
            return Err(SstError::Corrupt("block index truncated".into()));
        }
        let klen =
            u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().expect("sliced 4")) as usize;
        cursor += 4;

        if cursor + klen + 16 > bytes.len() {
            return Err(SstError::Corrupt("block index truncated".into()));
        }
        let first_key = bytes[cursor..cursor + klen].to_vec();
        cursor += klen;
        let offset = read_u64_le(bytes, cursor);
        let length = read_u64_le(bytes, cursor + 8);
        cursor += 16;

        entries.push(BlockIndexEntry {
            first_key,
            offset,
            length,
        });
    }
    Ok(entries)
}

fn read_u64_le(bytes: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(bytes[at..at + 8].try_into().expect("sliced 8"))
}
