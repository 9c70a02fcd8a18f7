//! SSTable writer.
//!
//! Builds the on-disk layout described in the [module docs](super): data
//! blocks are filled additively and flushed with a CRC trailer when the next
//! entry would overflow the 4 KiB payload budget; the bloom filter is fed as
//! entries stream through; the block index and footer close the file. The
//! table is built in a temporary file and renamed into place.

use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use crc32fast::Hasher as Crc32;
use tracing::debug;

use super::{SstError, BLOCK_PAYLOAD_MAX, BLOCK_TRAILER};
use crate::bloom::BloomFilter;

/// Writes one SSTable from pre-sorted entries.
pub struct SstWriter {
    /// Final path of the table.
    path: PathBuf,
}

impl SstWriter {
    /// Creates a writer targeting `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Builds the table. `entries` must be sorted by raw key; an empty value
    /// is a tombstone and is stored verbatim.
    pub fn build(self, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<(), SstError> {
        debug_assert!(
            entries.windows(2).all(|w| w[0].0 <= w[1].0),
            "SSTable entries must be sorted by key"
        );

        let tmp_path = self.path.with_extension("sst.tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;

        let mut bloom = BloomFilter::with_capacity(entries.len());
        let mut index: Vec<(Vec<u8>, u64, u64)> = Vec::new();

        let mut block: Vec<u8> = Vec::with_capacity(BLOCK_PAYLOAD_MAX);
        let mut block_first_key: Option<Vec<u8>> = None;
        let mut offset = 0u64;

        for (key, value) in entries {
            bloom.insert(key);

            let encoded_len = 4 + key.len() + 4 + value.len();
            if !block.is_empty() && block.len() + encoded_len > BLOCK_PAYLOAD_MAX {
                offset += flush_block(&mut file, &mut block, &mut block_first_key, &mut index, offset)?;
            }

            if block.is_empty() {
                block_first_key = Some(key.clone());
            }
            block.extend_from_slice(&(key.len() as u32).to_le_bytes());
            block.extend_from_slice(key);
            block.extend_from_slice(&(value.len() as u32).to_le_bytes());
            block.extend_from_slice(value);
        }
        if !block.is_empty() {
            offset += flush_block(&mut file, &mut block, &mut block_first_key, &mut index, offset)?;
        }

        // Block index: count, then (klen | first_key | offset | length).
        let index_off = offset;
        let mut index_bytes = Vec::new();
        index_bytes.extend_from_slice(&(index.len() as u32).to_le_bytes());
        for (first_key, block_off, block_len) in &index {
            index_bytes.extend_from_slice(&(first_key.len() as u32).to_le_bytes());
            index_bytes.extend_from_slice(first_key);
            index_bytes.extend_from_slice(&block_off.to_le_bytes());
            index_bytes.extend_from_slice(&block_len.to_le_bytes());
        }
        file.write_all(&index_bytes)?;

        let bloom_off = index_off + index_bytes.len() as u64;
        let bloom_bytes = bloom.to_bytes();
        file.write_all(&bloom_bytes)?;

        let mut footer = Vec::with_capacity(super::FOOTER_SIZE);
        footer.extend_from_slice(&index_off.to_le_bytes());
        footer.extend_from_slice(&(index_bytes.len() as u64).to_le_bytes());
        footer.extend_from_slice(&bloom_off.to_le_bytes());
        footer.extend_from_slice(&(bloom_bytes.len() as u64).to_le_bytes());
        file.write_all(&footer)?;

        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, &self.path)?;

        debug!(
            path = %self.path.display(),
            entries = entries.len(),
            blocks = index.len(),
            "SSTable written"
        );
        Ok(())
    }
}

/// Appends the current block payload plus CRC trailer, records its index
/// entry, and resets the block buffer. Returns the bytes written.
fn flush_block(
    file: &mut File,
    block: &mut Vec<u8>,
    first_key: &mut Option<Vec<u8>>,
    index: &mut Vec<(Vec<u8>, u64, u64)>,
    offset: u64,
) -> Result<u64, SstError> {
    let mut hasher = Crc32::new();
    hasher.update(block);
    let crc = hasher.finalize();

    file.write_all(block)?;
    file.write_all(&crc.to_le_bytes())?;

    let length = (block.len() + BLOCK_TRAILER) as u64;
    let key = first_key
        .take()
        .ok_or_else(|| SstError::Internal("flushing block without a first key".into()))?;
    index.push((key, offset, length));

    block.clear();
    Ok(length)
}
