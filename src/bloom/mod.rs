//! Bloom Filter Module
//!
//! A compact probabilistic membership test serialized into every SSTable.
//! A bloom filter can state with certainty that a key is **not** present
//! (no false negatives), while occasionally reporting a key as present when
//! it is not (false positives cost one extra block read, never a wrong
//! answer).
//!
//! ## Design
//!
//! - Fixed `k = 3` hash functions, each an FNV-1a pass over the key seeded
//!   by the hash index, double-indexed into the bitset.
//! - The bitset is rounded up to whole 64-bit words.
//! - Write-time sizing heuristic: `max(64, 10 · n)` bits for `n` keys.
//!
//! # On-disk layout
//!
//! ```text
//! [k (8 LE)][bit_count (8 LE)][word_0 (8 LE)] ... [word_m (8 LE)]
//! ```
//!
//! Deserialization recovers both parameters from the prefix; the word count
//! is implied by `bit_count`.

#[cfg(test)]
mod tests;

use thiserror::Error;

const NUM_HASHES: u64 = 3;
const BITS_PER_KEY: u64 = 10;
const MIN_BITS: u64 = 64;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x1000_0000_01b3;

/// Errors returned when decoding a serialized filter.
#[derive(Debug, Error)]
pub enum BloomError {
    /// Serialized bytes are shorter than the declared layout.
    #[error("bloom filter truncated: {0} bytes")]
    Truncated(usize),

    /// Declared parameters are inconsistent (zero bits, absurd k).
    #[error("bloom filter has invalid parameters")]
    InvalidParameters,
}

/// A fixed-k bloom filter over byte-string keys.
#[derive(Debug, Clone, PartialEq)]
pub struct BloomFilter {
    /// Number of hash functions.
    k: u64,

    /// Number of addressable bits (word-aligned).
    bit_count: u64,

    /// Backing bitset, 64 bits per word.
    words: Vec<u64>,
}

impl BloomFilter {
    /// Creates a filter sized for `expected_keys` insertions using the
    /// write-time heuristic `max(64, 10 · n)` bits and `k = 3`.
    pub fn with_capacity(expected_keys: usize) -> Self {
        let wanted = (expected_keys as u64).saturating_mul(BITS_PER_KEY);
        let bit_count = wanted.max(MIN_BITS).div_ceil(64) * 64;

        Self {
            k: NUM_HASHES,
            bit_count,
            words: vec![0u64; (bit_count / 64) as usize],
        }
    }

    /// Inserts a key.
    pub fn insert(&mut self, key: &[u8]) {
        for i in 0..self.k {
            let bit = self.bit_index(i, key);
            self.words[(bit / 64) as usize] |= 1u64 << (bit % 64);
        }
    }

    /// Returns `false` only when at least one hashed bit is clear, i.e. the
    /// key is definitely absent. `true` means "maybe present".
    pub fn may_contain(&self, key: &[u8]) -> bool {
        for i in 0..self.k {
            let bit = self.bit_index(i, key);
            if self.words[(bit / 64) as usize] & (1u64 << (bit % 64)) == 0 {
                return false;
            }
        }
        true
    }

    /// Serializes the filter: `k (8 LE) | bit_count (8 LE) | words (8 LE each)`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.words.len() * 8);
        out.extend_from_slice(&self.k.to_le_bytes());
        out.extend_from_slice(&self.bit_count.to_le_bytes());
        for word in &self.words {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// Recovers a filter from its serialized form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BloomError> {
        if bytes.len() < 16 {
            return Err(BloomError::Truncated(bytes.len()));
        }

        let k = u64::from_le_bytes(bytes[0..8].try_into().expect("sliced 8 bytes"));
        let bit_count = u64::from_le_bytes(bytes[8..16].try_into().expect("sliced 8 bytes"));

        if k == 0 || bit_count == 0 || bit_count % 64 != 0 {
            return Err(BloomError::InvalidParameters);
        }

        let word_count = (bit_count / 64) as usize;
        let expected_len = 16 + word_count * 8;
        if bytes.len() < expected_len {
            return Err(BloomError::Truncated(bytes.len()));
        }

        let mut words = Vec::with_capacity(word_count);
        for i in 0..word_count {
            let start = 16 + i * 8;
            words.push(u64::from_le_bytes(
                bytes[start..start + 8].try_into().expect("sliced 8 bytes"),
            ));
        }

        Ok(Self {
            k,
            bit_count,
            words,
        })
    }

    /// Number of addressable bits.
    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    /// Number of hash functions.
    pub fn num_hashes(&self) -> u64 {
        self.k
    }

    /// FNV-1a over the key, seeded by the hash index, reduced to a bit slot.
    fn bit_index(&self, seed: u64, key: &[u8]) -> u64 {
        let mut hash = FNV_OFFSET_BASIS;
        for &byte in seed.to_le_bytes().iter() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        for &byte in key {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        hash % self.bit_count
    }
}
