//! Write-Ahead Logging (WAL) Module
//!
//! A **durable**, **append-only** journal that makes every committed batch
//! crash-safe before it touches any mutable in-memory structure. Records are
//! CRC-protected and self-delimiting; torn tails left by a crash are detected
//! and silently truncated during replay.
//!
//! # On-disk layout
//!
//! ```text
//! [SEQ_BE_8][LEN_BE_4][PAYLOAD_BYTES][CRC32_BE_4]
//! [SEQ_BE_8][LEN_BE_4][PAYLOAD_BYTES][CRC32_BE_4]
//! ...
//! ```
//!
//! - **seq** — the operation's sequence number; `0` for BEGIN/COMMIT frames.
//! - **crc32** — polynomial `0xEDB88320` computed over the payload bytes only.
//!
//! Two JSON payload shapes share the same frame:
//!
//! - **Legacy op** `{key, value?}` — a committed single operation; a missing
//!   `value` is a tombstone.
//! - **Transactional frame** `{type ∈ {begin, op, commit}, txid, key?, value??}`
//!   — `value` is double-optional so an explicit `null` (tombstone) can be
//!   told apart from an absent field.
//!
//! # Segments
//!
//! With `rotate_bytes > 0`, an append that would grow the active file past
//! the threshold first rotates it: the active `wal.log` is renamed to
//! `wal.NNNNNN.log` with a strictly increasing zero-padded index, and a
//! fresh active file is opened. Replay reads rotated segments in filename
//! order, then the active file. `gc` unlinks rotated segments that are fully
//! covered by the manifest sequence; the active file is never unlinked.
//!
//! # Concurrency model
//!
//! The active file handle lives behind a `Mutex` so appends, syncs, and
//! rotation serialize; the store is a single logical writer on top of this.
//!
//! # Guarantees
//!
//! - **Atomic frames:** each frame is written with a single `write_all`.
//! - **Durability:** `sync()` forces an `fsync`; the store calls it after
//!   every committed batch.
//! - **Corruption tolerance:** replay stops each file at the first frame
//!   whose length or CRC fails validation — bad tails never surface as
//!   errors.

#[cfg(test)]
mod tests;

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Active WAL file name inside the store directory.
pub const ACTIVE_FILE: &str = "wal.log";

/// Frame header size: seq (8) + len (4).
const FRAME_HEADER: usize = 12;

/// CRC trailer size.
const FRAME_TRAILER: usize = 4;

/// Upper bound on a single payload; larger lengths in a file are treated as
/// a corrupt tail during replay.
const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON payload encoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Payload exceeds the frame size limit.
    #[error("record size exceeds limit ({0} bytes)")]
    RecordTooLarge(usize),

    /// Internal consistency or locking error.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Payload shapes
// ------------------------------------------------------------------------------------------------

/// Legacy single-operation payload. A missing `value` is a tombstone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyOp {
    /// Base key (`collection || 0x00 || idJSON`, no sequence suffix).
    pub key: Vec<u8>,

    /// Encoded document, absent for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Vec<u8>>,
}

/// Transactional frame payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TxFrame {
    /// Opens a transaction.
    Begin {
        /// Batch transaction id, minted per batch.
        txid: Uuid,
    },

    /// One operation inside a transaction.
    Op {
        /// Batch transaction id.
        txid: Uuid,

        /// Base key.
        key: Vec<u8>,

        /// `Some(Some(_))` is a put, `Some(None)` an explicit-null tombstone,
        /// `None` an absent field.
        #[serde(
            default,
            deserialize_with = "double_option",
            skip_serializing_if = "Option::is_none"
        )]
        value: Option<Option<Vec<u8>>>,
    },

    /// Commits a transaction; uncommitted frames contribute no state.
    Commit {
        /// Batch transaction id.
        txid: Uuid,
    },
}

/// A decoded WAL payload.
#[derive(Debug, Clone, PartialEq)]
pub enum WalPayload {
    /// Transactional frame.
    Tx(TxFrame),

    /// Legacy committed single op.
    Legacy(LegacyOp),
}

impl WalPayload {
    /// Serializes the payload to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Self::Tx(frame) => serde_json::to_vec(frame),
            Self::Legacy(op) => serde_json::to_vec(op),
        }
    }

    /// Decodes a payload, preferring the transactional shape (it carries a
    /// `type` tag that the legacy shape lacks).
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        if let Ok(frame) = serde_json::from_slice::<TxFrame>(bytes) {
            return Ok(Self::Tx(frame));
        }
        serde_json::from_slice::<LegacyOp>(bytes).map(Self::Legacy)
    }
}

/// Deserializes an optional field whose *presence* matters: a present `null`
/// becomes `Some(None)` while an absent field stays `None` via
/// `#[serde(default)]`.
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// A frame recovered by replay.
#[derive(Debug, Clone, PartialEq)]
pub struct WalFrame {
    /// Sequence number carried by the frame (`0` for BEGIN/COMMIT).
    pub seq: u64,

    /// Decoded payload.
    pub payload: WalPayload,
}

// ------------------------------------------------------------------------------------------------
// WAL Core
// ------------------------------------------------------------------------------------------------

/// The write-ahead log: an active append file plus rotated segments.
#[derive(Debug)]
pub struct Wal {
    /// Directory holding the active file and rotated segments.
    dir: PathBuf,

    /// Active file handle; appends, syncs, and rotation serialize here.
    active: Mutex<File>,

    /// Segment rotation threshold in bytes; `0` disables rotation.
    rotate_bytes: u64,

    /// Next rotated-segment index, strictly increasing.
    next_segment: Mutex<u64>,
}

impl Wal {
    /// Opens (or creates) the WAL rooted at `dir`.
    ///
    /// Existing rotated segments are scanned so new rotations continue the
    /// index sequence.
    pub fn open(dir: impl AsRef<Path>, rotate_bytes: u64) -> Result<Self, WalError> {
        let dir = dir.as_ref().to_path_buf();
        let active = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(ACTIVE_FILE))?;

        let next_segment = Self::segment_paths_in(&dir)?
            .last()
            .and_then(|p| segment_index(p))
            .map_or(0, |i| i + 1);

        info!(dir = %dir.display(), rotate_bytes, next_segment, "WAL opened");

        Ok(Self {
            dir,
            active: Mutex::new(active),
            rotate_bytes,
            next_segment: Mutex::new(next_segment),
        })
    }

    /// Appends one frame, rotating the active file first if the append would
    /// push it past the configured threshold.
    ///
    /// The whole frame goes out in a single write call so a crash leaves at
    /// most one torn frame at the file tail.
    pub fn append(&self, seq: u64, payload: &WalPayload) -> Result<(), WalError> {
        let payload_bytes = payload.to_bytes()?;
        if payload_bytes.len() > MAX_PAYLOAD {
            return Err(WalError::RecordTooLarge(payload_bytes.len()));
        }

        let frame = encode_frame(seq, &payload_bytes);

        let mut guard = self
            .active
            .lock()
            .map_err(|_| WalError::Internal("WAL mutex poisoned".into()))?;

        if self.rotate_bytes > 0 {
            let current = guard.metadata()?.len();
            if current > 0 && current + frame.len() as u64 > self.rotate_bytes {
                self.rotate(&mut guard)?;
            }
        }

        guard.write_all(&frame)?;

        trace!(seq, len = payload_bytes.len(), "WAL frame appended");
        Ok(())
    }

    /// Forces durability of everything appended so far.
    pub fn sync(&self) -> Result<(), WalError> {
        let guard = self
            .active
            .lock()
            .map_err(|_| WalError::Internal("WAL mutex poisoned".into()))?;
        guard.sync_all()?;
        Ok(())
    }

    /// Replays every valid frame: rotated segments in filename order, then
    /// the active file. Each file stops at its first invalid frame.
    pub fn replay(&self) -> Result<Vec<WalFrame>, WalError> {
        let mut frames = Vec::new();

        for segment in self.segment_paths()? {
            replay_file(&segment, &mut frames)?;
        }
        replay_file(&self.dir.join(ACTIVE_FILE), &mut frames)?;

        debug!(frames = frames.len(), "WAL replay complete");
        Ok(frames)
    }

    /// Unlinks rotated segments whose maximum frame sequence is covered by
    /// `manifest_seq`. Returns the number of segments removed.
    ///
    /// The active file is never unlinked.
    pub fn gc(&self, manifest_seq: u64) -> Result<usize, WalError> {
        let mut removed = 0;

        for segment in self.segment_paths()? {
            let mut frames = Vec::new();
            replay_file(&segment, &mut frames)?;
            let max_seq = frames.iter().map(|f| f.seq).max().unwrap_or(0);

            if max_seq <= manifest_seq {
                fs::remove_file(&segment)?;
                removed += 1;
                debug!(segment = %segment.display(), max_seq, manifest_seq, "WAL segment removed");
            }
        }

        Ok(removed)
    }

    /// Path of the active WAL file.
    pub fn active_path(&self) -> PathBuf {
        self.dir.join(ACTIVE_FILE)
    }

    /// Replaces the active file contents with `bytes` (backup restore).
    pub fn replace_active(&self, bytes: &[u8]) -> Result<(), WalError> {
        let mut guard = self
            .active
            .lock()
            .map_err(|_| WalError::Internal("WAL mutex poisoned".into()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.dir.join(ACTIVE_FILE))?;
        file.write_all(bytes)?;
        file.sync_all()?;

        *guard = OpenOptions::new()
            .append(true)
            .open(self.dir.join(ACTIVE_FILE))?;
        Ok(())
    }

    /// Rotated segment paths in filename (and thus index) order.
    pub fn segment_paths(&self) -> Result<Vec<PathBuf>, WalError> {
        Self::segment_paths_in(&self.dir)
    }

    fn segment_paths_in(dir: &Path) -> Result<Vec<PathBuf>, WalError> {
        let mut segments: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| segment_index(p).is_some())
            .collect();
        segments.sort();
        Ok(segments)
    }

    /// Renames the active file to the next segment and opens a fresh one.
    fn rotate(&self, guard: &mut File) -> Result<(), WalError> {
        guard.sync_all()?;

        let mut index = self
            .next_segment
            .lock()
            .map_err(|_| WalError::Internal("WAL mutex poisoned".into()))?;
        let segment = self.dir.join(format!("wal.{:06}.log", *index));
        *index += 1;
        drop(index);

        fs::rename(self.dir.join(ACTIVE_FILE), &segment)?;
        *guard = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(ACTIVE_FILE))?;

        info!(segment = %segment.display(), "WAL rotated");
        Ok(())
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if let Ok(guard) = self.active.lock() {
            let _ = guard.sync_all();
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Frame codec
// ------------------------------------------------------------------------------------------------

/// Encodes one frame: `seq (8 BE) | len (4 BE) | payload | crc32 (4 BE)`.
fn encode_frame(seq: u64, payload: &[u8]) -> Vec<u8> {
    let mut hasher = Crc32::new();
    hasher.update(payload);
    let crc = hasher.finalize();

    let mut frame = Vec::with_capacity(FRAME_HEADER + payload.len() + FRAME_TRAILER);
    frame.extend_from_slice(&seq.to_be_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame
}

/// Reads all valid frames from one file, appending to `out`. Stops at the
/// first frame whose length or CRC fails; the bad tail is expected after a
/// crash and is not an error.
fn replay_file(path: &Path, out: &mut Vec<WalFrame>) -> Result<(), WalError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(WalError::Io(e)),
    };

    let mut cursor = 0usize;
    while bytes.len() - cursor >= FRAME_HEADER + FRAME_TRAILER {
        let seq = u64::from_be_bytes(bytes[cursor..cursor + 8].try_into().expect("sliced 8"));
        let len = u32::from_be_bytes(bytes[cursor + 8..cursor + 12].try_into().expect("sliced 4"))
            as usize;

        if len > MAX_PAYLOAD || bytes.len() - cursor - FRAME_HEADER - FRAME_TRAILER < len {
            warn!(path = %path.display(), offset = cursor, "WAL torn tail, truncating replay");
            break;
        }

        let payload = &bytes[cursor + FRAME_HEADER..cursor + FRAME_HEADER + len];
        let stored_crc = u32::from_be_bytes(
            bytes[cursor + FRAME_HEADER + len..cursor + FRAME_HEADER + len + 4]
                .try_into()
                .expect("sliced 4"),
        );

        let mut hasher = Crc32::new();
        hasher.update(payload);
        if hasher.finalize() != stored_crc {
            warn!(path = %path.display(), offset = cursor, "WAL CRC mismatch, truncating replay");
            break;
        }

        match WalPayload::decode(payload) {
            Ok(payload) => out.push(WalFrame { seq, payload }),
            Err(e) => {
                // Passed its CRC but does not decode: a writer bug, not a
                // torn tail. Stop this file all the same.
                warn!(path = %path.display(), offset = cursor, error = %e, "WAL payload undecodable");
                break;
            }
        }

        cursor += FRAME_HEADER + len + FRAME_TRAILER;
    }

    Ok(())
}

/// Parses the rotated-segment index out of a `wal.NNNNNN.log` filename.
fn segment_index(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let middle = name.strip_prefix("wal.")?.strip_suffix(".log")?;
    if middle.is_empty() || !middle.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    middle.parse().ok()
}
