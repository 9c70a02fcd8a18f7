//! Corruption detection: torn tails and flipped bytes stop replay of the
//! damaged file without surfacing an error.

use crate::wal::{LegacyOp, Wal, WalPayload};
use std::fs::{self, OpenOptions};
use std::io::Write;
use tempfile::TempDir;

fn legacy(key: &[u8], value: &[u8]) -> WalPayload {
    WalPayload::Legacy(LegacyOp {
        key: key.to_vec(),
        value: Some(value.to_vec()),
    })
}

#[test]
fn torn_tail_is_silently_truncated() {
    let dir = TempDir::new().unwrap();
    let wal = Wal::open(dir.path(), 0).unwrap();
    wal.append(1, &legacy(b"a", b"v1")).unwrap();
    wal.append(2, &legacy(b"b", b"v2")).unwrap();
    wal.sync().unwrap();
    drop(wal);

    // Append garbage that looks like the start of a frame but is cut short.
    let mut file = OpenOptions::new()
        .append(true)
        .open(dir.path().join("wal.log"))
        .unwrap();
    file.write_all(&3u64.to_be_bytes()).unwrap();
    file.write_all(&100u32.to_be_bytes()).unwrap();
    file.write_all(b"short").unwrap();
    drop(file);

    let wal = Wal::open(dir.path(), 0).unwrap();
    let frames = wal.replay().unwrap();
    assert_eq!(frames.len(), 2, "torn tail must not produce a frame");
}

#[test]
fn crc_mismatch_stops_replay_of_the_file() {
    let dir = TempDir::new().unwrap();
    let wal = Wal::open(dir.path(), 0).unwrap();
    wal.append(1, &legacy(b"a", b"v1")).unwrap();
    wal.append(2, &legacy(b"b", b"v2")).unwrap();
    wal.sync().unwrap();
    drop(wal);

    // Flip one payload byte of the first frame: both frames after it become
    // unreachable because replay stops at the first CRC failure.
    let path = dir.path().join("wal.log");
    let mut bytes = fs::read(&path).unwrap();
    bytes[14] ^= 0xff;
    fs::write(&path, bytes).unwrap();

    let wal = Wal::open(dir.path(), 0).unwrap();
    assert!(wal.replay().unwrap().is_empty());
}

#[test]
fn absurd_length_prefix_is_treated_as_torn_tail() {
    let dir = TempDir::new().unwrap();
    let wal = Wal::open(dir.path(), 0).unwrap();
    wal.append(1, &legacy(b"a", b"v1")).unwrap();
    wal.sync().unwrap();
    drop(wal);

    let mut file = OpenOptions::new()
        .append(true)
        .open(dir.path().join("wal.log"))
        .unwrap();
    file.write_all(&2u64.to_be_bytes()).unwrap();
    file.write_all(&u32::MAX.to_be_bytes()).unwrap();
    file.write_all(&[0u8; 64]).unwrap();
    drop(file);

    let wal = Wal::open(dir.path(), 0).unwrap();
    assert_eq!(wal.replay().unwrap().len(), 1);
}
