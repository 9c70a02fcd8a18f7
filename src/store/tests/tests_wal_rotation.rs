//! WAL segment rotation under real write load (spec scenario 8).

use tempfile::TempDir;

use crate::store::tests::helpers::*;
use crate::store::{Store, StoreOptions};

fn rotating_options(path: &std::path::Path) -> StoreOptions {
    StoreOptions {
        wal_segment_bytes: 1024,
        ..options(path)
    }
}

#[test]
fn two_hundred_ops_across_segments_all_recover() {
    let dir = TempDir::new().unwrap();
    {
        let store = Store::open(rotating_options(dir.path())).unwrap();
        let docs = store.collection::<Doc>("docs").unwrap();
        for i in 0..200u64 {
            docs.put(&doc(i, &format!("value-{i}"))).unwrap();
        }

        // Rotation actually happened.
        let segments = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                let name = e.as_ref().unwrap().file_name();
                let name = name.to_string_lossy();
                name.starts_with("wal.") && name.as_ref() != "wal.log"
            })
            .count();
        assert!(segments > 0, "1 KiB segments must rotate under 200 ops");
    }

    let store = Store::open(rotating_options(dir.path())).unwrap();
    let docs = store.collection::<Doc>("docs").unwrap();
    for i in [0u64, 50, 199] {
        assert_eq!(
            docs.get(&i, None).unwrap().unwrap().body,
            format!("value-{i}"),
            "id {i} lost across rotation"
        );
    }
}

#[test]
fn flush_garbage_collects_covered_segments() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(rotating_options(dir.path())).unwrap();
    let docs = store.collection::<Doc>("docs").unwrap();

    for i in 0..100u64 {
        docs.put(&doc(i, "payload-to-fill-segments")).unwrap();
    }
    let segments_before = std::fs::read_dir(dir.path())
        .unwrap()
        .filter(|e| {
            let name = e.as_ref().unwrap().file_name();
            let name = name.to_string_lossy();
            name.starts_with("wal.") && name.as_ref() != "wal.log"
        })
        .count();
    assert!(segments_before > 0);

    store.flush().unwrap();

    let segments_after = std::fs::read_dir(dir.path())
        .unwrap()
        .filter(|e| {
            let name = e.as_ref().unwrap().file_name();
            let name = name.to_string_lossy();
            name.starts_with("wal.") && name.as_ref() != "wal.log"
        })
        .count();
    assert_eq!(
        segments_after, 0,
        "a flush covers every rotated segment; gc must reclaim them"
    );
    assert!(dir.path().join("wal.log").exists());
}
