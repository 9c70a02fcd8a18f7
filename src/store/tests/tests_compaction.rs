//! Store-level compaction behavior (spec scenario 5) and status surface.

use tempfile::TempDir;

use crate::store::tests::helpers::*;
use crate::store::Store;

#[test]
fn l0_pileup_is_merged_and_keys_survive() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(small_memtable_options(dir.path())).unwrap();
    let docs = store.collection::<Doc>("docs").unwrap();

    // Overflow the 8-entry memtable five times over the same id range so
    // the resulting L0 tables overlap.
    for round in 0..5u64 {
        for i in 0..8u64 {
            docs.put(&doc(i, &format!("round{round}"))).unwrap();
        }
        store.flush().unwrap();
    }

    let l0_before: usize = store
        .compaction_status()
        .levels
        .iter()
        .filter(|l| l.level == 0)
        .map(|l| l.tables)
        .sum();
    assert!(l0_before >= 5, "expected an L0 pile-up, got {l0_before}");

    assert!(store.compact_now().unwrap());

    let l0_after: usize = store
        .compaction_status()
        .levels
        .iter()
        .filter(|l| l.level == 0)
        .map(|l| l.tables)
        .sum();
    assert!(l0_after < l0_before, "L0 table count must strictly decrease");

    // Union of keys preserved, newest version wins.
    for i in 0..8u64 {
        assert_eq!(docs.get(&i, None).unwrap().unwrap().body, "round4");
    }
}

#[test]
fn compaction_preserves_old_versions_for_snapshots() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(small_memtable_options(dir.path())).unwrap();
    let docs = store.collection::<Doc>("docs").unwrap();

    docs.put(&doc(1, "v1")).unwrap();
    let snap = store.snapshot();
    for i in 0..20u64 {
        docs.put(&doc(1, &format!("v{}", i + 2))).unwrap();
    }
    store.flush().unwrap();
    store.compact_now().unwrap();

    assert_eq!(docs.get(&1, Some(&snap)).unwrap().unwrap().body, "v1");
}

#[test]
fn status_exposes_levels_and_debt() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(small_memtable_options(dir.path())).unwrap();
    let docs = store.collection::<Doc>("docs").unwrap();

    let empty = store.compaction_status();
    assert!(!empty.running);
    assert!(empty.levels.is_empty());
    assert_eq!(empty.debt_bytes, 0);

    for round in 0..6u64 {
        for i in 0..8u64 {
            docs.put(&doc(round * 100 + i, "x")).unwrap();
        }
        store.flush().unwrap();
    }

    let status = store.compaction_status();
    let total_tables: usize = status.levels.iter().map(|l| l.tables).sum();
    assert_eq!(total_tables, 6);
    assert!(
        status.debt_bytes > 0,
        "more than four L0 tables must accrue debt"
    );
}

#[test]
fn sequences_remain_strictly_increasing_across_flush_and_compaction() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(small_memtable_options(dir.path())).unwrap();
    let docs = store.collection::<Doc>("docs").unwrap();

    let mut last = 0;
    for i in 0..40u64 {
        let seq = docs.put(&doc(i % 4, "x")).unwrap();
        assert!(seq > last);
        last = seq;
    }
    store.compact_now().unwrap();

    let seq = docs.put(&doc(0, "final")).unwrap();
    assert!(seq > last);
}
