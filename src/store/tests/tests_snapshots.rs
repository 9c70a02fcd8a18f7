//! MVCC snapshots: isolation in-process and across restarts (spec
//! scenario 1).

use tempfile::TempDir;

use crate::store::tests::helpers::*;

#[test]
fn snapshot_pins_a_read_view() {
    let dir = TempDir::new().unwrap();
    let (store, docs) = open_docs(dir.path());

    docs.put(&doc(1, "v1")).unwrap();
    let snap = store.snapshot();
    docs.put(&doc(1, "v2")).unwrap();

    assert_eq!(docs.get(&1, Some(&snap)).unwrap().unwrap().body, "v1");
    assert_eq!(docs.get(&1, None).unwrap().unwrap().body, "v2");
}

#[test]
fn snapshot_taken_after_commit_sees_it_immediately() {
    let dir = TempDir::new().unwrap();
    let (store, docs) = open_docs(dir.path());

    docs.put(&doc(1, "v1")).unwrap();
    let snap = store.snapshot();
    assert_eq!(docs.get(&1, Some(&snap)).unwrap().unwrap().body, "v1");
}

#[test]
fn snapshot_hides_later_deletes_and_inserts() {
    let dir = TempDir::new().unwrap();
    let (store, docs) = open_docs(dir.path());

    docs.put(&doc(1, "keep")).unwrap();
    let snap = store.snapshot();

    docs.delete(&1).unwrap();
    docs.put(&doc(2, "new")).unwrap();

    assert!(docs.get(&1, None).unwrap().is_none());
    assert_eq!(docs.get(&1, Some(&snap)).unwrap().unwrap().body, "keep");
    assert!(docs.get(&2, Some(&snap)).unwrap().is_none());

    let visible_now = docs.scan(None, None, None).unwrap();
    assert_eq!(visible_now.len(), 1);
    let visible_then = docs.scan(None, None, Some(&snap)).unwrap();
    assert_eq!(visible_then.len(), 1);
    assert_eq!(visible_then[0].body, "keep");
}

#[test]
fn snapshot_sequences_survive_restart() {
    // Spec scenario 1: put v1, snapshot s1, put v2, snapshot s2, flush,
    // close, reopen — both snapshots must still resolve.
    let dir = TempDir::new().unwrap();
    let (s1_seq, s2_seq);
    {
        let (store, docs) = open_docs(dir.path());
        docs.put(&doc(1, "v1")).unwrap();
        s1_seq = store.snapshot().sequence();
        docs.put(&doc(1, "v2")).unwrap();
        s2_seq = store.snapshot().sequence();
        store.flush().unwrap();
        store.close().unwrap();
    }

    let (store, docs) = open_docs(dir.path());
    let s1 = store.snapshot_at(s1_seq);
    let s2 = store.snapshot_at(s2_seq);

    assert_eq!(docs.get(&1, Some(&s1)).unwrap().unwrap().body, "v1");
    assert_eq!(docs.get(&1, Some(&s2)).unwrap().unwrap().body, "v2");
}

#[test]
fn history_is_a_prefix_under_earlier_snapshots() {
    let dir = TempDir::new().unwrap();
    let (store, docs) = open_docs(dir.path());

    docs.put(&doc(1, "v1")).unwrap();
    let early = store.snapshot();
    docs.put(&doc(1, "v2")).unwrap();
    docs.put(&doc(1, "v3")).unwrap();

    let early_history = docs.history(&1, Some(&early)).unwrap();
    let full_history = docs.history(&1, None).unwrap();

    assert_eq!(early_history.len(), 1);
    assert_eq!(full_history.len(), 3);
    assert_eq!(full_history[..1], early_history[..]);
}
