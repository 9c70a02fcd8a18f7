//! Backup bundles and restore (spec scenario 7).

use tempfile::TempDir;

use crate::index::IndexSpec;
use crate::store::tests::helpers::*;
use crate::store::StoreError;

#[test]
fn backup_restore_round_trip() {
    let dir = TempDir::new().unwrap();
    let (store, docs) = open_docs(dir.path());

    docs.put(&doc(1, "one")).unwrap();
    docs.put(&doc(2, "two")).unwrap();
    docs.put(&doc(3, "three")).unwrap();

    let backup = store.create_backup(Some("pre-mutation")).unwrap();
    assert!(backup.size_bytes > 0);

    // Diverge: delete one, add another, overwrite a third.
    docs.delete(&2).unwrap();
    docs.put(&doc(4, "four")).unwrap();
    docs.put(&doc(1, "one-rewritten")).unwrap();

    store.restore_backup(backup.id).unwrap();

    // Exactly the three original ids with their original values.
    let all = docs.scan(None, None, None).unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(docs.get(&1, None).unwrap().unwrap().body, "one");
    assert_eq!(docs.get(&2, None).unwrap().unwrap().body, "two");
    assert_eq!(docs.get(&3, None).unwrap().unwrap().body, "three");
    assert!(docs.get(&4, None).unwrap().is_none());
}

#[test]
fn restored_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let backup_id;
    {
        let (store, docs) = open_docs(dir.path());
        docs.put(&doc(1, "keep")).unwrap();
        backup_id = store.create_backup(None).unwrap().id;
        docs.put(&doc(2, "lose")).unwrap();
        store.restore_backup(backup_id).unwrap();
        store.close().unwrap();
    }

    let (_store, docs) = open_docs(dir.path());
    assert_eq!(docs.get(&1, None).unwrap().unwrap().body, "keep");
    assert!(docs.get(&2, None).unwrap().is_none());
}

#[test]
fn list_backups_returns_descriptors_in_creation_order() {
    let dir = TempDir::new().unwrap();
    let (store, docs) = open_docs(dir.path());

    assert!(store.list_backups().unwrap().is_empty());

    docs.put(&doc(1, "a")).unwrap();
    let first = store.create_backup(Some("first")).unwrap();
    docs.put(&doc(2, "b")).unwrap();
    let second = store.create_backup(None).unwrap();

    let listed = store.list_backups().unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, first.id);
    assert_eq!(listed[0].note.as_deref(), Some("first"));
    assert_eq!(listed[1].id, second.id);
    assert!(listed[1].note.is_none());
}

#[test]
fn backup_descriptor_uses_external_field_names() {
    let dir = TempDir::new().unwrap();
    let (store, docs) = open_docs(dir.path());
    docs.put(&doc(1, "a")).unwrap();
    let backup = store.create_backup(None).unwrap();

    let descriptor_path = dir
        .path()
        .join("backups")
        .join(backup.id.to_string())
        .join("backup.json");
    let text = std::fs::read_to_string(descriptor_path).unwrap();
    assert!(text.contains("\"createdAt\""));
    assert!(text.contains("\"sizeBytes\""));
}

#[test]
fn restoring_an_unknown_backup_fails_cleanly() {
    let dir = TempDir::new().unwrap();
    let (store, docs) = open_docs(dir.path());
    docs.put(&doc(1, "a")).unwrap();

    let err = store.restore_backup(uuid::Uuid::new_v4()).unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
    // The failed restore touched nothing.
    assert_eq!(docs.get(&1, None).unwrap().unwrap().body, "a");
}

#[test]
fn restore_preserves_index_definitions_and_uniqueness() {
    let dir = TempDir::new().unwrap();
    let (store, docs) = open_docs(dir.path());
    docs.define_index(IndexSpec::unique("body", |d: &Doc| {
        d.body.as_bytes().to_vec()
    }))
    .unwrap();

    docs.put(&doc(1, "held")).unwrap();
    let backup = store.create_backup(None).unwrap();
    docs.delete(&1).unwrap();

    store.restore_backup(backup.id).unwrap();

    // The index came back with the restored data: the key is taken again.
    let hit = docs.by_index("body", b"held", None).unwrap();
    assert_eq!(hit.len(), 1);
    assert!(docs.put(&doc(2, "held")).is_err());
}
