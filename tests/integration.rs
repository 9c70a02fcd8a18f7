//! Integration tests for the public `codexdb` API.
//!
//! These exercise the full stack (WAL → memtable → SSTable → compaction →
//! collections) through `codexdb::{Store, StoreOptions, Collection}` only.
//! No internal modules are referenced.
//!
//! ## Coverage areas
//! - **Lifecycle**: open, close, reopen, drop-without-close recovery
//! - **CRUD**: put, get, delete, overwrite, typed and untyped documents
//! - **Batches**: multi-collection atomicity, unique constraints, guards
//! - **MVCC**: snapshot isolation, history, snapshot sequences after restart
//! - **Indexes**: unique/multi definition, lookup, index scans
//! - **Maintenance**: flush, compaction, backup/restore, metrics
//! - **Concurrency**: readers during writes, parallel writers

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

use codexdb::{Document, IndexSpec, Store, StoreOptions};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Article {
    id: u64,
    slug: String,
    tags: Vec<String>,
}

impl Document for Article {
    type Id = u64;

    fn id(&self) -> u64 {
        self.id
    }
}

fn article(id: u64, slug: &str, tags: &[&str]) -> Article {
    Article {
        id,
        slug: slug.to_string(),
        tags: tags.iter().map(|t| t.to_string()).collect(),
    }
}

fn small_options(path: &std::path::Path) -> StoreOptions {
    StoreOptions {
        memtable_limit: 16,
        cache_bytes: 1 << 20,
        ..StoreOptions::new(path)
    }
}

// ================================================================================================
// Lifecycle & CRUD
// ================================================================================================

#[test]
fn open_write_close_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let store = Store::open(StoreOptions::default().with_path(dir.path())).unwrap();
        let articles = store.collection::<Article>("articles").unwrap();
        articles.put(&article(1, "hello", &[])).unwrap();
        store.close().unwrap();
    }

    let store = Store::open(StoreOptions::new(dir.path())).unwrap();
    let articles = store.collection::<Article>("articles").unwrap();
    assert_eq!(articles.get(&1, None).unwrap().unwrap().slug, "hello");
}

#[test]
fn crash_recovery_without_close() {
    let dir = TempDir::new().unwrap();
    {
        let store = Store::open(StoreOptions::new(dir.path())).unwrap();
        let articles = store.collection::<Article>("articles").unwrap();
        articles.put(&article(1, "survives", &[])).unwrap();
        articles.put(&article(2, "also", &[])).unwrap();
        articles.delete(&2).unwrap();
        // Drop without close: recovery must come from the WAL alone.
    }

    let store = Store::open(StoreOptions::new(dir.path())).unwrap();
    let articles = store.collection::<Article>("articles").unwrap();
    assert_eq!(articles.get(&1, None).unwrap().unwrap().slug, "survives");
    assert!(articles.get(&2, None).unwrap().is_none());
}

#[test]
fn overwrite_creates_versions_not_replacements() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(StoreOptions::new(dir.path())).unwrap();
    let articles = store.collection::<Article>("articles").unwrap();

    articles.put(&article(1, "v1", &[])).unwrap();
    articles.put(&article(1, "v2", &[])).unwrap();

    let history = articles.history(&1, None).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].1.as_ref().unwrap().slug, "v1");
    assert_eq!(history[1].1.as_ref().unwrap().slug, "v2");
}

// ================================================================================================
// Batches
// ================================================================================================

#[test]
fn batch_commits_atomically_across_collections() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(StoreOptions::new(dir.path())).unwrap();
    let articles = store.collection::<Article>("articles").unwrap();
    let drafts = store.collection::<Article>("drafts").unwrap();

    store
        .batch(
            vec![
                articles.put_op(&article(1, "published", &[])).unwrap(),
                drafts.delete_op(&1).unwrap(),
            ],
            None,
        )
        .unwrap();

    assert!(articles.get(&1, None).unwrap().is_some());
    assert!(drafts.get(&1, None).unwrap().is_none());
}

#[test]
fn unique_constraint_rejects_duplicate_slugs() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(StoreOptions::new(dir.path())).unwrap();
    let articles = store.collection::<Article>("articles").unwrap();
    articles
        .define_index(IndexSpec::unique("slug", |a: &Article| {
            a.slug.as_bytes().to_vec()
        }))
        .unwrap();

    articles.put(&article(1, "taken", &[])).unwrap();
    assert!(articles.put(&article(2, "taken", &[])).is_err());
    assert!(articles.get(&2, None).unwrap().is_none());

    // The same slug on the same id is an update, not a conflict.
    assert!(articles.put(&article(1, "taken", &["edited"])).is_ok());
}

// ================================================================================================
// MVCC
// ================================================================================================

#[test]
fn snapshots_isolate_readers_from_later_writes() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(StoreOptions::new(dir.path())).unwrap();
    let articles = store.collection::<Article>("articles").unwrap();

    articles.put(&article(1, "first", &[])).unwrap();
    let snap = store.snapshot();
    articles.put(&article(1, "second", &[])).unwrap();
    articles.put(&article(2, "other", &[])).unwrap();

    assert_eq!(articles.get(&1, Some(&snap)).unwrap().unwrap().slug, "first");
    assert!(articles.get(&2, Some(&snap)).unwrap().is_none());
    assert_eq!(articles.scan(None, None, Some(&snap)).unwrap().len(), 1);
    assert_eq!(articles.scan(None, None, None).unwrap().len(), 2);
}

#[test]
fn snapshot_sequences_stay_meaningful_after_restart() {
    let dir = TempDir::new().unwrap();
    let old_seq;
    {
        let store = Store::open(StoreOptions::new(dir.path())).unwrap();
        let articles = store.collection::<Article>("articles").unwrap();
        articles.put(&article(1, "old", &[])).unwrap();
        old_seq = store.snapshot().sequence();
        articles.put(&article(1, "new", &[])).unwrap();
        store.flush().unwrap();
        store.close().unwrap();
    }

    let store = Store::open(StoreOptions::new(dir.path())).unwrap();
    let articles = store.collection::<Article>("articles").unwrap();
    let snap = store.snapshot_at(old_seq);
    assert_eq!(articles.get(&1, Some(&snap)).unwrap().unwrap().slug, "old");
    assert_eq!(articles.get(&1, None).unwrap().unwrap().slug, "new");
}

// ================================================================================================
// Indexes & scans
// ================================================================================================

#[test]
fn multi_index_scans_order_by_key_then_id() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(StoreOptions::new(dir.path())).unwrap();
    let articles = store.collection::<Article>("articles").unwrap();
    articles
        .define_index(IndexSpec::multi("tags", |a: &Article| {
            a.tags.iter().map(|t| t.as_bytes().to_vec()).collect()
        }))
        .unwrap();

    articles.put(&article(1, "a", &["rust", "db"])).unwrap();
    articles.put(&article(2, "b", &["rust"])).unwrap();
    articles.put(&article(3, "c", &["zig"])).unwrap();

    let rust = articles.by_index("tags", b"rust", None).unwrap();
    assert_eq!(rust.len(), 2);

    let all = articles.scan_index("tags", b"", None, None).unwrap();
    // Keys in order: "db" (id 1), "rust" (ids 1, 2), "zig" (id 3).
    let ids: Vec<u64> = all.iter().map(|a| a.id).collect();
    assert_eq!(ids, vec![1, 1, 2, 3]);
}

#[test]
fn scans_filter_by_id_prefix_and_limit() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(StoreOptions::new(dir.path())).unwrap();
    let events = store.documents("events").unwrap();

    for i in 0..5 {
        events
            .put(&json!({"id": format!("click-{i}"), "kind": "click"}))
            .unwrap();
        events
            .put(&json!({"id": format!("view-{i}"), "kind": "view"}))
            .unwrap();
    }

    let clicks = events.scan(Some(b"\"click-".as_slice()), None, None).unwrap();
    assert_eq!(clicks.len(), 5);

    let limited = events.scan(None, Some(3), None).unwrap();
    assert_eq!(limited.len(), 3);
}

// ================================================================================================
// Maintenance
// ================================================================================================

#[test]
fn flush_compact_and_read_back() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(small_options(dir.path())).unwrap();
    let articles = store.collection::<Article>("articles").unwrap();

    for i in 0..100u64 {
        articles.put(&article(i, &format!("slug-{i}"), &[])).unwrap();
    }
    store.flush().unwrap();
    store.compact_now().unwrap();

    for i in (0..100u64).step_by(7) {
        assert_eq!(
            articles.get(&i, None).unwrap().unwrap().slug,
            format!("slug-{i}")
        );
    }

    let status = store.compaction_status();
    assert!(!status.levels.is_empty());
}

#[test]
fn backup_and_restore_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(StoreOptions::new(dir.path())).unwrap();
    let articles = store.collection::<Article>("articles").unwrap();

    articles.put(&article(1, "one", &[])).unwrap();
    articles.put(&article(2, "two", &[])).unwrap();
    let backup = store.create_backup(Some("nightly")).unwrap();

    articles.delete(&1).unwrap();
    articles.put(&article(3, "three", &[])).unwrap();

    store.restore_backup(backup.id).unwrap();

    let all = articles.scan(None, None, None).unwrap();
    let ids: Vec<u64> = all.iter().map(|a| a.id).collect();
    assert_eq!(ids, vec![1, 2]);

    let listed = store.list_backups().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].note.as_deref(), Some("nightly"));
}

#[test]
fn metrics_reflect_activity() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(small_options(dir.path())).unwrap();
    let articles = store.collection::<Article>("articles").unwrap();

    for i in 0..40u64 {
        articles.put(&article(i, "x", &[])).unwrap();
    }
    articles.delete(&0).unwrap();

    let m = store.metrics();
    assert_eq!(m.puts, 40);
    assert_eq!(m.deletes, 1);
    assert!(m.flushes >= 1, "a 16-entry memtable must have flushed");

    store.reset_metrics();
    assert_eq!(store.metrics().puts, 0);
}

// ================================================================================================
// Concurrency
// ================================================================================================

#[test]
fn concurrent_readers_during_writes() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(StoreOptions::new(dir.path())).unwrap();
    let articles = store.collection::<Article>("articles").unwrap();
    articles.put(&article(1, "seed", &[])).unwrap();

    let store = Arc::new(store);
    let mut handles = Vec::new();

    for _ in 0..4 {
        let store = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            let articles = store.collection::<Article>("articles").unwrap();
            for _ in 0..200 {
                let got = articles.get(&1, None).unwrap();
                assert!(got.is_some(), "id 1 must always be visible");
            }
        }));
    }

    for i in 0..100u64 {
        articles.put(&article(1, &format!("rev-{i}"), &[])).unwrap();
    }

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn parallel_writers_serialize_without_loss() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(Store::open(small_options(dir.path())).unwrap());

    let mut handles = Vec::new();
    for writer in 0..4u64 {
        let store = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            let articles = store.collection::<Article>("articles").unwrap();
            for i in 0..50u64 {
                let id = writer * 1000 + i;
                articles.put(&article(id, &format!("w{writer}-{i}"), &[])).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let articles = store.collection::<Article>("articles").unwrap();
    for writer in 0..4u64 {
        for i in 0..50u64 {
            let id = writer * 1000 + i;
            assert!(articles.get(&id, None).unwrap().is_some(), "lost id {id}");
        }
    }
}
