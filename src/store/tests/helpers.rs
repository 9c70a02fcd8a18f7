use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::collection::{Collection, Document};
use crate::store::{Store, StoreOptions};

/// Initialize tracing controlled by `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The document type store tests use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Doc {
    pub id: u64,
    pub body: String,
}

impl Document for Doc {
    type Id = u64;

    fn id(&self) -> u64 {
        self.id
    }
}

pub fn doc(id: u64, body: &str) -> Doc {
    Doc {
        id,
        body: body.to_string(),
    }
}

/// Default options with a small cache, suitable for most tests.
pub fn options(path: &Path) -> StoreOptions {
    init_tracing();
    StoreOptions {
        cache_bytes: 1 << 20,
        ..StoreOptions::new(path)
    }
}

/// Options with a tiny memtable so flushes trigger quickly.
pub fn small_memtable_options(path: &Path) -> StoreOptions {
    StoreOptions {
        memtable_limit: 8,
        auto_compact: false,
        ..options(path)
    }
}

pub fn open(path: &Path) -> Store {
    Store::open(options(path)).expect("open")
}

pub fn open_docs(path: &Path) -> (Store, Collection<Doc>) {
    let store = open(path);
    let docs = store.collection::<Doc>("docs").expect("collection");
    (store, docs)
}
