//! Collection Module
//!
//! A **collection** is a typed, named view over the store: documents with a
//! serializable id, multi-version history, and secondary indexes maintained
//! atomically with base writes.
//!
//! ## In-memory shape
//!
//! Per collection the core maintains:
//!
//! - `history: idJSON → [(seq, value?)]` — every committed version of every
//!   document, ascending by sequence; tombstones are `None`.
//! - Per **unique** index: `key → [(seq, idJSON?)]` — versioned so snapshot
//!   reads see the index as of their sequence.
//! - Per **multi** index: `key → [(seq, id-set)]` — versioned id sets.
//! - Per **fts** index: an inverted `term → id-set` map plus the terms each
//!   document contributed (head-only; scoring lives in the external search
//!   module).
//! - Per **vector** index: `idJSON → embedding` (head-only; graph search
//!   lives in the external search module).
//!
//! The store populates history through apply hooks — during batch commit,
//! WAL replay, and bootstrap — so the read path never touches disk at
//! steady state.
//!
//! ## Concurrency
//!
//! The core state sits behind an `RwLock`: readers proceed concurrently and
//! only block while the single writer is editing the maps.

#[cfg(test)]
mod tests;

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, RwLock},
};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::index::{IndexDef, IndexKind, IndexSpec, Projector};
use crate::store::{RawOp, StoreError, StoreInner};

// ------------------------------------------------------------------------------------------------
// Documents
// ------------------------------------------------------------------------------------------------

/// A storable document: serializable, with a serializable id.
///
/// The id's JSON encoding is the document's identity — history, indexes,
/// and scan ordering all key on the encoded id bytes.
pub trait Document: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Identifier type.
    type Id: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// Extracts the document's id.
    fn id(&self) -> Self::Id;
}

/// Untyped JSON documents identify themselves through their `"id"` field
/// (`null` when absent). This is the document form the HTTP surface uses.
impl Document for Value {
    type Id = Value;

    fn id(&self) -> Value {
        self.get("id").cloned().unwrap_or(Value::Null)
    }
}

/// JSON-encodes an id.
pub(crate) fn encode_id<I: Serialize>(id: &I) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(id)?)
}

// ------------------------------------------------------------------------------------------------
// Store-facing hooks
// ------------------------------------------------------------------------------------------------

/// Type-erased collection operations the store drives: batch validation,
/// committed-write application, and wholesale reset on restore.
pub(crate) trait CollectionHooks: Send + Sync {
    /// Checks unique constraints under the batch's cumulative effect.
    fn validate(&self, ops: &[RawOp]) -> Result<(), StoreError>;

    /// Applies one committed operation at `seq`.
    fn apply(&self, id_json: &[u8], value: Option<&[u8]>, seq: u64) -> Result<(), StoreError>;

    /// Clears history and index data, keeping index declarations.
    fn clear(&self);
}

// ------------------------------------------------------------------------------------------------
// Core state
// ------------------------------------------------------------------------------------------------

type UniqueVersions = Vec<(u64, Option<Vec<u8>>)>;
type MultiVersions = Vec<(u64, BTreeSet<Vec<u8>>)>;

enum IndexData {
    Unique(BTreeMap<Vec<u8>, UniqueVersions>),
    Multi(BTreeMap<Vec<u8>, MultiVersions>),
    Fts {
        postings: BTreeMap<String, BTreeSet<Vec<u8>>>,
        doc_terms: HashMap<Vec<u8>, Vec<String>>,
    },
    Vector(HashMap<Vec<u8>, Vec<f32>>),
}

impl IndexData {
    fn empty_for(kind: IndexKind) -> Self {
        match kind {
            IndexKind::Unique => Self::Unique(BTreeMap::new()),
            IndexKind::Multi => Self::Multi(BTreeMap::new()),
            IndexKind::Fts => Self::Fts {
                postings: BTreeMap::new(),
                doc_terms: HashMap::new(),
            },
            IndexKind::Vector => Self::Vector(HashMap::new()),
        }
    }
}

struct IndexState<T> {
    projector: Projector<T>,
    field: Option<String>,
    data: IndexData,
}

struct CollectionState<T> {
    /// `idJSON → versions`, sequences strictly ascending within an id.
    history: BTreeMap<Vec<u8>, Vec<(u64, Option<Arc<T>>)>>,

    /// Defined indexes by name.
    indexes: BTreeMap<String, IndexState<T>>,
}

/// Shared per-collection state; the store registers it as the collection's
/// apply/validate hook, handles borrow it for reads.
pub(crate) struct CollectionCore<T: Document> {
    name: String,
    state: RwLock<CollectionState<T>>,
}

impl<T: Document> CollectionCore<T> {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: RwLock::new(CollectionState {
                history: BTreeMap::new(),
                indexes: BTreeMap::new(),
            }),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Registers an index and backfills it from current history heads.
    /// Returns the serializable definition for the catalog.
    pub(crate) fn define_index(&self, spec: IndexSpec<T>) -> Result<IndexDef, StoreError> {
        let def = spec.def();
        let mut state = self.state.write().expect("collection lock poisoned");

        let mut index = IndexState {
            data: IndexData::empty_for(spec.projector.kind()),
            projector: spec.projector,
            field: spec.field,
        };

        // Backfill: the live head of each id enters at its own sequence.
        let heads: Vec<(Vec<u8>, u64, Arc<T>)> = state
            .history
            .iter()
            .filter_map(|(id, versions)| {
                versions
                    .last()
                    .and_then(|(seq, value)| value.clone().map(|v| (id.clone(), *seq, v)))
            })
            .collect();
        for (id_json, seq, value) in heads {
            update_index(&mut index, &id_json, None, Some(value.as_ref()), seq);
        }

        debug!(collection = %self.name, index = %def.name, kind = ?def.kind, "index defined");
        state.indexes.insert(def.name.clone(), index);
        Ok(def)
    }

    pub(crate) fn has_index(&self, name: &str) -> bool {
        self.state
            .read()
            .expect("collection lock poisoned")
            .indexes
            .contains_key(name)
    }

    /// Whether the id has any recorded version at all (decides fallback).
    pub(crate) fn knows_id(&self, id_json: &[u8]) -> bool {
        self.state
            .read()
            .expect("collection lock poisoned")
            .history
            .contains_key(id_json)
    }

    /// Latest visible value for `id_json` at `max_seq`.
    pub(crate) fn get_at(&self, id_json: &[u8], max_seq: u64) -> Option<Arc<T>> {
        let state = self.state.read().expect("collection lock poisoned");
        let versions = state.history.get(id_json)?;
        visible_version(versions, max_seq).and_then(|(_, v)| v.clone())
    }

    /// Version list truncated to `seq ≤ max_seq`.
    pub(crate) fn history_at(&self, id_json: &[u8], max_seq: u64) -> Vec<(u64, Option<T>)> {
        let state = self.state.read().expect("collection lock poisoned");
        match state.history.get(id_json) {
            Some(versions) => versions
                .iter()
                .take_while(|(seq, _)| *seq <= max_seq)
                .map(|(seq, value)| (*seq, value.as_deref().cloned()))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Latest visible documents ordered by encoded id, filtered by id
    /// prefix, resuming after `after` when set.
    pub(crate) fn scan_at(
        &self,
        prefix: Option<&[u8]>,
        after: Option<&[u8]>,
        limit: usize,
        max_seq: u64,
    ) -> Vec<T> {
        let state = self.state.read().expect("collection lock poisoned");
        let mut out = Vec::new();
        for (id, versions) in &state.history {
            if let Some(p) = prefix {
                if !id.starts_with(p) {
                    continue;
                }
            }
            if let Some(a) = after {
                if id.as_slice() <= a {
                    continue;
                }
            }
            if let Some((_, Some(value))) = visible_version(versions, max_seq) {
                out.push(value.as_ref().clone());
                if out.len() >= limit {
                    break;
                }
            }
        }
        out
    }

    /// Count of visible documents at `max_seq`.
    pub(crate) fn count_at(&self, max_seq: u64) -> usize {
        let state = self.state.read().expect("collection lock poisoned");
        state
            .history
            .values()
            .filter(|versions| matches!(visible_version(versions, max_seq), Some((_, Some(_)))))
            .count()
    }

    /// Documents holding `key` in the named index at `max_seq` (one for
    /// unique, id-ordered for multi).
    pub(crate) fn by_index_at(
        &self,
        index: &str,
        key: &[u8],
        max_seq: u64,
    ) -> Result<Vec<T>, StoreError> {
        let state = self.state.read().expect("collection lock poisoned");
        let idx = state
            .indexes
            .get(index)
            .ok_or_else(|| StoreError::UnknownIndex(index.to_string()))?;

        let ids = match &idx.data {
            IndexData::Unique(map) => match map.get(key).and_then(|v| unique_at(v, max_seq)) {
                Some(id) => vec![id],
                None => Vec::new(),
            },
            IndexData::Multi(map) => map
                .get(key)
                .and_then(|v| multi_at(v, max_seq))
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default(),
            _ => {
                return Err(StoreError::UnknownIndex(format!(
                    "{index} is not a key-queryable index"
                )))
            }
        };

        Ok(ids
            .iter()
            .filter_map(|id| {
                state
                    .history
                    .get(id)
                    .and_then(|versions| visible_version(versions, max_seq))
                    .and_then(|(_, v)| v.clone())
                    .map(|v| v.as_ref().clone())
            })
            .collect())
    }

    /// Documents under index keys starting with `prefix`, ordered by index
    /// key then encoded id, up to `limit`.
    pub(crate) fn scan_index_at(
        &self,
        index: &str,
        prefix: &[u8],
        limit: usize,
        max_seq: u64,
    ) -> Result<Vec<T>, StoreError> {
        let state = self.state.read().expect("collection lock poisoned");
        let idx = state
            .indexes
            .get(index)
            .ok_or_else(|| StoreError::UnknownIndex(index.to_string()))?;

        let mut ids_in_order: Vec<Vec<u8>> = Vec::new();
        match &idx.data {
            IndexData::Unique(map) => {
                for (key, versions) in map.range(prefix.to_vec()..) {
                    if !key.starts_with(prefix) {
                        break;
                    }
                    if let Some(id) = unique_at(versions, max_seq) {
                        ids_in_order.push(id);
                        if ids_in_order.len() >= limit {
                            break;
                        }
                    }
                }
            }
            IndexData::Multi(map) => {
                'outer: for (key, versions) in map.range(prefix.to_vec()..) {
                    if !key.starts_with(prefix) {
                        break;
                    }
                    if let Some(set) = multi_at(versions, max_seq) {
                        for id in set.iter() {
                            ids_in_order.push(id.clone());
                            if ids_in_order.len() >= limit {
                                break 'outer;
                            }
                        }
                    }
                }
            }
            _ => {
                return Err(StoreError::UnknownIndex(format!(
                    "{index} is not a key-queryable index"
                )))
            }
        }

        Ok(ids_in_order
            .iter()
            .filter_map(|id| {
                state
                    .history
                    .get(id)
                    .and_then(|versions| visible_version(versions, max_seq))
                    .and_then(|(_, v)| v.clone())
                    .map(|v| v.as_ref().clone())
            })
            .collect())
    }

    /// Ids whose full-text projection contains `term` (external-module
    /// contract surface).
    pub(crate) fn fts_postings(&self, index: &str, term: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        let state = self.state.read().expect("collection lock poisoned");
        match state.indexes.get(index).map(|i| &i.data) {
            Some(IndexData::Fts { postings, .. }) => Ok(postings
                .get(&term.to_lowercase())
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()),
            Some(_) | None => Err(StoreError::UnknownIndex(index.to_string())),
        }
    }

    /// `(idJSON, embedding)` pairs of the named vector index.
    pub(crate) fn vector_entries(&self, index: &str) -> Result<Vec<(Vec<u8>, Vec<f32>)>, StoreError> {
        let state = self.state.read().expect("collection lock poisoned");
        match state.indexes.get(index).map(|i| &i.data) {
            Some(IndexData::Vector(map)) => {
                Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            }
            Some(_) | None => Err(StoreError::UnknownIndex(index.to_string())),
        }
    }

    /// Catalog key-path declarations still missing from this core (used to
    /// rebuild dynamic indexes after restart).
    pub(crate) fn missing_defs(&self, defs: &[IndexDef]) -> Vec<IndexDef> {
        let state = self.state.read().expect("collection lock poisoned");
        defs.iter()
            .filter(|def| def.field.is_some() && !state.indexes.contains_key(&def.name))
            .cloned()
            .collect()
    }
}

// ------------------------------------------------------------------------------------------------
// Hook implementation
// ------------------------------------------------------------------------------------------------

impl<T: Document> CollectionHooks for CollectionCore<T> {
    fn validate(&self, ops: &[RawOp]) -> Result<(), StoreError> {
        let state = self.state.read().expect("collection lock poisoned");

        for (index_name, index) in &state.indexes {
            let IndexData::Unique(map) = &index.data else {
                continue;
            };
            let Projector::Unique(project) = &index.projector else {
                continue;
            };

            // Overlay simulation: committed heads, then each op in batch
            // order. A put conflicts with a *different* id holding its key.
            let mut live: BTreeMap<Vec<u8>, Vec<u8>> = map
                .iter()
                .filter_map(|(key, versions)| {
                    versions
                        .last()
                        .and_then(|(_, id)| id.clone())
                        .map(|id| (key.clone(), id))
                })
                .collect();
            let mut key_of: HashMap<Vec<u8>, Option<Vec<u8>>> = HashMap::new();

            for op in ops {
                let id = op.id_json.clone();
                let old_key = match key_of.get(&id) {
                    Some(k) => k.clone(),
                    None => state
                        .history
                        .get(&id)
                        .and_then(|versions| versions.last())
                        .and_then(|(_, value)| value.as_ref())
                        .map(|value| project(value)),
                };

                match &op.value {
                    Some(bytes) => {
                        let doc: T = serde_json::from_slice(bytes)?;
                        let new_key = project(&doc);
                        if let Some(holder) = live.get(&new_key) {
                            if holder != &id {
                                return Err(StoreError::UniqueConstraint {
                                    index: index_name.clone(),
                                    key: String::from_utf8_lossy(&new_key).into_owned(),
                                });
                            }
                        }
                        if let Some(old) = old_key {
                            if old != new_key {
                                live.remove(&old);
                            }
                        }
                        live.insert(new_key.clone(), id.clone());
                        key_of.insert(id, Some(new_key));
                    }
                    None => {
                        if let Some(old) = old_key {
                            live.remove(&old);
                        }
                        key_of.insert(id, None);
                    }
                }
            }
        }
        Ok(())
    }

    fn apply(&self, id_json: &[u8], value: Option<&[u8]>, seq: u64) -> Result<(), StoreError> {
        let new_doc: Option<Arc<T>> = match value {
            Some(bytes) => Some(Arc::new(serde_json::from_slice(bytes)?)),
            None => None,
        };

        let mut state = self.state.write().expect("collection lock poisoned");
        let versions = state.history.entry(id_json.to_vec()).or_default();

        // Replays can redeliver already-materialized sequences; versions
        // within an id are strictly increasing.
        if versions.last().is_some_and(|(last, _)| *last >= seq) {
            return Ok(());
        }
        let old_doc = versions.last().and_then(|(_, v)| v.clone());
        versions.push((seq, new_doc.clone()));

        for index in state.indexes.values_mut() {
            update_index(index, id_json, old_doc.as_deref(), new_doc.as_deref(), seq);
        }
        Ok(())
    }

    fn clear(&self) {
        let mut state = self.state.write().expect("collection lock poisoned");
        state.history.clear();
        for index in state.indexes.values_mut() {
            index.data = IndexData::empty_for(index.projector.kind());
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Index maintenance
// ------------------------------------------------------------------------------------------------

/// Records the version edges one committed write makes in one index.
fn update_index<T>(
    index: &mut IndexState<T>,
    id_json: &[u8],
    old: Option<&T>,
    new: Option<&T>,
    seq: u64,
) {
    match (&index.projector, &mut index.data) {
        (Projector::Unique(project), IndexData::Unique(map)) => {
            let old_key = old.map(|d| project(d));
            let new_key = new.map(|d| project(d));
            if old_key == new_key {
                return;
            }
            if let Some(old_key) = old_key {
                map.entry(old_key).or_default().push((seq, None));
            }
            if let Some(new_key) = new_key {
                map.entry(new_key)
                    .or_default()
                    .push((seq, Some(id_json.to_vec())));
            }
        }

        (Projector::Multi(project), IndexData::Multi(map)) => {
            let old_keys: BTreeSet<Vec<u8>> =
                old.map(|d| project(d).into_iter().collect()).unwrap_or_default();
            let new_keys: BTreeSet<Vec<u8>> =
                new.map(|d| project(d).into_iter().collect()).unwrap_or_default();

            for key in old_keys.difference(&new_keys) {
                let versions = map.entry(key.clone()).or_default();
                let mut set = versions.last().map(|(_, s)| s.clone()).unwrap_or_default();
                set.remove(id_json);
                versions.push((seq, set));
            }
            for key in new_keys.difference(&old_keys) {
                let versions = map.entry(key.clone()).or_default();
                let mut set = versions.last().map(|(_, s)| s.clone()).unwrap_or_default();
                set.insert(id_json.to_vec());
                versions.push((seq, set));
            }
        }

        (Projector::Fts(project), IndexData::Fts { postings, doc_terms }) => {
            if let Some(old_terms) = doc_terms.remove(id_json) {
                for term in old_terms {
                    if let Some(set) = postings.get_mut(&term) {
                        set.remove(id_json);
                        if set.is_empty() {
                            postings.remove(&term);
                        }
                    }
                }
            }
            if let Some(doc) = new {
                let terms = tokenize(&project(doc));
                for term in &terms {
                    postings
                        .entry(term.clone())
                        .or_default()
                        .insert(id_json.to_vec());
                }
                doc_terms.insert(id_json.to_vec(), terms);
            }
        }

        (Projector::Vector(project), IndexData::Vector(map)) => {
            match new {
                Some(doc) => {
                    map.insert(id_json.to_vec(), project(doc));
                }
                None => {
                    map.remove(id_json);
                }
            }
        }

        // Kind mismatch cannot happen: data is created from the projector.
        _ => unreachable!("index data does not match projector kind"),
    }
}

/// Lowercased alphanumeric tokens, deduplicated.
fn tokenize(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(t.to_string()))
        .map(str::to_string)
        .collect()
}

/// Latest version with `seq ≤ max_seq`.
fn visible_version<T>(
    versions: &[(u64, Option<Arc<T>>)],
    max_seq: u64,
) -> Option<&(u64, Option<Arc<T>>)> {
    versions.iter().rev().find(|(seq, _)| *seq <= max_seq)
}

fn unique_at(versions: &UniqueVersions, max_seq: u64) -> Option<Vec<u8>> {
    versions
        .iter()
        .rev()
        .find(|(seq, _)| *seq <= max_seq)
        .and_then(|(_, id)| id.clone())
}

fn multi_at(versions: &MultiVersions, max_seq: u64) -> Option<&BTreeSet<Vec<u8>>> {
    versions
        .iter()
        .rev()
        .find(|(seq, _)| *seq <= max_seq)
        .map(|(_, set)| set)
}

// ------------------------------------------------------------------------------------------------
// Public handle
// ------------------------------------------------------------------------------------------------

/// Typed handle to one collection. Cheap to clone; all mutations route
/// through the owning store's single-writer commit path.
pub struct Collection<T: Document> {
    pub(crate) core: Arc<CollectionCore<T>>,
    pub(crate) store: Arc<StoreInner>,
}

impl<T: Document> std::fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.core.name)
            .finish()
    }
}

impl<T: Document> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            store: Arc::clone(&self.store),
        }
    }
}

impl<T: Document> Collection<T> {
    /// Collection name.
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Writes a document (new version, never in place). Returns the commit
    /// sequence.
    pub fn put(&self, doc: &T) -> Result<u64, StoreError> {
        let id_json = encode_id(&doc.id())?;
        let value = serde_json::to_vec(doc)?;
        self.store
            .commit_single(self.core.name(), id_json, Some(value))
    }

    /// Tombstones a document. Returns the commit sequence.
    pub fn delete(&self, id: &T::Id) -> Result<u64, StoreError> {
        let id_json = encode_id(id)?;
        self.store.commit_single(self.core.name(), id_json, None)
    }

    /// A put operation for [`Store::batch`](crate::store::Store::batch).
    pub fn put_op(&self, doc: &T) -> Result<RawOp, StoreError> {
        Ok(RawOp {
            collection: self.core.name().to_string(),
            id_json: encode_id(&doc.id())?,
            value: Some(serde_json::to_vec(doc)?),
        })
    }

    /// A delete operation for [`Store::batch`](crate::store::Store::batch).
    pub fn delete_op(&self, id: &T::Id) -> Result<RawOp, StoreError> {
        Ok(RawOp {
            collection: self.core.name().to_string(),
            id_json: encode_id(id)?,
            value: None,
        })
    }

    /// Reads the latest version visible at `snapshot` (or now). Tombstones
    /// read as `None`.
    pub fn get(
        &self,
        id: &T::Id,
        snapshot: Option<&crate::store::Snapshot>,
    ) -> Result<Option<T>, StoreError> {
        let id_json = encode_id(id)?;
        let max_seq = snapshot.map_or(u64::MAX, |s| s.sequence());

        if self.core.knows_id(&id_json) {
            return Ok(self.core.get_at(&id_json, max_seq).map(|v| v.as_ref().clone()));
        }

        // Not bootstrapped into history: fall through to the raw layers.
        match self.store.lookup_raw(self.core.name(), &id_json, max_seq)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Declares an index, backfills it from current heads, and persists its
    /// definition in the manifest catalog.
    pub fn define_index(&self, spec: IndexSpec<T>) -> Result<(), StoreError> {
        let def = self.core.define_index(spec)?;
        self.store.persist_index_def(self.core.name(), def)
    }

    /// Documents holding `key` in the named index (unique: zero or one).
    pub fn by_index(
        &self,
        index: &str,
        key: &[u8],
        snapshot: Option<&crate::store::Snapshot>,
    ) -> Result<Vec<T>, StoreError> {
        let max_seq = snapshot.map_or(u64::MAX, |s| s.sequence());
        self.core.by_index_at(index, key, max_seq)
    }

    /// Documents under index keys starting with `prefix`, ordered by index
    /// key then encoded id. `limit` defaults to the store's scan limit.
    pub fn scan_index(
        &self,
        index: &str,
        prefix: &[u8],
        limit: Option<usize>,
        snapshot: Option<&crate::store::Snapshot>,
    ) -> Result<Vec<T>, StoreError> {
        let max_seq = snapshot.map_or(u64::MAX, |s| s.sequence());
        let limit = limit.unwrap_or(self.store.default_scan_limit());
        self.core.scan_index_at(index, prefix, limit, max_seq)
    }

    /// Latest visible documents ordered by encoded id, optionally filtered
    /// by an encoded-id prefix.
    pub fn scan(
        &self,
        prefix: Option<&[u8]>,
        limit: Option<usize>,
        snapshot: Option<&crate::store::Snapshot>,
    ) -> Result<Vec<T>, StoreError> {
        let max_seq = snapshot.map_or(u64::MAX, |s| s.sequence());
        let limit = limit.unwrap_or(self.store.default_scan_limit());
        Ok(self.core.scan_at(prefix, None, limit, max_seq))
    }

    /// Like [`scan`](Self::scan) but resuming after the encoded id of the
    /// last document a previous page returned.
    pub fn scan_page(
        &self,
        prefix: Option<&[u8]>,
        after: Option<&[u8]>,
        limit: Option<usize>,
        snapshot: Option<&crate::store::Snapshot>,
    ) -> Result<Vec<T>, StoreError> {
        let max_seq = snapshot.map_or(u64::MAX, |s| s.sequence());
        let limit = limit.unwrap_or(self.store.default_scan_limit());
        Ok(self.core.scan_at(prefix, after, limit, max_seq))
    }

    /// The document's version list (ascending by sequence) up to the
    /// snapshot bound.
    pub fn history(
        &self,
        id: &T::Id,
        snapshot: Option<&crate::store::Snapshot>,
    ) -> Result<Vec<(u64, Option<T>)>, StoreError> {
        let id_json = encode_id(id)?;
        let max_seq = snapshot.map_or(u64::MAX, |s| s.sequence());
        Ok(self.core.history_at(&id_json, max_seq))
    }

    /// Number of visible documents.
    pub fn count(&self, snapshot: Option<&crate::store::Snapshot>) -> usize {
        let max_seq = snapshot.map_or(u64::MAX, |s| s.sequence());
        self.core.count_at(max_seq)
    }

    /// Encoded ids whose full-text projection contains `term` (contract
    /// surface for the external search module).
    pub fn fts_postings(&self, index: &str, term: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        self.core.fts_postings(index, term)
    }

    /// `(idJSON, embedding)` pairs of a vector index (contract surface for
    /// the external search module).
    pub fn vector_entries(&self, index: &str) -> Result<Vec<(Vec<u8>, Vec<f32>)>, StoreError> {
        self.core.vector_entries(index)
    }
}
