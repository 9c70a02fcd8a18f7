use serde::{Deserialize, Serialize};

use crate::collection::{CollectionCore, CollectionHooks, Document};
use crate::store::RawOp;

/// The document type most collection tests use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub email: String,
    pub tags: Vec<String>,
}

impl Document for User {
    type Id = u64;

    fn id(&self) -> u64 {
        self.id
    }
}

pub fn user(id: u64, email: &str, tags: &[&str]) -> User {
    User {
        id,
        email: email.to_string(),
        tags: tags.iter().map(|t| t.to_string()).collect(),
    }
}

/// Applies a put directly through the hook interface at `seq`.
pub fn put(core: &CollectionCore<User>, doc: &User, seq: u64) {
    let id_json = serde_json::to_vec(&doc.id).unwrap();
    let value = serde_json::to_vec(doc).unwrap();
    core.apply(&id_json, Some(&value), seq).unwrap();
}

/// Applies a tombstone directly through the hook interface at `seq`.
pub fn delete(core: &CollectionCore<User>, id: u64, seq: u64) {
    let id_json = serde_json::to_vec(&id).unwrap();
    core.apply(&id_json, None, seq).unwrap();
}

pub fn put_op(doc: &User) -> RawOp {
    RawOp {
        collection: "users".into(),
        id_json: serde_json::to_vec(&doc.id).unwrap(),
        value: Some(serde_json::to_vec(doc).unwrap()),
    }
}

pub fn delete_op(id: u64) -> RawOp {
    RawOp {
        collection: "users".into(),
        id_json: serde_json::to_vec(&id).unwrap(),
        value: None,
    }
}

pub fn id_json(id: u64) -> Vec<u8> {
    serde_json::to_vec(&id).unwrap()
}
