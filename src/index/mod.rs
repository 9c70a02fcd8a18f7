//! Index Definitions and Projectors
//!
//! A secondary index is declared by an [`IndexSpec`]: a name plus a
//! [`Projector`] that extracts index keys from a typed document. Four kinds
//! exist:
//!
//! - **Unique** — one key per document, at most one live document per key.
//! - **Multi** — many keys per document, many documents per key.
//! - **Fts** — projects the text that the full-text module indexes.
//! - **Vector** — projects the embedding that the vector module indexes.
//!
//! The manifest persists only the serializable part of a definition
//! ([`IndexDef`]): name, kind, and — for indexes declared over untyped JSON
//! documents — the key-path string the projector was parsed from. Typed
//! projectors hold closures and must be re-declared by the caller after a
//! restart; key-path projectors are rebuilt from the catalog.
//!
//! [`KeyPath`] is the extractor for untyped documents, supporting `.field`,
//! `.a.b`, and `.arr[]` (array fan-out).


use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Catalog forms (persisted in the manifest)
// ------------------------------------------------------------------------------------------------

/// The four index kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    /// One key per document, at most one live document per key.
    Unique,

    /// Many-to-many keys.
    Multi,

    /// Full-text projection (external search module).
    Fts,

    /// Embedding projection (external search module).
    Vector,
}

/// Serializable index definition, as stored in the manifest catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    /// Index name, unique within its collection.
    pub name: String,

    /// Index kind.
    pub kind: IndexKind,

    /// Key-path string for untyped (JSON) documents; absent for typed
    /// projector-backed indexes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

// ------------------------------------------------------------------------------------------------
// Typed projectors
// ------------------------------------------------------------------------------------------------

/// Extracts index keys from a typed document.
pub enum Projector<T> {
    /// Single key; uniqueness enforced.
    Unique(Box<dyn Fn(&T) -> Vec<u8> + Send + Sync>),

    /// Zero or more keys.
    Multi(Box<dyn Fn(&T) -> Vec<Vec<u8>> + Send + Sync>),

    /// Text handed to the full-text module.
    Fts(Box<dyn Fn(&T) -> String + Send + Sync>),

    /// Embedding handed to the vector module.
    Vector(Box<dyn Fn(&T) -> Vec<f32> + Send + Sync>),
}

impl<T> Projector<T> {
    /// The kind this projector feeds.
    pub fn kind(&self) -> IndexKind {
        match self {
            Self::Unique(_) => IndexKind::Unique,
            Self::Multi(_) => IndexKind::Multi,
            Self::Fts(_) => IndexKind::Fts,
            Self::Vector(_) => IndexKind::Vector,
        }
    }
}

impl<T> std::fmt::Debug for Projector<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Unique(_) => "Projector::Unique",
            Self::Multi(_) => "Projector::Multi",
            Self::Fts(_) => "Projector::Fts",
            Self::Vector(_) => "Projector::Vector",
        })
    }
}

/// A full index declaration: name, projector, and (for untyped documents)
/// the key-path string to persist in the catalog.
#[derive(Debug)]
pub struct IndexSpec<T> {
    /// Index name, unique within its collection.
    pub name: String,

    /// Key extraction.
    pub projector: Projector<T>,

    /// Key-path string, when the projector was parsed from one.
    pub field: Option<String>,
}

impl<T> IndexSpec<T> {
    /// Declares a unique index.
    pub fn unique(
        name: impl Into<String>,
        extract: impl Fn(&T) -> Vec<u8> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            projector: Projector::Unique(Box::new(extract)),
            field: None,
        }
    }

    /// Declares a multi-valued index.
    pub fn multi(
        name: impl Into<String>,
        extract: impl Fn(&T) -> Vec<Vec<u8>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            projector: Projector::Multi(Box::new(extract)),
            field: None,
        }
    }

    /// Declares a full-text projection.
    pub fn fts(
        name: impl Into<String>,
        extract: impl Fn(&T) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            projector: Projector::Fts(Box::new(extract)),
            field: None,
        }
    }

    /// Declares a vector projection.
    pub fn vector(
        name: impl Into<String>,
        extract: impl Fn(&T) -> Vec<f32> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            projector: Projector::Vector(Box::new(extract)),
            field: None,
        }
    }

    /// The serializable catalog form.
    pub fn def(&self) -> IndexDef {
        IndexDef {
            name: self.name.clone(),
            kind: self.projector.kind(),
            field: self.field.clone(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Key paths over JSON trees
// ------------------------------------------------------------------------------------------------

/// Errors from key-path parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyPathError {
    /// Paths must begin with `.`.
    #[error("key path must start with '.': {0:?}")]
    MissingLeadingDot(String),

    /// Empty segment (`..` or a trailing dot).
    #[error("empty segment in key path {0:?}")]
    EmptySegment(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    /// Object field access.
    Field(String),

    /// Array fan-out (`[]`).
    Spread,
}

/// A parsed key path such as `.a.b` or `.tags[]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPath {
    segments: Vec<Segment>,
    source: String,
}

impl KeyPath {
    /// Parses a path string: `.field`, `.a.b`, `.arr[]`, `.a.b[]`.
    pub fn parse(path: &str) -> Result<Self, KeyPathError> {
        let Some(rest) = path.strip_prefix('.') else {
            return Err(KeyPathError::MissingLeadingDot(path.to_string()));
        };

        let mut segments = Vec::new();
        for part in rest.split('.') {
            let mut part = part;
            if part.is_empty() {
                return Err(KeyPathError::EmptySegment(path.to_string()));
            }
            let mut spreads = 0;
            while let Some(stripped) = part.strip_suffix("[]") {
                part = stripped;
                spreads += 1;
            }
            if part.is_empty() {
                return Err(KeyPathError::EmptySegment(path.to_string()));
            }
            segments.push(Segment::Field(part.to_string()));
            for _ in 0..spreads {
                segments.push(Segment::Spread);
            }
        }

        Ok(Self {
            segments,
            source: path.to_string(),
        })
    }

    /// The original path string.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Extracts every leaf the path reaches in `value`. `[]` fans out over
    /// array elements; a missing field yields nothing.
    pub fn extract<'a>(&self, value: &'a Value) -> Vec<&'a Value> {
        let mut current = vec![value];
        for segment in &self.segments {
            let mut next = Vec::new();
            match segment {
                Segment::Field(name) => {
                    for v in current {
                        if let Some(child) = v.get(name) {
                            next.push(child);
                        }
                    }
                }
                Segment::Spread => {
                    for v in current {
                        if let Some(items) = v.as_array() {
                            next.extend(items.iter());
                        }
                    }
                }
            }
            current = next;
        }
        current
    }
}

/// Builds a projector over untyped JSON documents from a key path.
///
/// - `Unique`: the first leaf, JSON-encoded (`null` when the path misses).
/// - `Multi`: every leaf, JSON-encoded.
/// - `Fts`: string leaves joined with a single space.
/// - `Vector`: the first leaf that is an array of numbers.
pub fn value_projector(kind: IndexKind, path: KeyPath) -> Projector<Value> {
    match kind {
        IndexKind::Unique => Projector::Unique(Box::new(move |doc: &Value| {
            let leaf = path.extract(doc).into_iter().next().cloned();
            encode_index_key(&leaf.unwrap_or(Value::Null))
        })),
        IndexKind::Multi => Projector::Multi(Box::new(move |doc: &Value| {
            path.extract(doc).into_iter().map(encode_index_key).collect()
        })),
        IndexKind::Fts => Projector::Fts(Box::new(move |doc: &Value| {
            path.extract(doc)
                .into_iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(" ")
        })),
        IndexKind::Vector => Projector::Vector(Box::new(move |doc: &Value| {
            path.extract(doc)
                .into_iter()
                .find_map(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_f64)
                        .map(|f| f as f32)
                        .collect()
                })
                .unwrap_or_default()
        })),
    }
}

/// JSON-encodes an index key leaf.
pub fn encode_index_key(value: &Value) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_else(|_| b"null".to_vec())
}
