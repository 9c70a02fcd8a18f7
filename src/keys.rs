//! Composite key encoding.
//!
//! Every record in the store lives at a composite key:
//!
//! ```text
//! collection || 0x00 || idJSON [ || 0x00 || seq(8 BE) ]
//! ```
//!
//! The trailing sequence suffix is present in SSTable keys (so multiple
//! versions of one document sort adjacently and survive restarts) and absent
//! in WAL payload keys and in-memory index maps. JSON text never contains a
//! raw NUL byte, so the separators are unambiguous.

const SEP: u8 = 0x00;
const SEQ_SUFFIX_LEN: usize = 1 + 8;

/// A key split into its components.
#[derive(Debug, PartialEq, Eq)]
pub struct ParsedKey<'a> {
    /// Collection name (UTF-8).
    pub collection: &'a [u8],

    /// JSON-encoded document id.
    pub id_json: &'a [u8],

    /// Sequence suffix, when present.
    pub seq: Option<u64>,
}

/// Builds the base key `collection || 0x00 || idJSON` (no sequence suffix).
pub fn base_key(collection: &str, id_json: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(collection.len() + 1 + id_json.len());
    key.extend_from_slice(collection.as_bytes());
    key.push(SEP);
    key.extend_from_slice(id_json);
    key
}

/// Appends the big-endian sequence suffix to a base key.
pub fn versioned_key(base: &[u8], seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(base.len() + SEQ_SUFFIX_LEN);
    key.extend_from_slice(base);
    key.push(SEP);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// Splits a key into `(collection, idJSON, seq?)`.
///
/// Returns `None` when the key has no collection separator. The sequence
/// suffix is recognized by shape: a trailing `0x00` followed by exactly
/// eight bytes, after the id portion.
pub fn parse_key(key: &[u8]) -> Option<ParsedKey<'_>> {
    let sep = key.iter().position(|&b| b == SEP)?;
    let collection = &key[..sep];
    let rest = &key[sep + 1..];

    if rest.len() > SEQ_SUFFIX_LEN && rest[rest.len() - SEQ_SUFFIX_LEN] == SEP {
        let id_json = &rest[..rest.len() - SEQ_SUFFIX_LEN];
        let seq_bytes: [u8; 8] = rest[rest.len() - 8..].try_into().ok()?;
        Some(ParsedKey {
            collection,
            id_json,
            seq: Some(u64::from_be_bytes(seq_bytes)),
        })
    } else {
        Some(ParsedKey {
            collection,
            id_json: rest,
            seq: None,
        })
    }
}

/// Strips the sequence suffix from a versioned key, if present.
pub fn strip_seq(key: &[u8]) -> (&[u8], Option<u64>) {
    if key.len() > SEQ_SUFFIX_LEN && key[key.len() - SEQ_SUFFIX_LEN] == SEP {
        let seq_bytes: [u8; 8] = match key[key.len() - 8..].try_into() {
            Ok(b) => b,
            Err(_) => return (key, None),
        };
        (
            &key[..key.len() - SEQ_SUFFIX_LEN],
            Some(u64::from_be_bytes(seq_bytes)),
        )
    } else {
        (key, None)
    }
}
