use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::rev_tree::RevTree;

// ---------------------------------------------------------------------------
// Revision
// ---------------------------------------------------------------------------

/// A revision identifier: `{pos}-{hash}`.
///
/// - `pos` is the generation number (starts at 1, increments each edit).
/// - `hash` is a 32-character hex MD5 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Revision {
    pub pos: u64,
    pub hash: String,
}

impl Revision {
    pub fn new(pos: u64, hash: impl Into<String>) -> Self {
        Self {
            pos,
            hash: hash.into(),
        }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.pos, self.hash)
    }
}

impl FromStr for Revision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (pos_str, hash) = s
            .split_once('-')
            .ok_or_else(|| Error::InvalidRev(s.to_string()))?;
        let pos: u64 = pos_str
            .parse()
            .map_err(|_| Error::InvalidRev(s.to_string()))?;
        if hash.is_empty() {
            return Err(Error::InvalidRev(s.to_string()));
        }
        Ok(Revision {
            pos,
            hash: hash.to_string(),
        })
    }
}

impl Ord for Revision {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.pos
            .cmp(&other.pos)
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// ---------------------------------------------------------------------------
// DocMeta — per-document metadata persisted in the document store
// ---------------------------------------------------------------------------

/// Everything the adapter knows about a document besides its bodies.
///
/// `rev` is the revision introduced by the most recent write; the winning
/// revision is always recomputed from `rev_tree`, never read from here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocMeta {
    pub id: String,
    pub rev: Revision,
    pub rev_tree: RevTree,
    /// Maps every materialized revision to the sequence its body lives under.
    #[serde(default)]
    pub rev_map: HashMap<String, u64>,
    /// Sequence of the most recently written revision.
    #[serde(default)]
    pub seq: u64,
    /// Whether the winning leaf was deleted as of the last write.
    #[serde(default)]
    pub deleted: bool,
}

// ---------------------------------------------------------------------------
// Option structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Retrieve a specific revision instead of the winner.
    pub rev: Option<String>,
    /// Include conflicting leaf revisions in `_conflicts`.
    pub conflicts: bool,
    /// Expand attachment stubs into inline base64 data.
    pub attachments: bool,
}

#[derive(Debug, Clone, Default)]
pub struct GetAttachmentOptions {
    /// Read the attachment as of a specific revision of the document.
    pub rev: Option<String>,
    /// Return base64 text instead of raw bytes.
    pub encode: bool,
}

#[derive(Debug, Clone)]
pub struct AllDocsOptions {
    pub start_key: Option<String>,
    pub end_key: Option<String>,
    /// Shorthand for a one-element `keys` list.
    pub key: Option<String>,
    /// Explicit key list; rows come back in this order (reversed when
    /// `descending`), with deleted and missing keys reported per key.
    pub keys: Option<Vec<String>>,
    pub include_docs: bool,
    pub conflicts: bool,
    pub descending: bool,
    pub skip: u64,
    pub limit: Option<u64>,
    /// Whether a row whose key equals `end_key` is included. Defaults to
    /// true.
    pub inclusive_end: bool,
}

impl Default for AllDocsOptions {
    fn default() -> Self {
        Self {
            start_key: None,
            end_key: None,
            key: None,
            keys: None,
            include_docs: false,
            conflicts: false,
            descending: false,
            skip: 0,
            limit: None,
            inclusive_end: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BulkDocsOptions {
    /// When true (interactive edits), new revisions are generated and
    /// conflicting writes are rejected. When false (replication), incoming
    /// revision trees are merged as-is.
    pub new_edits: bool,
    /// Set by delete operations so that deleting a nonexistent document
    /// reports `not_found` instead of silently inserting a tombstone.
    pub was_delete: bool,
}

impl Default for BulkDocsOptions {
    fn default() -> Self {
        Self {
            new_edits: true,
            was_delete: false,
        }
    }
}

impl BulkDocsOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replication() -> Self {
        Self {
            new_edits: false,
            was_delete: false,
        }
    }

    pub fn delete() -> Self {
        Self {
            new_edits: true,
            was_delete: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChangesOptions {
    pub since: u64,
    pub limit: Option<u64>,
    pub descending: bool,
    pub include_docs: bool,
    /// Include `_conflicts` in emitted docs.
    pub conflicts: bool,
    /// Only emit changes for these document ids.
    pub doc_ids: Option<Vec<String>>,
    /// Inline Mango selector applied to each change's document.
    pub selector: Option<serde_json::Value>,
    /// `"ddoc/filtername"`: names a selector stored in a design document.
    pub filter: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub create_if_missing: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// Per-document outcome of a bulk write, in input order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocResult {
    pub ok: bool,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl DocResult {
    pub fn ok(id: impl Into<String>, rev: String) -> Self {
        Self {
            ok: true,
            id: id.into(),
            rev: Some(rev),
            error: None,
            reason: None,
            status: None,
        }
    }

    pub fn err(id: impl Into<String>, err: &Error) -> Self {
        Self {
            ok: false,
            id: id.into(),
            rev: None,
            error: Some(err.name().to_string()),
            reason: Some(err.reason()),
            status: Some(err.status()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllDocsRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<AllDocsRowValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<serde_json::Value>,
    /// `"not_found"` for keys-mode lookups that matched nothing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllDocsRowValue {
    pub rev: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllDocsResponse {
    pub total_rows: u64,
    pub offset: u64,
    pub rows: Vec<AllDocsRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbInfo {
    pub db_name: String,
    /// Count of distinct non-local documents ever inserted. Deletions do
    /// not decrement it and resurrections do not re-increment it.
    pub doc_count: u64,
    pub update_seq: u64,
}

// ---------------------------------------------------------------------------
// Change feed types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub seq: u64,
    pub id: String,
    /// Leaf revisions of the document, winner first.
    pub changes: Vec<ChangeRev>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRev {
    pub rev: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesResponse {
    pub results: Vec<ChangeEvent>,
    pub last_seq: u64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_display_and_parse() {
        let rev = Revision::new(3, "abc123");
        assert_eq!(rev.to_string(), "3-abc123");

        let parsed: Revision = "3-abc123".parse().unwrap();
        assert_eq!(parsed, rev);
    }

    #[test]
    fn revision_ordering() {
        let r1 = Revision::new(1, "aaa");
        let r2 = Revision::new(2, "aaa");
        let r3 = Revision::new(2, "bbb");
        assert!(r1 < r2);
        assert!(r2 < r3);
    }

    #[test]
    fn invalid_revision() {
        assert!("nope".parse::<Revision>().is_err());
        assert!("abc-123".parse::<Revision>().is_err());
        assert!("3-".parse::<Revision>().is_err());
    }

    #[test]
    fn bulk_docs_options_defaults() {
        let opts = BulkDocsOptions::new();
        assert!(opts.new_edits);
        assert!(!opts.was_delete);

        let repl = BulkDocsOptions::replication();
        assert!(!repl.new_edits);

        assert!(BulkDocsOptions::delete().was_delete);
    }

    #[test]
    fn doc_result_from_error() {
        let row = DocResult::err("a", &Error::RevConflict);
        assert!(!row.ok);
        assert_eq!(row.error.as_deref(), Some("conflict"));
        assert_eq!(row.status, Some(409));
    }

    #[test]
    fn doc_meta_roundtrips_through_json() {
        let meta = DocMeta {
            id: "doc1".into(),
            rev: Revision::new(1, "aaa"),
            rev_tree: vec![],
            rev_map: HashMap::from([("1-aaa".to_string(), 7u64)]),
            seq: 7,
            deleted: false,
        };
        let bytes = serde_json::to_vec(&meta).unwrap();
        let back: DocMeta = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.id, "doc1");
        assert_eq!(back.rev_map["1-aaa"], 7);
    }
}
