//! Incoming document parsing.
//!
//! Turns a raw JSON document plus the `new_edits` flag into the metadata
//! and body the write pipeline works with: underscore fields extracted and
//! validated, a fresh revision generated (interactive edits) or the given
//! revision path reconstructed (replication).

use md5::{Digest, Md5};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::document::{DocMeta, Revision};
use crate::error::{Error, Result};
use crate::rev_tree::{RevNode, RevPath, RevStatus, build_path};

/// A parsed document ready for the write pipeline. The body still carries
/// `_attachments`; all other underscore fields have been extracted.
#[derive(Debug, Clone)]
pub struct ParsedDoc {
    pub meta: DocMeta,
    pub body: Map<String, Value>,
}

/// Ids starting with `_local/` are adapter-private: stored, but excluded
/// from `all_docs` and the change feed.
pub fn is_local_id(id: &str) -> bool {
    id.starts_with("_local/")
}

pub fn parse_doc(raw: Value, new_edits: bool) -> Result<ParsedDoc> {
    let Value::Object(mut obj) = raw else {
        return Err(Error::BadRequest("document must be a JSON object".into()));
    };

    let id = match obj.remove("_id") {
        None => Uuid::new_v4().simple().to_string(),
        Some(Value::String(id)) => id,
        Some(_) => return Err(Error::BadRequest("document id must be a string".into())),
    };
    if id.starts_with('_') && !is_local_id(&id) && !id.starts_with("_design/") {
        return Err(Error::BadRequest(format!(
            "only reserved document ids may start with underscore: {id}"
        )));
    }

    let rev = obj
        .remove("_rev")
        .and_then(|v| v.as_str().map(String::from))
        .map(|s| s.parse::<Revision>())
        .transpose()?;

    let deleted = obj
        .remove("_deleted")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let revisions = obj.remove("_revisions");

    // `_attachments` stays in the body; anything else underscored is either
    // adapter output (`_conflicts`) or a typo, and both are rejected.
    if let Some(field) = obj
        .keys()
        .find(|k| k.starts_with('_') && k.as_str() != "_attachments")
    {
        return Err(Error::BadRequest(format!("invalid field name: {field}")));
    }

    if new_edits {
        parse_new_edit(id, rev, deleted, obj)
    } else {
        parse_replicated(id, rev, revisions, deleted, obj)
    }
}

fn parse_new_edit(
    id: String,
    parent: Option<Revision>,
    deleted: bool,
    body: Map<String, Value>,
) -> Result<ParsedDoc> {
    let pos = parent.as_ref().map(|r| r.pos + 1).unwrap_or(1);
    let rev = Revision::new(pos, next_rev_hash(&id, parent.as_ref(), deleted, &body));

    let leaf = RevNode::leaf(rev.hash.clone(), deleted);
    let path = match &parent {
        Some(parent) => RevPath {
            pos: parent.pos,
            node: RevNode {
                hash: parent.hash.clone(),
                deleted: false,
                status: RevStatus::Missing,
                children: vec![leaf],
            },
        },
        None => RevPath { pos: 1, node: leaf },
    };

    Ok(ParsedDoc {
        meta: DocMeta {
            id,
            rev,
            rev_tree: vec![path],
            rev_map: Default::default(),
            seq: 0,
            deleted,
        },
        body,
    })
}

fn parse_replicated(
    id: String,
    rev: Option<Revision>,
    revisions: Option<Value>,
    deleted: bool,
    body: Map<String, Value>,
) -> Result<ParsedDoc> {
    let rev = rev.ok_or_else(|| {
        Error::BadRequest("_rev is required when writing with new_edits=false".into())
    })?;

    let path = match revisions {
        Some(revisions) => {
            let (start, hashes) = unpack_revisions(&revisions)?;
            if start != rev.pos || hashes.first() != Some(&rev.hash) {
                return Err(Error::BadRequest("_revisions does not match _rev".into()));
            }
            build_path(start, &hashes, deleted)
        }
        None => RevPath {
            pos: rev.pos,
            node: RevNode::leaf(rev.hash.clone(), deleted),
        },
    };

    Ok(ParsedDoc {
        meta: DocMeta {
            id,
            rev,
            rev_tree: vec![path],
            rev_map: Default::default(),
            seq: 0,
            deleted,
        },
        body,
    })
}

/// CouchDB `_revisions` format: `{start: N, ids: [leaf_hash, parent, …]}`.
fn unpack_revisions(value: &Value) -> Result<(u64, Vec<String>)> {
    let invalid = || Error::BadRequest("invalid _revisions".into());
    let start = value.get("start").and_then(Value::as_u64).ok_or_else(invalid)?;
    let ids = value
        .get("ids")
        .and_then(Value::as_array)
        .ok_or_else(invalid)?
        .iter()
        .map(|v| v.as_str().map(String::from).ok_or_else(invalid))
        .collect::<Result<Vec<_>>>()?;
    if ids.is_empty() || start < ids.len() as u64 {
        return Err(invalid());
    }
    Ok((start, ids))
}

/// Deterministic revision hash over the parent rev, the deleted flag, and
/// the body. `serde_json::Map` orders keys, so equal bodies hash equally.
fn next_rev_hash(
    id: &str,
    parent: Option<&Revision>,
    deleted: bool,
    body: &Map<String, Value>,
) -> String {
    let mut hasher = Md5::new();
    hasher.update(id.as_bytes());
    if let Some(parent) = parent {
        hasher.update(parent.to_string().as_bytes());
    }
    hasher.update([deleted as u8]);
    hasher.update(serde_json::to_vec(body).expect("maps serialize"));
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn generates_id_when_absent() {
        let parsed = parse_doc(json!({"v": 1}), true).unwrap();
        assert_eq!(parsed.meta.id.len(), 32);
        assert_eq!(parsed.meta.rev.pos, 1);
    }

    #[test]
    fn first_edit_builds_single_leaf() {
        let parsed = parse_doc(json!({"_id": "a", "v": 1}), true).unwrap();
        assert_eq!(parsed.meta.rev_tree.len(), 1);
        assert_eq!(parsed.meta.rev_tree[0].pos, 1);
        assert_eq!(parsed.meta.rev_tree[0].node.hash, parsed.meta.rev.hash);
        assert!(parsed.body.get("_id").is_none());
        assert_eq!(parsed.body["v"], 1);
    }

    #[test]
    fn edit_with_parent_anchors_below_it() {
        let first = parse_doc(json!({"_id": "a", "v": 1}), true).unwrap();
        let parent = first.meta.rev.clone();
        let second = parse_doc(
            json!({"_id": "a", "_rev": parent.to_string(), "v": 2}),
            true,
        )
        .unwrap();
        assert_eq!(second.meta.rev.pos, 2);
        let path = &second.meta.rev_tree[0];
        assert_eq!(path.pos, 1);
        assert_eq!(path.node.hash, parent.hash);
        assert_eq!(path.node.status, RevStatus::Missing);
        assert_eq!(path.node.children[0].hash, second.meta.rev.hash);
    }

    #[test]
    fn rev_hash_is_deterministic_and_content_sensitive() {
        let a1 = parse_doc(json!({"_id": "a", "v": 1}), true).unwrap();
        let a2 = parse_doc(json!({"_id": "a", "v": 1}), true).unwrap();
        let b = parse_doc(json!({"_id": "a", "v": 2}), true).unwrap();
        assert_eq!(a1.meta.rev, a2.meta.rev);
        assert_ne!(a1.meta.rev, b.meta.rev);
    }

    #[test]
    fn deleted_flag_reaches_meta_and_leaf() {
        let parsed = parse_doc(json!({"_id": "a", "_deleted": true}), true).unwrap();
        assert!(parsed.meta.deleted);
        assert!(parsed.meta.rev_tree[0].node.deleted);
    }

    #[test]
    fn reserved_ids_rejected_locals_and_designs_allowed() {
        assert!(parse_doc(json!({"_id": "_bad"}), true).is_err());
        assert!(parse_doc(json!({"_id": "_local/cfg"}), true).is_ok());
        assert!(parse_doc(json!({"_id": "_design/d"}), true).is_ok());
    }

    #[test]
    fn unknown_underscore_field_rejected() {
        assert!(parse_doc(json!({"_id": "a", "_zap": 1}), true).is_err());
    }

    #[test]
    fn attachments_stay_in_body() {
        let parsed = parse_doc(
            json!({"_id": "a", "_attachments": {"f": {"content_type": "text/plain", "data": "aGk="}}}),
            true,
        )
        .unwrap();
        assert!(parsed.body.contains_key("_attachments"));
    }

    #[test]
    fn replicated_write_requires_rev() {
        assert!(parse_doc(json!({"_id": "a"}), false).is_err());
    }

    #[test]
    fn replicated_write_keeps_given_rev() {
        let parsed = parse_doc(json!({"_id": "a", "_rev": "4-beef", "v": 9}), false).unwrap();
        assert_eq!(parsed.meta.rev.to_string(), "4-beef");
        assert_eq!(parsed.meta.rev_tree[0].pos, 4);
    }

    #[test]
    fn replicated_write_unpacks_revisions() {
        let parsed = parse_doc(
            json!({
                "_id": "a",
                "_rev": "3-ccc",
                "_revisions": {"start": 3, "ids": ["ccc", "bbb", "aaa"]},
            }),
            false,
        )
        .unwrap();
        let path = &parsed.meta.rev_tree[0];
        assert_eq!(path.pos, 1);
        assert_eq!(path.node.hash, "aaa");
        assert_eq!(path.node.status, RevStatus::Missing);
        assert_eq!(path.node.children[0].children[0].hash, "ccc");
    }

    #[test]
    fn mismatched_revisions_rejected() {
        let err = parse_doc(
            json!({
                "_id": "a",
                "_rev": "3-ccc",
                "_revisions": {"start": 3, "ids": ["zzz", "bbb", "aaa"]},
            }),
            false,
        );
        assert!(err.is_err());
    }
}
