//! Revision tree storage shape.
//!
//! A document's edit history is a forest: each `RevPath` roots a tree of
//! `RevNode`s at some generation `pos`. Ancestors that were stemmed away
//! raise the root `pos` above 1.

use serde::{Deserialize, Serialize};

use crate::document::Revision;

/// Forest of revision paths for one document.
pub type RevTree = Vec<RevPath>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevPath {
    /// Generation number of the root node.
    pub pos: u64,
    pub node: RevNode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevNode {
    pub hash: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub status: RevStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<RevNode>,
}

impl RevNode {
    pub fn leaf(hash: impl Into<String>, deleted: bool) -> Self {
        RevNode {
            hash: hash.into(),
            deleted,
            status: RevStatus::Available,
            children: Vec::new(),
        }
    }
}

/// Whether a revision's body is materialized in the sequence store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevStatus {
    #[default]
    Available,
    /// Known only as an ancestor hash; the body was never stored locally.
    Missing,
}

/// A leaf revision with its deleted flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaf {
    pub pos: u64,
    pub hash: String,
    pub deleted: bool,
}

impl Leaf {
    pub fn rev(&self) -> Revision {
        Revision::new(self.pos, self.hash.clone())
    }
}

/// Collect every leaf in the forest, sorted winner-first.
///
/// Winner order: non-deleted before deleted, then higher generation, then
/// lexicographically greater hash. Every replica arrives at the same order.
pub fn collect_leaves(tree: &RevTree) -> Vec<Leaf> {
    let mut leaves = Vec::new();
    for path in tree {
        walk_leaves(&path.node, path.pos, &mut leaves);
    }
    leaves.sort_by(|a, b| {
        a.deleted
            .cmp(&b.deleted)
            .then_with(|| b.pos.cmp(&a.pos))
            .then_with(|| b.hash.cmp(&a.hash))
    });
    leaves
}

fn walk_leaves(node: &RevNode, pos: u64, out: &mut Vec<Leaf>) {
    if node.children.is_empty() {
        out.push(Leaf {
            pos,
            hash: node.hash.clone(),
            deleted: node.deleted,
        });
    }
    for child in &node.children {
        walk_leaves(child, pos + 1, out);
    }
}

/// Build a linear path from a replication-style revision list.
///
/// `hashes` runs leaf-first (CouchDB `_revisions.ids` order); `pos` is the
/// leaf's generation. Ancestors are marked `Missing`, the leaf `Available`.
pub fn build_path(pos: u64, hashes: &[String], deleted: bool) -> RevPath {
    debug_assert!(!hashes.is_empty());
    let mut node = RevNode {
        hash: hashes[0].clone(),
        deleted,
        status: RevStatus::Available,
        children: Vec::new(),
    };
    for hash in &hashes[1..] {
        node = RevNode {
            hash: hash.clone(),
            deleted: false,
            status: RevStatus::Missing,
            children: vec![node],
        };
    }
    RevPath {
        pos: pos + 1 - hashes.len() as u64,
        node,
    }
}

/// Find a node by generation and hash anywhere in the forest.
pub fn find_node<'a>(tree: &'a RevTree, pos: u64, hash: &str) -> Option<&'a RevNode> {
    for path in tree {
        if let Some(node) = find_in_node(&path.node, path.pos, pos, hash) {
            return Some(node);
        }
    }
    None
}

fn find_in_node<'a>(
    node: &'a RevNode,
    node_pos: u64,
    target_pos: u64,
    target_hash: &str,
) -> Option<&'a RevNode> {
    if node_pos == target_pos && node.hash == target_hash {
        return Some(node);
    }
    if node_pos >= target_pos {
        return None;
    }
    node.children
        .iter()
        .find_map(|child| find_in_node(child, node_pos + 1, target_pos, target_hash))
}
