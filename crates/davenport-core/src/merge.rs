//! Revision tree merge algebra.
//!
//! The write pipeline hands us the existing tree and one incoming linear
//! path (as produced by `parse_doc`); we graft the path below its deepest
//! ancestor already present in the tree and report what kind of edit that
//! was. The caller turns `kind` into its conflict decision.

use crate::document::Revision;
use crate::rev_tree::{Leaf, RevNode, RevPath, RevTree, collect_leaves};

/// What merging a path into the tree amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    /// The path extended an existing branch (or started an empty tree).
    NewLeaf,
    /// The path forked the tree, creating a conflicting branch or root.
    NewBranch,
    /// The path's leaf already existed; nothing was added.
    InternalNode,
}

#[derive(Debug, Clone)]
pub struct Merged {
    pub tree: RevTree,
    pub kind: MergeKind,
}

/// Merge `path` into `tree`, stemming the result to at most `depth`
/// generations per branch.
pub fn merge(tree: &RevTree, path: &RevPath, depth: u64) -> Merged {
    let mut result = tree.clone();
    let kind = graft_path(&mut result, path);
    if depth > 0 {
        let _ = stem(&mut result, depth);
    }
    Merged { tree: result, kind }
}

struct ChainLink {
    pos: u64,
    node: RevNode,
}

/// Flatten a linear path into root-to-leaf links. Incoming paths follow
/// the first child only; `parse_doc` never produces branched paths.
fn linearize(path: &RevPath) -> Vec<ChainLink> {
    let mut links = Vec::new();
    let mut pos = path.pos;
    let mut node = &path.node;
    loop {
        links.push(ChainLink {
            pos,
            node: RevNode {
                children: Vec::new(),
                ..node.clone()
            },
        });
        match node.children.first() {
            Some(child) => {
                node = child;
                pos += 1;
            }
            None => break,
        }
    }
    links
}

fn graft_path(tree: &mut RevTree, path: &RevPath) -> MergeKind {
    if tree.is_empty() {
        tree.push(path.clone());
        return MergeKind::NewLeaf;
    }

    let chain = linearize(path);

    // Deepest link first: the graft point is the closest known ancestor.
    for idx in (0..chain.len()).rev() {
        let link = &chain[idx];
        if let Some(anchor) = find_node_mut(tree, link.pos, &link.node.hash) {
            if idx == chain.len() - 1 {
                return MergeKind::InternalNode;
            }
            return graft_below(anchor, &chain[idx + 1..]);
        }
    }

    // No shared ancestor anywhere: a disjoint root is itself a conflict.
    tree.push(path.clone());
    MergeKind::NewBranch
}

fn graft_below(anchor: &mut RevNode, remainder: &[ChainLink]) -> MergeKind {
    let mut current = anchor;
    let mut kind = MergeKind::InternalNode;
    for link in remainder {
        match current
            .children
            .iter()
            .position(|c| c.hash == link.node.hash)
        {
            Some(idx) => {
                current = &mut current.children[idx];
            }
            None => {
                if matches!(kind, MergeKind::InternalNode) {
                    kind = if current.children.is_empty() {
                        MergeKind::NewLeaf
                    } else {
                        MergeKind::NewBranch
                    };
                }
                current.children.push(link.node.clone());
                let last = current.children.len() - 1;
                current = &mut current.children[last];
            }
        }
    }
    kind
}

fn find_node_mut<'a>(tree: &'a mut RevTree, pos: u64, hash: &str) -> Option<&'a mut RevNode> {
    for path in tree.iter_mut() {
        let root_pos = path.pos;
        if let Some(node) = find_in_node_mut(&mut path.node, root_pos, pos, hash) {
            return Some(node);
        }
    }
    None
}

fn find_in_node_mut<'a>(
    node: &'a mut RevNode,
    node_pos: u64,
    target_pos: u64,
    target_hash: &str,
) -> Option<&'a mut RevNode> {
    if node_pos == target_pos && node.hash == target_hash {
        return Some(node);
    }
    if node_pos >= target_pos {
        return None;
    }
    node.children
        .iter_mut()
        .find_map(|child| find_in_node_mut(child, node_pos + 1, target_pos, target_hash))
}

// ---------------------------------------------------------------------------
// Winning revision
// ---------------------------------------------------------------------------

/// The deterministic winner across all leaves: non-deleted beats deleted,
/// then higher generation, then lexicographically greater hash.
pub fn winning_rev(tree: &RevTree) -> Option<Revision> {
    collect_leaves(tree).first().map(Leaf::rev)
}

/// Whether the winning leaf is deleted.
pub fn is_deleted(tree: &RevTree) -> bool {
    collect_leaves(tree)
        .first()
        .map(|l| l.deleted)
        .unwrap_or(false)
}

/// Non-winning, non-deleted leaf revisions.
pub fn collect_conflicts(tree: &RevTree) -> Vec<Revision> {
    collect_leaves(tree)
        .iter()
        .skip(1)
        .filter(|l| !l.deleted)
        .map(Leaf::rev)
        .collect()
}

// ---------------------------------------------------------------------------
// Stemming — the revision pruning primitive used by compaction
// ---------------------------------------------------------------------------

/// Drop ancestors so no branch holds more than `depth` generations.
/// Stops at branch points. Returns the revisions that were cut.
pub fn stem(tree: &mut RevTree, depth: u64) -> Vec<Revision> {
    let mut stemmed = Vec::new();
    for path in tree.iter_mut() {
        while chain_len(&path.node) > depth && path.node.children.len() == 1 {
            let child = path.node.children.pop().expect("single child");
            stemmed.push(Revision::new(path.pos, path.node.hash.clone()));
            path.node = child;
            path.pos += 1;
        }
    }
    stemmed
}

fn chain_len(node: &RevNode) -> u64 {
    1 + node.children.iter().map(chain_len).max().unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
