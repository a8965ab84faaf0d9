// Copyright 2015-2020 Parity Technologies (UK) Ltd.
// This file is part of OpenEthereum.

// OpenEthereum is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// OpenEthereum is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with OpenEthereum.  If not, see <http://www.gnu.org/licenses/>.

//! Copy-on-write application of an update list to a trie.
//!
//! Updates are flattened (nested lists become absolute-keyed operations,
//! incarnation becomes a subtree wipe ahead of them) and applied in list
//! order against the in-memory tree. Touched nodes lose their on-disk
//! offset and are reserialized by the commit pass; untouched subtrees keep
//! their offsets, which is what makes the update copy-on-write on disk.

use parity_bytes::Bytes;
use triedb_pool::StoragePool;

use crate::{
    error::{DbError, Result},
    find::child_into_node,
    nibbles::Nibbles,
    node::{Child, Node, MAX_PATH_NIBBLES, MAX_VALUE_LEN_OF_LEAF},
    update::{Update, UpdateList},
};

pub(crate) enum Action {
    Put(Bytes),
    Delete,
    /// Discard the whole subtree at the key (incarnation semantics).
    Wipe,
    /// Install an already-built subtree at the key. Used by `copy_trie`;
    /// the destination is wiped first, so the subtree never merges with
    /// existing content.
    Graft(Box<Node>),
}

pub(crate) struct FlatOp {
    pub key: Nibbles,
    pub action: Action,
    pub version: u64,
}

/// Expand an update list into absolute-keyed operations, in application
/// order.
pub(crate) fn flatten(updates: UpdateList) -> Result<Vec<FlatOp>> {
    let mut ops = Vec::new();
    flatten_into(&Nibbles::new(), updates, &mut ops)?;
    Ok(ops)
}

fn flatten_into(prefix: &Nibbles, updates: UpdateList, ops: &mut Vec<FlatOp>) -> Result<()> {
    for update in updates.into_vec() {
        let Update {
            key,
            value,
            incarnation,
            nested,
            version,
        } = update;
        let mut absolute = prefix.clone();
        absolute.extend(&key);
        if absolute.len() > MAX_PATH_NIBBLES {
            return Err(DbError::InvariantViolation(format!(
                "key of {} nibbles exceeds the {MAX_PATH_NIBBLES} limit",
                absolute.len()
            )));
        }
        if incarnation {
            ops.push(FlatOp {
                key: absolute.clone(),
                action: Action::Wipe,
                version,
            });
        }
        match value {
            Some(value) => {
                if value.len() > MAX_VALUE_LEN_OF_LEAF {
                    return Err(DbError::InvariantViolation(format!(
                        "value of {} bytes exceeds the leaf ceiling",
                        value.len()
                    )));
                }
                ops.push(FlatOp {
                    key: absolute.clone(),
                    action: Action::Put(value),
                    version,
                });
            }
            None if nested.is_empty() && !incarnation => ops.push(FlatOp {
                key: absolute.clone(),
                action: Action::Delete,
                version,
            }),
            None => {}
        }
        flatten_into(&absolute, nested, ops)?;
    }
    Ok(())
}

/// Apply `updates` to `root`, producing the new tree. Only the touched
/// spine is dirtied; a failed load aborts with the prior tree dropped, so
/// callers reload their root on error.
pub(crate) fn apply_updates(
    pool: Option<&StoragePool>,
    root: Option<Box<Node>>,
    updates: UpdateList,
) -> Result<Option<Box<Node>>> {
    let mut tree = root;
    for op in flatten(updates)? {
        let (next, _) = apply_one(pool, tree, op)?;
        tree = next;
    }
    Ok(tree)
}

/// Prepend `suffix` to a grafted subtree's root path.
fn graft_with_suffix(mut sub: Box<Node>, suffix: Nibbles) -> Box<Node> {
    let mut path = suffix;
    path.extend(&sub.path);
    debug_assert!(path.len() <= MAX_PATH_NIBBLES);
    sub.path = path;
    sub.refresh_meta();
    sub
}

fn apply_one(
    pool: Option<&StoragePool>,
    existing: Option<Box<Node>>,
    op: FlatOp,
) -> Result<(Option<Box<Node>>, bool)> {
    let Some(mut node) = existing else {
        return Ok(match op.action {
            Action::Put(value) => (
                Some(Box::new(Node::new_leaf(op.key, value, op.version))),
                true,
            ),
            Action::Graft(sub) => (Some(graft_with_suffix(sub, op.key)), true),
            Action::Delete | Action::Wipe => (None, false),
        });
    };

    let cpl = node.path.common_prefix_len(op.key.as_slice());
    let path_len = node.path.len();
    let key_len = op.key.len();

    if cpl == path_len && cpl == key_len {
        // the operation lands exactly on this node
        return Ok(match op.action {
            Action::Wipe => (None, true),
            Action::Put(value) => {
                node.value = Some(value);
                node.version = op.version;
                node.refresh_meta();
                (Some(node), true)
            }
            Action::Graft(sub) => (Some(graft_with_suffix(sub, op.key)), true),
            Action::Delete => {
                if !node.has_value() {
                    (Some(node), false)
                } else {
                    node.value = None;
                    (canonicalize(pool, node)?, true)
                }
            }
        });
    }

    if cpl == key_len {
        // the key ends above this node, mid-path
        return Ok(match op.action {
            Action::Wipe => (None, true),
            Action::Delete => (Some(node), false),
            // the destination was wiped ahead of a graft, so nothing can
            // remain below the key; replace outright
            Action::Graft(sub) => (Some(graft_with_suffix(sub, op.key)), true),
            Action::Put(value) => {
                let node = split_path(node, cpl);
                let mut parent = Node::new_leaf(op.key, value, op.version);
                parent.set_child(node.path_branch, Child::from_node(node.lower));
                parent.refresh_meta();
                (Some(Box::new(parent)), true)
            }
        });
    }

    if cpl == path_len {
        // descend into the child slot selected by the next key nibble
        let branch = op.key.at(cpl);
        let rest = FlatOp {
            key: op.key.skip(cpl + 1),
            action: op.action,
            version: op.version,
        };
        let sub = match node.take_child(branch) {
            Some(child) => Some(child_into_node(pool, *child)?),
            None => None,
        };
        let (replacement, changed) = apply_one(pool, sub, rest)?;
        if let Some(sub) = replacement {
            node.set_child(branch, Child::from_node(sub));
        }
        if !changed {
            return Ok((Some(node), false));
        }
        return Ok((canonicalize(pool, node)?, true));
    }

    // paths diverge strictly below both the key and the node path
    match op.action {
        Action::Delete | Action::Wipe => Ok((Some(node), false)),
        Action::Put(value) => {
            let split = split_path(node, cpl);
            let mut branch = Node::new_branch(op.key.sliced(0, cpl), op.version);
            branch.set_child(split.path_branch, Child::from_node(split.lower));
            let leaf = Node::new_leaf(op.key.skip(cpl + 1), value, op.version);
            branch.set_child(op.key.at(cpl), Child::from_node(Box::new(leaf)));
            branch.refresh_meta();
            Ok((Some(Box::new(branch)), true))
        }
        Action::Graft(sub) => {
            let split = split_path(node, cpl);
            let mut branch = Node::new_branch(op.key.sliced(0, cpl), op.version);
            branch.set_child(split.path_branch, Child::from_node(split.lower));
            let grafted = graft_with_suffix(sub, op.key.skip(cpl + 1));
            branch.set_child(op.key.at(cpl), Child::from_node(grafted));
            branch.refresh_meta();
            Ok((Some(Box::new(branch)), true))
        }
    }
}

/// Rebind `sub` as the subtree at `at`, discarding whatever was there.
/// The subtree's payload is shared, not rewritten; only the grafted root
/// node (whose path changes) and the spine above it are dirtied.
pub(crate) fn graft_subtree(
    pool: Option<&StoragePool>,
    root: Option<Box<Node>>,
    at: Nibbles,
    sub: Box<Node>,
    version: u64,
) -> Result<Option<Box<Node>>> {
    let (root, _) = apply_one(
        pool,
        root,
        FlatOp {
            key: at.clone(),
            action: Action::Wipe,
            version,
        },
    )?;
    let (root, _) = apply_one(
        pool,
        root,
        FlatOp {
            key: at,
            action: Action::Graft(sub),
            version,
        },
    )?;
    Ok(root)
}

struct SplitNode {
    /// Branch nibble the lower half hangs under.
    path_branch: u8,
    lower: Box<Node>,
}

/// Cut a node's path at `at`: the nibble at `at` becomes a branch index
/// and the node keeps the remainder.
fn split_path(mut node: Box<Node>, at: usize) -> SplitNode {
    debug_assert!(at < node.path.len());
    let path_branch = node.path.at(at);
    node.path = node.path.skip(at + 1);
    node.refresh_meta();
    SplitNode {
        path_branch,
        lower: node,
    }
}

/// Restore branch-compression canonical form after a removal: a node with
/// no value collapses when it has no children, and merges into its sole
/// child when it has exactly one.
fn canonicalize(pool: Option<&StoragePool>, mut node: Box<Node>) -> Result<Option<Box<Node>>> {
    if node.has_value() || node.child_count() > 1 {
        node.refresh_meta();
        return Ok(Some(node));
    }
    match node.sole_child_index() {
        None => Ok(None),
        Some(branch) => {
            let child = node.take_child(branch).expect("sole child present; qed");
            let mut sub = child_into_node(pool, *child)?;
            let mut merged = node.path.clone();
            merged.push(branch);
            merged.extend(&sub.path);
            debug_assert!(merged.len() <= MAX_PATH_NIBBLES);
            sub.path = merged;
            sub.refresh_meta();
            Ok(Some(sub))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::find::find_blocking;

    fn nib(nibbles: &[u8]) -> Nibbles {
        Nibbles::from_nibbles(nibbles)
    }

    fn apply(root: Option<Box<Node>>, updates: Vec<Update>) -> Option<Box<Node>> {
        apply_updates(None, root, updates.into_iter().collect()).unwrap()
    }

    fn value_at(root: &Node, key: &[u8]) -> Option<Vec<u8>> {
        find_blocking(None, root, &nib(key))
            .unwrap()
            .and_then(|found| found.value)
    }

    #[test]
    fn single_leaf() {
        let root = apply(None, vec![Update::insert(nib(&[1, 2, 3]), b"v".to_vec(), 0)]);
        let root = root.unwrap();
        assert_eq!(root.path.as_slice(), &[1, 2, 3]);
        assert_eq!(value_at(&root, &[1, 2, 3]), Some(b"v".to_vec()));
        assert_eq!(value_at(&root, &[1, 2]), None);
        assert_eq!(value_at(&root, &[1, 2, 3, 4]), None);
        assert_eq!(value_at(&root, &[9]), None);
    }

    #[test]
    fn split_on_divergence() {
        let root = apply(None, vec![Update::insert(nib(&[1, 2, 3]), b"a".to_vec(), 0)]);
        let root = apply(root, vec![Update::insert(nib(&[1, 2, 9, 9]), b"b".to_vec(), 0)]);
        let root = root.unwrap();
        // branch compressed at the common prefix
        assert_eq!(root.path.as_slice(), &[1, 2]);
        assert!(!root.has_value());
        assert_eq!(root.child_count(), 2);
        assert_eq!(value_at(&root, &[1, 2, 3]), Some(b"a".to_vec()));
        assert_eq!(value_at(&root, &[1, 2, 9, 9]), Some(b"b".to_vec()));
    }

    #[test]
    fn value_above_existing_node() {
        let root = apply(None, vec![Update::insert(nib(&[1, 2, 3]), b"a".to_vec(), 0)]);
        let root = apply(root, vec![Update::insert(nib(&[1]), b"top".to_vec(), 0)]);
        let root = root.unwrap();
        assert_eq!(root.path.as_slice(), &[1]);
        assert!(root.has_value());
        assert_eq!(value_at(&root, &[1]), Some(b"top".to_vec()));
        assert_eq!(value_at(&root, &[1, 2, 3]), Some(b"a".to_vec()));
    }

    #[test]
    fn overwrite_in_place() {
        let root = apply(None, vec![Update::insert(nib(&[5, 5]), b"one".to_vec(), 0)]);
        let fp_one = root.as_ref().unwrap().fingerprint;
        let root = apply(root, vec![Update::insert(nib(&[5, 5]), b"two".to_vec(), 1)]);
        let root = root.unwrap();
        assert_eq!(value_at(&root, &[5, 5]), Some(b"two".to_vec()));
        assert_ne!(root.fingerprint, fp_one);
    }

    #[test]
    fn delete_collapses_branch() {
        let updates = vec![
            Update::insert(nib(&[1, 2, 3]), b"a".to_vec(), 0),
            Update::insert(nib(&[1, 2, 9]), b"b".to_vec(), 0),
        ];
        let two = apply(None, updates);
        assert_eq!(two.as_ref().unwrap().path.as_slice(), &[1, 2]);

        let one = apply(two, vec![Update::delete(nib(&[1, 2, 9]), 1)]);
        let one = one.unwrap();
        // the branch merged back into a single leaf with the full path
        assert_eq!(one.path.as_slice(), &[1, 2, 3]);
        assert_eq!(one.child_count(), 0);
        assert_eq!(value_at(&one, &[1, 2, 3]), Some(b"a".to_vec()));

        let none = apply(Some(one), vec![Update::delete(nib(&[1, 2, 3]), 2)]);
        assert!(none.is_none());
    }

    #[test]
    fn delete_of_absent_key_changes_nothing() {
        let root = apply(None, vec![Update::insert(nib(&[1, 2]), b"a".to_vec(), 0)]);
        let fp = root.as_ref().unwrap().fingerprint;
        let root = apply(root, vec![Update::delete(nib(&[7, 7]), 1)]);
        let root = apply(root, vec![Update::delete(nib(&[1, 2, 3]), 1)]);
        let root = root.unwrap();
        assert_eq!(root.fingerprint, fp);
    }

    #[test]
    fn incarnation_resets_subtree() {
        let mut account = Update::insert(nib(&[0xa, 0xa]), b"account".to_vec(), 0);
        account.nested.push_front(Update::insert(nib(&[1]), b"s1".to_vec(), 0));
        account.nested.push_front(Update::insert(nib(&[0]), b"s0".to_vec(), 0));
        let root = apply(None, vec![account]);
        assert_eq!(
            value_at(root.as_ref().unwrap(), &[0xa, 0xa, 0]),
            Some(b"s0".to_vec())
        );

        // redeploy: wipe the subtree, keep only the fresh storage slot
        let mut redeploy = Update::insert(nib(&[0xa, 0xa]), b"account2".to_vec(), 1);
        redeploy.incarnation = true;
        redeploy
            .nested
            .push_front(Update::insert(nib(&[7]), b"fresh".to_vec(), 1));
        let root = apply(root, vec![redeploy]);
        let root = root.unwrap();
        assert_eq!(value_at(&root, &[0xa, 0xa]), Some(b"account2".to_vec()));
        assert_eq!(value_at(&root, &[0xa, 0xa, 0]), None);
        assert_eq!(value_at(&root, &[0xa, 0xa, 1]), None);
        assert_eq!(value_at(&root, &[0xa, 0xa, 7]), Some(b"fresh".to_vec()));
    }

    #[test]
    fn fingerprints_ignore_insertion_order() {
        let forward: Vec<Update> = (0u8..16)
            .map(|n| Update::insert(nib(&[n, n ^ 0xf]), vec![n; 9], 0))
            .collect();
        let backward: Vec<Update> = (0u8..16)
            .rev()
            .map(|n| Update::insert(nib(&[n, n ^ 0xf]), vec![n; 9], 0))
            .collect();
        let a = apply(None, forward).unwrap();
        let b = apply(None, backward).unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn list_order_wins_for_duplicate_keys() {
        let updates = vec![
            Update::insert(nib(&[3]), b"first".to_vec(), 0),
            Update::insert(nib(&[3]), b"second".to_vec(), 0),
        ];
        let root = apply(None, updates).unwrap();
        assert_eq!(value_at(&root, &[3]), Some(b"second".to_vec()));
    }

    #[test]
    fn min_version_tracks_oldest_leaf() {
        let root = apply(None, vec![Update::insert(nib(&[1, 1]), b"old".to_vec(), 3)]);
        let root = apply(root, vec![Update::insert(nib(&[2, 2]), b"new".to_vec(), 9)]);
        let root = root.unwrap();
        assert_eq!(root.min_version, 3);
        let newer = root.child(2).unwrap();
        assert_eq!(newer.min_version, 9);
    }

    #[test]
    fn oversized_value_is_rejected() {
        let huge = vec![0u8; MAX_VALUE_LEN_OF_LEAF + 1];
        let result = apply_updates(
            None,
            None,
            vec![Update::insert(nib(&[1]), huge, 0)].into_iter().collect(),
        );
        assert!(matches!(result, Err(DbError::InvariantViolation(_))));
    }
}
