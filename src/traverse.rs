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

//! Depth-first traversal driven by a user state machine.

use triedb_pool::StoragePool;

use crate::{
    error::{DbError, Result},
    find::read_node_at,
    node::Node,
};

/// Branch value passed for the node a traversal starts at, which hangs
/// under no parent slot.
pub const ROOT_BRANCH: u8 = 0x10;

/// User-supplied traversal callbacks. `down` may prune a subtree by
/// returning `false`; `clone_machine` supports parallel sub-walks, each
/// clone owning its own state.
pub trait TraverseMachine: Send {
    fn down(&mut self, branch: u8, node: &Node) -> Result<bool>;
    fn up(&mut self, branch: u8, node: &Node) -> Result<()>;
    fn clone_machine(&self) -> Box<dyn TraverseMachine>;
}

/// Walk `node` depth-first. Child subtrees whose `min_version` is below
/// `floor` are skipped. With `concurrency > 1` the top-level children fan
/// out across threads on cloned machines; only pools that allow blocking
/// reads off the writer thread (read-only and in-memory) should enable
/// that.
pub fn preorder_traverse(
    pool: Option<&StoragePool>,
    node: &Node,
    machine: &mut dyn TraverseMachine,
    floor: u64,
    concurrency: usize,
) -> Result<bool> {
    if !machine.down(ROOT_BRANCH, node)? {
        machine.up(ROOT_BRANCH, node)?;
        return Ok(false);
    }
    if concurrency > 1 {
        walk_children_parallel(pool, node, machine, floor, concurrency)?;
    } else {
        walk_children(pool, node, machine, floor)?;
    }
    machine.up(ROOT_BRANCH, node)?;
    Ok(true)
}

fn walk_children(
    pool: Option<&StoragePool>,
    node: &Node,
    machine: &mut dyn TraverseMachine,
    floor: u64,
) -> Result<()> {
    for branch in 0..16u8 {
        let Some(child) = node.child(branch) else {
            continue;
        };
        if child.min_version < floor {
            trace!(target: "triedb", "pruning branch {branch:x} below version floor {floor}");
            continue;
        }
        match &child.node {
            Some(cached) => visit(pool, branch, cached, machine, floor)?,
            None => {
                let pool = pool.ok_or_else(|| {
                    DbError::InvariantViolation("uncached child in a memory-only trie".into())
                })?;
                let loaded = read_node_at(pool, child.offset, child.min_version)?;
                visit(Some(pool), branch, &loaded, machine, floor)?;
            }
        }
    }
    Ok(())
}

fn visit(
    pool: Option<&StoragePool>,
    branch: u8,
    node: &Node,
    machine: &mut dyn TraverseMachine,
    floor: u64,
) -> Result<()> {
    if machine.down(branch, node)? {
        walk_children(pool, node, machine, floor)?;
    }
    machine.up(branch, node)
}

/// Fan the root's children out over up to `concurrency` threads, each
/// driving a cloned machine.
fn walk_children_parallel(
    pool: Option<&StoragePool>,
    node: &Node,
    machine: &mut dyn TraverseMachine,
    floor: u64,
    concurrency: usize,
) -> Result<()> {
    let branches: Vec<u8> = (0..16u8)
        .filter(|branch| {
            node.child(*branch)
                .map_or(false, |child| child.min_version >= floor)
        })
        .collect();
    for wave in branches.chunks(concurrency.max(1)) {
        let results: Vec<Result<()>> = std::thread::scope(|scope| {
            let handles: Vec<_> = wave
                .iter()
                .map(|branch| {
                    let branch = *branch;
                    let mut clone = machine.clone_machine();
                    scope.spawn(move || {
                        let child = node.child(branch).expect("branch filtered above; qed");
                        match &child.node {
                            Some(cached) => visit(pool, branch, cached, clone.as_mut(), floor),
                            None => {
                                let pool = pool.ok_or_else(|| {
                                    DbError::InvariantViolation(
                                        "uncached child in a memory-only trie".into(),
                                    )
                                })?;
                                let loaded =
                                    read_node_at(pool, child.offset, child.min_version)?;
                                visit(Some(pool), branch, &loaded, clone.as_mut(), floor)
                            }
                        }
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("traversal thread panicked"))
                .collect()
        });
        for result in results {
            result?;
        }
    }
    Ok(())
}

/// Load every node under `node` into the in-memory cache. Returns the
/// number of nodes read from disk; cached subtrees cost nothing.
pub(crate) fn load_all(pool: &StoragePool, node: &mut Node) -> Result<usize> {
    let mut loaded = 0;
    for index in 0..16usize {
        let Some(child) = node.children[index].as_deref_mut() else {
            continue;
        };
        if child.node.is_none() {
            child.node = Some(Box::new(read_node_at(
                pool,
                child.offset,
                child.min_version,
            )?));
            loaded += 1;
        }
        loaded += load_all(pool, child.node.as_deref_mut().expect("cached above; qed"))?;
    }
    Ok(loaded)
}
