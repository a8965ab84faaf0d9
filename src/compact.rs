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

//! Compaction: migrate live data out of cold chunks so they can return
//! to the free list.
//!
//! A pass picks a bounded slice of chunks from the head of the slow list,
//! walks the about-to-be-committed tree and dirties every node located in
//! a victim chunk (plus the spine above it). The commit pass then rewrites
//! those nodes into the current stream like any other dirty node. Victims
//! are reclaimed once the history floor has passed the compacting
//! version, at which point no retained version can reference them.

use std::collections::HashSet;

use triedb_pool::{ListId, StoragePool, INVALID_OFFSET};

use crate::{
    aux::UpdateAux,
    error::Result,
    find::read_node_at,
    node::Node,
};

/// Chunks migrated per pass.
const COMPACTION_SLICE: usize = 2;

/// Select victims and dirty their live nodes in `root`. Returns the
/// victim chunk ids for [`UpdateAux::schedule_free`] after the commit.
pub(crate) fn run_compaction(aux: &mut UpdateAux, root: &mut Node) -> Result<Vec<u32>> {
    let Some(pool) = aux.pool() else {
        return Ok(Vec::new());
    };
    let busy: HashSet<u32> = aux
        .head_chunks()
        .into_iter()
        .chain(aux.pending_free_chunks())
        .collect();
    let victims: HashSet<u32> = pool
        .meta()
        .list_iter(ListId::Slow)
        .chain(pool.meta().list_iter(ListId::Fast))
        .filter(|id| !busy.contains(id))
        .take(COMPACTION_SLICE)
        .collect();
    if victims.is_empty() {
        return Ok(Vec::new());
    }
    // the root node itself may live in a victim chunk; the walk below
    // only inspects child slots, so check it here or a clean root would
    // keep its offset while its chunk is reclaimed
    let mut moved = 0;
    if root.offset.is_valid() && victims.contains(&root.offset.chunk_id()) {
        root.offset = INVALID_OFFSET;
        moved += 1;
    }
    moved += relocate(pool, root, &victims)?;
    if moved > 0 {
        root.offset = INVALID_OFFSET;
    }
    debug!(
        target: "triedb",
        "compaction pass over chunks {victims:?}: {moved} nodes relocated"
    );
    // root checked and whole tree walked above, so a victim with no
    // relocations holds nothing the new version references; every victim
    // is safe to reclaim once the history floor passes
    Ok(victims.into_iter().collect())
}

/// Walk the whole tree, caching as needed, and invalidate the offset of
/// every node inside a victim chunk along with its ancestors. Returns the
/// number of relocated nodes.
fn relocate(pool: &StoragePool, node: &mut Node, victims: &HashSet<u32>) -> Result<usize> {
    let mut moved = 0;
    for index in 0..16usize {
        let Some(child) = node.children[index].as_deref_mut() else {
            continue;
        };
        let in_victim = child.offset.is_valid() && victims.contains(&child.offset.chunk_id());
        if child.node.is_none() {
            child.node = Some(Box::new(read_node_at(
                pool,
                child.offset,
                child.min_version,
            )?));
        }
        let sub = child.node.as_deref_mut().expect("cached above; qed");
        let below = relocate(pool, sub, victims)?;
        moved += below;
        if in_victim {
            moved += 1;
        }
        if in_victim || below > 0 {
            sub.offset = INVALID_OFFSET;
            child.offset = INVALID_OFFSET;
        }
    }
    Ok(moved)
}
