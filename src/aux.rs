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

//! The writer's auxiliary state: append streams, commit and version ring.
//!
//! Exactly one `UpdateAux` exists per pool, owned by the worker thread.
//! Dirty nodes stream into the fast or slow append head; a commit waits
//! for the writes, advances the wip offsets under the dirty byte and
//! publishes the new root into the version ring. A failed commit rewinds
//! the pool to the wip offsets, leaving the prior version intact.

use std::{cell::RefCell, io, rc::Rc};

use triedb_io::{Buffer, CompletedOp, Executor};
use triedb_pool::{
    ChunkHandle, ChunkOffset, ListId, MetaRegion, StoragePool, DISK_PAGE_SIZE, INVALID_OFFSET,
    INVALID_VERSION,
};

use crate::{
    error::{DbError, Result},
    find::read_node_at,
    node::Node,
};

/// Shared between the auxiliary and the async read pipeline.
pub(crate) struct OnDiskStore {
    pub pool: StoragePool,
    pub io: Executor,
}

struct WriteHead {
    list: ListId,
    chunk: Option<ChunkHandle>,
    buf: Option<Buffer>,
    /// In-chunk offset buffered bytes flush to.
    buf_base: u64,
    buf_fill: usize,
}

impl WriteHead {
    fn new(list: ListId) -> WriteHead {
        WriteHead {
            list,
            chunk: None,
            buf: None,
            buf_base: 0,
            buf_fill: 0,
        }
    }

    /// Offset the next committed byte would land at.
    fn position(&self) -> ChunkOffset {
        match &self.chunk {
            Some(chunk) => chunk.offset(self.buf_base + self.buf_fill as u64),
            None => INVALID_OFFSET,
        }
    }
}

struct PendingFree {
    chunk: u32,
    /// Chunk may be reclaimed once the history floor reaches this version.
    at_version: u64,
}

/// The single writer's view of the pool.
pub struct UpdateAux {
    store: Option<Rc<OnDiskStore>>,
    mem_meta: Option<MetaRegion>,
    fast_head: WriteHead,
    slow_head: WriteHead,
    write_error: Rc<RefCell<Option<io::Error>>>,
    pending_free: Vec<PendingFree>,
    /// Fabricated offset counter for the memory-only mode.
    mem_cursor: u64,
}

impl UpdateAux {
    /// Writer over an open pool. The append heads resume at the wip
    /// offsets recorded by the last clean commit.
    pub(crate) fn new_on_disk(pool: StoragePool, io: Executor) -> Result<UpdateAux> {
        let mut aux = UpdateAux {
            store: Some(Rc::new(OnDiskStore { pool, io })),
            mem_meta: None,
            fast_head: WriteHead::new(ListId::Fast),
            slow_head: WriteHead::new(ListId::Slow),
            write_error: Rc::new(RefCell::new(None)),
            pending_free: Vec::new(),
            mem_cursor: 0,
        };
        aux.resume_heads()?;
        Ok(aux)
    }

    /// Trie semantics without persistence; the version ring and
    /// watermarks live in an anonymous mapping.
    pub(crate) fn new_in_memory(history_length: u64) -> UpdateAux {
        let meta = MetaRegion::anonymous(1);
        meta.format(1, history_length);
        UpdateAux {
            store: None,
            mem_meta: Some(meta),
            fast_head: WriteHead::new(ListId::Fast),
            slow_head: WriteHead::new(ListId::Slow),
            write_error: Rc::new(RefCell::new(None)),
            pending_free: Vec::new(),
            mem_cursor: 0,
        }
    }

    fn resume_heads(&mut self) -> Result<()> {
        let store = self.store.clone().expect("on-disk aux; qed");
        for head in [&mut self.fast_head, &mut self.slow_head] {
            let wip = store.pool.meta().wip_offset(head.list);
            if wip.is_valid() {
                let chunk = store
                    .pool
                    .activate_chunk(triedb_pool::ChunkClass::Sequential, wip.chunk_id())?;
                debug_assert_eq!(chunk.used(), wip.byte_offset());
                head.buf_base = wip.byte_offset();
                head.chunk = Some(chunk);
            }
        }
        Ok(())
    }

    pub fn is_on_disk(&self) -> bool {
        self.store.is_some()
    }

    pub(crate) fn store(&self) -> Option<&Rc<OnDiskStore>> {
        self.store.as_ref()
    }

    pub(crate) fn pool(&self) -> Option<&StoragePool> {
        self.store.as_deref().map(|store| &store.pool)
    }

    /// The metadata region: the pool's mapping on disk, an anonymous one
    /// in memory-only mode.
    pub fn meta(&self) -> &MetaRegion {
        match &self.store {
            Some(store) => store.pool.meta(),
            None => self.mem_meta.as_ref().expect("one of the two; qed"),
        }
    }

    // --- version accessors ---

    pub fn earliest_version(&self) -> Option<u64> {
        let (lower, next) = self.meta().version_range();
        (next != INVALID_VERSION && next != lower).then_some(lower)
    }

    pub fn latest_version(&self) -> Option<u64> {
        let (lower, next) = self.meta().version_range();
        (next != INVALID_VERSION && next != lower).then(|| next - 1)
    }

    pub fn latest_finalized(&self) -> Option<u64> {
        let version = self.meta().latest_finalized();
        (version != INVALID_VERSION).then_some(version)
    }

    pub fn latest_verified(&self) -> Option<u64> {
        let version = self.meta().latest_verified();
        (version != INVALID_VERSION).then_some(version)
    }

    /// Versions advance one at a time; the latest may be replaced in
    /// place for proposal rounds. A fresh pool accepts any start.
    pub(crate) fn validate_upsert_version(&self, version: u64) -> Result<()> {
        match self.latest_version() {
            None => Ok(()),
            Some(latest) if version == latest || version == latest + 1 => Ok(()),
            Some(latest) => Err(DbError::InvariantViolation(format!(
                "upsert at version {version}, latest is {latest}"
            ))),
        }
    }

    /// Load the root node of `version` from the ring.
    pub(crate) fn load_root(&self, version: u64) -> Result<Option<Node>> {
        let meta = self.meta();
        if !meta.version_in_range(version) {
            return Err(DbError::VersionUnknown);
        }
        let Some(offset) = meta.root_offset(version) else {
            // a committed empty tree
            return Ok(None);
        };
        let pool = self
            .pool()
            .ok_or_else(|| DbError::InvariantViolation("no historic roots in memory mode".into()))?;
        Ok(Some(read_node_at(pool, offset, version)?))
    }

    // --- append streams ---

    /// Append one serialized node to the fast or slow stream and return
    /// the offset it will occupy once flushed.
    pub(crate) fn append_node(&mut self, to_fast: bool, bytes: &[u8]) -> Result<ChunkOffset> {
        match self.store.clone() {
            None => {
                let offset = ChunkOffset::new(0, self.mem_cursor);
                self.mem_cursor += (bytes.len() as u64 + 7) & !7;
                Ok(offset)
            }
            Some(store) => {
                let head = if to_fast {
                    &mut self.fast_head
                } else {
                    &mut self.slow_head
                };
                append_to_head(&store, head, &self.write_error, bytes)
            }
        }
    }

    /// Serialize every dirty node under `node`, bottom-up, into the
    /// selected stream. Clean subtrees are skipped untouched, which is
    /// what makes the commit copy-on-write.
    pub(crate) fn write_tree(&mut self, node: &mut Node, to_fast: bool) -> Result<ChunkOffset> {
        Self::write_tree_inner(
            &mut self.fast_head,
            &mut self.slow_head,
            &self.store,
            &self.write_error,
            &mut self.mem_cursor,
            node,
            to_fast,
        )
    }

    fn write_tree_inner(
        fast: &mut WriteHead,
        slow: &mut WriteHead,
        store: &Option<Rc<OnDiskStore>>,
        error: &Rc<RefCell<Option<io::Error>>>,
        mem_cursor: &mut u64,
        node: &mut Node,
        to_fast: bool,
    ) -> Result<ChunkOffset> {
        // manual recursion avoids re-borrowing self around the child loop
        for index in 0..16usize {
            let Some(child) = node.children[index].as_deref_mut() else {
                continue;
            };
            if child.offset.is_valid() {
                continue;
            }
            let sub = child.node.as_deref_mut().ok_or_else(|| {
                DbError::InvariantViolation("dirty child slot without a cached node".into())
            })?;
            let offset = Self::write_tree_inner(fast, slow, store, error, mem_cursor, sub, to_fast)?;
            child.offset = offset;
            child.fingerprint = sub.fingerprint;
            child.min_version = sub.min_version;
        }
        if node.offset.is_valid() {
            return Ok(node.offset);
        }
        let bytes = node.encode();
        let offset = match store {
            None => {
                let offset = ChunkOffset::new(0, *mem_cursor);
                *mem_cursor += (bytes.len() as u64 + 7) & !7;
                offset
            }
            Some(store) => {
                let head = if to_fast { fast } else { slow };
                append_to_head(store, head, error, &bytes)?
            }
        };
        node.offset = offset;
        Ok(offset)
    }

    /// Publish `root_offset` as the root of `version`: flush the append
    /// streams, wait for every write, then advance the wip offsets and
    /// the ring under the dirty byte. Ripe compaction victims return to
    /// the free list afterwards.
    pub(crate) fn commit(&mut self, version: u64, root_offset: ChunkOffset) -> Result<()> {
        if let Some(store) = self.store.clone() {
            flush_head(&store, &mut self.fast_head, &self.write_error)?;
            flush_head(&store, &mut self.slow_head, &self.write_error)?;
            store.io.wait_until_done()?;
            if let Some(err) = self.write_error.borrow_mut().take() {
                return Err(DbError::Device(err));
            }
            store
                .pool
                .meta()
                .advance_wip_offsets(self.fast_head.position(), self.slow_head.position());
        }
        self.meta().push_root(version, root_offset);
        trace!(target: "triedb", "committed version {version}, root at {root_offset}");
        self.reclaim_ripe_chunks()?;
        Ok(())
    }

    /// Undo an interrupted or failed commit: drop buffered bytes, rewind
    /// the pool to the wip offsets and restart the append heads there.
    pub(crate) fn abort_commit(&mut self) -> Result<()> {
        let Some(store) = self.store.clone() else {
            return Ok(());
        };
        // inflight writes still own their buffers; let them land first
        let _ = store.io.wait_until_done();
        *self.write_error.borrow_mut() = None;
        self.fast_head = WriteHead::new(ListId::Fast);
        self.slow_head = WriteHead::new(ListId::Slow);
        store.pool.rewind_to_wip_offsets()?;
        self.resume_heads()?;
        Ok(())
    }

    /// A compacted chunk stays on its list until every version that may
    /// reference it has left the ring.
    pub(crate) fn schedule_free(&mut self, chunks: impl IntoIterator<Item = u32>, version: u64) {
        for chunk in chunks {
            debug!(target: "triedb", "chunk {chunk} queued for reclaim once history passes {version}");
            self.pending_free.push(PendingFree {
                chunk,
                at_version: version,
            });
        }
    }

    pub(crate) fn pending_free_chunks(&self) -> Vec<u32> {
        self.pending_free.iter().map(|entry| entry.chunk).collect()
    }

    /// Current write-head chunks; compaction must not touch these.
    pub(crate) fn head_chunks(&self) -> Vec<u32> {
        [&self.fast_head, &self.slow_head]
            .iter()
            .filter_map(|head| head.chunk.as_ref().map(|chunk| chunk.id()))
            .collect()
    }

    fn reclaim_ripe_chunks(&mut self) -> Result<()> {
        let Some(store) = self.store.clone() else {
            return Ok(());
        };
        let lower = store.pool.meta().version_lower_bound();
        let mut kept = Vec::with_capacity(self.pending_free.len());
        for entry in self.pending_free.drain(..) {
            if lower >= entry.at_version {
                debug!(target: "triedb", "reclaiming compacted chunk {}", entry.chunk);
                let chunk = store
                    .pool
                    .activate_chunk(triedb_pool::ChunkClass::Sequential, entry.chunk)?;
                store.pool.release_chunk(&chunk)?;
            } else {
                kept.push(entry);
            }
        }
        self.pending_free = kept;
        Ok(())
    }
}

fn append_to_head(
    store: &Rc<OnDiskStore>,
    head: &mut WriteHead,
    error: &Rc<RefCell<Option<io::Error>>>,
    bytes: &[u8],
) -> Result<ChunkOffset> {
    let needed = bytes.len();
    debug_assert!(needed > 0 && needed <= triedb_io::WRITE_BUFFER_SIZE);
    if needed as u64 > store.pool.chunk_capacity() {
        return Err(DbError::InvariantViolation(format!(
            "node of {needed} bytes cannot fit a chunk"
        )));
    }
    loop {
        let Some(chunk) = head.chunk.clone() else {
            let chunk = store.pool.allocate_chunk(head.list)?;
            debug_assert_eq!(chunk.used(), 0);
            head.buf_base = 0;
            head.chunk = Some(chunk);
            continue;
        };
        let position = head.buf_base + head.buf_fill as u64;
        if position + needed as u64 > chunk.capacity() {
            flush_head(store, head, error)?;
            head.chunk = None;
            continue;
        }
        if head.buf.is_none() {
            head.buf = Some(store.io.write_buffer()?);
        }
        if head.buf_fill + needed > head.buf.as_ref().expect("just set; qed").len() {
            flush_head(store, head, error)?;
            continue;
        }
        let buf = head.buf.as_mut().expect("just set; qed");
        buf.as_mut_slice()[head.buf_fill..head.buf_fill + needed].copy_from_slice(bytes);
        let offset = chunk.offset(position);
        head.buf_fill += needed;
        return Ok(offset);
    }
}

/// Submit the buffered bytes, padded to a whole page so the next flush
/// starts page-aligned. The used counter advances by the padded amount.
fn flush_head(
    store: &Rc<OnDiskStore>,
    head: &mut WriteHead,
    error: &Rc<RefCell<Option<io::Error>>>,
) -> Result<()> {
    if head.buf_fill == 0 {
        head.buf = None;
        return Ok(());
    }
    let chunk = head.chunk.clone().expect("buffered bytes imply a chunk; qed");
    let mut buf = head.buf.take().expect("buffered bytes imply a buffer; qed");
    let padded = (head.buf_fill as u64 + DISK_PAGE_SIZE - 1) & !(DISK_PAGE_SIZE - 1);
    buf.as_mut_slice()[head.buf_fill..padded as usize].fill(0);
    let reserved = chunk
        .try_reserve(padded)
        .expect("append head checked chunk capacity; qed");
    debug_assert_eq!(reserved, head.buf_base);

    let sink = error.clone();
    let expected = padded as usize;
    store.io.submit_write(
        buf,
        &chunk,
        head.buf_base,
        padded as u32,
        Box::new(
            move |_io: &Executor, _op: CompletedOp, result: io::Result<usize>| {
                let failure = match result {
                    Ok(bytes) if bytes == expected => None,
                    Ok(bytes) => Some(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("short write: {bytes} of {expected} bytes"),
                    )),
                    Err(err) => Some(err),
                };
                if let Some(err) = failure {
                    let mut sink = sink.borrow_mut();
                    if sink.is_none() {
                        *sink = Some(err);
                    }
                }
            },
        ),
    )?;
    head.buf_base += padded;
    head.buf_fill = 0;
    Ok(())
}
