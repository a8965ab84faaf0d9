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

//! Point lookups: the blocking walk and the pipelined async walk.
//!
//! The blocking walk reads nodes through the cached descriptors and is
//! what the read-only view and the tests use. The async walk chains one
//! submission per uncached hop: each completion decodes the node, walks as
//! far as the cache allows and submits the next read, so a lookup's disk
//! hops overlap with whatever else the executor is doing.

use std::rc::Rc;

use ethereum_types::H256;
use parity_bytes::Bytes;

use triedb_io::{CompletedOp, Executor};
use triedb_pool::{ChunkOffset, StoragePool, DISK_PAGE_SIZE};

use crate::{
    aux::OnDiskStore,
    error::{DbError, Result},
    nibbles::Nibbles,
    node::{Child, DecodeError, Node},
};

/// What a successful lookup saw at the key.
pub struct FindOutcome {
    /// The leaf value, when the node carries one.
    pub value: Option<Bytes>,
    /// Subtree fingerprint of the node at the key.
    pub fingerprint: H256,
    /// Smallest write version under the node.
    pub min_version: u64,
}

fn outcome(node: &Node) -> FindOutcome {
    FindOutcome {
        value: node.value.clone(),
        fingerprint: node.fingerprint,
        min_version: node.min_version,
    }
}

/// Read and decode the node at `offset`, growing the read until the
/// serialization is complete.
pub(crate) fn read_node_at(pool: &StoragePool, offset: ChunkOffset, hint: u64) -> Result<Node> {
    if !offset.is_valid() {
        return Err(DbError::CorruptNode("invalid node offset"));
    }
    let available = pool.chunk_capacity() - offset.byte_offset();
    let mut len = (DISK_PAGE_SIZE.min(available)) as usize;
    loop {
        let mut buf = vec![0u8; len];
        pool.read_at(offset, &mut buf)?;
        match Node::decode(&buf, hint) {
            Ok(node) => return Ok(node),
            Err(DecodeError::Truncated { needed }) => {
                if needed as u64 > available || needed <= len {
                    return Err(DbError::CorruptNode("node extends past chunk end"));
                }
                len = needed;
            }
            Err(DecodeError::Corrupt(what)) => return Err(DbError::CorruptNode(what)),
        }
    }
}

/// Resolve a child slot to its node: the cache when present, a blocking
/// read otherwise.
pub(crate) fn child_into_node(pool: Option<&StoragePool>, child: Child) -> Result<Box<Node>> {
    match child.node {
        Some(node) => Ok(node),
        None => {
            let pool = pool.ok_or_else(|| {
                DbError::InvariantViolation("uncached child in a memory-only trie".into())
            })?;
            Ok(Box::new(read_node_at(pool, child.offset, child.min_version)?))
        }
    }
}

/// Walk `key` down from `root` with synchronous reads. `Ok(None)` is
/// "no node at exactly this key".
pub fn find_blocking(
    pool: Option<&StoragePool>,
    root: &Node,
    key: &Nibbles,
) -> Result<Option<FindOutcome>> {
    walk_blocking(pool, root, key.as_slice())
}

fn walk_blocking(
    pool: Option<&StoragePool>,
    node: &Node,
    key: &[u8],
) -> Result<Option<FindOutcome>> {
    let cpl = node.path.common_prefix_len(key);
    if cpl < node.path.len() {
        return Ok(None);
    }
    let key = &key[cpl..];
    let Some(&branch) = key.first() else {
        return Ok(Some(outcome(node)));
    };
    let Some(child) = node.child(branch) else {
        return Ok(None);
    };
    let key = &key[1..];
    match &child.node {
        Some(cached) => walk_blocking(pool, cached, key),
        None => {
            let pool = pool.ok_or_else(|| {
                DbError::InvariantViolation("uncached child in a memory-only trie".into())
            })?;
            let loaded = read_node_at(pool, child.offset, child.min_version)?;
            walk_blocking(Some(pool), &loaded, key)
        }
    }
}

/// Locate the subtree covering every key beneath `prefix` and return an
/// owned copy of its root node, path rebased to be relative to the
/// prefix. `deep` clones the cached subtree too (memory-only tries have
/// no disk to reload from); otherwise the copy carries descriptors only.
pub(crate) fn find_subtree(
    pool: Option<&StoragePool>,
    root: &Node,
    prefix: &[u8],
    deep: bool,
) -> Result<Option<Node>> {
    let node = root;
    let cpl = node.path.common_prefix_len(prefix);
    if cpl == prefix.len() {
        let mut sub = if deep {
            node.clone()
        } else {
            node.shallow_clone()
        };
        sub.path = node.path.skip(cpl);
        return Ok(Some(sub));
    }
    if cpl < node.path.len() {
        return Ok(None);
    }
    let rest = &prefix[cpl..];
    let Some(child) = node.child(rest[0]) else {
        return Ok(None);
    };
    match &child.node {
        Some(cached) => find_subtree(pool, cached, &rest[1..], deep),
        None => {
            let loaded = Box::new(read_node_at(
                pool.ok_or_else(|| {
                    DbError::InvariantViolation("uncached child in a memory-only trie".into())
                })?,
                child.offset,
                child.min_version,
            )?);
            find_subtree(pool, &loaded, &rest[1..], deep)
        }
    }
}

/// Continuation invoked once an async lookup settles.
pub(crate) type FindCallback = Box<dyn FnOnce(Result<Option<FindOutcome>>)>;

/// Start an async lookup from a cached root node.
pub(crate) fn find_async(store: &Rc<OnDiskStore>, root: &Node, key: &Nibbles, cb: FindCallback) {
    continue_from_node(store, root, key.as_slice(), cb)
}

/// Start an async lookup from a bare root offset (historic versions whose
/// root is not cached).
pub(crate) fn find_async_at(
    store: &Rc<OnDiskStore>,
    root_offset: ChunkOffset,
    hint: u64,
    key: &Nibbles,
    cb: FindCallback,
) {
    submit_node_read(store.clone(), root_offset, hint, key.as_slice().to_vec(), cb)
}

fn continue_from_node(store: &Rc<OnDiskStore>, node: &Node, key: &[u8], cb: FindCallback) {
    let cpl = node.path.common_prefix_len(key);
    if cpl < node.path.len() {
        cb(Ok(None));
        return;
    }
    let key = &key[cpl..];
    let Some(&branch) = key.first() else {
        cb(Ok(Some(outcome(node))));
        return;
    };
    let Some(child) = node.child(branch) else {
        cb(Ok(None));
        return;
    };
    let key = &key[1..];
    match &child.node {
        Some(cached) => continue_from_node(store, cached, key, cb),
        None => submit_node_read(
            store.clone(),
            child.offset,
            child.min_version,
            key.to_vec(),
            cb,
        ),
    }
}

fn submit_node_read(
    store: Rc<OnDiskStore>,
    offset: ChunkOffset,
    hint: u64,
    key: Vec<u8>,
    cb: FindCallback,
) {
    let window_base = offset.byte_offset() & !(DISK_PAGE_SIZE - 1);
    let capacity = store.pool.chunk_capacity();
    let buf = match store.io.read_buffer() {
        Ok(buf) => buf,
        Err(err) => {
            cb(Err(DbError::Device(err)));
            return;
        }
    };
    let window_len = (buf.len() as u64).min(capacity - window_base) as u32;
    let chunk = match store.pool.activate_chunk(triedb_pool::ChunkClass::Sequential, offset.chunk_id()) {
        Ok(chunk) => chunk,
        Err(err) => {
            cb(Err(err.into()));
            return;
        }
    };
    let receiver = {
        let store = store.clone();
        move |_io: &Executor, op: CompletedOp, result: std::io::Result<usize>| {
            let buf = op.into_read_buffer().expect("read completion; qed");
            let bytes = match result {
                Ok(bytes) => bytes,
                Err(err) => {
                    cb(Err(DbError::Device(err)));
                    return;
                }
            };
            let skip = (offset.byte_offset() - window_base) as usize;
            if bytes <= skip {
                cb(Err(DbError::Device(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "short node read",
                ))));
                return;
            }
            let slice = &buf.as_slice()[skip..bytes];
            match Node::decode(slice, hint) {
                Ok(node) => continue_from_node(&store, &node, &key, cb),
                Err(DecodeError::Truncated { needed }) => {
                    submit_scatter_read(store, offset, hint, needed, key, cb)
                }
                Err(DecodeError::Corrupt(what)) => cb(Err(DbError::CorruptNode(what))),
            }
        }
    };
    if let Err(err) = store
        .io
        .submit_read(buf, &chunk, window_base, window_len, Box::new(receiver))
    {
        // the closure consumed cb; errors here surface via poll instead
        warn!(target: "triedb", "read submission failed: {err}");
    }
}

/// Second hop for nodes larger than one read buffer: gather enough
/// buffers to cover the full serialization and reassemble it.
fn submit_scatter_read(
    store: Rc<OnDiskStore>,
    offset: ChunkOffset,
    hint: u64,
    needed: usize,
    key: Vec<u8>,
    cb: FindCallback,
) {
    let window_base = offset.byte_offset() & !(DISK_PAGE_SIZE - 1);
    let skip = (offset.byte_offset() - window_base) as usize;
    let capacity = store.pool.chunk_capacity();
    let total = {
        let unaligned = skip as u64 + needed as u64;
        (unaligned + DISK_PAGE_SIZE - 1) & !(DISK_PAGE_SIZE - 1)
    };
    if window_base + total > capacity {
        cb(Err(DbError::CorruptNode("node extends past chunk end")));
        return;
    }
    let mut bufs = Vec::new();
    let mut covered = 0u64;
    while covered < total {
        match store.io.read_buffer() {
            Ok(buf) => {
                covered += buf.len() as u64;
                bufs.push(buf);
            }
            Err(err) => {
                cb(Err(DbError::Device(err)));
                return;
            }
        }
    }
    let chunk = match store.pool.activate_chunk(triedb_pool::ChunkClass::Sequential, offset.chunk_id()) {
        Ok(chunk) => chunk,
        Err(err) => {
            cb(Err(err.into()));
            return;
        }
    };
    let receiver = {
        let store = store.clone();
        move |_io: &Executor, op: CompletedOp, result: std::io::Result<usize>| {
            let bufs = op.into_scatter_buffers();
            let bytes = match result {
                Ok(bytes) => bytes,
                Err(err) => {
                    cb(Err(DbError::Device(err)));
                    return;
                }
            };
            if (bytes as u64) < total {
                cb(Err(DbError::Device(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "short scatter read",
                ))));
                return;
            }
            let mut assembled = Vec::with_capacity(total as usize);
            let mut remaining = total as usize;
            for buf in &bufs {
                let take = remaining.min(buf.len());
                assembled.extend_from_slice(&buf.as_slice()[..take]);
                remaining -= take;
            }
            match Node::decode(&assembled[skip..], hint) {
                Ok(node) => continue_from_node(&store, &node, &key, cb),
                Err(_) => cb(Err(DbError::CorruptNode("scatter reassembly incomplete"))),
            }
        }
    };
    if let Err(err) = store
        .io
        .submit_read_scatter(bufs, &chunk, window_base, total, Box::new(receiver))
    {
        warn!(target: "triedb", "scatter submission failed: {err}");
    }
}
