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

//! The public database handles.
//!
//! [`Database`] owns a single worker thread holding the writer's
//! [`UpdateAux`] and executor; every operation becomes a request on a
//! lock-free channel and returns through a per-request reply channel, so
//! client threads see operations complete in submission order.
//! [`ReadOnlyDatabase`] opens the same files read-only from any process
//! and serves lookups at any still-retained version.

use std::{
    cell::RefCell,
    fs::OpenOptions,
    path::PathBuf,
    rc::Rc,
    thread::{self, JoinHandle},
};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use ethereum_types::H256;
use parity_bytes::Bytes;
use parking_lot::Mutex;

use triedb_io::{Executor, ExecutorConfig, RingConfig};
use triedb_pool::{
    ChunkOffset, Mode, PoolOptions, StoragePool, INVALID_OFFSET,
};

use crate::{
    aux::UpdateAux,
    compact::run_compaction,
    error::{DbError, Result},
    find::{find_async, find_async_at, find_blocking, find_subtree, read_node_at, FindOutcome},
    nibbles::Nibbles,
    node::Node,
    traverse::{load_all, preorder_traverse, TraverseMachine},
    update::UpdateList,
    upsert::{apply_updates, graft_subtree},
};

/// Writer configuration.
#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    /// Backing devices or files, device 0 first.
    pub paths: Vec<PathBuf>,
    /// Discard any existing contents and format from scratch.
    pub truncate: bool,
    /// Create missing regular files with this size. Zero means sources
    /// must already exist.
    pub create_file_size: u64,
    /// Chunk size used when formatting.
    pub chunk_capacity: u64,
    /// Maximum number of retained versions.
    pub history_length: u64,
    /// Spread sequential chunks across devices by capacity ratio.
    pub interleave_chunks: bool,
    /// Allow compaction passes during upserts that request them.
    pub compaction: bool,
    pub uring_entries: u32,
    pub sq_thread_cpu: Option<u32>,
    pub rd_buffers: usize,
    pub wr_buffers: usize,
    pub concurrent_read_limit: u32,
    pub capture_io_latencies: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            paths: Vec::new(),
            truncate: false,
            create_file_size: 0,
            chunk_capacity: 2 * 1024 * 1024 * 1024,
            history_length: 65_536,
            interleave_chunks: false,
            compaction: true,
            uring_entries: 128,
            sq_thread_cpu: None,
            rd_buffers: 64,
            wr_buffers: 8,
            concurrent_read_limit: 0,
            capture_io_latencies: false,
        }
    }
}

/// Read-only view configuration; must match the writer's layout knobs.
#[derive(Clone, Debug, Default)]
pub struct ReadOnlyDatabaseConfig {
    pub paths: Vec<PathBuf>,
    pub interleave_chunks: bool,
}

enum VersionQuery {
    Earliest,
    Latest,
    Finalized,
}

enum Request {
    Upsert {
        updates: UpdateList,
        version: u64,
        compact: bool,
        write_to_fast: bool,
        reply: Sender<Result<()>>,
    },
    Get {
        key: Nibbles,
        version: u64,
        want_data: bool,
        reply: Sender<Result<Bytes>>,
    },
    Traverse {
        prefix: Nibbles,
        machine: Box<dyn TraverseMachine>,
        version: u64,
        concurrency: usize,
        reply: Sender<Result<bool>>,
    },
    CopyTrie {
        src_version: u64,
        src_prefix: Nibbles,
        dst_version: u64,
        dst_prefix: Nibbles,
        may_overwrite: bool,
        reply: Sender<Result<()>>,
    },
    Finalize {
        version: u64,
        block_id: H256,
        reply: Sender<Result<()>>,
    },
    UpdateVerified {
        version: u64,
        reply: Sender<Result<()>>,
    },
    UpdateVoted {
        version: u64,
        block_id: H256,
        reply: Sender<Result<()>>,
    },
    Version {
        query: VersionQuery,
        reply: Sender<Option<u64>>,
    },
    Prefetch {
        reply: Sender<Result<usize>>,
    },
    Shutdown,
}

/// Handle to the single-writer database. Shareable across threads; all
/// operations funnel through the worker in submission order.
pub struct Database {
    tx: Sender<Request>,
    worker: Option<JoinHandle<()>>,
}

impl Database {
    /// Open or create an on-disk database and start its worker thread.
    pub fn open(config: DatabaseConfig) -> Result<Database> {
        Self::start(move || Worker::open_on_disk(config))
    }

    /// A database with the same API but no persistence. Historic
    /// versions all resolve to the current tree.
    pub fn in_memory(history_length: u64) -> Database {
        Self::start(move || Ok(Worker::open_in_memory(history_length)))
            .expect("in-memory worker cannot fail to open; qed")
    }

    fn start(open: impl FnOnce() -> Result<Worker> + Send + 'static) -> Result<Database> {
        let (tx, rx) = unbounded();
        let (init_tx, init_rx) = bounded(1);
        let worker = thread::Builder::new()
            .name("triedb-worker".into())
            .spawn(move || {
                let worker = match open() {
                    Ok(worker) => {
                        let _ = init_tx.send(Ok(()));
                        worker
                    }
                    Err(err) => {
                        let _ = init_tx.send(Err(err));
                        return;
                    }
                };
                worker.run(rx);
            })
            .expect("worker thread spawn cannot fail; qed");
        match init_rx.recv() {
            Ok(Ok(())) => Ok(Database {
                tx,
                worker: Some(worker),
            }),
            Ok(Err(err)) => {
                let _ = worker.join();
                Err(err)
            }
            Err(_) => {
                let _ = worker.join();
                Err(DbError::Terminated)
            }
        }
    }

    fn request<T>(&self, build: impl FnOnce(Sender<Result<T>>) -> Request) -> Result<T> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(build(reply_tx))
            .map_err(|_| DbError::Terminated)?;
        reply_rx.recv().map_err(|_| DbError::Terminated)?
    }

    /// Apply an update list as `version`. `version` must continue the
    /// history: one past the latest, or equal to it for proposal rounds.
    pub fn upsert(
        &self,
        updates: UpdateList,
        version: u64,
        compact: bool,
        write_to_fast: bool,
    ) -> Result<()> {
        self.request(|reply| Request::Upsert {
            updates,
            version,
            compact,
            write_to_fast,
            reply,
        })
    }

    /// The value stored at `key` in `version`.
    pub fn get(&self, key: Nibbles, version: u64) -> Result<Bytes> {
        self.request(|reply| Request::Get {
            key,
            version,
            want_data: false,
            reply,
        })
    }

    /// The 32-byte subtree fingerprint of the node at `key` in `version`.
    pub fn get_data(&self, key: Nibbles, version: u64) -> Result<Bytes> {
        self.request(|reply| Request::Get {
            key,
            version,
            want_data: true,
            reply,
        })
    }

    /// Drive `machine` depth-first over the subtree at `prefix`. Results
    /// aggregate through whatever shared state the machine carries.
    pub fn traverse(
        &self,
        prefix: Nibbles,
        machine: Box<dyn TraverseMachine>,
        version: u64,
        concurrency: usize,
    ) -> Result<bool> {
        self.request(|reply| Request::Traverse {
            prefix,
            machine,
            version,
            concurrency,
            reply,
        })
    }

    /// Rebind the subtree at `src_prefix` of `src_version` under
    /// `dst_prefix`, committed as `dst_version`. Payload is shared, not
    /// rewritten.
    pub fn copy_trie(
        &self,
        src_version: u64,
        src_prefix: Nibbles,
        dst_version: u64,
        dst_prefix: Nibbles,
        may_overwrite: bool,
    ) -> Result<()> {
        self.request(|reply| Request::CopyTrie {
            src_version,
            src_prefix,
            dst_version,
            dst_prefix,
            may_overwrite,
            reply,
        })
    }

    /// Promote the proposal tree of `block_id` to the finalized prefix.
    pub fn finalize(&self, version: u64, block_id: H256) -> Result<()> {
        self.request(|reply| Request::Finalize {
            version,
            block_id,
            reply,
        })
    }

    pub fn update_verified(&self, version: u64) -> Result<()> {
        self.request(|reply| Request::UpdateVerified { version, reply })
    }

    pub fn update_voted(&self, version: u64, block_id: H256) -> Result<()> {
        self.request(|reply| Request::UpdateVoted {
            version,
            block_id,
            reply,
        })
    }

    pub fn earliest_version(&self) -> Result<Option<u64>> {
        self.version_query(VersionQuery::Earliest)
    }

    pub fn latest_version(&self) -> Result<Option<u64>> {
        self.version_query(VersionQuery::Latest)
    }

    pub fn latest_finalized(&self) -> Result<Option<u64>> {
        self.version_query(VersionQuery::Finalized)
    }

    fn version_query(&self, query: VersionQuery) -> Result<Option<u64>> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(Request::Version {
                query,
                reply: reply_tx,
            })
            .map_err(|_| DbError::Terminated)?;
        reply_rx.recv().map_err(|_| DbError::Terminated)
    }

    /// Warm the worker's node cache with the latest version's tree.
    pub fn prefetch(&self) -> Result<usize> {
        self.request(|reply| Request::Prefetch { reply })
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.tx.send(Request::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

struct Worker {
    aux: UpdateAux,
    root: Option<Box<Node>>,
    compaction: bool,
}

impl Worker {
    fn open_on_disk(config: DatabaseConfig) -> Result<Worker> {
        if config.paths.is_empty() {
            return Err(DbError::MetadataMismatch("no backing paths given".into()));
        }
        if config.create_file_size > 0 {
            for path in &config.paths {
                if !path.exists() {
                    let file = OpenOptions::new()
                        .create(true)
                        .write(true)
                        .open(path)
                        .map_err(DbError::Device)?;
                    file.set_len(config.create_file_size).map_err(DbError::Device)?;
                    info!(target: "triedb", "created pool source {} of {} bytes", path.display(), config.create_file_size);
                }
            }
        }
        let mode = if config.truncate {
            Mode::Truncate
        } else {
            Mode::OpenExisting
        };
        let pool = StoragePool::open(
            &config.paths,
            mode,
            PoolOptions {
                read_only: false,
                interleave_chunks: config.interleave_chunks,
                chunk_capacity: config.chunk_capacity,
                history_length: config.history_length,
            },
        )?;
        let io = Executor::new(ExecutorConfig {
            ring: RingConfig {
                entries: config.uring_entries,
                sq_thread_cpu: config.sq_thread_cpu,
            },
            rd_buffers: config.rd_buffers,
            wr_buffers: config.wr_buffers,
            concurrent_read_limit: config.concurrent_read_limit,
            capture_io_latencies: config.capture_io_latencies,
        })
        .map_err(DbError::Device)?;
        let aux = UpdateAux::new_on_disk(pool, io)?;
        let root = match aux.latest_version() {
            Some(latest) => aux.load_root(latest)?.map(Box::new),
            None => None,
        };
        Ok(Worker {
            aux,
            root,
            compaction: config.compaction,
        })
    }

    fn open_in_memory(history_length: u64) -> Worker {
        Worker {
            aux: UpdateAux::new_in_memory(history_length),
            root: None,
            compaction: false,
        }
    }

    fn run(mut self, rx: Receiver<Request>) {
        while let Ok(request) = rx.recv() {
            let fatal = self.handle(request);
            if fatal {
                warn!(target: "triedb", "worker stopping on fatal error; draining requests");
                break;
            }
        }
        // dropping the receiver fails every in-flight and future request
        // with `Terminated`
    }

    /// Service one request; returns true when the error leaves the store
    /// untrustworthy and the worker must stop.
    fn handle(&mut self, request: Request) -> bool {
        fn is_fatal<T>(result: &Result<T>) -> bool {
            matches!(
                result,
                Err(DbError::InvariantViolation(_)) | Err(DbError::MetadataMismatch(_))
            )
        }
        match request {
            Request::Upsert {
                updates,
                version,
                compact,
                write_to_fast,
                reply,
            } => {
                let result = self.upsert(updates, version, compact, write_to_fast);
                let fatal = is_fatal(&result);
                let _ = reply.send(result);
                fatal
            }
            Request::Get {
                key,
                version,
                want_data,
                reply,
            } => {
                let result = self.get(key, version, want_data);
                let fatal = is_fatal(&result);
                let _ = reply.send(result);
                fatal
            }
            Request::Traverse {
                prefix,
                machine,
                version,
                concurrency,
                reply,
            } => {
                let result = self.traverse(prefix, machine, version, concurrency);
                let fatal = is_fatal(&result);
                let _ = reply.send(result);
                fatal
            }
            Request::CopyTrie {
                src_version,
                src_prefix,
                dst_version,
                dst_prefix,
                may_overwrite,
                reply,
            } => {
                let result =
                    self.copy_trie(src_version, src_prefix, dst_version, dst_prefix, may_overwrite);
                let fatal = is_fatal(&result);
                let _ = reply.send(result);
                fatal
            }
            Request::Finalize {
                version,
                block_id,
                reply,
            } => {
                let result = self.finalize(version, block_id);
                let fatal = is_fatal(&result);
                let _ = reply.send(result);
                fatal
            }
            Request::UpdateVerified { version, reply } => {
                let result = self.update_verified(version);
                let _ = reply.send(result);
                false
            }
            Request::UpdateVoted {
                version,
                block_id,
                reply,
            } => {
                let meta = self.aux.meta();
                meta.set_voted(version, &block_id.to_fixed_bytes());
                let _ = reply.send(Ok(()));
                false
            }
            Request::Version { query, reply } => {
                let answer = match query {
                    VersionQuery::Earliest => self.aux.earliest_version(),
                    VersionQuery::Latest => self.aux.latest_version(),
                    VersionQuery::Finalized => self.aux.latest_finalized(),
                };
                let _ = reply.send(answer);
                false
            }
            Request::Prefetch { reply } => {
                let result = self.prefetch();
                let _ = reply.send(result);
                false
            }
            Request::Shutdown => true,
        }
    }

    fn upsert(
        &mut self,
        updates: UpdateList,
        version: u64,
        compact: bool,
        write_to_fast: bool,
    ) -> Result<()> {
        self.aux.validate_upsert_version(version)?;
        let base = self.root.take();
        self.root = match apply_updates(self.aux.pool(), base, updates) {
            Ok(root) => root,
            Err(err) => {
                self.recover();
                return Err(err);
            }
        };
        let mut victims = Vec::new();
        if compact && self.compaction {
            if let Some(root) = self.root.as_deref_mut() {
                victims = match run_compaction(&mut self.aux, root) {
                    Ok(victims) => victims,
                    Err(err) => {
                        self.recover();
                        return Err(err);
                    }
                };
            }
        }
        let root_offset = match self.root.as_deref_mut() {
            Some(root) => match self.aux.write_tree(root, write_to_fast) {
                Ok(offset) => offset,
                Err(err) => {
                    self.recover();
                    return Err(err);
                }
            },
            None => INVALID_OFFSET,
        };
        if let Err(err) = self.aux.commit(version, root_offset) {
            self.recover();
            return Err(err);
        }
        if !victims.is_empty() {
            self.aux.schedule_free(victims, version);
        }
        Ok(())
    }

    /// Reload the last committed state after a failed mutation; the
    /// in-memory tree may have diverged from disk.
    fn recover(&mut self) {
        if !self.aux.is_on_disk() {
            return;
        }
        if let Err(err) = self.aux.abort_commit() {
            warn!(target: "triedb", "post-failure rewind failed: {err}");
        }
        self.root = self
            .aux
            .latest_version()
            .and_then(|latest| self.aux.load_root(latest).ok().flatten())
            .map(Box::new);
    }

    fn get(&mut self, key: Nibbles, version: u64, want_data: bool) -> Result<Bytes> {
        if !self.aux.meta().version_in_range(version) {
            return Err(DbError::VersionUnknown);
        }
        let outcome = match self.aux.store() {
            None => match &self.root {
                // memory mode serves every retained version from the
                // current tree
                Some(root) => find_blocking(None, root, &key)?,
                None => None,
            },
            Some(store) => {
                let result: Rc<RefCell<Option<Result<Option<FindOutcome>>>>> =
                    Rc::new(RefCell::new(None));
                let sink = result.clone();
                let cb = Box::new(move |found: Result<Option<FindOutcome>>| {
                    *sink.borrow_mut() = Some(found);
                });
                let latest = self.aux.latest_version();
                if Some(version) == latest {
                    match &self.root {
                        Some(root) => find_async(store, root, &key, cb),
                        None => return Err(DbError::KeyNotFound),
                    }
                } else {
                    match self.aux.meta().root_offset(version) {
                        Some(offset) => find_async_at(store, offset, version, &key, cb),
                        None => return Err(DbError::KeyNotFound),
                    }
                }
                loop {
                    if result.borrow().is_some() {
                        break;
                    }
                    if store.io.io_in_flight() == 0 {
                        return Err(DbError::Device(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            "read pipeline stalled",
                        )));
                    }
                    store.io.poll(true, usize::MAX).map_err(DbError::Device)?;
                }
                let outcome = result.borrow_mut().take().expect("checked above; qed");
                outcome?
            }
        };
        match outcome {
            Some(found) => {
                if want_data {
                    Ok(found.fingerprint.as_bytes().to_vec())
                } else {
                    found.value.ok_or(DbError::KeyNotFound)
                }
            }
            None => Err(DbError::KeyNotFound),
        }
    }

    fn traverse(
        &mut self,
        prefix: Nibbles,
        mut machine: Box<dyn TraverseMachine>,
        version: u64,
        concurrency: usize,
    ) -> Result<bool> {
        if !self.aux.meta().version_in_range(version) {
            return Err(DbError::VersionUnknown);
        }
        let on_disk = self.aux.is_on_disk();
        let latest = self.aux.latest_version();
        let historic_root;
        let root: &Node = if Some(version) == latest || !on_disk {
            match self.root.as_deref() {
                Some(root) => root,
                None => return Ok(true),
            }
        } else {
            historic_root = self.aux.load_root(version)?;
            match &historic_root {
                Some(root) => root,
                None => return Ok(true),
            }
        };
        let pool = self.aux.pool();
        let Some(start) = find_subtree(pool, root, prefix.as_slice(), !on_disk)? else {
            return Ok(true);
        };
        // the writer thread must not fan blocking reads out in parallel
        let concurrency = if on_disk { 1 } else { concurrency };
        preorder_traverse(pool, &start, machine.as_mut(), 0, concurrency)
    }

    fn copy_trie(
        &mut self,
        src_version: u64,
        src_prefix: Nibbles,
        dst_version: u64,
        dst_prefix: Nibbles,
        may_overwrite: bool,
    ) -> Result<()> {
        if !self.aux.meta().version_in_range(src_version) {
            return Err(DbError::VersionUnknown);
        }
        self.aux.validate_upsert_version(dst_version)?;
        let on_disk = self.aux.is_on_disk();
        let latest = self.aux.latest_version();

        let sub = {
            let historic_root;
            let src_root: &Node = if Some(src_version) == latest || !on_disk {
                self.root.as_deref().ok_or(DbError::KeyNotFound)?
            } else {
                historic_root = self.aux.load_root(src_version)?;
                historic_root.as_ref().ok_or(DbError::KeyNotFound)?
            };
            find_subtree(self.aux.pool(), src_root, src_prefix.as_slice(), !on_disk)?
                .ok_or(DbError::KeyNotFound)?
        };
        if !may_overwrite {
            if let Some(root) = self.root.as_deref() {
                if find_subtree(self.aux.pool(), root, dst_prefix.as_slice(), false)?.is_some() {
                    return Err(DbError::InvariantViolation(format!(
                        "destination prefix {dst_prefix} already populated"
                    )));
                }
            }
        }

        let base = self.root.take();
        self.root = match graft_subtree(
            self.aux.pool(),
            base,
            dst_prefix,
            Box::new(sub),
            dst_version,
        ) {
            Ok(root) => root,
            Err(err) => {
                self.recover();
                return Err(err);
            }
        };
        let root_offset = match self.root.as_deref_mut() {
            Some(root) => match self.aux.write_tree(root, true) {
                Ok(offset) => offset,
                Err(err) => {
                    self.recover();
                    return Err(err);
                }
            },
            None => INVALID_OFFSET,
        };
        if let Err(err) = self.aux.commit(dst_version, root_offset) {
            self.recover();
            return Err(err);
        }
        Ok(())
    }

    fn finalize(&mut self, version: u64, block_id: H256) -> Result<()> {
        match self.aux.latest_finalized() {
            Some(finalized) if version != finalized + 1 => {
                return Err(DbError::InvariantViolation(format!(
                    "finalize at {version}, latest finalized is {finalized}"
                )))
            }
            _ => {}
        }
        if self.aux.latest_version() != Some(version) {
            return Err(DbError::InvariantViolation(format!(
                "only the latest version may be finalized, got {version}"
            )));
        }
        self.copy_trie(
            version,
            crate::proposal_prefix(&block_id),
            version,
            crate::finalized_prefix(),
            true,
        )?;
        self.aux.meta().set_latest_finalized(version);
        Ok(())
    }

    fn update_verified(&mut self, version: u64) -> Result<()> {
        if let Some(current) = self.aux.latest_verified() {
            if version <= current {
                return Err(DbError::InvariantViolation(format!(
                    "verified watermark must advance: {version} <= {current}"
                )));
            }
        }
        self.aux.meta().set_latest_verified(version);
        Ok(())
    }

    fn prefetch(&mut self) -> Result<usize> {
        let Some(root) = self.root.as_deref_mut() else {
            return Ok(0);
        };
        match self.aux.pool() {
            Some(pool) => load_all(pool, root),
            None => Ok(0),
        }
    }
}

struct PinnedRoot {
    version: u64,
    offset: ChunkOffset,
    node: Box<Node>,
}

/// A same-pool view that never writes. Any number may exist, in this
/// process or others; each observes committed versions through the
/// shared metadata mapping.
pub struct ReadOnlyDatabase {
    pool: StoragePool,
    pinned: Mutex<Option<PinnedRoot>>,
}

impl ReadOnlyDatabase {
    pub fn open(config: ReadOnlyDatabaseConfig) -> Result<ReadOnlyDatabase> {
        let pool = StoragePool::open(
            &config.paths,
            Mode::OpenExisting,
            PoolOptions {
                read_only: true,
                interleave_chunks: config.interleave_chunks,
                ..Default::default()
            },
        )?;
        let db = ReadOnlyDatabase {
            pool,
            pinned: Mutex::new(None),
        };
        let _ = db.load_latest();
        Ok(db)
    }

    pub fn earliest_version(&self) -> Option<u64> {
        let (lower, next) = self.pool.meta().version_range();
        (next != triedb_pool::INVALID_VERSION && next != lower).then_some(lower)
    }

    pub fn latest_version(&self) -> Option<u64> {
        let (lower, next) = self.pool.meta().version_range();
        (next != triedb_pool::INVALID_VERSION && next != lower).then(|| next - 1)
    }

    pub fn latest_finalized(&self) -> Option<u64> {
        let version = self.pool.meta().latest_finalized();
        (version != triedb_pool::INVALID_VERSION).then_some(version)
    }

    /// Whether the pinned root still matches the writer's newest commit.
    pub fn is_latest(&self) -> bool {
        let pinned = self.pinned.lock();
        match (&*pinned, self.pool.meta().latest_root_offset()) {
            (Some(pinned), Some((_, offset))) => pinned.offset == offset,
            (None, None) => true,
            _ => false,
        }
    }

    /// Re-pin the newest committed root.
    pub fn load_latest(&self) -> Result<()> {
        let Some((version, offset)) = self.pool.meta().latest_root_offset() else {
            *self.pinned.lock() = None;
            return Ok(());
        };
        let node = Box::new(read_node_at(&self.pool, offset, version)?);
        *self.pinned.lock() = Some(PinnedRoot {
            version,
            offset,
            node,
        });
        Ok(())
    }

    /// Point lookup at any retained version. `VersionUnknown` means the
    /// version left history mid-query; retry fresher.
    pub fn get(&self, key: Nibbles, version: u64) -> Result<Bytes> {
        match self.lookup(&key, version)? {
            Some(found) => found.value.ok_or(DbError::KeyNotFound),
            None => Err(DbError::KeyNotFound),
        }
    }

    /// Subtree fingerprint at `key`, like the writer's `get_data`.
    pub fn get_data(&self, key: Nibbles, version: u64) -> Result<Bytes> {
        match self.lookup(&key, version)? {
            Some(found) => Ok(found.fingerprint.as_bytes().to_vec()),
            None => Err(DbError::KeyNotFound),
        }
    }

    fn lookup(&self, key: &Nibbles, version: u64) -> Result<Option<FindOutcome>> {
        let meta = self.pool.meta();
        if !meta.version_in_range(version) {
            return Err(DbError::VersionUnknown);
        }
        let result = (|| {
            let pinned = self.pinned.lock();
            if let Some(pinned) = &*pinned {
                if pinned.version == version && meta.root_offset(version) == Some(pinned.offset) {
                    return find_blocking(Some(&self.pool), &pinned.node, key);
                }
            }
            drop(pinned);
            let Some(offset) = meta.root_offset(version) else {
                return Ok(None);
            };
            let root = read_node_at(&self.pool, offset, version)?;
            find_blocking(Some(&self.pool), &root, key)
        })();
        // anything read mid-prune may be garbage; the version bound is
        // the authority
        if !meta.version_in_range(version) {
            return Err(DbError::VersionUnknown);
        }
        result
    }

    /// Depth-first walk of the subtree under `prefix` at `version`,
    /// optionally fanning out across threads.
    pub fn traverse(
        &self,
        prefix: Nibbles,
        machine: &mut dyn TraverseMachine,
        version: u64,
        concurrency: usize,
    ) -> Result<bool> {
        let meta = self.pool.meta();
        if !meta.version_in_range(version) {
            return Err(DbError::VersionUnknown);
        }
        let result = (|| {
            let Some(offset) = meta.root_offset(version) else {
                return Ok(true);
            };
            let root = read_node_at(&self.pool, offset, version)?;
            let Some(start) = find_subtree(Some(&self.pool), &root, prefix.as_slice(), false)?
            else {
                return Ok(true);
            };
            preorder_traverse(Some(&self.pool), &start, machine, 0, concurrency)
        })();
        if !meta.version_in_range(version) {
            return Err(DbError::VersionUnknown);
        }
        result
    }
}
