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

//! Pool assembly: devices, chunk arena and chunk handles.

use std::{
    os::unix::io::RawFd,
    path::Path,
    sync::{
        atomic::Ordering,
        Arc, Weak,
    },
};

use log::{debug, info, warn};
use memmap2::MmapOptions;
use parking_lot::Mutex;

use crate::{
    device::{pread_exact, Device, Footer},
    error::{Error, Result},
    fnv1a_add,
    meta::{ListId, MetaRegion},
    offset::{ChunkOffset, INVALID_CHUNK_ID},
    FNV1A_BASIS, METADATA_RESERVE,
};

/// How to treat existing pool contents at open.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mode {
    /// Footers and metadata must already be valid.
    OpenExisting,
    /// Discard everything and format from scratch.
    Truncate,
}

/// The two chunk classes of a pool.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChunkClass {
    /// Chunk 0 of each device: random access, reserved for metadata.
    Conventional,
    /// Everything else: append-only with a persistent used-byte counter.
    Sequential,
}

/// Open-time knobs.
#[derive(Clone, Debug)]
pub struct PoolOptions {
    pub read_only: bool,
    /// Spread sequential chunks across devices proportionally to their
    /// capacity instead of keeping each device's chunks contiguous.
    pub interleave_chunks: bool,
    /// Chunk size used when formatting. Power of two.
    pub chunk_capacity: u64,
    /// Version history bound written into fresh metadata.
    pub history_length: u64,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            read_only: false,
            interleave_chunks: false,
            chunk_capacity: 2 * 1024 * 1024 * 1024,
            history_length: crate::meta::ROOT_RING_SIZE,
        }
    }
}

pub(crate) struct PoolInner {
    devices: Vec<Device>,
    meta: MetaRegion,
    /// Global sequential chunk id to (device index, zone within device).
    seq_map: Vec<(u32, u32)>,
    chunk_capacity: u64,
    read_only: bool,
    /// Guards all free/fast/slow list surgery.
    list_lock: Mutex<()>,
    active_cnv: Mutex<Vec<Weak<ChunkShared>>>,
    active_seq: Mutex<Vec<Weak<ChunkShared>>>,
}

/// A storage pool over one or more backing devices.
pub struct StoragePool {
    inner: Arc<PoolInner>,
}

struct ChunkShared {
    pool: Arc<PoolInner>,
    class: ChunkClass,
    id: u32,
    device: u32,
    base: u64,
    capacity: u64,
    generation: u32,
}

/// A cheap, clonable handle to an activated chunk.
#[derive(Clone)]
pub struct ChunkHandle {
    shared: Arc<ChunkShared>,
}

impl StoragePool {
    /// Open a pool over `sources`. Every source is classified (regular
    /// file or block device; zoned devices are rejected), its footer is
    /// verified or written, and the pool metadata region on device 0 is
    /// memory-mapped.
    pub fn open<P: AsRef<Path>>(sources: &[P], mode: Mode, opts: PoolOptions) -> Result<StoragePool> {
        if sources.is_empty() {
            return Err(Error::InvalidSource("no sources given".into()));
        }
        if mode == Mode::Truncate && opts.read_only {
            return Err(Error::ReadOnly);
        }

        let mut devices = Vec::with_capacity(sources.len());
        for (index, source) in sources.iter().enumerate() {
            devices.push(Device::open(index as u32, source.as_ref(), opts.read_only)?);
        }

        let chunk_capacity = Self::init_footers(&mut devices, mode, &opts)?;
        let per_device_seq: Vec<u32> = devices
            .iter()
            .map(|device| {
                let chunks = device.chunks(chunk_capacity);
                chunks.saturating_sub(1)
            })
            .collect();
        for (device, seq) in devices.iter().zip(&per_device_seq) {
            if device.chunks(chunk_capacity) == 0 {
                return Err(Error::InvalidSource(format!(
                    "{} is too small for even one chunk of {:#x} bytes",
                    device.path().display(),
                    chunk_capacity
                )));
            }
            debug!(target: "triedb", "device {}: {} sequential chunks", device.index(), seq);
        }
        let total_seq: u64 = per_device_seq.iter().map(|c| *c as u64).sum();
        if total_seq == 0 {
            return Err(Error::InvalidSource(
                "pool has no sequential chunks; enlarge the sources".into(),
            ));
        }
        if total_seq >= INVALID_CHUNK_ID as u64 {
            return Err(Error::InvalidSource(format!(
                "pool would hold {total_seq} chunks, above the 20-bit limit"
            )));
        }
        let total_seq = total_seq as u32;

        Self::check_config_hash(&devices, chunk_capacity, opts.interleave_chunks, &per_device_seq)?;
        let seq_map = Self::build_seq_map(&per_device_seq, opts.interleave_chunks);
        debug_assert_eq!(seq_map.len(), total_seq as usize);

        let meta = Self::map_metadata(&devices[0], total_seq, opts.read_only)?;
        match mode {
            Mode::Truncate => {
                meta.format(total_seq, opts.history_length.min(crate::meta::ROOT_RING_SIZE));
                for id in 0..total_seq {
                    meta.list_append(ListId::Free, id);
                }
                meta.add_free_capacity(total_seq as u64 * chunk_capacity);
                info!(target: "triedb", "formatted pool: {} sequential chunks of {:#x} bytes", total_seq, chunk_capacity);
            }
            Mode::OpenExisting => {
                meta.verify(total_seq).map_err(Error::MetadataMismatch)?;
            }
        }

        let inner = Arc::new(PoolInner {
            active_cnv: Mutex::new(vec![Weak::new(); devices.len()]),
            active_seq: Mutex::new(vec![Weak::new(); total_seq as usize]),
            devices,
            meta,
            seq_map,
            chunk_capacity,
            read_only: opts.read_only,
            list_lock: Mutex::new(()),
        });

        let pool = StoragePool { inner };
        if !opts.read_only && pool.meta().is_dirty() {
            warn!(target: "triedb", "pool metadata dirty at open; rewinding to last clean state");
            pool.rewind_to_wip_offsets()?;
        }
        Ok(pool)
    }

    fn init_footers(devices: &mut [Device], mode: Mode, opts: &PoolOptions) -> Result<u64> {
        let mut chunk_capacity: Option<u64> = None;
        for device in devices.iter() {
            let footer = match mode {
                Mode::Truncate => {
                    if !opts.chunk_capacity.is_power_of_two()
                        || opts.chunk_capacity < 1024 * 1024
                        || opts.chunk_capacity > 2 * 1024 * 1024 * 1024
                    {
                        return Err(Error::InvalidSource(format!(
                            "chunk capacity {:#x} must be a power of two between 1MiB and 2GiB",
                            opts.chunk_capacity
                        )));
                    }
                    if let Err(err) = device.discard_all() {
                        // some filesystems cannot punch the whole file; a
                        // formatted pool never reads unwritten bytes anyway
                        debug!(target: "triedb", "discard of {} failed at format: {err}", device.path().display());
                    }
                    let footer = Footer {
                        chunk_capacity: opts.chunk_capacity as u32,
                        config_hash: 0,
                    };
                    device.write_footer(&footer)?;
                    footer
                }
                Mode::OpenExisting => device.read_footer()?.ok_or_else(|| {
                    Error::MetadataMismatch(format!(
                        "{} has not been initialised as a pool source",
                        device.path().display()
                    ))
                })?,
            };
            let capacity = footer.chunk_capacity as u64;
            match chunk_capacity {
                None => chunk_capacity = Some(capacity),
                Some(existing) if existing != capacity => {
                    return Err(Error::MetadataMismatch(format!(
                        "{} has chunk capacity {:#x}, pool uses {:#x}",
                        device.path().display(),
                        capacity,
                        existing
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(chunk_capacity.expect("at least one device; qed"))
    }

    fn config_hash(chunk_capacity: u64, interleave: bool, per_device_seq: &[u32]) -> u32 {
        let mut hash = fnv1a_add(FNV1A_BASIS, 1 + interleave as u32);
        for seq in per_device_seq {
            // hash the full per-device chunk count, conventional included
            hash = fnv1a_add(hash, seq + 1);
            hash = fnv1a_add(hash, chunk_capacity as u32);
        }
        hash
    }

    fn check_config_hash(
        devices: &[Device],
        chunk_capacity: u64,
        interleave: bool,
        per_device_seq: &[u32],
    ) -> Result<()> {
        let expected = Self::config_hash(chunk_capacity, interleave, per_device_seq);
        for device in devices {
            let footer = device
                .read_footer()?
                .expect("footer verified or written above; qed");
            if footer.config_hash == 0 {
                device.write_footer(&Footer {
                    config_hash: expected,
                    ..footer
                })?;
            } else if footer.config_hash != expected {
                return Err(Error::MetadataMismatch(format!(
                    "{} was initialised with a different pool configuration",
                    device.path().display()
                )));
            }
        }
        Ok(())
    }

    /// Lay out the global sequential chunk table. With interleaving, a
    /// device holding twice the chunks of another appears twice as often,
    /// so consecutive allocations spread proportionally to capacity.
    fn build_seq_map(per_device_seq: &[u32], interleave: bool) -> Vec<(u32, u32)> {
        let total: u64 = per_device_seq.iter().map(|c| *c as u64).sum();
        let mut map = Vec::with_capacity(total as usize);
        if !interleave {
            for (device, count) in per_device_seq.iter().enumerate() {
                for zone in 1..=*count {
                    map.push((device as u32, zone));
                }
            }
            return map;
        }
        let mut ratios = vec![0f64; per_device_seq.len()];
        let mut credit = vec![0f64; per_device_seq.len()];
        let mut next_zone = vec![1u32; per_device_seq.len()];
        for (device, count) in per_device_seq.iter().enumerate() {
            if *count > 0 {
                ratios[device] = total as f64 / *count as f64;
                credit[device] = ratios[device];
            }
        }
        while (map.len() as u64) < total {
            for device in 0..per_device_seq.len() {
                if per_device_seq[device] == 0 || next_zone[device] > per_device_seq[device] {
                    continue;
                }
                credit[device] -= 1.0;
                if credit[device] < 0.0 {
                    map.push((device as u32, next_zone[device]));
                    next_zone[device] += 1;
                    credit[device] += ratios[device];
                    if map.len() as u64 == total {
                        break;
                    }
                }
            }
        }
        map
    }

    fn map_metadata(device0: &Device, total_seq: u32, read_only: bool) -> Result<MetaRegion> {
        let region_len = MetaRegion::region_len(total_seq);
        if region_len > METADATA_RESERVE {
            return Err(Error::InvalidSource(format!(
                "metadata region of {region_len} bytes exceeds the reserve"
            )));
        }
        let region_off = device0.footer_offset() - region_len;
        let mut options = MmapOptions::new();
        options.offset(region_off).len(region_len as usize);
        if read_only {
            let map = unsafe { options.map(device0.cached_file()) }.map_err(Error::Io)?;
            Ok(MetaRegion::from_ro_map(map))
        } else {
            let map = options.map_raw(device0.cached_file()).map_err(Error::Io)?;
            Ok(MetaRegion::from_rw_map(map))
        }
    }

    /// Truncate interrupted appends back to the last committed state:
    /// used counters rewind to the wip offsets and chunks appended past
    /// them return to the free list. Runs automatically when a writer
    /// opens a dirty pool; the writer also invokes it after an aborted
    /// commit, which leaves the pool in the same shape as a crash.
    pub fn rewind_to_wip_offsets(&self) -> Result<()> {
        let meta = self.meta();
        for list in [ListId::Fast, ListId::Slow] {
            let wip = meta.wip_offset(list);
            let members: Vec<u32> = meta.list_iter(list).collect();
            let cut = if wip.is_valid() {
                match members.iter().position(|id| *id == wip.chunk_id()) {
                    Some(position) => {
                        meta.chunk_used(wip.chunk_id())
                            .store(wip.byte_offset() as u32, Ordering::Release);
                        position + 1
                    }
                    None => {
                        warn!(target: "triedb", "wip chunk {} missing from {:?} list", wip.chunk_id(), list);
                        members.len()
                    }
                }
            } else {
                0
            };
            for id in &members[cut..] {
                debug!(target: "triedb", "rewind: returning chunk {id} to the free list");
                let handle = self.activate_chunk(ChunkClass::Sequential, *id)?;
                self.release_chunk(&handle)?;
            }
        }
        meta.dirty().store(0, Ordering::Release);
        Ok(())
    }

    pub fn meta(&self) -> &MetaRegion {
        &self.inner.meta
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    pub fn chunk_capacity(&self) -> u64 {
        self.inner.chunk_capacity
    }

    pub fn device_count(&self) -> usize {
        self.inner.devices.len()
    }

    pub fn seq_chunk_count(&self) -> u32 {
        self.inner.seq_map.len() as u32
    }

    /// Bytes sitting on the free list.
    pub fn free_capacity(&self) -> u64 {
        self.inner.meta.capacity_in_free_list()
    }

    /// Total committed payload bytes across all sequential chunks.
    pub fn bytes_used(&self) -> u64 {
        (0..self.seq_chunk_count())
            .map(|id| self.inner.meta.chunk_used(id).load(Ordering::Acquire) as u64)
            .sum()
    }

    /// The already-active handle for a chunk, if any.
    pub fn chunk(&self, class: ChunkClass, id: u32) -> Result<Option<ChunkHandle>> {
        let table = match class {
            ChunkClass::Conventional => self.inner.active_cnv.lock(),
            ChunkClass::Sequential => self.inner.active_seq.lock(),
        };
        let slot = table.get(id as usize).ok_or(Error::ChunkNotFound)?;
        Ok(slot.upgrade().map(|shared| ChunkHandle { shared }))
    }

    /// Activate a chunk: idempotent and reference counted. Concurrent
    /// activations observe the same handle.
    pub fn activate_chunk(&self, class: ChunkClass, id: u32) -> Result<ChunkHandle> {
        let mut table = match class {
            ChunkClass::Conventional => self.inner.active_cnv.lock(),
            ChunkClass::Sequential => self.inner.active_seq.lock(),
        };
        let slot = table.get_mut(id as usize).ok_or(Error::ChunkNotFound)?;
        if let Some(shared) = slot.upgrade() {
            return Ok(ChunkHandle { shared });
        }
        let (device, base) = match class {
            ChunkClass::Conventional => (id, 0),
            ChunkClass::Sequential => {
                let (device, zone) = self.inner.seq_map[id as usize];
                (device, zone as u64 * self.inner.chunk_capacity)
            }
        };
        let generation = match class {
            ChunkClass::Sequential => self.inner.meta.chunk_info(id).insertion_count(),
            ChunkClass::Conventional => 0,
        };
        let shared = Arc::new(ChunkShared {
            pool: self.inner.clone(),
            class,
            id,
            device,
            base,
            capacity: self.inner.chunk_capacity,
            generation,
        });
        *slot = Arc::downgrade(&shared);
        Ok(ChunkHandle { shared })
    }

    /// Take a chunk off the free list and append it to `list`.
    pub fn allocate_chunk(&self, list: ListId) -> Result<ChunkHandle> {
        debug_assert!(list != ListId::Free);
        if self.inner.read_only {
            return Err(Error::ReadOnly);
        }
        let _lock = self.inner.list_lock.lock();
        let meta = self.meta();
        let id = meta.list_pop_head(ListId::Free).ok_or(Error::NoFreeChunks)?;
        meta.list_append(list, id);
        meta.sub_free_capacity(self.inner.chunk_capacity);
        debug!(target: "triedb", "allocated chunk {id} onto the {list:?} list");
        self.activate_chunk(ChunkClass::Sequential, id)
    }

    /// Return a chunk to the free list, discarding its payload.
    pub fn release_chunk(&self, handle: &ChunkHandle) -> Result<()> {
        if self.inner.read_only {
            return Err(Error::ReadOnly);
        }
        debug_assert_eq!(handle.class(), ChunkClass::Sequential);
        let _lock = self.inner.list_lock.lock();
        let meta = self.meta();
        meta.list_remove(handle.id());
        handle.destroy_contents()?;
        meta.list_append(ListId::Free, handle.id());
        meta.add_free_capacity(self.inner.chunk_capacity);
        debug!(target: "triedb", "released chunk {} back to the free list", handle.id());
        Ok(())
    }

    /// Blocking read of committed bytes at a pool offset, through the
    /// cached descriptor of the owning device.
    pub fn read_at(&self, offset: ChunkOffset, buf: &mut [u8]) -> Result<()> {
        let inner = &self.inner;
        let (device, zone) = *inner
            .seq_map
            .get(offset.chunk_id() as usize)
            .ok_or(Error::ChunkNotFound)?;
        let base = zone as u64 * inner.chunk_capacity;
        if offset.byte_offset() + buf.len() as u64 > inner.chunk_capacity {
            return Err(Error::ChunkNotFound);
        }
        pread_exact(
            inner.devices[device as usize].cached_file(),
            buf,
            base + offset.byte_offset(),
        )
    }
}

impl ChunkHandle {
    pub fn class(&self) -> ChunkClass {
        self.shared.class
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn device_index(&self) -> u32 {
        self.shared.device
    }

    /// Byte offset of this chunk within its device.
    pub fn base(&self) -> u64 {
        self.shared.base
    }

    pub fn capacity(&self) -> u64 {
        self.shared.capacity
    }

    /// Insertion counter at activation; a mismatch against the live
    /// descriptor marks this handle stale.
    pub fn generation(&self) -> u32 {
        self.shared.generation
    }

    pub fn is_stale(&self) -> bool {
        self.shared.class == ChunkClass::Sequential
            && self.shared.pool.meta.chunk_info(self.shared.id).insertion_count()
                != self.shared.generation
    }

    /// Committed payload bytes.
    pub fn used(&self) -> u64 {
        match self.shared.class {
            ChunkClass::Sequential => self
                .shared
                .pool
                .meta
                .chunk_used(self.shared.id)
                .load(Ordering::Acquire) as u64,
            ChunkClass::Conventional => 0,
        }
    }

    /// Reserve `bytes` of append space; returns the in-chunk offset the
    /// write must land at, or `None` when the chunk is full. Single
    /// writer only.
    pub fn try_reserve(&self, bytes: u64) -> Option<u64> {
        debug_assert_eq!(self.shared.class, ChunkClass::Sequential);
        debug_assert!(!self.shared.pool.read_only);
        let used = self.shared.pool.meta.chunk_used(self.shared.id);
        let current = used.load(Ordering::Acquire) as u64;
        if current + bytes > self.shared.capacity {
            return None;
        }
        used.store((current + bytes) as u32, Ordering::Release);
        Some(current)
    }

    /// Rewind the used counter; only the writer's recovery and commit
    /// paths may call this.
    pub fn set_used(&self, bytes: u64) {
        debug_assert!(!self.shared.pool.read_only);
        self.shared
            .pool
            .meta
            .chunk_used(self.shared.id)
            .store(bytes as u32, Ordering::Release);
    }

    /// Descriptor the async executor should read through.
    pub fn read_fd(&self) -> RawFd {
        let device = &self.shared.pool.devices[self.shared.device as usize];
        match self.shared.class {
            ChunkClass::Sequential => device.direct_read_fd(),
            ChunkClass::Conventional => device.cached_fd(),
        }
    }

    /// Descriptor the async executor should write through.
    pub fn write_fd(&self) -> RawFd {
        let device = &self.shared.pool.devices[self.shared.device as usize];
        match self.shared.class {
            ChunkClass::Sequential => device.direct_write_fd(),
            ChunkClass::Conventional => device.cached_fd(),
        }
    }

    /// Absolute device offset of an in-chunk offset.
    pub fn file_offset(&self, offset_in_chunk: u64) -> u64 {
        debug_assert!(offset_in_chunk <= self.shared.capacity);
        self.shared.base + offset_in_chunk
    }

    /// Blocking positional read through the cached descriptor.
    pub fn pread(&self, buf: &mut [u8], offset_in_chunk: u64) -> Result<()> {
        debug_assert!(offset_in_chunk + buf.len() as u64 <= self.shared.capacity);
        let device = &self.shared.pool.devices[self.shared.device as usize];
        pread_exact(device.cached_file(), buf, self.shared.base + offset_in_chunk)
    }

    /// Hole-punch (files) or discard (block devices) the whole chunk and
    /// zero its used counter.
    pub fn destroy_contents(&self) -> Result<()> {
        debug_assert!(!self.shared.pool.read_only);
        let device = &self.shared.pool.devices[self.shared.device as usize];
        device.discard_range(self.shared.base, self.shared.capacity)?;
        if self.shared.class == ChunkClass::Sequential {
            self.shared
                .pool
                .meta
                .chunk_used(self.shared.id)
                .store(0, Ordering::Release);
        }
        Ok(())
    }
}

impl ChunkHandle {
    /// Pool offset for an in-chunk byte offset.
    pub fn offset(&self, offset_in_chunk: u64) -> ChunkOffset {
        ChunkOffset::new(self.shared.id, offset_in_chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DISK_PAGE_SIZE;
    use std::fs::File;
    use tempdir::TempDir;

    const CAP: u64 = 1 << 20; // 1 MiB chunks keep the files small

    fn source(dir: &TempDir, name: &str, bytes: u64) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let file = File::create(&path).unwrap();
        file.set_len(bytes).unwrap();
        path
    }

    fn options() -> PoolOptions {
        PoolOptions {
            chunk_capacity: CAP,
            history_length: 64,
            ..Default::default()
        }
    }

    fn small_pool(dir: &TempDir) -> StoragePool {
        let path = source(dir, "a", 32 * 1024 * 1024);
        StoragePool::open(&[path], Mode::Truncate, options()).unwrap()
    }

    #[test]
    fn format_and_reopen() {
        let dir = TempDir::new("triedb-pool").unwrap();
        let path = source(&dir, "a", 32 * 1024 * 1024);
        let seq = {
            let pool = StoragePool::open(&[&path], Mode::Truncate, options()).unwrap();
            assert!(pool.seq_chunk_count() > 0);
            assert_eq!(pool.free_capacity(), pool.seq_chunk_count() as u64 * CAP);
            pool.seq_chunk_count()
        };
        let pool = StoragePool::open(&[&path], Mode::OpenExisting, options()).unwrap();
        assert_eq!(pool.seq_chunk_count(), seq);
    }

    #[test]
    fn open_uninitialised_fails() {
        let dir = TempDir::new("triedb-pool").unwrap();
        let path = source(&dir, "a", 32 * 1024 * 1024);
        match StoragePool::open(&[&path], Mode::OpenExisting, options()) {
            Err(Error::MetadataMismatch(_)) => {}
            other => panic!("expected metadata mismatch, got {other:?}"),
        }
    }

    #[test]
    fn config_change_is_rejected() {
        let dir = TempDir::new("triedb-pool").unwrap();
        let path = source(&dir, "a", 32 * 1024 * 1024);
        drop(StoragePool::open(&[&path], Mode::Truncate, options()).unwrap());
        let mut opts = options();
        opts.interleave_chunks = true;
        match StoragePool::open(&[&path], Mode::OpenExisting, opts) {
            Err(Error::MetadataMismatch(_)) => {}
            other => panic!("expected metadata mismatch, got {other:?}"),
        }
    }

    #[test]
    fn allocate_release_cycle() {
        let dir = TempDir::new("triedb-pool").unwrap();
        let pool = small_pool(&dir);
        let before = pool.free_capacity();
        let chunk = pool.allocate_chunk(ListId::Fast).unwrap();
        assert_eq!(pool.free_capacity(), before - CAP);
        assert_eq!(pool.meta().chunk_info(chunk.id()).list(), ListId::Fast);

        assert_eq!(chunk.try_reserve(4096), Some(0));
        assert_eq!(chunk.try_reserve(4096), Some(4096));
        assert_eq!(chunk.used(), 8192);
        assert_eq!(chunk.try_reserve(CAP), None);

        pool.release_chunk(&chunk).unwrap();
        assert_eq!(pool.free_capacity(), before);
        assert_eq!(chunk.used(), 0);
        assert!(chunk.is_stale());
    }

    #[test]
    fn activation_is_idempotent() {
        let dir = TempDir::new("triedb-pool").unwrap();
        let pool = small_pool(&dir);
        let a = pool.activate_chunk(ChunkClass::Sequential, 0).unwrap();
        let b = pool.activate_chunk(ChunkClass::Sequential, 0).unwrap();
        assert!(Arc::ptr_eq(&a.shared, &b.shared));
        assert!(pool.chunk(ChunkClass::Sequential, 0).unwrap().is_some());
        assert!(pool
            .chunk(ChunkClass::Sequential, pool.seq_chunk_count() - 1)
            .unwrap()
            .is_none());
        assert!(matches!(
            pool.chunk(ChunkClass::Sequential, pool.seq_chunk_count()),
            Err(Error::ChunkNotFound)
        ));
    }

    #[test]
    fn read_back_written_bytes() {
        let dir = TempDir::new("triedb-pool").unwrap();
        let pool = small_pool(&dir);
        let chunk = pool.allocate_chunk(ListId::Fast).unwrap();
        let at = chunk.try_reserve(DISK_PAGE_SIZE).unwrap();
        let payload = vec![0x5au8; DISK_PAGE_SIZE as usize];
        crate::device::pwrite_all(
            pool.inner.devices[chunk.device_index() as usize].cached_file(),
            &payload,
            chunk.file_offset(at),
        )
        .unwrap();

        let mut back = vec![0u8; payload.len()];
        chunk.pread(&mut back, at).unwrap();
        assert_eq!(back, payload);
        let mut via_pool = vec![0u8; payload.len()];
        pool.read_at(chunk.offset(at), &mut via_pool).unwrap();
        assert_eq!(via_pool, payload);
    }

    #[test]
    fn interleave_spreads_proportionally() {
        let map = StoragePool::build_seq_map(&[20, 10, 5], true);
        assert_eq!(map.len(), 35);
        // first handful should not be all from one device
        let first: Vec<u32> = map.iter().take(7).map(|(d, _)| *d).collect();
        assert!(first.contains(&0) && first.contains(&1) && first.contains(&2));
        // every zone appears exactly once
        for (device, count) in [20u32, 10, 5].iter().enumerate() {
            let zones: Vec<u32> = map
                .iter()
                .filter(|(d, _)| *d == device as u32)
                .map(|(_, z)| *z)
                .collect();
            assert_eq!(zones.len(), *count as usize);
        }
    }

    #[test]
    fn multi_device_pool() {
        let dir = TempDir::new("triedb-pool").unwrap();
        let a = source(&dir, "a", 32 * 1024 * 1024);
        let b = source(&dir, "b", 24 * 1024 * 1024);
        let pool = StoragePool::open(&[a, b], Mode::Truncate, options()).unwrap();
        assert_eq!(pool.device_count(), 2);
        // device 1 reserves only its footer page, device 0 the reserve too
        let expected = (32 * 1024 * 1024 - DISK_PAGE_SIZE - METADATA_RESERVE) / CAP - 1
            + (24 * 1024 * 1024 - DISK_PAGE_SIZE) / CAP - 1;
        assert_eq!(pool.seq_chunk_count() as u64, expected);
    }

    #[test]
    fn rewind_after_dirty_shutdown() {
        let dir = TempDir::new("triedb-pool").unwrap();
        let path = source(&dir, "a", 32 * 1024 * 1024);
        let (dirty_chunk, extra_chunk) = {
            let pool = StoragePool::open(&[&path], Mode::Truncate, options()).unwrap();
            let chunk = pool.allocate_chunk(ListId::Fast).unwrap();
            chunk.try_reserve(8192).unwrap();
            // a clean commit up to 8192 bytes into this chunk
            pool.meta()
                .advance_wip_offsets(chunk.offset(8192), crate::INVALID_OFFSET);
            // then a crash mid-append: more bytes used, another chunk taken,
            // dirty byte left high
            chunk.try_reserve(4096).unwrap();
            let extra = pool.allocate_chunk(ListId::Fast).unwrap();
            extra.try_reserve(4096).unwrap();
            std::mem::forget(pool.meta().hold_dirty());
            (chunk.id(), extra.id())
        };
        let pool = StoragePool::open(&[&path], Mode::OpenExisting, options()).unwrap();
        assert!(!pool.meta().is_dirty());
        assert_eq!(
            pool.meta().chunk_used(dirty_chunk).load(Ordering::Acquire),
            8192
        );
        assert_eq!(pool.meta().chunk_used(extra_chunk).load(Ordering::Acquire), 0);
        assert_eq!(pool.meta().chunk_info(extra_chunk).list(), ListId::Free);
        assert_eq!(
            pool.meta().list_iter(ListId::Fast).collect::<Vec<_>>(),
            vec![dirty_chunk]
        );
    }
}
