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

//! The memory-mapped pool metadata region.
//!
//! The region lives at the tail of device 0, immediately below the device
//! footer, and is shared between the single writer and any number of
//! read-only openers. All fields are accessed through 8-byte (or narrower)
//! atomics at fixed offsets; multi-field mutations raise the dirty byte
//! first and lower it once the mutation is complete, so a reader that
//! observes the dirty byte high retries rather than trusting a torn state.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use memmap2::{Mmap, MmapMut, MmapRaw};

use crate::{
    offset::{ChunkOffset, INVALID_CHUNK_ID, INVALID_OFFSET},
    round_up_page,
};

/// Layout version tag; exact match required.
pub const META_MAGIC: [u8; 8] = *b"OETRIE01";

/// Capacity of the root-offset ring. Power of two.
pub const ROOT_RING_SIZE: u64 = 65_536;

/// Sentinel for "no version stored".
pub const INVALID_VERSION: u64 = u64::MAX;

const OFF_MAGIC: usize = 0x00;
const OFF_CHUNK_INFO_COUNT: usize = 0x08;
const OFF_FLAGS: usize = 0x0c;
const OFF_DIRTY: usize = 0x10;
const OFF_CAP_FREE: usize = 0x18;
const OFF_HISTORY_LEN: usize = 0x20;
const OFF_LATEST_FINALIZED: usize = 0x28;
const OFF_LATEST_VERIFIED: usize = 0x30;
const OFF_LATEST_VOTED: usize = 0x38;
const OFF_AUTO_EXPIRE: usize = 0x40;
const OFF_VOTED_BLOCK_ID: usize = 0x48; // 32 bytes
const OFF_WIP_FAST: usize = 0x68;
const OFF_WIP_SLOW: usize = 0x70;
const OFF_FREE_LIST: usize = 0x78;
const OFF_FAST_LIST: usize = 0x80;
const OFF_SLOW_LIST: usize = 0x88;
const OFF_VERSION_LOWER: usize = 0x90;
const OFF_NEXT_VERSION: usize = 0x98;
const OFF_RING: usize = 0x1000;
const OFF_CHUNK_INFO: usize = OFF_RING + (ROOT_RING_SIZE as usize) * 8;

const FLAG_USING_CHUNKS_FOR_ROOT_OFFSETS: u32 = 1;

/// High 32 bits all set marks the compressed ring representation.
const RING_CHUNKED_SENTINEL: u64 = 0xffff_ffff_0000_0000;

fn list_offset(list: ListId) -> usize {
    match list {
        ListId::Free => OFF_FREE_LIST,
        ListId::Fast => OFF_FAST_LIST,
        ListId::Slow => OFF_SLOW_LIST,
    }
}

/// The three intrusive lists a sequential chunk can belong to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ListId {
    Free,
    Fast,
    Slow,
}

/// One 8-byte chunk descriptor. Bit layout:
/// prev id (20) | next id (20) | in_fast (1) | in_slow (1) |
/// insertion counter (20) | unused (2).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo(u64);

impl ChunkInfo {
    const PREV_SHIFT: u32 = 0;
    const NEXT_SHIFT: u32 = 20;
    const FAST_BIT: u64 = 1 << 40;
    const SLOW_BIT: u64 = 1 << 41;
    const COUNT_SHIFT: u32 = 42;
    const ID_MASK: u64 = (1 << 20) - 1;

    pub fn detached() -> ChunkInfo {
        ChunkInfo(0)
            .with_prev(INVALID_CHUNK_ID)
            .with_next(INVALID_CHUNK_ID)
    }

    pub fn from_raw(raw: u64) -> ChunkInfo {
        ChunkInfo(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn prev(self) -> u32 {
        ((self.0 >> Self::PREV_SHIFT) & Self::ID_MASK) as u32
    }

    pub fn next(self) -> u32 {
        ((self.0 >> Self::NEXT_SHIFT) & Self::ID_MASK) as u32
    }

    pub fn in_fast(self) -> bool {
        self.0 & Self::FAST_BIT != 0
    }

    pub fn in_slow(self) -> bool {
        self.0 & Self::SLOW_BIT != 0
    }

    pub fn list(self) -> ListId {
        if self.in_fast() {
            ListId::Fast
        } else if self.in_slow() {
            ListId::Slow
        } else {
            ListId::Free
        }
    }

    /// Monotonic per-chunk reinsertion counter, 20 bits; lets a stale
    /// handle be detected without dereferencing anything.
    pub fn insertion_count(self) -> u32 {
        ((self.0 >> Self::COUNT_SHIFT) & Self::ID_MASK) as u32
    }

    pub fn with_prev(self, id: u32) -> ChunkInfo {
        ChunkInfo(
            (self.0 & !(Self::ID_MASK << Self::PREV_SHIFT))
                | (((id as u64) & Self::ID_MASK) << Self::PREV_SHIFT),
        )
    }

    pub fn with_next(self, id: u32) -> ChunkInfo {
        ChunkInfo(
            (self.0 & !(Self::ID_MASK << Self::NEXT_SHIFT))
                | (((id as u64) & Self::ID_MASK) << Self::NEXT_SHIFT),
        )
    }

    pub fn with_list(self, list: ListId) -> ChunkInfo {
        let cleared = self.0 & !(Self::FAST_BIT | Self::SLOW_BIT);
        ChunkInfo(match list {
            ListId::Fast => cleared | Self::FAST_BIT,
            ListId::Slow => cleared | Self::SLOW_BIT,
            ListId::Free => cleared,
        })
    }

    pub fn with_insertion_count(self, count: u32) -> ChunkInfo {
        ChunkInfo(
            (self.0 & !(Self::ID_MASK << Self::COUNT_SHIFT))
                | (((count as u64) & Self::ID_MASK) << Self::COUNT_SHIFT),
        )
    }
}

impl std::fmt::Debug for ChunkInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ChunkInfo")
            .field("prev", &self.prev())
            .field("next", &self.next())
            .field("list", &self.list())
            .field("insertions", &self.insertion_count())
            .finish()
    }
}

/// What a ring slot decodes to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RingSlot {
    /// Flat representation: the root node's location.
    Offset(ChunkOffset),
    /// Compressed forward-compatibility representation: the root offset
    /// lives inside the given conventional chunk. No current writer emits
    /// this shape; readers must not misparse it as a flat offset.
    Chunked(u32),
}

enum Mapping {
    Rw(MmapRaw),
    Ro(Mmap),
    Anon(MmapMut),
}

/// A view over the mapped metadata region.
pub struct MetaRegion {
    ptr: *mut u8,
    len: usize,
    writable: bool,
    dirty_depth: AtomicU32,
    _map: Mapping,
}

// The region is a shared-memory structure; every access goes through
// atomics at fixed offsets.
unsafe impl Send for MetaRegion {}
unsafe impl Sync for MetaRegion {}

/// RAII holder for the dirty byte. Re-entrant: only the outermost guard
/// actually raises and lowers the byte.
pub struct DirtyGuard<'a> {
    meta: &'a MetaRegion,
}

impl<'a> Drop for DirtyGuard<'a> {
    fn drop(&mut self) {
        if self.meta.dirty_depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.meta.dirty().store(0, Ordering::Release);
        }
    }
}

impl MetaRegion {
    /// Region length in bytes for a pool of `count` sequential chunks,
    /// rounded up to a whole page.
    pub fn region_len(count: u32) -> u64 {
        let used = OFF_CHUNK_INFO + (count as usize) * 8;
        round_up_page(used as u64 + (count as u64) * 4)
    }

    pub fn from_rw_map(map: MmapRaw) -> MetaRegion {
        let (ptr, len) = (map.as_mut_ptr(), map.len());
        MetaRegion {
            ptr,
            len,
            writable: true,
            dirty_depth: AtomicU32::new(0),
            _map: Mapping::Rw(map),
        }
    }

    pub fn from_ro_map(map: Mmap) -> MetaRegion {
        let (ptr, len) = (map.as_ptr() as *mut u8, map.len());
        MetaRegion {
            ptr,
            len,
            writable: false,
            dirty_depth: AtomicU32::new(0),
            _map: Mapping::Ro(map),
        }
    }

    /// Heap-backed region used by the in-memory pool mode and the tests.
    pub fn anonymous(count: u32) -> MetaRegion {
        let len = Self::region_len(count) as usize;
        let map = MmapMut::map_anon(len).expect("anonymous map never fails on Linux");
        let ptr = map.as_ptr() as *mut u8;
        MetaRegion {
            ptr,
            len,
            writable: true,
            dirty_depth: AtomicU32::new(0),
            _map: Mapping::Anon(map),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    fn at(&self, off: usize, bytes: usize) -> *mut u8 {
        debug_assert!(off + bytes <= self.len, "metadata access out of bounds");
        // Offsets are compile-time constants or validated ids; the map is
        // live for the lifetime of self.
        unsafe { self.ptr.add(off) }
    }

    fn au8(&self, off: usize) -> &AtomicU8 {
        unsafe { &*(self.at(off, 1) as *const AtomicU8) }
    }

    fn au32(&self, off: usize) -> &AtomicU32 {
        debug_assert_eq!(off % 4, 0);
        unsafe { &*(self.at(off, 4) as *const AtomicU32) }
    }

    fn au64(&self, off: usize) -> &AtomicU64 {
        debug_assert_eq!(off % 8, 0);
        unsafe { &*(self.at(off, 8) as *const AtomicU64) }
    }

    // --- magic and geometry ---

    pub fn magic(&self) -> [u8; 8] {
        self.au64(OFF_MAGIC).load(Ordering::Acquire).to_le_bytes()
    }

    pub fn chunk_info_count(&self) -> u32 {
        self.au32(OFF_CHUNK_INFO_COUNT).load(Ordering::Acquire)
    }

    pub fn using_chunks_for_root_offsets(&self) -> bool {
        self.au32(OFF_FLAGS).load(Ordering::Acquire) & FLAG_USING_CHUNKS_FOR_ROOT_OFFSETS != 0
    }

    // --- dirty byte ---

    pub fn dirty(&self) -> &AtomicU8 {
        self.au8(OFF_DIRTY)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty().load(Ordering::Acquire) != 0
    }

    /// Raise the dirty byte for the duration of a multi-field mutation.
    pub fn hold_dirty(&self) -> DirtyGuard {
        debug_assert!(self.writable);
        if self.dirty_depth.fetch_add(1, Ordering::Relaxed) == 0 {
            self.dirty().store(1, Ordering::Release);
        }
        DirtyGuard { meta: self }
    }

    /// Run a multi-field read, retrying while the writer holds the dirty
    /// byte high around it.
    pub fn read_consistent<T>(&self, f: impl Fn(&MetaRegion) -> T) -> T {
        loop {
            while self.is_dirty() {
                std::hint::spin_loop();
            }
            let value = f(self);
            if !self.is_dirty() {
                return value;
            }
        }
    }

    // --- plain words ---

    pub fn capacity_in_free_list(&self) -> u64 {
        self.au64(OFF_CAP_FREE).load(Ordering::Acquire)
    }

    pub fn history_length(&self) -> u64 {
        self.au64(OFF_HISTORY_LEN).load(Ordering::Acquire)
    }

    pub fn set_history_length(&self, value: u64) {
        debug_assert!(self.writable);
        self.au64(OFF_HISTORY_LEN).store(value, Ordering::Release);
    }

    pub fn latest_finalized(&self) -> u64 {
        self.au64(OFF_LATEST_FINALIZED).load(Ordering::Acquire)
    }

    pub fn set_latest_finalized(&self, value: u64) {
        debug_assert!(self.writable);
        self.au64(OFF_LATEST_FINALIZED).store(value, Ordering::Release);
    }

    pub fn latest_verified(&self) -> u64 {
        self.au64(OFF_LATEST_VERIFIED).load(Ordering::Acquire)
    }

    pub fn set_latest_verified(&self, value: u64) {
        debug_assert!(self.writable);
        self.au64(OFF_LATEST_VERIFIED).store(value, Ordering::Release);
    }

    pub fn latest_voted(&self) -> u64 {
        self.au64(OFF_LATEST_VOTED).load(Ordering::Acquire)
    }

    pub fn auto_expire_version(&self) -> u64 {
        self.au64(OFF_AUTO_EXPIRE).load(Ordering::Acquire)
    }

    pub fn set_auto_expire_version(&self, value: u64) {
        debug_assert!(self.writable);
        self.au64(OFF_AUTO_EXPIRE).store(value, Ordering::Release);
    }

    pub fn voted_block_id(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        for word in 0..4 {
            let v = self.au64(OFF_VOTED_BLOCK_ID + word * 8).load(Ordering::Acquire);
            out[word * 8..word * 8 + 8].copy_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Store the voted version and block id together. Multi-field, so the
    /// dirty byte is held across both stores.
    pub fn set_voted(&self, version: u64, block_id: &[u8; 32]) {
        debug_assert!(self.writable);
        let _guard = self.hold_dirty();
        self.au64(OFF_LATEST_VOTED).store(version, Ordering::Release);
        for word in 0..4 {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&block_id[word * 8..word * 8 + 8]);
            self.au64(OFF_VOTED_BLOCK_ID + word * 8)
                .store(u64::from_le_bytes(bytes), Ordering::Release);
        }
    }

    // --- wip offsets ---

    pub fn wip_offset(&self, list: ListId) -> ChunkOffset {
        let off = match list {
            ListId::Fast => OFF_WIP_FAST,
            ListId::Slow => OFF_WIP_SLOW,
            ListId::Free => unreachable!("the free list has no write head"),
        };
        ChunkOffset::from_raw(self.au64(off).load(Ordering::Acquire))
    }

    /// Advance both in-progress tails. Called once per committed version.
    pub fn advance_wip_offsets(&self, fast: ChunkOffset, slow: ChunkOffset) {
        debug_assert!(self.writable);
        let _guard = self.hold_dirty();
        self.au64(OFF_WIP_FAST).store(fast.raw(), Ordering::Release);
        self.au64(OFF_WIP_SLOW).store(slow.raw(), Ordering::Release);
    }

    // --- root-offset ring ---

    pub fn version_lower_bound(&self) -> u64 {
        self.au64(OFF_VERSION_LOWER).load(Ordering::Acquire)
    }

    pub fn next_version(&self) -> u64 {
        self.au64(OFF_NEXT_VERSION).load(Ordering::Acquire)
    }

    /// Versions currently resolvable, as a half-open range.
    pub fn version_range(&self) -> (u64, u64) {
        self.read_consistent(|meta| (meta.version_lower_bound(), meta.next_version()))
    }

    /// Whether `version` is currently within the retained history.
    pub fn version_in_range(&self, version: u64) -> bool {
        let (lower, next) = self.version_range();
        next != INVALID_VERSION && version >= lower && version < next
    }

    fn ring_word(&self, version: u64) -> &AtomicU64 {
        let slot = (version & (ROOT_RING_SIZE - 1)) as usize;
        self.au64(OFF_RING + slot * 8)
    }

    /// Decode the slot for `version` without bounds checking. Both ring
    /// representations are accepted; only the flat one is ever written.
    pub fn ring_slot(&self, version: u64) -> RingSlot {
        let raw = self.ring_word(version).load(Ordering::Acquire);
        if raw != u64::MAX && raw & RING_CHUNKED_SENTINEL == RING_CHUNKED_SENTINEL {
            RingSlot::Chunked((raw & 0xf_ffff) as u32)
        } else {
            RingSlot::Offset(ChunkOffset::from_raw(raw))
        }
    }

    /// The root offset recorded for `version`, if that version is still
    /// within the ring bounds and stored in the flat representation.
    pub fn root_offset(&self, version: u64) -> Option<ChunkOffset> {
        let (lower, next) = self.version_range();
        if next == INVALID_VERSION || version < lower || version >= next {
            return None;
        }
        match self.ring_slot(version) {
            RingSlot::Offset(off) if off.is_valid() => Some(off),
            _ => None,
        }
    }

    /// Root offset of the newest committed version, if any.
    pub fn latest_root_offset(&self) -> Option<(u64, ChunkOffset)> {
        let (lower, next) = self.version_range();
        if next == INVALID_VERSION || next == lower {
            return None;
        }
        self.root_offset(next - 1).map(|off| (next - 1, off))
    }

    /// Publish `offset` as the root of `version`. `version` must be the
    /// next version, or the latest version when replacing a proposal
    /// round. The lower bound advances when the ring or the configured
    /// history would otherwise be exceeded.
    pub fn push_root(&self, version: u64, offset: ChunkOffset) {
        debug_assert!(self.writable);
        let _guard = self.hold_dirty();
        let lower = self.version_lower_bound();
        let next = self.next_version();
        let empty = next == INVALID_VERSION || next == lower;
        if empty {
            self.au64(OFF_VERSION_LOWER).store(version, Ordering::Release);
        } else if version + 1 == next {
            // replacing the latest round
            self.ring_word(version).store(offset.raw(), Ordering::Release);
            return;
        } else {
            debug_assert_eq!(version, next, "versions advance one at a time");
        }
        self.ring_word(version).store(offset.raw(), Ordering::Release);
        self.au64(OFF_NEXT_VERSION).store(version + 1, Ordering::Release);

        let lower = self.version_lower_bound();
        let history = self.history_length().min(ROOT_RING_SIZE);
        let retained = version + 1 - lower;
        if history > 0 && retained > history {
            let floor = version + 1 - history;
            self.au64(OFF_VERSION_LOWER).store(floor, Ordering::Release);
            // oldest version the writer may still serve
            self.au64(OFF_AUTO_EXPIRE).store(floor, Ordering::Release);
        }
    }

    /// Drop every version below `floor` from the ring.
    pub fn raise_version_lower_bound(&self, floor: u64) {
        debug_assert!(self.writable);
        let _guard = self.hold_dirty();
        if floor > self.version_lower_bound() {
            self.au64(OFF_VERSION_LOWER).store(floor, Ordering::Release);
            self.au64(OFF_AUTO_EXPIRE).store(floor, Ordering::Release);
        }
    }

    // --- chunk descriptors ---

    fn info_word(&self, id: u32) -> &AtomicU64 {
        debug_assert!(id < self.chunk_info_count());
        self.au64(OFF_CHUNK_INFO + (id as usize) * 8)
    }

    pub fn chunk_info(&self, id: u32) -> ChunkInfo {
        ChunkInfo::from_raw(self.info_word(id).load(Ordering::Acquire))
    }

    fn store_chunk_info(&self, id: u32, info: ChunkInfo) {
        debug_assert!(self.writable);
        self.info_word(id).store(info.raw(), Ordering::Release);
    }

    fn used_offset(&self) -> usize {
        OFF_CHUNK_INFO + (self.chunk_info_count() as usize) * 8
    }

    /// Persistent used-byte counter of a sequential chunk.
    pub fn chunk_used(&self, id: u32) -> &AtomicU32 {
        debug_assert!(id < self.chunk_info_count());
        self.au32(self.used_offset() + (id as usize) * 4)
    }

    // --- intrusive lists ---

    fn list_word(&self, list: ListId) -> &AtomicU64 {
        self.au64(list_offset(list))
    }

    fn load_heads(&self, list: ListId) -> (u32, u32) {
        let raw = self.list_word(list).load(Ordering::Acquire);
        (raw as u32, (raw >> 32) as u32)
    }

    fn store_heads(&self, list: ListId, head: u32, tail: u32) {
        debug_assert!(self.writable);
        self.list_word(list)
            .store((head as u64) | ((tail as u64) << 32), Ordering::Release);
    }

    pub fn list_head(&self, list: ListId) -> Option<u32> {
        let (head, _) = self.load_heads(list);
        (head != u32::MAX).then_some(head)
    }

    pub fn list_tail(&self, list: ListId) -> Option<u32> {
        let (_, tail) = self.load_heads(list);
        (tail != u32::MAX).then_some(tail)
    }

    /// Append `id` to the tail of `list`. The chunk must be detached.
    pub fn list_append(&self, list: ListId, id: u32) {
        debug_assert!(self.writable);
        let _guard = self.hold_dirty();
        let generation = self.chunk_info(id).insertion_count().wrapping_add(1) & 0xf_ffff;
        let (head, tail) = self.load_heads(list);
        let mut info = ChunkInfo::detached()
            .with_list(list)
            .with_insertion_count(generation);
        if tail == u32::MAX {
            debug_assert_eq!(head, u32::MAX);
            self.store_heads(list, id, id);
        } else {
            let old_tail = self.chunk_info(tail);
            debug_assert_eq!(old_tail.next(), INVALID_CHUNK_ID);
            self.store_chunk_info(tail, old_tail.with_next(id));
            info = info.with_prev(tail);
            self.store_heads(list, head, id);
        }
        self.store_chunk_info(id, info);
    }

    /// Unlink `id` from whichever list it is on. Head, tail and mid-list
    /// removals are all permitted; the insertion counter identifies stale
    /// handles regardless of position.
    pub fn list_remove(&self, id: u32) {
        debug_assert!(self.writable);
        let _guard = self.hold_dirty();
        let info = self.chunk_info(id);
        let list = info.list();
        let (mut head, mut tail) = self.load_heads(list);
        if info.prev() == INVALID_CHUNK_ID {
            debug_assert_eq!(head, id);
            head = info.next();
        } else {
            let prev = self.chunk_info(info.prev());
            self.store_chunk_info(info.prev(), prev.with_next(info.next()));
        }
        if info.next() == INVALID_CHUNK_ID {
            debug_assert_eq!(tail, id);
            tail = info.prev();
        } else {
            let next = self.chunk_info(info.next());
            self.store_chunk_info(info.next(), next.with_prev(info.prev()));
        }
        let head = if head == INVALID_CHUNK_ID { u32::MAX } else { head };
        let tail = if tail == INVALID_CHUNK_ID { u32::MAX } else { tail };
        self.store_heads(list, head, tail);
        self.store_chunk_info(
            id,
            ChunkInfo::detached().with_insertion_count(info.insertion_count()),
        );
    }

    /// Detach and return the head of `list`, if any.
    pub fn list_pop_head(&self, list: ListId) -> Option<u32> {
        let head = self.list_head(list)?;
        self.list_remove(head);
        Some(head)
    }

    /// Walk a list from head to tail. Writer-side only; readers must not
    /// assume the chain is stable.
    pub fn list_iter(&self, list: ListId) -> ListIter {
        ListIter {
            meta: self,
            next: self.list_head(list).unwrap_or(u32::MAX),
        }
    }

    pub fn add_free_capacity(&self, bytes: u64) {
        debug_assert!(self.writable);
        let _guard = self.hold_dirty();
        let v = self.capacity_in_free_list();
        self.au64(OFF_CAP_FREE).store(v + bytes, Ordering::Release);
    }

    pub fn sub_free_capacity(&self, bytes: u64) {
        debug_assert!(self.writable);
        let _guard = self.hold_dirty();
        let v = self.capacity_in_free_list();
        debug_assert!(v >= bytes);
        self.au64(OFF_CAP_FREE).store(v - bytes, Ordering::Release);
    }

    /// Format a fresh region: magic, geometry, empty ring, empty lists,
    /// cleared counters and watermarks.
    pub fn format(&self, chunk_count: u32, history_length: u64) {
        debug_assert!(self.writable);
        let _guard = self.hold_dirty();
        self.au64(OFF_MAGIC)
            .store(u64::from_le_bytes(META_MAGIC), Ordering::Release);
        self.au32(OFF_CHUNK_INFO_COUNT).store(chunk_count, Ordering::Release);
        self.au32(OFF_FLAGS).store(0, Ordering::Release);
        self.au64(OFF_CAP_FREE).store(0, Ordering::Release);
        self.au64(OFF_HISTORY_LEN).store(history_length, Ordering::Release);
        self.au64(OFF_LATEST_FINALIZED).store(INVALID_VERSION, Ordering::Release);
        self.au64(OFF_LATEST_VERIFIED).store(INVALID_VERSION, Ordering::Release);
        self.au64(OFF_LATEST_VOTED).store(INVALID_VERSION, Ordering::Release);
        self.au64(OFF_AUTO_EXPIRE).store(INVALID_VERSION, Ordering::Release);
        for word in 0..4 {
            self.au64(OFF_VOTED_BLOCK_ID + word * 8).store(0, Ordering::Release);
        }
        self.au64(OFF_WIP_FAST).store(INVALID_OFFSET.raw(), Ordering::Release);
        self.au64(OFF_WIP_SLOW).store(INVALID_OFFSET.raw(), Ordering::Release);
        for list in [ListId::Free, ListId::Fast, ListId::Slow] {
            self.store_heads(list, u32::MAX, u32::MAX);
        }
        self.au64(OFF_VERSION_LOWER).store(0, Ordering::Release);
        self.au64(OFF_NEXT_VERSION).store(INVALID_VERSION, Ordering::Release);
        for version in 0..ROOT_RING_SIZE {
            self.ring_word(version).store(INVALID_OFFSET.raw(), Ordering::Release);
        }
        for id in 0..chunk_count {
            self.store_chunk_info(id, ChunkInfo::detached());
            self.chunk_used(id).store(0, Ordering::Release);
        }
    }

    /// Validate magic and geometry of an existing region.
    pub fn verify(&self, expected_chunks: u32) -> Result<(), String> {
        if self.magic() != META_MAGIC {
            return Err(format!(
                "metadata magic {:02x?} does not match layout {:02x?}",
                self.magic(),
                META_MAGIC
            ));
        }
        if self.chunk_info_count() != expected_chunks {
            return Err(format!(
                "metadata records {} chunks, pool layout has {}",
                self.chunk_info_count(),
                expected_chunks
            ));
        }
        Ok(())
    }
}

/// Iterator over an intrusive list.
pub struct ListIter<'a> {
    meta: &'a MetaRegion,
    next: u32,
}

impl<'a> Iterator for ListIter<'a> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.next == u32::MAX || self.next == INVALID_CHUNK_ID {
            return None;
        }
        let id = self.next;
        let next = self.meta.chunk_info(id).next();
        self.next = if next == INVALID_CHUNK_ID { u32::MAX } else { next };
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> MetaRegion {
        let meta = MetaRegion::anonymous(16);
        meta.format(16, 256);
        meta
    }

    #[test]
    fn chunk_info_bit_packing() {
        let info = ChunkInfo::detached()
            .with_prev(0x1_2345)
            .with_next(0xa_bcde)
            .with_list(ListId::Slow)
            .with_insertion_count(0xf_0f0f);
        assert_eq!(info.prev(), 0x1_2345);
        assert_eq!(info.next(), 0xa_bcde);
        assert!(info.in_slow() && !info.in_fast());
        assert_eq!(info.insertion_count(), 0xf_0f0f);
        assert_eq!(ChunkInfo::from_raw(info.raw()), info);
    }

    #[test]
    fn format_leaves_region_clean() {
        let meta = region();
        assert_eq!(meta.magic(), META_MAGIC);
        assert!(!meta.is_dirty());
        assert_eq!(meta.chunk_info_count(), 16);
        assert_eq!(meta.next_version(), INVALID_VERSION);
        assert_eq!(meta.latest_root_offset(), None);
        assert_eq!(meta.root_offset(0), None);
        assert_eq!(meta.list_head(ListId::Free), None);
    }

    #[test]
    fn list_append_remove() {
        let meta = region();
        for id in 0..4 {
            meta.list_append(ListId::Free, id);
        }
        assert_eq!(meta.list_iter(ListId::Free).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(meta.list_head(ListId::Free), Some(0));
        assert_eq!(meta.list_tail(ListId::Free), Some(3));

        // mid-list removal
        meta.list_remove(2);
        assert_eq!(meta.list_iter(ListId::Free).collect::<Vec<_>>(), vec![0, 1, 3]);
        // head removal
        meta.list_remove(0);
        assert_eq!(meta.list_iter(ListId::Free).collect::<Vec<_>>(), vec![1, 3]);
        // tail removal
        meta.list_remove(3);
        assert_eq!(meta.list_iter(ListId::Free).collect::<Vec<_>>(), vec![1]);
        meta.list_remove(1);
        assert_eq!(meta.list_head(ListId::Free), None);
        assert_eq!(meta.list_tail(ListId::Free), None);
        assert!(!meta.is_dirty());
    }

    #[test]
    fn insertion_count_survives_moves() {
        let meta = region();
        meta.list_append(ListId::Free, 7);
        let first = meta.chunk_info(7).insertion_count();
        meta.list_remove(7);
        meta.list_append(ListId::Fast, 7);
        let second = meta.chunk_info(7).insertion_count();
        assert_eq!(second, first + 1);
        assert_eq!(meta.chunk_info(7).list(), ListId::Fast);
    }

    #[test]
    fn ring_push_and_bounds() {
        let meta = region();
        meta.push_root(10, ChunkOffset::new(1, 4096));
        meta.push_root(11, ChunkOffset::new(1, 8192));
        assert_eq!(meta.version_range(), (10, 12));
        assert_eq!(meta.root_offset(10), Some(ChunkOffset::new(1, 4096)));
        assert_eq!(meta.root_offset(11), Some(ChunkOffset::new(1, 8192)));
        assert_eq!(meta.root_offset(9), None);
        assert_eq!(meta.root_offset(12), None);
        assert_eq!(
            meta.latest_root_offset(),
            Some((11, ChunkOffset::new(1, 8192)))
        );
    }

    #[test]
    fn ring_replaces_latest_round() {
        let meta = region();
        meta.push_root(5, ChunkOffset::new(1, 0));
        meta.push_root(5, ChunkOffset::new(2, 0));
        assert_eq!(meta.version_range(), (5, 6));
        assert_eq!(meta.root_offset(5), Some(ChunkOffset::new(2, 0)));
    }

    #[test]
    fn ring_respects_history_length() {
        let meta = MetaRegion::anonymous(4);
        meta.format(4, 4);
        for version in 0..8 {
            meta.push_root(version, ChunkOffset::new(0, version * 4096));
        }
        assert_eq!(meta.version_range(), (4, 8));
        assert_eq!(meta.root_offset(3), None);
        assert_eq!(meta.root_offset(4), Some(ChunkOffset::new(0, 4 * 4096)));
    }

    #[test]
    fn chunked_ring_slot_is_not_misparsed() {
        let meta = region();
        meta.push_root(0, ChunkOffset::new(1, 0));
        meta.push_root(1, ChunkOffset::new(1, 4096));
        // simulate a future writer having stored the compressed shape
        meta.ring_word(1).store(RING_CHUNKED_SENTINEL | 42, Ordering::Release);
        assert_eq!(meta.ring_slot(1), RingSlot::Chunked(42));
        assert_eq!(meta.root_offset(1), None);
        assert_eq!(meta.root_offset(0), Some(ChunkOffset::new(1, 0)));
    }

    #[test]
    fn dirty_guard_nests() {
        let meta = region();
        {
            let _outer = meta.hold_dirty();
            assert!(meta.is_dirty());
            {
                let _inner = meta.hold_dirty();
                assert!(meta.is_dirty());
            }
            assert!(meta.is_dirty());
        }
        assert!(!meta.is_dirty());
    }

    #[test]
    fn voted_metadata_round_trips() {
        let meta = region();
        let id = [0xabu8; 32];
        meta.set_voted(99, &id);
        assert_eq!(meta.latest_voted(), 99);
        assert_eq!(meta.voted_block_id(), id);
    }
}
