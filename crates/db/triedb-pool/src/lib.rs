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

//! Chunked storage pool over raw block devices and regular files.
//!
//! A pool aggregates one or more backing devices, carves each of them into
//! fixed-size power-of-two chunks and keeps its own bookkeeping in a
//! memory-mapped metadata region on device 0. Chunk 0 of every device is
//! *conventional* (random access, reserved for metadata); all remaining
//! chunks are *sequential* (append-only, with a persistent used-byte
//! counter). Sequential chunks move between three intrusive lists embedded
//! in the metadata region: free, fast and slow.
//!
//! One process may open the pool read-write; any number of others may open
//! it read-only and observe committed state through the shared metadata map.

mod device;
mod error;
mod meta;
mod offset;
mod pool;

pub use device::{Device, DeviceKind, Footer};
pub use error::{Error, Result};
pub use meta::{
    ChunkInfo, DirtyGuard, ListId, ListIter, MetaRegion, RingSlot, INVALID_VERSION, ROOT_RING_SIZE,
};
pub use offset::{ChunkOffset, CHUNK_ID_BITS, INVALID_CHUNK_ID, INVALID_OFFSET, MAX_CHUNKS};
pub use pool::{ChunkClass, ChunkHandle, Mode, PoolOptions, StoragePool};

/// Granularity of all device I/O and of the metadata footer.
pub const DISK_PAGE_SIZE: u64 = 4096;

/// Bytes reserved at the tail of device 0 for the pool metadata region,
/// sized for the maximum chunk count and rounded up generously.
pub const METADATA_RESERVE: u64 = 16 * 1024 * 1024;

pub(crate) fn round_down_page(v: u64) -> u64 {
    v & !(DISK_PAGE_SIZE - 1)
}

pub(crate) fn round_up_page(v: u64) -> u64 {
    (v + DISK_PAGE_SIZE - 1) & !(DISK_PAGE_SIZE - 1)
}

/// FNV-1a over little-endian words; used for the device configuration hash.
pub(crate) fn fnv1a_add(hash: u32, word: u32) -> u32 {
    let mut h = hash;
    for byte in word.to_le_bytes() {
        h ^= byte as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}

pub(crate) const FNV1A_BASIS: u32 = 0x811c_9dc5;
