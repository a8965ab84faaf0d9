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

//! Pre-allocated, DMA-aligned buffer arenas.
//!
//! `O_DIRECT` transfers need page-aligned memory, so buffers come out of
//! one large aligned allocation per arena. A [`Buffer`] owns its slot
//! exclusively while an operation is in flight and returns it to the
//! arena's free list on drop.

use std::{alloc, cell::RefCell, rc::Rc, slice};

/// Alignment every buffer satisfies.
pub const DMA_ALIGNMENT: usize = 4096;

/// Size of one read buffer: eight disk pages.
pub const READ_BUFFER_SIZE: usize = 8 * 4096;

/// Size of one write buffer.
pub const WRITE_BUFFER_SIZE: usize = 4 * 1024 * 1024;

struct ArenaInner {
    base: *mut u8,
    buffer_size: usize,
    count: usize,
    free: RefCell<Vec<u32>>,
}

impl Drop for ArenaInner {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.free.borrow().len(),
            self.count,
            "buffers leaked past arena shutdown"
        );
        let layout = alloc::Layout::from_size_align(self.buffer_size * self.count, DMA_ALIGNMENT)
            .expect("arena layout validated at construction; qed");
        unsafe { alloc::dealloc(self.base, layout) };
    }
}

/// A fixed-size pool of equally sized aligned buffers.
pub struct BufferArena {
    inner: Rc<ArenaInner>,
}

impl BufferArena {
    pub fn new(buffer_size: usize, count: usize) -> BufferArena {
        assert!(buffer_size % DMA_ALIGNMENT == 0);
        assert!(count > 0 && count < u32::MAX as usize);
        let layout = alloc::Layout::from_size_align(buffer_size * count, DMA_ALIGNMENT)
            .expect("aligned arena layout");
        let base = unsafe { alloc::alloc_zeroed(layout) };
        assert!(!base.is_null(), "arena allocation failed");
        BufferArena {
            inner: Rc::new(ArenaInner {
                base,
                buffer_size,
                count,
                free: RefCell::new((0..count as u32).rev().collect()),
            }),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    pub fn available(&self) -> usize {
        self.inner.free.borrow().len()
    }

    /// Take a buffer, or `None` when every slot is in flight.
    pub fn try_alloc(&self) -> Option<Buffer> {
        let index = self.inner.free.borrow_mut().pop()?;
        Some(Buffer {
            arena: self.inner.clone(),
            index,
        })
    }
}

/// Exclusive ownership of one arena slot.
pub struct Buffer {
    arena: Rc<ArenaInner>,
    index: u32,
}

impl Buffer {
    pub fn len(&self) -> usize {
        self.arena.buffer_size
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn as_ptr(&self) -> *const u8 {
        unsafe { self.arena.base.add(self.index as usize * self.arena.buffer_size) }
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        unsafe { self.arena.base.add(self.index as usize * self.arena.buffer_size) }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.as_ptr(), self.len()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let len = self.len();
        unsafe { slice::from_raw_parts_mut(self.as_mut_ptr(), len) }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.arena.free.borrow_mut().push(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_exhaust_release() {
        let arena = BufferArena::new(READ_BUFFER_SIZE, 2);
        assert_eq!(arena.available(), 2);
        let a = arena.try_alloc().unwrap();
        let b = arena.try_alloc().unwrap();
        assert!(arena.try_alloc().is_none());
        assert_eq!(a.as_ptr() as usize % DMA_ALIGNMENT, 0);
        assert_eq!(b.as_ptr() as usize % DMA_ALIGNMENT, 0);
        assert_ne!(a.as_ptr(), b.as_ptr());
        drop(a);
        assert_eq!(arena.available(), 1);
        let c = arena.try_alloc().unwrap();
        drop(b);
        drop(c);
        assert_eq!(arena.available(), 2);
    }

    #[test]
    fn buffers_are_writable() {
        let arena = BufferArena::new(READ_BUFFER_SIZE, 1);
        let mut buf = arena.try_alloc().unwrap();
        buf.as_mut_slice()[0] = 0xaa;
        buf.as_mut_slice()[READ_BUFFER_SIZE - 1] = 0xbb;
        assert_eq!(buf.as_slice()[0], 0xaa);
        assert_eq!(buf.as_slice()[READ_BUFFER_SIZE - 1], 0xbb);
    }
}
