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

//! One backing device of a storage pool.

use std::{
    fs::{File, OpenOptions},
    io,
    os::unix::{
        fs::{FileTypeExt, OpenOptionsExt},
        io::{AsRawFd, RawFd},
    },
    path::{Path, PathBuf},
};

use log::{debug, trace};

use crate::{
    error::{Error, Result},
    round_down_page, DISK_PAGE_SIZE, METADATA_RESERVE,
};

/// Magic of the per-device footer.
pub const FOOTER_MAGIC: [u8; 4] = *b"MND0";

const ZONEFS_SUPER_MAGIC: i64 = 0x5a4f_4653;

/// What kind of inode backs the device.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeviceKind {
    File,
    BlockDevice,
}

/// Contents of the 4 KiB-aligned footer at the tail of every device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Footer {
    pub chunk_capacity: u32,
    pub config_hash: u32,
}

/// An open backing device: a regular file or a raw block device.
///
/// Two descriptor classes are kept: the cached read-write descriptor used
/// for blocking metadata and conventional-chunk access, and an `O_DIRECT`
/// pair used by the async executor for sequential-chunk I/O. Filesystems
/// that refuse `O_DIRECT` (tmpfs) silently fall back to the cached
/// descriptor.
pub struct Device {
    index: u32,
    kind: DeviceKind,
    size: u64,
    cached: File,
    direct_read: Option<File>,
    direct_write: Option<File>,
    path: PathBuf,
}

impl Device {
    /// Open and classify one pool source. Zoned devices are recognised and
    /// rejected; they are reserved, not implemented.
    pub fn open(index: u32, path: &Path, read_only: bool) -> Result<Device> {
        let cached = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .map_err(Error::Io)?;

        let fs_type = fstatfs_type(cached.as_raw_fd())?;
        if fs_type == ZONEFS_SUPER_MAGIC {
            return Err(Error::Unsupported("zoned device"));
        }

        let file_type = cached.metadata().map_err(Error::Io)?.file_type();
        let kind = if file_type.is_block_device() {
            DeviceKind::BlockDevice
        } else if file_type.is_file() {
            DeviceKind::File
        } else {
            return Err(Error::InvalidSource(format!(
                "{} is neither a regular file nor a block device",
                path.display()
            )));
        };

        let size = device_size(&cached, kind)?;
        if size < DISK_PAGE_SIZE * 4 {
            return Err(Error::InvalidSource(format!(
                "{} is too small to hold a pool footer",
                path.display()
            )));
        }

        let mut device = Device {
            index,
            kind,
            size,
            cached,
            direct_read: None,
            direct_write: None,
            path: path.to_path_buf(),
        };
        device.open_direct(read_only);
        Ok(device)
    }

    fn open_direct(&mut self, read_only: bool) {
        let mut read = OpenOptions::new();
        read.read(true).custom_flags(libc::O_DIRECT);
        match read.open(&self.path) {
            Ok(f) => self.direct_read = Some(f),
            Err(err) => {
                debug!(target: "triedb", "O_DIRECT read open of {} failed ({err}); using cached fd", self.path.display())
            }
        }
        if !read_only {
            let mut write = OpenOptions::new();
            write.write(true).custom_flags(libc::O_DIRECT);
            match write.open(&self.path) {
                Ok(f) => self.direct_write = Some(f),
                Err(err) => {
                    debug!(target: "triedb", "O_DIRECT write open of {} failed ({err}); using cached fd", self.path.display())
                }
            }
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cached_file(&self) -> &File {
        &self.cached
    }

    pub fn cached_fd(&self) -> RawFd {
        self.cached.as_raw_fd()
    }

    pub fn direct_read_fd(&self) -> RawFd {
        self.direct_read
            .as_ref()
            .map(|f| f.as_raw_fd())
            .unwrap_or_else(|| self.cached.as_raw_fd())
    }

    pub fn direct_write_fd(&self) -> RawFd {
        self.direct_write
            .as_ref()
            .map(|f| f.as_raw_fd())
            .unwrap_or_else(|| self.cached.as_raw_fd())
    }

    /// Device byte offset of the footer page.
    pub fn footer_offset(&self) -> u64 {
        round_down_page(self.size) - DISK_PAGE_SIZE
    }

    /// Bytes usable for chunks: everything below the footer, less the
    /// metadata reserve on device 0.
    pub fn usable_bytes(&self) -> u64 {
        let reserved = if self.index == 0 { METADATA_RESERVE } else { 0 };
        self.footer_offset().saturating_sub(reserved)
    }

    /// Number of whole chunks this device holds, chunk 0 included.
    pub fn chunks(&self, chunk_capacity: u64) -> u32 {
        (self.usable_bytes() / chunk_capacity) as u32
    }

    /// Read the footer; `None` when the magic is absent (uninitialised).
    pub fn read_footer(&self) -> Result<Option<Footer>> {
        let mut page = vec![0u8; DISK_PAGE_SIZE as usize];
        pread_exact(&self.cached, &mut page, self.footer_offset())?;
        if page[0..4] != FOOTER_MAGIC {
            return Ok(None);
        }
        let chunk_capacity = u32::from_le_bytes(page[4..8].try_into().expect("4 bytes"));
        let config_hash = u32::from_le_bytes(page[8..12].try_into().expect("4 bytes"));
        Ok(Some(Footer {
            chunk_capacity,
            config_hash,
        }))
    }

    pub fn write_footer(&self, footer: &Footer) -> Result<()> {
        let mut page = vec![0u8; DISK_PAGE_SIZE as usize];
        page[0..4].copy_from_slice(&FOOTER_MAGIC);
        page[4..8].copy_from_slice(&footer.chunk_capacity.to_le_bytes());
        page[8..12].copy_from_slice(&footer.config_hash.to_le_bytes());
        pwrite_all(&self.cached, &page, self.footer_offset())?;
        self.cached.sync_data().map_err(Error::Io)?;
        trace!(target: "triedb", "device {}: footer written, chunk capacity {:#x}", self.index, footer.chunk_capacity);
        Ok(())
    }

    /// Discard every byte of the device, footer included.
    pub fn discard_all(&self) -> Result<()> {
        self.discard_range(0, self.size)
    }

    /// Return the extent to unwritten storage: hole punch for files,
    /// `BLKDISCARD` for block devices.
    pub fn discard_range(&self, offset: u64, len: u64) -> Result<()> {
        match self.kind {
            DeviceKind::File => punch_hole(self.cached.as_raw_fd(), offset, len),
            DeviceKind::BlockDevice => blk_discard(self.cached.as_raw_fd(), offset, len),
        }
    }
}

fn device_size(file: &File, kind: DeviceKind) -> Result<u64> {
    match kind {
        DeviceKind::File => Ok(file.metadata().map_err(Error::Io)?.len()),
        DeviceKind::BlockDevice => {
            // lseek to the end works for block devices and avoids the ioctl
            let size = unsafe { libc::lseek(file.as_raw_fd(), 0, libc::SEEK_END) };
            if size < 0 {
                return Err(Error::Io(io::Error::last_os_error()));
            }
            Ok(size as u64)
        }
    }
}

fn fstatfs_type(fd: RawFd) -> Result<i64> {
    let mut stat: libc::statfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstatfs(fd, &mut stat) } != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(stat.f_type as i64)
}

fn punch_hole(fd: RawFd, offset: u64, len: u64) -> Result<()> {
    let rc = unsafe {
        libc::fallocate(
            fd,
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            offset as libc::off_t,
            len as libc::off_t,
        )
    };
    if rc != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(())
}

fn blk_discard(fd: RawFd, offset: u64, len: u64) -> Result<()> {
    // BLKDISCARD = _IO(0x12, 119)
    const BLKDISCARD: libc::c_ulong = 0x1277;
    let range = [offset, len];
    if unsafe { libc::ioctl(fd, BLKDISCARD, range.as_ptr()) } != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(())
}

pub(crate) fn pread_exact(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset).map_err(Error::Io)
}

pub(crate) fn pwrite_all(file: &File, buf: &[u8], offset: u64) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset).map_err(Error::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn scratch_device(dir: &TempDir, size: u64) -> Device {
        let path = dir.path().join("dev");
        let file = File::create(&path).unwrap();
        file.set_len(size).unwrap();
        drop(file);
        Device::open(0, &path, false).unwrap()
    }

    #[test]
    fn footer_round_trips() {
        let dir = TempDir::new("triedb-pool").unwrap();
        let device = scratch_device(&dir, 64 * 1024 * 1024);
        assert_eq!(device.read_footer().unwrap(), None);
        let footer = Footer {
            chunk_capacity: 1 << 22,
            config_hash: 0xdead_beef,
        };
        device.write_footer(&footer).unwrap();
        assert_eq!(device.read_footer().unwrap(), Some(footer));
    }

    #[test]
    fn geometry() {
        let dir = TempDir::new("triedb-pool").unwrap();
        let size = 64 * 1024 * 1024;
        let device = scratch_device(&dir, size);
        assert_eq!(device.kind(), DeviceKind::File);
        assert_eq!(device.footer_offset(), size - DISK_PAGE_SIZE);
        // device 0 reserves the metadata region
        assert_eq!(
            device.usable_bytes(),
            size - DISK_PAGE_SIZE - METADATA_RESERVE
        );
        assert_eq!(device.chunks(1 << 22), (size - DISK_PAGE_SIZE - METADATA_RESERVE) as u32 >> 22);
    }

    #[test]
    fn punch_hole_zeroes_extent() {
        let dir = TempDir::new("triedb-pool").unwrap();
        let device = scratch_device(&dir, 64 * 1024 * 1024);
        pwrite_all(device.cached_file(), &[0xffu8; 8192], 4096).unwrap();
        device.discard_range(4096, 8192).unwrap();
        let mut back = [0u8; 8192];
        pread_exact(device.cached_file(), &mut back, 4096).unwrap();
        assert!(back.iter().all(|b| *b == 0));
    }
}
