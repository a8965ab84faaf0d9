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

//! Thin wrapper around the kernel submission/completion ring.

use std::io;

use io_uring::IoUring;

/// Ring construction parameters.
#[derive(Clone, Copy, Debug)]
pub struct RingConfig {
    /// Submission queue depth. Rounded up to a power of two by the kernel.
    pub entries: u32,
    /// Pin a kernel submission-polling thread to this CPU. When unset,
    /// submissions go through the `io_uring_enter` syscall.
    pub sq_thread_cpu: Option<u32>,
}

impl Default for RingConfig {
    fn default() -> Self {
        RingConfig {
            entries: 128,
            sq_thread_cpu: None,
        }
    }
}

/// An owned io_uring instance.
pub struct Ring {
    inner: IoUring,
}

impl Ring {
    pub fn new(config: RingConfig) -> io::Result<Ring> {
        let mut builder = IoUring::builder();
        if let Some(cpu) = config.sq_thread_cpu {
            builder.setup_sqpoll(2_000);
            builder.setup_sqpoll_cpu(cpu);
        }
        let inner = builder.build(config.entries.max(2))?;
        Ok(Ring { inner })
    }

    pub fn inner(&mut self) -> &mut IoUring {
        &mut self.inner
    }
}
