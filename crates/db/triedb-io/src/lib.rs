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

//! Asynchronous I/O over an io_uring kernel ring.
//!
//! The executor is single-threaded and cooperative: operations make
//! progress only when the owning thread calls [`Executor::poll`].
//! Suspension points are exactly inside `poll`, inside write-buffer
//! allocation when the arena is exhausted, and inside read submission when
//! the inflight cap is reached. Completed operations are handed back to
//! their receiver together with the buffers they owned.

mod buffers;
mod executor;
mod ring;

pub use buffers::{Buffer, BufferArena, DMA_ALIGNMENT, READ_BUFFER_SIZE, WRITE_BUFFER_SIZE};
pub use executor::{CompletedOp, Executor, ExecutorConfig, IoStats, OpReceiver};
pub use ring::{Ring, RingConfig};
