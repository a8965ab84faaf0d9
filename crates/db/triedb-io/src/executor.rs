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

//! The connected-operation executor.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    io,
    os::unix::io::RawFd,
    time::{Duration, Instant},
};

use io_uring::{opcode, squeue, types};
use log::trace;
use slab::Slab;
use triedb_pool::ChunkHandle;

use crate::{
    buffers::{Buffer, BufferArena, READ_BUFFER_SIZE, WRITE_BUFFER_SIZE},
    ring::{Ring, RingConfig},
};

/// Executor construction parameters.
#[derive(Clone, Copy, Debug)]
pub struct ExecutorConfig {
    pub ring: RingConfig,
    /// Number of pre-allocated read buffers.
    pub rd_buffers: usize,
    /// Number of pre-allocated write buffers.
    pub wr_buffers: usize,
    /// Reads submitted beyond this many in flight wait on a FIFO queue.
    /// Zero disables the cap.
    pub concurrent_read_limit: u32,
    /// Stamp each operation at initiation and report its latency.
    pub capture_io_latencies: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            ring: RingConfig::default(),
            rd_buffers: 64,
            wr_buffers: 8,
            concurrent_read_limit: 0,
            capture_io_latencies: false,
        }
    }
}

/// Counters the executor keeps about itself.
#[derive(Clone, Copy, Debug, Default)]
pub struct IoStats {
    pub reads: u64,
    pub scatter_reads: u64,
    pub writes: u64,
    pub timers: u64,
    /// Reads that hit the inflight cap and waited on the FIFO.
    pub reads_queued: u64,
    pub max_inflight_reads: u32,
    pub max_inflight_writes: u32,
}

/// A receiver is the continuation of a connected operation. It gets the
/// operation's buffers back along with the kernel's result and may submit
/// follow-up operations through the executor it is handed.
pub trait OpReceiver {
    fn complete(self: Box<Self>, io: &Executor, op: CompletedOp, result: io::Result<usize>);
}

impl<F> OpReceiver for F
where
    F: FnOnce(&Executor, CompletedOp, io::Result<usize>),
{
    fn complete(self: Box<Self>, io: &Executor, op: CompletedOp, result: io::Result<usize>) {
        (*self)(io, op, result)
    }
}

enum Payload {
    Read {
        buf: Buffer,
        fd: RawFd,
        offset: u64,
        len: u32,
        _chunk: ChunkHandle,
    },
    ReadScatter {
        bufs: Vec<Buffer>,
        iovecs: Box<[libc::iovec]>,
        fd: RawFd,
        offset: u64,
        _chunk: ChunkHandle,
    },
    Write {
        buf: Buffer,
        len: u32,
        fd: RawFd,
        offset: u64,
        _chunk: ChunkHandle,
    },
    Timer {
        ts: Box<types::Timespec>,
    },
}

struct Operation {
    payload: Payload,
    receiver: Box<dyn OpReceiver>,
    initiated: Option<Instant>,
}

/// A finished operation, handed to its receiver.
pub struct CompletedOp {
    payload: Payload,
    /// Time between initiation and completion, when latency capture is on.
    pub latency: Option<Duration>,
}

impl CompletedOp {
    /// Reclaim the buffer of a plain read.
    pub fn into_read_buffer(self) -> Option<Buffer> {
        match self.payload {
            Payload::Read { buf, .. } => Some(buf),
            _ => None,
        }
    }

    /// Reclaim the buffers of a scatter read, in iovec order.
    pub fn into_scatter_buffers(self) -> Vec<Buffer> {
        match self.payload {
            Payload::ReadScatter { bufs, .. } => bufs,
            _ => Vec::new(),
        }
    }
}

/// Single-threaded cooperative async I/O executor.
pub struct Executor {
    ring: RefCell<Ring>,
    ops: RefCell<Slab<Operation>>,
    read_arena: BufferArena,
    write_arena: BufferArena,
    pending_reads: RefCell<VecDeque<usize>>,
    inflight_rd: Cell<u32>,
    inflight_rd_scatter: Cell<u32>,
    inflight_wr: Cell<u32>,
    inflight_tm: Cell<u32>,
    read_limit: Cell<u32>,
    capture_latencies: Cell<bool>,
    stats: RefCell<IoStats>,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> io::Result<Executor> {
        Ok(Executor {
            ring: RefCell::new(Ring::new(config.ring)?),
            ops: RefCell::new(Slab::new()),
            read_arena: BufferArena::new(READ_BUFFER_SIZE, config.rd_buffers.max(2)),
            write_arena: BufferArena::new(WRITE_BUFFER_SIZE, config.wr_buffers.max(2)),
            pending_reads: RefCell::new(VecDeque::new()),
            inflight_rd: Cell::new(0),
            inflight_rd_scatter: Cell::new(0),
            inflight_wr: Cell::new(0),
            inflight_tm: Cell::new(0),
            read_limit: Cell::new(config.concurrent_read_limit),
            capture_latencies: Cell::new(config.capture_io_latencies),
            stats: RefCell::new(IoStats::default()),
        })
    }

    pub fn stats(&self) -> IoStats {
        *self.stats.borrow()
    }

    pub fn concurrent_read_limit(&self) -> u32 {
        self.read_limit.get()
    }

    pub fn set_concurrent_read_limit(&self, limit: u32) {
        self.read_limit.set(limit);
    }

    pub fn capture_io_latencies(&self) -> bool {
        self.capture_latencies.get()
    }

    pub fn set_capture_io_latencies(&self, on: bool) {
        self.capture_latencies.set(on);
    }

    /// Everything the kernel currently owes us, queued reads included.
    pub fn io_in_flight(&self) -> u32 {
        self.submitted_in_flight() + self.pending_reads.borrow().len() as u32
    }

    pub fn reads_in_flight(&self) -> u32 {
        self.inflight_rd.get() + self.pending_reads.borrow().len() as u32
    }

    pub fn writes_in_flight(&self) -> u32 {
        self.inflight_wr.get()
    }

    fn submitted_in_flight(&self) -> u32 {
        self.inflight_rd.get()
            + self.inflight_rd_scatter.get()
            + self.inflight_wr.get()
            + self.inflight_tm.get()
    }

    /// Take a read buffer, polling for completions while the arena is
    /// exhausted.
    pub fn read_buffer(&self) -> io::Result<Buffer> {
        loop {
            if let Some(buf) = self.read_arena.try_alloc() {
                return Ok(buf);
            }
            if self.io_in_flight() == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "read buffers exhausted with no i/o in flight",
                ));
            }
            self.poll(true, 1)?;
        }
    }

    /// Take a write buffer, polling the completion ring while the arena is
    /// exhausted. This is a suspension point of the writer.
    pub fn write_buffer(&self) -> io::Result<Buffer> {
        loop {
            if let Some(buf) = self.write_arena.try_alloc() {
                return Ok(buf);
            }
            if self.io_in_flight() == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "write buffers exhausted with no i/o in flight",
                ));
            }
            self.poll(true, 1)?;
        }
    }

    /// Submit a read of `len` bytes at `offset_in_chunk`. Beyond the
    /// inflight cap the operation waits in FIFO order and is submitted as
    /// earlier reads complete. Offsets and lengths must be page-aligned,
    /// the chunk descriptors being opened with `O_DIRECT` where possible.
    pub fn submit_read(
        &self,
        buf: Buffer,
        chunk: &ChunkHandle,
        offset_in_chunk: u64,
        len: u32,
        receiver: Box<dyn OpReceiver>,
    ) -> io::Result<()> {
        debug_assert_eq!(offset_in_chunk % 4096, 0);
        debug_assert_eq!(len as usize % 4096, 0);
        debug_assert!(len as usize <= buf.len());
        let payload = Payload::Read {
            buf,
            fd: chunk.read_fd(),
            offset: chunk.file_offset(offset_in_chunk),
            len,
            _chunk: chunk.clone(),
        };
        let key = self.ops.borrow_mut().insert(Operation {
            payload,
            receiver,
            initiated: None,
        });
        let limit = self.read_limit.get();
        if limit > 0 && self.inflight_rd.get() >= limit {
            self.pending_reads.borrow_mut().push_back(key);
            self.stats.borrow_mut().reads_queued += 1;
            return Ok(());
        }
        self.start_read(key)
    }

    /// Scatter `total_len` bytes at `offset_in_chunk` across `bufs` in
    /// order. Used when a node's payload spans read buffers.
    pub fn submit_read_scatter(
        &self,
        bufs: Vec<Buffer>,
        chunk: &ChunkHandle,
        offset_in_chunk: u64,
        total_len: u64,
        receiver: Box<dyn OpReceiver>,
    ) -> io::Result<()> {
        debug_assert_eq!(offset_in_chunk % 4096, 0);
        debug_assert_eq!(total_len % 4096, 0);
        debug_assert!(bufs.iter().map(|b| b.len() as u64).sum::<u64>() >= total_len);
        let mut iovecs = Vec::with_capacity(bufs.len());
        let mut remaining = total_len;
        let mut bufs = bufs;
        for buf in &mut bufs {
            if remaining == 0 {
                break;
            }
            let iov_len = remaining.min(buf.len() as u64) as usize;
            iovecs.push(libc::iovec {
                iov_base: buf.as_mut_ptr() as *mut libc::c_void,
                iov_len,
            });
            remaining -= iov_len as u64;
        }
        let iovecs = iovecs.into_boxed_slice();
        let fd = chunk.read_fd();
        let offset = chunk.file_offset(offset_in_chunk);
        let entry = opcode::Readv::new(types::Fd(fd), iovecs.as_ptr(), iovecs.len() as u32)
            .offset(offset)
            .build();
        let key = self.ops.borrow_mut().insert(Operation {
            payload: Payload::ReadScatter {
                bufs,
                iovecs,
                fd,
                offset,
                _chunk: chunk.clone(),
            },
            receiver,
            initiated: self.initiation_stamp(),
        });
        self.push_sqe(entry.user_data(key as u64))?;
        self.inflight_rd_scatter.set(self.inflight_rd_scatter.get() + 1);
        self.stats.borrow_mut().scatter_reads += 1;
        Ok(())
    }

    /// Submit a write of the first `len` bytes of `buf`. Writes are never
    /// queued: buffer-pool exhaustion is the write-side back-pressure.
    pub fn submit_write(
        &self,
        buf: Buffer,
        chunk: &ChunkHandle,
        offset_in_chunk: u64,
        len: u32,
        receiver: Box<dyn OpReceiver>,
    ) -> io::Result<()> {
        debug_assert_eq!(offset_in_chunk % 4096, 0);
        debug_assert_eq!(len as usize % 4096, 0);
        debug_assert!(len as usize <= buf.len());
        let fd = chunk.write_fd();
        let offset = chunk.file_offset(offset_in_chunk);
        let entry = opcode::Write::new(types::Fd(fd), buf.as_ptr(), len)
            .offset(offset)
            .build();
        let key = self.ops.borrow_mut().insert(Operation {
            payload: Payload::Write {
                buf,
                len,
                fd,
                offset,
                _chunk: chunk.clone(),
            },
            receiver,
            initiated: self.initiation_stamp(),
        });
        self.push_sqe(entry.user_data(key as u64))?;
        let inflight = self.inflight_wr.get() + 1;
        self.inflight_wr.set(inflight);
        let mut stats = self.stats.borrow_mut();
        stats.writes += 1;
        stats.max_inflight_writes = stats.max_inflight_writes.max(inflight);
        Ok(())
    }

    /// One-shot timer; the receiver fires after `delay`.
    pub fn submit_timed(&self, delay: Duration, receiver: Box<dyn OpReceiver>) -> io::Result<()> {
        let ts = Box::new(
            types::Timespec::new()
                .sec(delay.as_secs())
                .nsec(delay.subsec_nanos()),
        );
        let entry = opcode::Timeout::new(&*ts as *const types::Timespec).build();
        let key = self.ops.borrow_mut().insert(Operation {
            payload: Payload::Timer { ts },
            receiver,
            initiated: self.initiation_stamp(),
        });
        self.push_sqe(entry.user_data(key as u64))?;
        self.inflight_tm.set(self.inflight_tm.get() + 1);
        self.stats.borrow_mut().timers += 1;
        Ok(())
    }

    /// Process up to `max` completions. Blocking waits for at least one;
    /// non-blocking returns 0 when none are ready. Receivers run on this
    /// thread, inside this call.
    pub fn poll(&self, blocking: bool, max: usize) -> io::Result<usize> {
        if max == 0 {
            return Ok(0);
        }
        if self.submitted_in_flight() == 0 {
            self.drain_pending_reads()?;
            if self.submitted_in_flight() == 0 {
                return Ok(0);
            }
        }
        {
            let mut ring = self.ring.borrow_mut();
            if blocking {
                ring.inner().submit_and_wait(1)?;
            } else {
                ring.inner().submit()?;
            }
        }
        let completions: Vec<(u64, i32)> = {
            let mut ring = self.ring.borrow_mut();
            ring.inner()
                .completion()
                .take(max)
                .map(|entry| (entry.user_data(), entry.result()))
                .collect()
        };
        let handled = completions.len();
        for (key, raw) in completions {
            let op = self.ops.borrow_mut().remove(key as usize);
            let result = match &op.payload {
                Payload::Read { .. } => {
                    self.inflight_rd.set(self.inflight_rd.get() - 1);
                    decode_result(raw)
                }
                Payload::ReadScatter { .. } => {
                    self.inflight_rd_scatter
                        .set(self.inflight_rd_scatter.get() - 1);
                    decode_result(raw)
                }
                Payload::Write { .. } => {
                    self.inflight_wr.set(self.inflight_wr.get() - 1);
                    decode_result(raw)
                }
                Payload::Timer { .. } => {
                    self.inflight_tm.set(self.inflight_tm.get() - 1);
                    // a fired timeout completes with ETIME
                    if raw == -libc::ETIME || raw >= 0 {
                        Ok(0)
                    } else {
                        decode_result(raw)
                    }
                }
            };
            let latency = op.initiated.map(|at| at.elapsed());
            trace!(target: "triedb", "completion {key}: {result:?}");
            op.receiver.complete(
                self,
                CompletedOp {
                    payload: op.payload,
                    latency,
                },
                result,
            );
        }
        self.drain_pending_reads()?;
        Ok(handled)
    }

    /// Poll until every submitted and queued operation has completed.
    pub fn wait_until_done(&self) -> io::Result<()> {
        while self.io_in_flight() > 0 {
            if self.submitted_in_flight() == 0 {
                // only FIFO-queued reads remain; start what the cap allows
                self.drain_pending_reads()?;
                continue;
            }
            self.poll(true, usize::MAX)?;
        }
        Ok(())
    }

    fn initiation_stamp(&self) -> Option<Instant> {
        self.capture_latencies.get().then(Instant::now)
    }

    fn start_read(&self, key: usize) -> io::Result<()> {
        let entry = {
            let mut ops = self.ops.borrow_mut();
            let op = ops.get_mut(key).expect("key just inserted or queued; qed");
            op.initiated = self.initiation_stamp();
            match &mut op.payload {
                Payload::Read { buf, fd, offset, len, .. } => {
                    opcode::Read::new(types::Fd(*fd), buf.as_mut_ptr(), *len)
                        .offset(*offset)
                        .build()
                        .user_data(key as u64)
                }
                _ => unreachable!("start_read on a non-read operation"),
            }
        };
        self.push_sqe(entry)?;
        let inflight = self.inflight_rd.get() + 1;
        self.inflight_rd.set(inflight);
        let mut stats = self.stats.borrow_mut();
        stats.reads += 1;
        stats.max_inflight_reads = stats.max_inflight_reads.max(inflight);
        Ok(())
    }

    fn drain_pending_reads(&self) -> io::Result<()> {
        loop {
            let limit = self.read_limit.get();
            if limit > 0 && self.inflight_rd.get() >= limit {
                return Ok(());
            }
            let Some(key) = self.pending_reads.borrow_mut().pop_front() else {
                return Ok(());
            };
            self.start_read(key)?;
        }
    }

    fn push_sqe(&self, entry: squeue::Entry) -> io::Result<()> {
        let mut ring = self.ring.borrow_mut();
        let ring = ring.inner();
        loop {
            let pushed = unsafe { ring.submission().push(&entry).is_ok() };
            ring.submit()?;
            if pushed {
                return Ok(());
            }
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // in-flight operations own buffers the kernel may still touch;
        // drain them before the arenas go away
        if self.io_in_flight() > 0 {
            if let Err(err) = self.wait_until_done() {
                log::warn!(target: "triedb", "executor drained with error at shutdown: {err}");
            }
        }
    }
}

fn decode_result(raw: i32) -> io::Result<usize> {
    if raw < 0 {
        Err(io::Error::from_raw_os_error(-raw))
    } else {
        Ok(raw as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, rc::Rc};
    use tempdir::TempDir;
    use triedb_pool::{ListId, Mode, PoolOptions, StoragePool};

    fn scratch_pool(dir: &TempDir) -> StoragePool {
        let path = dir.path().join("pool");
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(32 * 1024 * 1024).unwrap();
        drop(file);
        StoragePool::open(
            &[path],
            Mode::Truncate,
            PoolOptions {
                chunk_capacity: 1 << 20,
                history_length: 16,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn executor_or_skip() -> Option<Executor> {
        // io_uring may be disabled by seccomp in constrained environments
        match Executor::new(ExecutorConfig::default()) {
            Ok(exec) => Some(exec),
            Err(err) => {
                eprintln!("skipping io_uring test: {err}");
                None
            }
        }
    }

    #[test]
    fn write_then_read_round_trip() {
        let Some(exec) = executor_or_skip() else { return };
        let dir = TempDir::new("triedb-io").unwrap();
        let pool = scratch_pool(&dir);
        let chunk = pool.allocate_chunk(ListId::Fast).unwrap();
        let at = chunk.try_reserve(8192).unwrap();

        let mut buf = exec.write_buffer().unwrap();
        buf.as_mut_slice()[..8192]
            .iter_mut()
            .enumerate()
            .for_each(|(i, b)| *b = (i % 251) as u8);
        let wrote = Rc::new(Cell::new(false));
        let wrote2 = wrote.clone();
        exec.submit_write(
            buf,
            &chunk,
            at,
            8192,
            Box::new(move |_io: &Executor, _op: CompletedOp, result: io::Result<usize>| {
                assert_eq!(result.unwrap(), 8192);
                wrote2.set(true);
            }),
        )
        .unwrap();
        exec.wait_until_done().unwrap();
        assert!(wrote.get());

        let got = Rc::new(RefCell::new(Vec::new()));
        let got2 = got.clone();
        let buf = exec.read_buffer().unwrap();
        exec.submit_read(
            buf,
            &chunk,
            at,
            8192,
            Box::new(move |_io: &Executor, op: CompletedOp, result: io::Result<usize>| {
                assert_eq!(result.unwrap(), 8192);
                let buf = op.into_read_buffer().unwrap();
                got2.borrow_mut().extend_from_slice(&buf.as_slice()[..8192]);
            }),
        )
        .unwrap();
        exec.wait_until_done().unwrap();
        let got = got.borrow();
        assert_eq!(got.len(), 8192);
        assert!(got.iter().enumerate().all(|(i, b)| *b == (i % 251) as u8));
    }

    #[test]
    fn read_cap_queues_fifo() {
        let Some(exec) = executor_or_skip() else { return };
        exec.set_concurrent_read_limit(1);
        let dir = TempDir::new("triedb-io").unwrap();
        let pool = scratch_pool(&dir);
        let chunk = pool.allocate_chunk(ListId::Fast).unwrap();
        chunk.try_reserve(16 * 4096).unwrap();

        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..4u64 {
            let order = order.clone();
            let buf = exec.read_buffer().unwrap();
            exec.submit_read(
                buf,
                &chunk,
                i * 4096,
                4096,
                Box::new(move |_io: &Executor, _op: CompletedOp, result: io::Result<usize>| {
                    result.unwrap();
                    order.borrow_mut().push(i);
                }),
            )
            .unwrap();
        }
        assert!(exec.reads_in_flight() >= 3);
        exec.wait_until_done().unwrap();
        assert_eq!(&*order.borrow(), &[0, 1, 2, 3]);
        assert!(exec.stats().reads_queued >= 3);
    }

    #[test]
    fn timer_fires() {
        let Some(exec) = executor_or_skip() else { return };
        let fired = Rc::new(Cell::new(false));
        let fired2 = fired.clone();
        let started = Instant::now();
        exec.submit_timed(
            Duration::from_millis(10),
            Box::new(move |_io: &Executor, _op: CompletedOp, result: io::Result<usize>| {
                result.unwrap();
                fired2.set(true);
            }),
        )
        .unwrap();
        exec.wait_until_done().unwrap();
        assert!(fired.get());
        assert!(started.elapsed() >= Duration::from_millis(10));
    }
}
