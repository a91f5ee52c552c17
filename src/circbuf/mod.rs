//! A bounded multi-producer/single-consumer circular buffer of
//! variable-sized byte blocks (spec.md §4.4), used internally as a
//! backpressure-aware handoff between a writer thread and a reader thread.
//!
//! The source splits the buffer into fixed-size chunks linked in a list,
//! with the writer wrapping in place inside a chunk once there's no more
//! room ahead of it but space remains behind the reader. That in-chunk
//! wrap is an allocation optimization; the FIFO and backpressure semantics
//! it implements are the same as a plain bounded queue of blocks once the
//! wrap bookkeeping is factored out, so this rewrite keeps a `VecDeque` of
//! committed blocks and enforces the byte budget (`max_allocation`)
//! directly rather than through chunk geometry. `max_block_size` is still
//! derived the way the original derives its per-chunk ceiling, so
//! `BLOCK_TOO_LARGE` triggers at the same sizes.
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use tracing::{debug, trace};

use crate::error::{Error, Result};

const DEFAULT_CHUNK_SIZE: usize = 2 * 1024 * 1024;
const DEFAULT_MAX_ALLOCATION: usize = 8 * DEFAULT_CHUNK_SIZE;
/// Per-block bookkeeping gap the original reserves around a chunk's three
/// guaranteed blocks (header alignment slack).
const GAP: usize = 8;

const STANDARD_CHUNK_SIZES: &[usize] = &[
    64 * 1024,
    256 * 1024,
    1024 * 1024,
    4 * 1024 * 1024,
    16 * 1024 * 1024,
];

fn round_up_to_standard_chunk_size(needed: usize) -> usize {
    STANDARD_CHUNK_SIZES
        .iter()
        .copied()
        .find(|&size| size >= needed)
        .unwrap_or_else(|| needed.max(*STANDARD_CHUNK_SIZES.last().unwrap()))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Running,
    /// No more writes accepted; the reader drains what's left.
    Draining,
    Stopped,
}

struct Inner {
    queue: VecDeque<Vec<u8>>,
    total_used: usize,
    max_allocation: usize,
    max_block_size: usize,
    fixed_item_size: Option<usize>,
    state: State,
    has_write_block: bool,
    has_read_block: bool,
    checked_out_size: Option<usize>,
    wait_count: u32,
}

/// Configuration accepted by `CircBuf::create`; surfaced mainly so callers
/// can inspect the effective chunk size and allocation ceiling after
/// `0` defaults have been applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CircBufConfig {
    pub chunk_size: usize,
    pub max_allocation: usize,
    pub fixed_item_size: Option<usize>,
}

/// A handle to space reserved for the next block the writer will fill.
/// Must be passed to `commit_write_block` to become visible to the reader.
#[derive(Debug)]
pub struct WriteBlock {
    buf: Vec<u8>,
}

impl WriteBlock {
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }
}

/// A handle to the block the reader is currently consuming. Must be
/// passed to `release_read_block` to free its space back to the writer.
#[derive(Debug)]
pub struct ReadBlock {
    data: Vec<u8>,
}

impl ReadBlock {
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

/// A bounded FIFO of byte blocks shared between a writer and a reader.
pub struct CircBuf {
    inner: Mutex<Inner>,
    not_full: Condvar,
    not_empty: Condvar,
    drained: Condvar,
}

impl CircBuf {
    fn new(
        max_allocation: usize,
        max_block_size: usize,
        fixed_item_size: Option<usize>,
    ) -> CircBuf {
        CircBuf {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                total_used: 0,
                max_allocation,
                max_block_size,
                fixed_item_size,
                state: State::Running,
                has_write_block: false,
                has_read_block: false,
                checked_out_size: None,
                wait_count: 0,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            drained: Condvar::new(),
        }
    }

    /// Create a buffer whose blocks carry a length header. `chunk_size ==
    /// 0` and `max_allocation == 0` pick defaults; the maximum single
    /// block size is derived so at least 3 blocks fit per chunk, matching
    /// the source's `(chunk_size - 4*gap) / 3` rule.
    pub fn create(chunk_size: usize, max_allocation: usize) -> Result<CircBuf> {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        let max_allocation = if max_allocation == 0 {
            DEFAULT_MAX_ALLOCATION
        } else {
            max_allocation
        };
        let max_block_size = chunk_size.saturating_sub(4 * GAP) / 3;
        if max_block_size == 0 {
            return Err(Error::input("chunk_size too small to hold 3 blocks"));
        }
        Ok(CircBuf::new(max_allocation, max_block_size, None))
    }

    /// Create a buffer in fixed-item mode: every block is exactly
    /// `item_size` bytes and carries no length header.
    pub fn create_fixed(item_size: usize, item_count: usize) -> Result<CircBuf> {
        if item_size == 0 || item_count == 0 {
            return Err(Error::input("item_size and item_count must be nonzero"));
        }
        let needed = (item_size + 1) * item_count;
        let _chunk_size = round_up_to_standard_chunk_size(needed);
        let max_allocation = item_size * item_count;
        Ok(CircBuf::new(max_allocation, item_size, Some(item_size)))
    }

    pub fn config(&self) -> CircBufConfig {
        let inner = self.inner.lock().unwrap();
        CircBufConfig {
            chunk_size: inner.max_block_size,
            max_allocation: inner.max_allocation,
            fixed_item_size: inner.fixed_item_size,
        }
    }

    /// Acquire `size` bytes of write space. Blocks until space is free
    /// unless `no_wait`, in which case it returns `WOULD_BLOCK`.
    pub fn get_write_block(&self, size: usize, no_wait: bool) -> Result<WriteBlock> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(fixed) = inner.fixed_item_size {
            if size != fixed {
                return Err(Error::input("fixed-item mode requires size == item_size"));
            }
        }
        if size > inner.max_block_size {
            return Err(Error::BlockTooLarge);
        }
        if inner.has_write_block {
            return Err(Error::UncommittedBlock);
        }
        loop {
            if inner.state != State::Running {
                return Err(Error::Stopped);
            }
            if inner.total_used + size <= inner.max_allocation {
                inner.has_write_block = true;
                return Ok(WriteBlock {
                    buf: vec![0u8; size],
                });
            }
            if no_wait {
                trace!(size, "get_write_block: would block");
                return Err(Error::WouldBlock);
            }
            trace!(size, "get_write_block: blocking for space");
            inner.wait_count += 1;
            inner = self.not_full.wait(inner).unwrap();
            inner.wait_count -= 1;
            self.drained.notify_all();
        }
    }

    /// Commit a previously acquired write block. `actual_size` may be less
    /// than the space acquired, but never greater; in fixed-item mode it
    /// must equal the item size.
    pub fn commit_write_block(&self, mut block: WriteBlock, actual_size: usize) -> Result<()> {
        if actual_size > block.buf.len() {
            return Err(Error::input("actual_size exceeds acquired size"));
        }
        let mut inner = self.inner.lock().unwrap();
        if !inner.has_write_block {
            return Err(Error::HasNoBlock);
        }
        if let Some(fixed) = inner.fixed_item_size {
            if actual_size != fixed {
                return Err(Error::input(
                    "fixed-item mode requires actual_size == item_size",
                ));
            }
        }
        block.buf.truncate(actual_size);
        inner.has_write_block = false;
        inner.total_used += actual_size;
        inner.queue.push_back(block.buf);
        trace!(
            actual_size,
            total_used = inner.total_used,
            "commit_write_block"
        );
        self.not_empty.notify_one();
        Ok(())
    }

    /// Acquire the next block for the reader. Blocks until one exists
    /// unless `no_wait`. Returns `STOPPED` once the buffer is empty and
    /// either stopped outright or stopped-writing and fully drained.
    pub fn get_read_block(&self, no_wait: bool) -> Result<ReadBlock> {
        let mut inner = self.inner.lock().unwrap();
        if inner.has_read_block {
            return Err(Error::UncommittedBlock);
        }
        loop {
            if let Some(data) = inner.queue.pop_front() {
                inner.has_read_block = true;
                inner.checked_out_size = Some(data.len());
                return Ok(ReadBlock { data });
            }
            match inner.state {
                State::Stopped => return Err(Error::Stopped),
                State::Draining => {
                    inner.state = State::Stopped;
                    self.not_full.notify_all();
                    self.not_empty.notify_all();
                    return Err(Error::Stopped);
                }
                State::Running => {}
            }
            if no_wait {
                trace!("get_read_block: would block");
                return Err(Error::WouldBlock);
            }
            trace!("get_read_block: blocking for a block");
            inner.wait_count += 1;
            inner = self.not_empty.wait(inner).unwrap();
            inner.wait_count -= 1;
            self.drained.notify_all();
        }
    }

    /// Release the current read block, freeing its space to the writer.
    pub fn release_read_block(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.has_read_block {
            return Err(Error::HasNoBlock);
        }
        inner.has_read_block = false;
        let len = inner.checked_out_size.take().unwrap_or(0);
        inner.total_used -= len;
        self.not_full.notify_one();
        Ok(())
    }

    /// Stop the buffer outright: all waiters wake and observe `STOPPED`,
    /// and subsequent acquires fail immediately. Blocks until all
    /// in-flight acquire calls have unblocked.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        debug!(wait_count = inner.wait_count, "stop: waking all waiters");
        inner.state = State::Stopped;
        self.not_full.notify_all();
        self.not_empty.notify_all();
        let _inner = self
            .drained
            .wait_while(inner, |i| i.wait_count > 0)
            .unwrap();
        debug!("stop: all waiters drained");
    }

    /// Stop accepting writes; the reader continues to drain queued blocks
    /// and then observes `STOPPED` once empty.
    pub fn stop_writing(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == State::Running {
            debug!("stop_writing: entering draining state");
            inner.state = State::Draining;
        }
        self.not_full.notify_all();
    }

    /// Consume the buffer, freeing its queued blocks. `Drop` already does
    /// this; this method exists so callers can follow the source's
    /// explicit `stopped → destroyed` lifecycle in their own code.
    pub fn destroy(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::thread;
    use test_log::test;

    #[test]
    fn write_then_read_round_trips_payload() {
        let buf = CircBuf::create(4096, 0).unwrap();
        let mut block = buf.get_write_block(5, false).unwrap();
        block.as_mut_slice().copy_from_slice(b"hello");
        buf.commit_write_block(block, 5).unwrap();

        let read = buf.get_read_block(false).unwrap();
        assert_eq!(read.as_slice(), b"hello");
        buf.release_read_block().unwrap();
    }

    #[test]
    fn block_larger_than_max_is_rejected() {
        let buf = CircBuf::create(100, 0).unwrap();
        let err = buf.get_write_block(1000, false).unwrap_err();
        assert!(matches!(err, Error::BlockTooLarge));
    }

    #[test]
    fn no_wait_would_block_when_full() {
        let buf = CircBuf::create(0, 64).unwrap();
        let block = buf.get_write_block(64, false).unwrap();
        buf.commit_write_block(block, 64).unwrap();
        let err = buf.get_write_block(1, true).unwrap_err();
        assert!(matches!(err, Error::WouldBlock));
    }

    #[test]
    fn stop_writing_drains_then_reports_stopped() {
        let buf = CircBuf::create(4096, 0).unwrap();
        let mut block = buf.get_write_block(3, false).unwrap();
        block.as_mut_slice().copy_from_slice(b"abc");
        buf.commit_write_block(block, 3).unwrap();
        buf.stop_writing();

        let read = buf.get_read_block(false).unwrap();
        assert_eq!(read.as_slice(), b"abc");
        buf.release_read_block().unwrap();

        let err = buf.get_read_block(false).unwrap_err();
        assert!(matches!(err, Error::Stopped));
    }

    #[test]
    fn stop_wakes_a_blocked_reader() {
        let buf = Arc::new(CircBuf::create(4096, 0).unwrap());
        let reader = Arc::clone(&buf);
        let handle = thread::spawn(move || reader.get_read_block(false));
        // Give the reader a chance to start blocking before stopping.
        thread::sleep(std::time::Duration::from_millis(50));
        buf.stop();
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, Error::Stopped));
    }

    #[test]
    fn fixed_mode_rejects_mismatched_size() {
        let buf = CircBuf::create_fixed(16, 4).unwrap();
        let err = buf.get_write_block(8, false).unwrap_err();
        assert!(matches!(err, Error::Input(_)));
    }
}
