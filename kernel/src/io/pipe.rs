//! In-kernel pipe: a fixed-capacity byte ring shared between a write end and
//! a read end, each reached through an ordinary `IoObject`. Blocking reads
//! wait for data or for every write end to close (yielding EOF); blocking
//! writes wait for room or fail once every read end has closed.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::cell::{Cell, UnsafeCell};

use super::IoSlots;
use crate::config::PAGE_SIZE;
use crate::error::{KernelError, KernelResult};
use crate::sched::{Condition, Lock};

const PIPE_CAPACITY: usize = PAGE_SIZE;

struct PipeInner {
    lock: Lock,
    buf: UnsafeCell<VecDeque<u8>>,
    readable: Condition,
    writable: Condition,
    write_ends: Cell<usize>,
    read_ends: Cell<usize>,
}

// SAFETY: `buf`/`write_ends`/`read_ends` are only touched while `lock` is
// held, which serializes access the same way every other lock-guarded
// structure in this kernel does.
unsafe impl Sync for PipeInner {}
unsafe impl Send for PipeInner {}

pub struct PipeWriteEnd(Arc<PipeInner>);
pub struct PipeReadEnd(Arc<PipeInner>);

/// Creates a connected pair: write end, read end, each starting with exactly
/// one reference (the fd about to be installed for it).
pub fn new_pipe() -> (PipeWriteEnd, PipeReadEnd) {
    let inner = Arc::new(PipeInner {
        lock: Lock::new(),
        buf: UnsafeCell::new(VecDeque::with_capacity(PIPE_CAPACITY)),
        readable: Condition::new(),
        writable: Condition::new(),
        write_ends: Cell::new(1),
        read_ends: Cell::new(1),
    });
    (PipeWriteEnd(inner.clone()), PipeReadEnd(inner))
}

impl IoSlots for PipeWriteEnd {
    fn close(&mut self) -> KernelResult<()> {
        self.0.lock.acquire();
        self.0.write_ends.set(self.0.write_ends.get() - 1);
        self.0.lock.release();
        self.0.readable.broadcast();
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> KernelResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            self.0.lock.acquire();
            if self.0.read_ends.get() == 0 {
                self.0.lock.release();
                return Err(KernelError::IoError);
            }
            // SAFETY: `lock` is held for the duration of this access.
            let ring = unsafe { &mut *self.0.buf.get() };
            let space = PIPE_CAPACITY - ring.len();
            if space == 0 {
                self.0.lock.release();
                self.0.writable.wait();
                continue;
            }
            let n = buf.len().min(space);
            ring.extend(buf[..n].iter().copied());
            self.0.lock.release();
            self.0.readable.broadcast();
            return Ok(n);
        }
    }
}

impl IoSlots for PipeReadEnd {
    fn close(&mut self) -> KernelResult<()> {
        self.0.lock.acquire();
        self.0.read_ends.set(self.0.read_ends.get() - 1);
        self.0.lock.release();
        self.0.writable.broadcast();
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> KernelResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            self.0.lock.acquire();
            // SAFETY: `lock` is held for the duration of this access.
            let ring = unsafe { &mut *self.0.buf.get() };
            if !ring.is_empty() {
                let n = buf.len().min(ring.len());
                for slot in buf[..n].iter_mut() {
                    *slot = ring.pop_front().unwrap();
                }
                self.0.lock.release();
                self.0.writable.broadcast();
                return Ok(n);
            }
            if self.0.write_ends.get() == 0 {
                self.0.lock.release();
                return Ok(0);
            }
            self.0.lock.release();
            self.0.readable.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn write_then_read_roundtrip() {
        let (mut w, mut r) = new_pipe();
        assert_eq!(w.write(b"hi").unwrap(), 2);
        let mut buf = [0u8; 4];
        assert_eq!(r.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"hi");
    }

    #[test_case]
    fn read_after_writer_closed_is_eof() {
        let (mut w, mut r) = new_pipe();
        w.close().unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(r.read(&mut buf).unwrap(), 0);
    }
}
