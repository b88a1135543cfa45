//! Seekable wrapper: layers a byte-granularity cursor over an
//! at-addressable endpoint with block granularity.

use super::{
    ioclose, ioctl, ioreadat, iowriteat, IoObject, IoSlots, IOCTL_GETBLKSZ, IOCTL_GETEND,
    IOCTL_GETPOS, IOCTL_SETEND, IOCTL_SETPOS,
};
use crate::error::{KernelError, KernelResult};

pub struct SeekableIo {
    backing: *mut IoObject,
    pos: u64,
    block_size: usize,
}

// SAFETY: `backing` is only dereferenced through the `io` free functions,
// which require the caller to already be holding a valid reference; this
// kernel has no cross-hart concurrency to race against.
unsafe impl Send for SeekableIo {}

impl SeekableIo {
    /// Wraps `backing`, taking ownership of the one reference passed in.
    ///
    /// # Safety
    /// `backing` must be a live `IoObject` pointer with at least one
    /// reference that is being transferred to the new wrapper.
    pub unsafe fn new(backing: *mut IoObject) -> KernelResult<Self> {
        // SAFETY: caller contract.
        let block_size = unsafe { ioctl(backing, IOCTL_GETBLKSZ, 0) }?;
        Ok(Self {
            backing,
            pos: 0,
            block_size: (block_size.max(1)) as usize,
        })
    }
}

impl IoSlots for SeekableIo {
    fn close(&mut self) -> KernelResult<()> {
        // SAFETY: `backing` holds the one reference transferred in `new`.
        unsafe { ioclose(self.backing) }
    }

    fn read(&mut self, buf: &mut [u8]) -> KernelResult<usize> {
        if buf.len() < self.block_size {
            return Err(KernelError::InvalidArgument);
        }
        let len = buf.len() - (buf.len() % self.block_size);
        // SAFETY: `backing` is live for the lifetime of this wrapper.
        let n = unsafe { ioreadat(self.backing, self.pos, &mut buf[..len]) }?;
        self.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> KernelResult<usize> {
        if buf.len() < self.block_size {
            return Err(KernelError::InvalidArgument);
        }
        let len = buf.len() - (buf.len() % self.block_size);
        // SAFETY: `backing` is live for the lifetime of this wrapper.
        let n = unsafe { iowriteat(self.backing, self.pos, &buf[..len]) }?;
        self.pos += n as u64;
        Ok(n)
    }

    fn readat(&mut self, pos: u64, buf: &mut [u8]) -> KernelResult<usize> {
        // SAFETY: `backing` is live for the lifetime of this wrapper.
        unsafe { ioreadat(self.backing, pos, buf) }
    }

    fn writeat(&mut self, pos: u64, buf: &[u8]) -> KernelResult<usize> {
        // SAFETY: `backing` is live for the lifetime of this wrapper.
        unsafe { iowriteat(self.backing, pos, buf) }
    }

    fn cntl(&mut self, cmd: u32, arg: i64) -> KernelResult<i64> {
        match cmd {
            // The wrapper always presents byte granularity; the backing
            // endpoint's own block size is never exposed above it.
            IOCTL_GETBLKSZ => Ok(1),
            IOCTL_GETPOS => Ok(self.pos as i64),
            IOCTL_SETPOS => {
                if arg < 0 || (arg as u64) % self.block_size as u64 != 0 {
                    return Err(KernelError::InvalidArgument);
                }
                // SAFETY: `backing` is live for the lifetime of this wrapper.
                let end = unsafe { ioctl(self.backing, IOCTL_GETEND, 0) }?;
                if arg > end {
                    return Err(KernelError::InvalidArgument);
                }
                self.pos = arg as u64;
                Ok(0)
            }
            // SAFETY: `backing` is live for the lifetime of this wrapper.
            IOCTL_GETEND => unsafe { ioctl(self.backing, IOCTL_GETEND, 0) },
            IOCTL_SETEND => unsafe { ioctl(self.backing, IOCTL_SETEND, arg) },
            _ => Err(KernelError::NotSupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{ioinit1, IoKind, MemoryIo};
    use super::*;

    #[test_case]
    fn setpos_rejects_past_end() {
        let backing = ioinit1(IoKind::Memory(MemoryIo::new(
            alloc::vec![0u8; 16].into_boxed_slice(),
        )));
        // SAFETY: freshly created, single reference, test-only.
        let mut s = unsafe { SeekableIo::new(backing) }.unwrap();
        assert!(s.cntl(IOCTL_SETPOS, 4).is_ok());
        assert!(s.cntl(IOCTL_SETPOS, 100).is_err());
        s.close().unwrap();
    }
}
