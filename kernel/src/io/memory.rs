//! Memory-backed I/O object: a fixed buffer exposed as an at-addressable
//! endpoint. The wrapper owns the buffer outright.

use alloc::boxed::Box;

use super::{IoSlots, IOCTL_GETBLKSZ, IOCTL_GETEND};
use crate::error::{KernelError, KernelResult};

pub struct MemoryIo {
    buf: Box<[u8]>,
}

impl MemoryIo {
    pub fn new(buf: Box<[u8]>) -> Self {
        Self { buf }
    }
}

impl IoSlots for MemoryIo {
    fn readat(&mut self, pos: u64, buf: &mut [u8]) -> KernelResult<usize> {
        let pos = usize::try_from(pos).map_err(|_| KernelError::InvalidArgument)?;
        if pos > self.buf.len() {
            return Err(KernelError::InvalidArgument);
        }
        let n = buf.len().min(self.buf.len() - pos);
        buf[..n].copy_from_slice(&self.buf[pos..pos + n]);
        Ok(n)
    }

    fn writeat(&mut self, pos: u64, buf: &[u8]) -> KernelResult<usize> {
        let pos = usize::try_from(pos).map_err(|_| KernelError::InvalidArgument)?;
        if pos > self.buf.len() {
            return Err(KernelError::InvalidArgument);
        }
        let n = buf.len().min(self.buf.len() - pos);
        self.buf[pos..pos + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn cntl(&mut self, cmd: u32, _arg: i64) -> KernelResult<i64> {
        match cmd {
            IOCTL_GETBLKSZ => Ok(1),
            IOCTL_GETEND => Ok(self.buf.len() as i64),
            _ => Err(KernelError::NotSupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn readat_writeat_roundtrip() {
        let mut io = MemoryIo::new(alloc::vec![0u8; 8].into_boxed_slice());
        io.writeat(2, &[1, 2, 3]).unwrap();
        let mut out = [0u8; 3];
        assert_eq!(io.readat(2, &mut out).unwrap(), 3);
        assert_eq!(out, [1, 2, 3]);
    }

    #[test_case]
    fn out_of_bounds_pos_rejected() {
        let mut io = MemoryIo::new(alloc::vec![0u8; 4].into_boxed_slice());
        let mut out = [0u8; 1];
        assert!(io.readat(5, &mut out).is_err());
    }
}
