//! Block device abstraction.
//!
//! Every block device, virtio or RAM-backed, is reached through the same
//! at-addressable operation set the rest of the I/O layer uses:
//! `readat`/`writeat`/`cntl(GETBLKSZ|GETEND)`. Callers always pass a `pos`
//! aligned to the device's block size and a `buf` whose length is a multiple
//! of it.

use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::io::{IOCTL_GETBLKSZ, IOCTL_GETEND};

/// Block device trait, implemented by drivers and registered under
/// `DeviceEndpoint::Block`.
pub trait BlockDevice: Send + Sync {
    fn readat(&mut self, pos: u64, buf: &mut [u8]) -> KernelResult<usize>;
    fn writeat(&mut self, pos: u64, buf: &[u8]) -> KernelResult<usize>;
    fn cntl(&mut self, cmd: u32, arg: i64) -> KernelResult<i64>;
}

/// RAM-backed block device, used as a root filesystem backing store in
/// tests that don't depend on the virtio driver.
pub struct RamBlockDevice {
    block_size: usize,
    data: Vec<u8>,
}

impl RamBlockDevice {
    pub fn new(block_size: usize, block_count: u64) -> Self {
        Self {
            block_size,
            data: alloc::vec![0u8; block_size * block_count as usize],
        }
    }
}

impl BlockDevice for RamBlockDevice {
    fn readat(&mut self, pos: u64, buf: &mut [u8]) -> KernelResult<usize> {
        let pos = usize::try_from(pos).map_err(|_| KernelError::InvalidArgument)?;
        if pos % self.block_size != 0 || buf.len() % self.block_size != 0 {
            return Err(KernelError::InvalidArgument);
        }
        if pos > self.data.len() {
            return Err(KernelError::InvalidArgument);
        }
        let n = buf.len().min(self.data.len() - pos);
        buf[..n].copy_from_slice(&self.data[pos..pos + n]);
        Ok(n)
    }

    fn writeat(&mut self, pos: u64, buf: &[u8]) -> KernelResult<usize> {
        let pos = usize::try_from(pos).map_err(|_| KernelError::InvalidArgument)?;
        if pos % self.block_size != 0 || buf.len() % self.block_size != 0 {
            return Err(KernelError::InvalidArgument);
        }
        if pos > self.data.len() {
            return Err(KernelError::InvalidArgument);
        }
        let n = buf.len().min(self.data.len() - pos);
        self.data[pos..pos + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn cntl(&mut self, cmd: u32, _arg: i64) -> KernelResult<i64> {
        match cmd {
            IOCTL_GETBLKSZ => Ok(self.block_size as i64),
            IOCTL_GETEND => Ok(self.data.len() as i64),
            _ => Err(KernelError::NotSupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn ram_block_device_roundtrip() {
        let mut dev = RamBlockDevice::new(512, 4);
        let write_data = [0x42u8; 512];
        dev.writeat(512, &write_data).unwrap();
        let mut read_data = [0u8; 512];
        assert_eq!(dev.readat(512, &mut read_data).unwrap(), 512);
        assert_eq!(read_data, write_data);
    }

    #[test_case]
    fn misaligned_pos_rejected() {
        let mut dev = RamBlockDevice::new(512, 4);
        let mut buf = [0u8; 512];
        assert!(dev.readat(100, &mut buf).is_err());
    }
}
