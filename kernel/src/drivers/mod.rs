//! Device drivers and the named-device registry backing `DEVOPEN`.

pub mod console;
pub mod virtio;

use alloc::boxed::Box;

use crate::drivers::virtio::mmio::{try_init_mmio_blk, DEFAULT_BASES};
use crate::error::{KernelError, KernelResult};
use crate::fs::blockdev::BlockDevice;
use crate::io::IOCTL_GETBLKSZ;
use crate::sync::once_lock::GlobalState;
use console::CONSOLE;

static BLOCK_DEVICE: GlobalState<Box<dyn BlockDevice>> = GlobalState::new();

/// Probes the fixed virtio-mmio bases for a block device and, if found,
/// registers it as device instance `("blk", 0)`.
pub fn init() {
    for base in DEFAULT_BASES {
        if let Ok(dev) = try_init_mmio_blk(base) {
            let _ = BLOCK_DEVICE.init(Box::new(dev));
            crate::println!("[drivers] virtio-blk ready at {:#x}", base);
            return;
        }
    }
    crate::println!("[drivers] no virtio-blk device found");
}

/// Opens a named device instance for `DEVOPEN`. Only `("console", 0)` and
/// `("blk", 0)` exist; the kernel has no concept of additional instances of
/// either kind.
pub fn open_named(name: &str, inst: u32) -> KernelResult<DeviceEndpoint> {
    match (name, inst) {
        ("console", 0) => Ok(DeviceEndpoint::Console),
        ("blk", 0) if BLOCK_DEVICE.try_get().is_some() => Ok(DeviceEndpoint::Block),
        _ => Err(KernelError::NotFound),
    }
}

/// A device driver instance reached through the unified I/O object. The
/// console is a process-independent singleton; the block device similarly
/// has exactly one live instance, registered at boot by [`init`].
pub enum DeviceEndpoint {
    Console,
    Block,
}

// Not a shared trait impl: `IoSlots` is private to the `io` module subtree,
// which `drivers` lies outside of. `IoKind::Device` dispatches to these by
// name instead.
impl DeviceEndpoint {
    pub fn close(&mut self) -> KernelResult<()> {
        Ok(())
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> KernelResult<usize> {
        match self {
            DeviceEndpoint::Console => {
                let mut n = 0;
                while n < buf.len() {
                    match CONSOLE.try_getc() {
                        Some(b) => {
                            buf[n] = b;
                            n += 1;
                        }
                        None if n > 0 => break,
                        None => core::hint::spin_loop(),
                    }
                }
                Ok(n)
            }
            DeviceEndpoint::Block => Err(KernelError::NotSupported),
        }
    }

    pub(crate) fn write(&mut self, buf: &[u8]) -> KernelResult<usize> {
        match self {
            DeviceEndpoint::Console => {
                for &b in buf {
                    CONSOLE.putc(b);
                }
                Ok(buf.len())
            }
            DeviceEndpoint::Block => Err(KernelError::NotSupported),
        }
    }

    pub(crate) fn readat(&mut self, pos: u64, buf: &mut [u8]) -> KernelResult<usize> {
        match self {
            DeviceEndpoint::Console => Err(KernelError::NotSupported),
            DeviceEndpoint::Block => BLOCK_DEVICE
                .with_mut(|dev| dev.readat(pos, buf))
                .ok_or(KernelError::NotFound)?,
        }
    }

    pub(crate) fn writeat(&mut self, pos: u64, buf: &[u8]) -> KernelResult<usize> {
        match self {
            DeviceEndpoint::Console => Err(KernelError::NotSupported),
            DeviceEndpoint::Block => BLOCK_DEVICE
                .with_mut(|dev| dev.writeat(pos, buf))
                .ok_or(KernelError::NotFound)?,
        }
    }

    pub(crate) fn cntl(&mut self, cmd: u32, arg: i64) -> KernelResult<i64> {
        match self {
            DeviceEndpoint::Console if cmd == IOCTL_GETBLKSZ => Ok(1),
            DeviceEndpoint::Console => Err(KernelError::NotSupported),
            DeviceEndpoint::Block => BLOCK_DEVICE
                .with_mut(|dev| dev.cntl(cmd, arg))
                .ok_or(KernelError::NotFound)?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn unknown_device_name_not_found() {
        assert!(matches!(open_named("nope", 0), Err(KernelError::NotFound)));
    }
}
