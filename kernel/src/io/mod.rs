//! Unified I/O object.
//!
//! Every open device, file, memory buffer, and seekable wrapper is reached
//! through the same closed operation set: close/read/write/readat/writeat/
//! cntl. Rust has no safe pointer-subtraction downcast for the teacher's
//! vtable-and-subtraction C idiom, so `IoKind` is a small closed enum
//! instead of a trait object; `IoObject` carries the reference count.

pub mod memory;
pub mod pipe;
pub mod seekable;

use alloc::boxed::Box;
use core::cell::Cell;

pub use memory::MemoryIo;
pub use pipe::{new_pipe, PipeReadEnd, PipeWriteEnd};
pub use seekable::SeekableIo;

use crate::drivers::DeviceEndpoint;
use crate::error::{KernelError, KernelResult};
use crate::fs::ktfs::KtfsFile;

pub const IOCTL_GETBLKSZ: u32 = 1;
pub const IOCTL_GETPOS: u32 = 2;
pub const IOCTL_SETPOS: u32 = 3;
pub const IOCTL_GETEND: u32 = 4;
pub const IOCTL_SETEND: u32 = 5;

/// The closed set of operation slots. Any method left at its default means
/// "unsupported" for that kind.
trait IoSlots {
    fn close(&mut self) -> KernelResult<()> {
        Ok(())
    }
    fn read(&mut self, _buf: &mut [u8]) -> KernelResult<usize> {
        Err(KernelError::NotSupported)
    }
    fn write(&mut self, _buf: &[u8]) -> KernelResult<usize> {
        Err(KernelError::NotSupported)
    }
    fn readat(&mut self, _pos: u64, _buf: &mut [u8]) -> KernelResult<usize> {
        Err(KernelError::NotSupported)
    }
    fn writeat(&mut self, _pos: u64, _buf: &[u8]) -> KernelResult<usize> {
        Err(KernelError::NotSupported)
    }
    fn cntl(&mut self, _cmd: u32, _arg: i64) -> KernelResult<i64> {
        Err(KernelError::NotSupported)
    }
}

/// A sub-type of I/O object. Device driver instance, filesystem file, memory
/// buffer, or a seekable wrapper layered over one of the others.
pub enum IoKind {
    Device(DeviceEndpoint),
    KtfsFile(KtfsFile),
    Memory(MemoryIo),
    Seekable(SeekableIo),
    PipeWrite(PipeWriteEnd),
    PipeRead(PipeReadEnd),
}

impl IoSlots for IoKind {
    fn close(&mut self) -> KernelResult<()> {
        match self {
            IoKind::Device(d) => d.close(),
            IoKind::KtfsFile(f) => f.close(),
            IoKind::Memory(m) => m.close(),
            IoKind::Seekable(s) => s.close(),
            IoKind::PipeWrite(w) => w.close(),
            IoKind::PipeRead(r) => r.close(),
        }
    }
    fn read(&mut self, buf: &mut [u8]) -> KernelResult<usize> {
        match self {
            IoKind::Device(d) => d.read(buf),
            IoKind::KtfsFile(f) => f.read(buf),
            IoKind::Memory(m) => m.read(buf),
            IoKind::Seekable(s) => s.read(buf),
            IoKind::PipeWrite(w) => w.read(buf),
            IoKind::PipeRead(r) => r.read(buf),
        }
    }
    fn write(&mut self, buf: &[u8]) -> KernelResult<usize> {
        match self {
            IoKind::Device(d) => d.write(buf),
            IoKind::KtfsFile(f) => f.write(buf),
            IoKind::Memory(m) => m.write(buf),
            IoKind::Seekable(s) => s.write(buf),
            IoKind::PipeWrite(w) => w.write(buf),
            IoKind::PipeRead(r) => r.write(buf),
        }
    }
    fn readat(&mut self, pos: u64, buf: &mut [u8]) -> KernelResult<usize> {
        match self {
            IoKind::Device(d) => d.readat(pos, buf),
            IoKind::KtfsFile(f) => f.readat(pos, buf),
            IoKind::Memory(m) => m.readat(pos, buf),
            IoKind::Seekable(s) => s.readat(pos, buf),
            IoKind::PipeWrite(w) => w.readat(pos, buf),
            IoKind::PipeRead(r) => r.readat(pos, buf),
        }
    }
    fn writeat(&mut self, pos: u64, buf: &[u8]) -> KernelResult<usize> {
        match self {
            IoKind::Device(d) => d.writeat(pos, buf),
            IoKind::KtfsFile(f) => f.writeat(pos, buf),
            IoKind::Memory(m) => m.writeat(pos, buf),
            IoKind::Seekable(s) => s.writeat(pos, buf),
            IoKind::PipeWrite(w) => w.writeat(pos, buf),
            IoKind::PipeRead(r) => r.writeat(pos, buf),
        }
    }
    fn cntl(&mut self, cmd: u32, arg: i64) -> KernelResult<i64> {
        match self {
            IoKind::Device(d) => d.cntl(cmd, arg),
            IoKind::KtfsFile(f) => f.cntl(cmd, arg),
            IoKind::Memory(m) => m.cntl(cmd, arg),
            IoKind::Seekable(s) => s.cntl(cmd, arg),
            IoKind::PipeWrite(w) => w.cntl(cmd, arg),
            IoKind::PipeRead(r) => r.cntl(cmd, arg),
        }
    }
}

pub struct IoObject {
    kind: IoKind,
    refcount: Cell<usize>,
}

/// Allocates an I/O object with refcount 0; the caller must add references
/// explicitly (`ioaddref`) before handing out any copy of the pointer.
pub fn ioinit0(kind: IoKind) -> *mut IoObject {
    Box::into_raw(Box::new(IoObject {
        kind,
        refcount: Cell::new(0),
    }))
}

/// Allocates an I/O object with refcount 1, for the common case of a single
/// initial owner.
pub fn ioinit1(kind: IoKind) -> *mut IoObject {
    Box::into_raw(Box::new(IoObject {
        kind,
        refcount: Cell::new(1),
    }))
}

/// # Safety
/// `io` must be a live pointer previously returned by `ioinit0`/`ioinit1`.
pub unsafe fn ioaddref(io: *mut IoObject) {
    // SAFETY: caller contract.
    let obj = unsafe { &*io };
    obj.refcount.set(obj.refcount.get() + 1);
}

/// Drops one reference; when the count reaches zero, calls the kind's
/// `close` and frees the object.
///
/// # Safety
/// `io` must be a live pointer previously returned by `ioinit0`/`ioinit1`
/// and must not be used again after this call if the count reaches zero.
pub unsafe fn ioclose(io: *mut IoObject) -> KernelResult<()> {
    // SAFETY: caller contract.
    let count = unsafe { &*io }.refcount.get();
    if count == 0 {
        return Err(KernelError::InvalidArgument);
    }
    let count = count - 1;
    // SAFETY: caller contract.
    unsafe { &*io }.refcount.set(count);
    if count == 0 {
        // SAFETY: last reference; reclaiming via Box::from_raw matches the
        // Box::into_raw used to create it.
        let mut boxed = unsafe { Box::from_raw(io) };
        boxed.kind.close()
    } else {
        Ok(())
    }
}

/// # Safety
/// `io` must be a live pointer with at least one outstanding reference.
pub unsafe fn ioread(io: *mut IoObject, buf: &mut [u8]) -> KernelResult<usize> {
    // SAFETY: caller contract.
    unsafe { &mut *io }.kind.read(buf)
}

/// # Safety
/// `io` must be a live pointer with at least one outstanding reference.
pub unsafe fn iowrite(io: *mut IoObject, buf: &[u8]) -> KernelResult<usize> {
    // SAFETY: caller contract.
    unsafe { &mut *io }.kind.write(buf)
}

/// Reads until `buf` is full or the source returns 0 (end of data).
///
/// # Safety
/// `io` must be a live pointer with at least one outstanding reference.
pub unsafe fn iofill(io: *mut IoObject, buf: &mut [u8]) -> KernelResult<usize> {
    let mut total = 0;
    while total < buf.len() {
        // SAFETY: caller contract, forwarded each iteration.
        let n = unsafe { ioread(io, &mut buf[total..]) }?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

/// # Safety
/// `io` must be a live pointer with at least one outstanding reference.
pub unsafe fn ioreadat(io: *mut IoObject, pos: u64, buf: &mut [u8]) -> KernelResult<usize> {
    // SAFETY: caller contract.
    unsafe { &mut *io }.kind.readat(pos, buf)
}

/// # Safety
/// `io` must be a live pointer with at least one outstanding reference.
pub unsafe fn iowriteat(io: *mut IoObject, pos: u64, buf: &[u8]) -> KernelResult<usize> {
    // SAFETY: caller contract.
    unsafe { &mut *io }.kind.writeat(pos, buf)
}

/// Dispatches to the kind's `cntl`. If the kind has no opinion on
/// `IOCTL_GETBLKSZ`, the default block size of 1 is returned instead of an
/// error.
///
/// # Safety
/// `io` must be a live pointer with at least one outstanding reference.
pub unsafe fn ioctl(io: *mut IoObject, cmd: u32, arg: i64) -> KernelResult<i64> {
    // SAFETY: caller contract.
    match unsafe { &mut *io }.kind.cntl(cmd, arg) {
        Err(KernelError::NotSupported) if cmd == IOCTL_GETBLKSZ => Ok(1),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn refcount_lifecycle_closes_on_zero() {
        let io = ioinit1(IoKind::Memory(MemoryIo::new(alloc::vec![0u8; 16].into_boxed_slice())));
        // SAFETY: freshly created, single reference, test-only.
        unsafe {
            ioaddref(io);
            assert!(ioclose(io).is_ok());
            assert!(ioclose(io).is_ok());
        }
    }
}
