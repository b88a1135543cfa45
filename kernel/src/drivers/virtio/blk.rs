//! Virtio-blk device driver.
//!
//! Implements a block device driver for virtio-blk over the MMIO transport
//! (virtio spec section 5.2), the only transport QEMU's RISC-V `virt`
//! machine exposes.
//!
//! # Virtio-blk request format
//!
//! Each request is a three-descriptor chain:
//!
//! 1. **Header** (device-readable): `VirtioBlkReqHeader` with request type +
//!    sector
//! 2. **Data** (device-readable for write, device-writable for read): sector
//!    data
//! 3. **Status** (device-writable): single byte result (0 = OK, 1 = IOERR, 2 =
//!    UNSUPP)

#![allow(dead_code)]

use core::sync::atomic::{self, Ordering};

use super::mmio::VirtioMmioTransport;
use super::queue::{VirtQueue, VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE};
use crate::config::PAGE_SIZE;
use crate::error::{KernelError, KernelResult};
use crate::fs::blockdev::BlockDevice;
use crate::io::{IOCTL_GETBLKSZ, IOCTL_GETEND};
use crate::mm::frame_allocator::{alloc_pages, free_pages};

/// Block size in bytes (standard sector).
pub const BLOCK_SIZE: usize = 512;

/// Virtio-blk feature bits (virtio spec 5.2.3).
pub mod features {
    pub const VIRTIO_BLK_F_SIZE_MAX: u32 = 1 << 1;
    pub const VIRTIO_BLK_F_SEG_MAX: u32 = 1 << 2;
    pub const VIRTIO_BLK_F_GEOMETRY: u32 = 1 << 4;
    pub const VIRTIO_BLK_F_RO: u32 = 1 << 5;
    pub const VIRTIO_BLK_F_BLK_SIZE: u32 = 1 << 6;
    pub const VIRTIO_BLK_F_FLUSH: u32 = 1 << 9;
}

/// Virtio-blk request types (virtio spec 5.2.6).
mod req_type {
    pub const VIRTIO_BLK_T_IN: u32 = 0;
    pub const VIRTIO_BLK_T_OUT: u32 = 1;
}

/// Virtio-blk status values (returned in the status byte).
mod blk_status {
    pub const VIRTIO_BLK_S_OK: u8 = 0;
    pub const VIRTIO_BLK_S_IOERR: u8 = 1;
    pub const VIRTIO_BLK_S_UNSUPP: u8 = 2;
}

/// Virtio-blk request header, sent as the first descriptor in each request
/// chain.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct VirtioBlkReqHeader {
    type_: u32,
    reserved: u32,
    sector: u64,
}

/// A DMA buffer for a single virtio-blk request: header, sector data, and
/// status byte packed into one page. The kernel's identity map means the
/// physical base doubles as the kernel-virtual pointer.
struct RequestBuffer {
    base: usize,
    header_phys: u64,
    data_phys: u64,
    status_phys: u64,
    data_virt: usize,
    status_virt: usize,
}

impl RequestBuffer {
    fn new(data_len: usize) -> KernelResult<Self> {
        let total = core::mem::size_of::<VirtioBlkReqHeader>() + data_len + 1;
        if total > PAGE_SIZE {
            return Err(KernelError::InvalidArgument);
        }

        let base = alloc_pages(1);
        // SAFETY: `base` is one freshly allocated, exclusively owned page.
        unsafe { core::ptr::write_bytes(base as *mut u8, 0, PAGE_SIZE) };

        let header_offset = 0;
        let data_offset = core::mem::size_of::<VirtioBlkReqHeader>();
        let status_offset = data_offset + data_len;

        Ok(Self {
            base,
            header_phys: (base + header_offset) as u64,
            data_phys: (base + data_offset) as u64,
            status_phys: (base + status_offset) as u64,
            data_virt: base + data_offset,
            status_virt: base + status_offset,
        })
    }

    fn write_header(&self, type_: u32, sector: u64) {
        let header = VirtioBlkReqHeader {
            type_,
            reserved: 0,
            sector,
        };
        // SAFETY: `header_phys == base` points into the page this buffer owns.
        unsafe {
            core::ptr::write_volatile(self.base as *mut VirtioBlkReqHeader, header);
        }
    }

    fn write_data(&self, data: &[u8]) {
        // SAFETY: `data_virt` has `data.len()` bytes available (checked at
        // construction against the single-page bound).
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), self.data_virt as *mut u8, data.len());
        }
    }

    fn read_data(&self, buf: &mut [u8]) {
        // SAFETY: `data_virt` holds data the device wrote before posting the
        // used-ring entry this call is gated on.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.data_virt as *const u8,
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
    }

    fn read_status(&self) -> u8 {
        // SAFETY: `status_virt` holds a byte the device wrote.
        unsafe { core::ptr::read_volatile(self.status_virt as *const u8) }
    }
}

impl Drop for RequestBuffer {
    fn drop(&mut self) {
        free_pages(self.base, 1);
    }
}

/// Virtio block device reachable over MMIO.
///
/// Manages a single virtio-blk device with one request virtqueue (queue 0).
pub struct VirtioBlkDevice {
    transport: VirtioMmioTransport,
    queue: VirtQueue,
    capacity_sectors: u64,
    read_only: bool,
}

impl VirtioBlkDevice {
    /// Construct from an already-negotiated MMIO transport and queue; see
    /// [`super::mmio::try_init_mmio_blk`] for the handshake that produces
    /// these.
    pub(super) fn from_mmio(
        transport: VirtioMmioTransport,
        queue: VirtQueue,
        capacity_sectors: u64,
        read_only: bool,
    ) -> Self {
        Self {
            transport,
            queue,
            capacity_sectors,
            read_only,
        }
    }

    pub fn capacity_sectors(&self) -> u64 {
        self.capacity_sectors
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_sectors * BLOCK_SIZE as u64
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Reads a single 512-byte sector. `buf` must be at least `BLOCK_SIZE`.
    pub fn read_block(&mut self, block_num: u64, buf: &mut [u8]) -> KernelResult<()> {
        if buf.len() < BLOCK_SIZE || block_num >= self.capacity_sectors {
            return Err(KernelError::InvalidArgument);
        }
        self.do_request(req_type::VIRTIO_BLK_T_IN, block_num, Some(buf), None)
    }

    /// Writes a single 512-byte sector. `data` must be at least `BLOCK_SIZE`.
    pub fn write_block(&mut self, block_num: u64, data: &[u8]) -> KernelResult<()> {
        if self.read_only {
            return Err(KernelError::AccessDenied);
        }
        if data.len() < BLOCK_SIZE || block_num >= self.capacity_sectors {
            return Err(KernelError::InvalidArgument);
        }
        self.do_request(req_type::VIRTIO_BLK_T_OUT, block_num, None, Some(data))
    }

    /// Submits a single-sector request and polls for completion.
    fn do_request(
        &mut self,
        type_: u32,
        sector: u64,
        read_buf: Option<&mut [u8]>,
        write_data: Option<&[u8]>,
    ) -> KernelResult<()> {
        let data_len = BLOCK_SIZE;
        let req_buf = RequestBuffer::new(data_len)?;
        req_buf.write_header(type_, sector);
        if let Some(data) = write_data {
            req_buf.write_data(&data[..data_len]);
        }

        let desc_header = self.queue.alloc_desc().ok_or(KernelError::OutOfMemory)?;
        let desc_data = match self.queue.alloc_desc() {
            Some(d) => d,
            None => {
                self.queue.free_desc(desc_header);
                return Err(KernelError::OutOfMemory);
            }
        };
        let desc_status = match self.queue.alloc_desc() {
            Some(d) => d,
            None => {
                self.queue.free_desc(desc_header);
                self.queue.free_desc(desc_data);
                return Err(KernelError::OutOfMemory);
            }
        };

        // Descriptor 0: header (device-readable, chained to data).
        // SAFETY: all three descriptor indices were just allocated; the
        // physical addresses point into `req_buf`'s page, which outlives the
        // request (dropped only after the chain is freed below).
        unsafe {
            self.queue.write_desc(
                desc_header,
                req_buf.header_phys,
                core::mem::size_of::<VirtioBlkReqHeader>() as u32,
                VIRTQ_DESC_F_NEXT,
                desc_data,
            );
        }

        let data_flags = if type_ == req_type::VIRTIO_BLK_T_IN {
            VIRTQ_DESC_F_WRITE | VIRTQ_DESC_F_NEXT
        } else {
            VIRTQ_DESC_F_NEXT
        };
        // SAFETY: see above.
        unsafe {
            self.queue
                .write_desc(desc_data, req_buf.data_phys, data_len as u32, data_flags, desc_status);
        }

        // SAFETY: see above.
        unsafe {
            self.queue
                .write_desc(desc_status, req_buf.status_phys, 1, VIRTQ_DESC_F_WRITE, 0);
        }

        atomic::fence(Ordering::Release);
        self.queue.push_avail(desc_header);
        self.transport.notify_queue(0);

        let mut spins: u32 = 0;
        const MAX_SPINS: u32 = 10_000_000;
        while !self.queue.has_used() {
            core::hint::spin_loop();
            spins += 1;
            if spins >= MAX_SPINS {
                self.queue.free_chain(desc_header);
                return Err(KernelError::IoError);
            }
        }
        self.queue.poll_used();

        let status = req_buf.read_status();
        match status {
            blk_status::VIRTIO_BLK_S_OK => {}
            blk_status::VIRTIO_BLK_S_IOERR => {
                self.queue.free_chain(desc_header);
                return Err(KernelError::IoError);
            }
            blk_status::VIRTIO_BLK_S_UNSUPP => {
                self.queue.free_chain(desc_header);
                return Err(KernelError::NotSupported);
            }
            _ => {
                self.queue.free_chain(desc_header);
                return Err(KernelError::IoError);
            }
        }

        if let Some(buf) = read_buf {
            req_buf.read_data(&mut buf[..data_len]);
        }
        self.queue.free_chain(desc_header);
        Ok(())
    }
}

impl BlockDevice for VirtioBlkDevice {
    fn readat(&mut self, pos: u64, buf: &mut [u8]) -> KernelResult<usize> {
        if pos % BLOCK_SIZE as u64 != 0 || buf.len() % BLOCK_SIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let mut done = 0;
        while done < buf.len() {
            let sector = pos / BLOCK_SIZE as u64 + (done / BLOCK_SIZE) as u64;
            if sector >= self.capacity_sectors {
                break;
            }
            self.read_block(sector, &mut buf[done..done + BLOCK_SIZE])?;
            done += BLOCK_SIZE;
        }
        Ok(done)
    }

    fn writeat(&mut self, pos: u64, buf: &[u8]) -> KernelResult<usize> {
        if pos % BLOCK_SIZE as u64 != 0 || buf.len() % BLOCK_SIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let mut done = 0;
        while done < buf.len() {
            let sector = pos / BLOCK_SIZE as u64 + (done / BLOCK_SIZE) as u64;
            if sector >= self.capacity_sectors {
                break;
            }
            self.write_block(sector, &buf[done..done + BLOCK_SIZE])?;
            done += BLOCK_SIZE;
        }
        Ok(done)
    }

    fn cntl(&mut self, cmd: u32, _arg: i64) -> KernelResult<i64> {
        match cmd {
            IOCTL_GETBLKSZ => Ok(BLOCK_SIZE as i64),
            IOCTL_GETEND => Ok(self.capacity_bytes() as i64),
            _ => Err(KernelError::NotSupported),
        }
    }
}
