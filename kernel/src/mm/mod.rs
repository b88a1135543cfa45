//! Physical and virtual memory management: the page-frame allocator, Sv39
//! page tables, address-space lifecycle, and the kernel heap.

pub mod address_space;
pub mod frame_allocator;
pub mod heap;
pub mod page_table;

pub use address_space::MsTag;
pub use page_table::{PteFlags, PAGE_TABLE_ENTRIES};

use crate::config::{PAGE_SIZE, PHYS_MEM_BASE};

/// Total physical RAM QEMU's `virt` machine provides by default. A real
/// deployment would read this from the firmware-provided device tree
/// instead of hardcoding it.
const RAM_SIZE: usize = 128 * 1024 * 1024;

extern "C" {
    /// First address past the kernel image, provided by `link.ld`.
    static _end: u8;
}

/// Brings up memory management in the order every later subsystem assumes:
/// frame allocator seeded with everything past the kernel image, then the
/// boot page table and kernel identity map, then the kernel heap.
pub fn init() {
    // SAFETY: `_end` is a linker-defined symbol; only its address is used,
    // never dereferenced.
    let kernel_end = unsafe { &_end as *const u8 as usize };
    let free_base = (kernel_end + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let free_len = (PHYS_MEM_BASE + RAM_SIZE) - free_base;
    frame_allocator::init(free_base, free_len);
    address_space::init();
    heap::init();
}
