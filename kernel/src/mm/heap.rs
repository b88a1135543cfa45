//! Kernel heap.
//!
//! A small bump-then-free heap carved out of page-allocator memory, managed
//! by `linked_list_allocator`'s free-list allocator. This is the crate's
//! `#[global_allocator]`, wired up in `lib.rs`.

use linked_list_allocator::LockedHeap;

use crate::config::PAGE_SIZE;
use crate::mm::frame_allocator::alloc_pages;

/// Kernel heap size: generous for an educational kernel's own bookkeeping
/// (thread/process tables, cache entries, page-table metadata) without
/// eating meaningfully into a QEMU `virt` instance's default RAM.
pub const HEAP_SIZE: usize = 2 * 1024 * 1024;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Reserves `HEAP_SIZE` bytes from the page allocator and hands them to the
/// global allocator. Must run after `mm::frame_allocator::init` and before
/// any `alloc`-dependent subsystem runs.
pub fn init() {
    let pages = HEAP_SIZE / PAGE_SIZE;
    let base = alloc_pages(pages);
    // SAFETY: `base` is `pages * PAGE_SIZE` bytes of memory freshly and
    // exclusively allocated from the page allocator, handed to the global
    // allocator exactly once before any allocation can occur.
    unsafe {
        ALLOCATOR.lock().init(base as *mut u8, pages * PAGE_SIZE);
    }
}
