//! Physical page-frame allocator.
//!
//! Free physical memory is tracked as a singly linked list of chunks. Each
//! chunk's header lives in the first bytes of its first page: `{ next, count }`.
//! Allocation is first-fit; there is no coalescing, since callers only ever
//! free runs they previously allocated as a unit.

use crate::config::PAGE_SIZE;
use crate::sync::once_lock::GlobalState;

/// Header written into the first page of every free chunk.
#[repr(C)]
struct ChunkHeader {
    next: *mut ChunkHeader,
    count: usize,
}

/// SAFETY: chunk headers only move between threads while the allocator's
/// lock is held.
unsafe impl Send for ChunkHeader {}

struct FreeList {
    head: *mut ChunkHeader,
    free_pages: usize,
}

/// SAFETY: access is always mediated by `FREE_LIST`'s internal mutex.
unsafe impl Send for FreeList {}

static FREE_LIST: GlobalState<FreeList> = GlobalState::new();

/// Registers `[base, base + len)` as free physical memory. `base` and `len`
/// must both be page-aligned. Called once at boot, before any other
/// subsystem calls `alloc_pages`.
pub fn init(base: usize, len: usize) {
    assert_eq!(base % PAGE_SIZE, 0, "frame allocator base must be page-aligned");
    assert_eq!(len % PAGE_SIZE, 0, "frame allocator length must be page-aligned");
    let count = len / PAGE_SIZE;
    let header = base as *mut ChunkHeader;
    // SAFETY: `base` is a valid, exclusively-owned, page-aligned physical
    // range handed to us by the boot code; nothing else has touched it yet.
    unsafe {
        header.write(ChunkHeader {
            next: core::ptr::null_mut(),
            count,
        });
    }
    FREE_LIST
        .init(FreeList {
            head: header,
            free_pages: count,
        })
        .unwrap_or_else(|_| panic!("frame allocator initialized twice"));
}

/// Allocates `n` contiguous pages and returns the base physical address.
///
/// There is no backing store beyond physical RAM, so exhaustion is fatal:
/// callers that cannot tolerate it should check `free_page_count` first
/// (e.g. address-space clone, which needs a known worst case up front).
pub fn alloc_pages(n: usize) -> usize {
    assert!(n > 0);
    FREE_LIST
        .with_mut(|list| {
            let mut prev: *mut *mut ChunkHeader = &mut list.head;
            loop {
                // SAFETY: `prev` always points at either `list.head` or the
                // `next` field of a chunk header previously written by
                // `init`/`free_pages`, both of which maintain a well-formed
                // singly linked list.
                let cur = unsafe { *prev };
                if cur.is_null() {
                    panic!("frame allocator exhausted: requested {n} pages, none available");
                }
                // SAFETY: `cur` is non-null and was installed by `init` or
                // `free_pages`, both of which write a fully initialized
                // `ChunkHeader` before linking it in.
                let header = unsafe { &mut *cur };
                if header.count >= n {
                    let base = cur as usize;
                    let remaining = header.count - n;
                    let next = header.next;
                    if remaining == 0 {
                        // SAFETY: `prev` points at a valid link slot owned by
                        // this list.
                        unsafe { *prev = next };
                    } else {
                        let new_base = base + n * PAGE_SIZE;
                        let new_header = new_base as *mut ChunkHeader;
                        // SAFETY: `new_base` lies strictly inside the chunk
                        // being carved, which this allocator exclusively owns.
                        unsafe {
                            new_header.write(ChunkHeader {
                                next,
                                count: remaining,
                            });
                            *prev = new_header;
                        }
                    }
                    list.free_pages -= n;
                    return base;
                }
                prev = &mut header.next;
            }
        })
        .expect("frame allocator not initialized")
}

/// Returns `n` pages starting at `p` to the free list. `p` must be
/// page-aligned and must name a run the caller legitimately owns.
pub fn free_pages(p: usize, n: usize) {
    assert_eq!(p % PAGE_SIZE, 0, "freed address must be page-aligned");
    assert!(n > 0);
    FREE_LIST
        .with_mut(|list| {
            let header = p as *mut ChunkHeader;
            // SAFETY: `p` is caller-owned, page-aligned physical memory of at
            // least one page, per this function's contract.
            unsafe {
                header.write(ChunkHeader {
                    next: list.head,
                    count: n,
                });
            }
            list.head = header;
            list.free_pages += n;
        })
        .expect("frame allocator not initialized");
}

/// Total number of free pages across all chunks.
pub fn free_page_count() -> usize {
    FREE_LIST
        .with(|list| list.free_pages)
        .expect("frame allocator not initialized")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn alloc_free_and_first_fit() {
        let mut buf = alloc::vec![0u8; 96 * PAGE_SIZE];
        let raw = buf.as_mut_ptr() as usize;
        let base = (raw + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        init(base, 64 * PAGE_SIZE);

        let total = free_page_count();
        assert_eq!(total, 64);

        let p = alloc_pages(3);
        assert_eq!(p, base);
        assert_eq!(free_page_count(), total - 3);

        let a = alloc_pages(4);
        let b = alloc_pages(8);
        assert_ne!(a, b);
        assert_eq!(free_page_count(), total - 3 - 4 - 8);

        free_pages(a, 4);
        free_pages(b, 8);
        free_pages(p, 3);
        assert_eq!(free_page_count(), total);
    }
}
