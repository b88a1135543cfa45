//! Address-space lifecycle: Sv39 root tags, clone/reset/discard, and the
//! mapping primitives the rest of the kernel builds on.
//!
//! An address space is identified by an opaque [`MsTag`] — enough bits to
//! install directly into `satp`. Kernel space is the reserved asid-0 tag
//! created once at boot; every user process clones a fresh tag from the
//! currently active one.

use core::arch::asm;

use crate::config::{PAGE_SIZE, PHYS_MEM_BASE, UMEM_END, UMEM_START};
use crate::error::{KernelError, KernelResult};
use crate::mm::frame_allocator::{alloc_pages, free_pages};
use crate::mm::page_table::{table_at, table_at_mut, PageTable, PteFlags, VirtAddrParts};
use crate::sync::once_lock::GlobalState;

/// Sv39 `satp` MODE field.
const SATP_MODE_SV39: u64 = 8;
const SATP_MODE_SHIFT: u32 = 60;
const SATP_ASID_SHIFT: u32 = 44;
const SATP_ASID_MASK: u64 = 0xFFFF;
const SATP_PPN_MASK: u64 = 0xFFF_FFFF_FFFF; // 44 bits

/// Amount of physical RAM the kernel identity-maps as one global gigapage
/// (1 GiB), generous for a QEMU `virt` instance.
const KERNEL_IDENTITY_MAP_SIZE: usize = 1 << 30;

/// Opaque address-space tag: paging mode + asid + root table PPN, laid out
/// exactly as the `satp` CSR expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsTag(u64);

impl MsTag {
    fn new(asid: u16, root_paddr: usize) -> Self {
        let ppn = (root_paddr as u64 >> 12) & SATP_PPN_MASK;
        Self((SATP_MODE_SV39 << SATP_MODE_SHIFT) | ((asid as u64) << SATP_ASID_SHIFT) | ppn)
    }

    pub fn root_paddr(self) -> usize {
        ((self.0 & SATP_PPN_MASK) << 12) as usize
    }

    pub fn asid(self) -> u16 {
        ((self.0 >> SATP_ASID_SHIFT) & SATP_ASID_MASK) as u16
    }

    fn satp_value(self) -> u64 {
        self.0
    }
}

static KERNEL_TAG: GlobalState<MsTag> = GlobalState::new();
static ACTIVE_TAG: GlobalState<MsTag> = GlobalState::new();
static NEXT_ASID: GlobalState<u16> = GlobalState::new();

/// Builds the boot page table: a single global gigapage leaf identity-mapping
/// physical RAM, and installs it as both the kernel tag and the active space.
/// Must run after the frame allocator is initialized and before any user
/// address space is created.
pub fn init() {
    let root_paddr = alloc_pages(1);
    // SAFETY: `root_paddr` was just allocated exclusively by this call and is
    // page-aligned.
    let root = unsafe { table_at_mut(root_paddr) };
    root.zero();

    debug_assert_eq!(PHYS_MEM_BASE % KERNEL_IDENTITY_MAP_SIZE, 0);
    let parts = VirtAddrParts::new(PHYS_MEM_BASE);
    let flags = PteFlags::READ | PteFlags::WRITE | PteFlags::EXEC | PteFlags::GLOBAL;
    root[parts.vpn[0]].set_leaf(PHYS_MEM_BASE, flags);

    let tag = MsTag::new(0, root_paddr);
    KERNEL_TAG.init(tag).unwrap_or_else(|_| panic!("address space initialized twice"));
    ACTIVE_TAG.init(tag).unwrap_or_else(|_| panic!("address space initialized twice"));
    NEXT_ASID.init(1).unwrap_or_else(|_| panic!("address space initialized twice"));
    switch_mspace(tag);

    // `validate_vptr`/`validate_vstr` dereference user pages directly from
    // S-mode (there is one page table per process, shared by kernel and user
    // code running on it); SUM (bit 18) must stay set for the kernel's own
    // lifetime to permit that.
    const SSTATUS_SUM: usize = 1 << 18;
    // SAFETY: setting SUM only affects whether S-mode may access U-pages;
    // valid unconditionally.
    unsafe { asm!("csrs sstatus, {m}", m = in(reg) SSTATUS_SUM) };
}

pub fn kernel_tag() -> MsTag {
    KERNEL_TAG.with(|t| *t).expect("mm::address_space not initialized")
}

pub fn active_mspace() -> MsTag {
    ACTIVE_TAG.with(|t| *t).expect("mm::address_space not initialized")
}

/// Installs `tag` into `satp` and flushes the TLB.
pub fn switch_mspace(tag: MsTag) {
    ACTIVE_TAG.with_mut(|t| *t = tag);
    // SAFETY: `tag` encodes a valid Sv39 root table previously built by
    // `init` or `clone_active_mspace`; writing satp and fencing is the
    // documented way to switch translation contexts on RISC-V.
    unsafe {
        asm!("csrw satp, {0}", "sfence.vma", in(reg) tag.satp_value());
    }
}

fn next_asid() -> u16 {
    NEXT_ASID
        .with_mut(|n| {
            let cur = *n;
            let next = if cur >= u16::MAX - 1 { 1 } else { cur + 1 };
            *n = next;
            cur
        })
        .expect("mm::address_space not initialized")
}

/// Walks to (allocating if needed) the level-0 entry for `vaddr` in the table
/// rooted at `root_paddr`, then calls `f` with a mutable reference to it.
fn walk_leaf_mut<R>(root_paddr: usize, vaddr: usize, alloc_missing: bool, f: impl FnOnce(&mut PageTable, usize) -> R) -> Option<R> {
    let parts = VirtAddrParts::new(vaddr);
    let mut table_paddr = root_paddr;
    for level in 0..2 {
        // SAFETY: `table_paddr` always names a live page table: the root on
        // entry, or a child table just installed/validated below.
        let table = unsafe { table_at_mut(table_paddr) };
        let idx = parts.vpn[level];
        if table[idx].is_unused() {
            if !alloc_missing {
                return None;
            }
            let child_paddr = alloc_pages(1);
            // SAFETY: freshly allocated, exclusively owned page.
            unsafe { table_at_mut(child_paddr) }.zero();
            table[idx].set_child(child_paddr);
        } else if table[idx].is_leaf() {
            // A large page already covers this range; nothing finer to walk.
            return None;
        }
        table_paddr = table[idx].addr();
    }
    // SAFETY: `table_paddr` names the level-0 table reached above.
    let leaf_table = unsafe { table_at_mut(table_paddr) };
    Some(f(leaf_table, parts.vpn[2]))
}

/// Installs a single 4 KiB mapping `vaddr -> paddr` in the active space.
pub fn map_page(vaddr: usize, paddr: usize, flags: PteFlags) {
    assert_eq!(vaddr % PAGE_SIZE, 0);
    assert_eq!(paddr % PAGE_SIZE, 0);
    let root = active_mspace().root_paddr();
    walk_leaf_mut(root, vaddr, true, |table, idx| {
        table[idx].set_leaf(paddr, flags | PteFlags::ACCESS | PteFlags::DIRTY);
    })
    .expect("map_page: vaddr already covered by a large page");
}

/// Maps `size` bytes starting at `vaddr` to the identity-offset physical
/// range starting at `paddr`.
pub fn map_range(vaddr: usize, size: usize, paddr: usize, flags: PteFlags) {
    assert_eq!(vaddr % PAGE_SIZE, 0);
    assert_eq!(size % PAGE_SIZE, 0);
    let pages = size / PAGE_SIZE;
    for i in 0..pages {
        map_page(vaddr + i * PAGE_SIZE, paddr + i * PAGE_SIZE, flags);
    }
}

/// Allocates fresh zeroed physical pages and maps them across `[vaddr, vaddr+size)`.
pub fn alloc_and_map_range(vaddr: usize, size: usize, flags: PteFlags) {
    assert_eq!(vaddr % PAGE_SIZE, 0);
    assert_eq!(size % PAGE_SIZE, 0);
    let pages = size / PAGE_SIZE;
    for i in 0..pages {
        let frame = alloc_pages(1);
        // SAFETY: `frame` was just allocated and is exclusively owned; it is
        // one full page, matching the zeroing length.
        unsafe { core::ptr::write_bytes(frame as *mut u8, 0, PAGE_SIZE) };
        map_page(vaddr + i * PAGE_SIZE, frame, flags);
    }
}

/// Rewrites only the permission bits across an already-mapped range.
pub fn set_range_flags(vaddr: usize, size: usize, flags: PteFlags) {
    assert_eq!(vaddr % PAGE_SIZE, 0);
    assert_eq!(size % PAGE_SIZE, 0);
    let root = active_mspace().root_paddr();
    let pages = size / PAGE_SIZE;
    for i in 0..pages {
        let va = vaddr + i * PAGE_SIZE;
        walk_leaf_mut(root, va, false, |table, idx| {
            let paddr = table[idx].addr();
            table[idx].set_leaf(paddr, flags | PteFlags::ACCESS | PteFlags::DIRTY);
        });
    }
}

/// Unmaps `[vaddr, vaddr+size)` and returns the backing data pages.
pub fn unmap_and_free_range(vaddr: usize, size: usize) {
    assert_eq!(vaddr % PAGE_SIZE, 0);
    assert_eq!(size % PAGE_SIZE, 0);
    let root = active_mspace().root_paddr();
    let pages = size / PAGE_SIZE;
    for i in 0..pages {
        let va = vaddr + i * PAGE_SIZE;
        walk_leaf_mut(root, va, false, |table, idx| {
            if !table[idx].is_unused() {
                let paddr = table[idx].addr();
                table[idx].clear();
                free_pages(paddr, 1);
            }
        });
    }
    // SAFETY: `root` is the active space's own root table.
    unsafe {
        asm!("sfence.vma");
    }
}

/// Deep-copies the user half of the active space into a fresh root table
/// carrying a new asid. Global (kernel) entries are copied by value, sharing
/// the underlying pages.
pub fn clone_active_mspace() -> MsTag {
    let src_root_paddr = active_mspace().root_paddr();
    let dst_root_paddr = alloc_pages(1);
    // SAFETY: freshly allocated, exclusively owned page.
    unsafe { table_at_mut(dst_root_paddr) }.zero();

    // SAFETY: `src_root_paddr` is the live root of the active space.
    let src_root = unsafe { table_at(src_root_paddr) };
    // SAFETY: just zeroed above, exclusively owned.
    let dst_root = unsafe { table_at_mut(dst_root_paddr) };
    clone_table_level(src_root, dst_root, 2);

    MsTag::new(next_asid(), dst_root_paddr)
}

/// Recursively clones one table level. `level` is 2 at the root, 0 at leaves.
fn clone_table_level(src: &PageTable, dst: &mut PageTable, level: usize) {
    for i in 0..crate::mm::page_table::PAGE_TABLE_ENTRIES {
        let entry = src[i];
        if entry.is_unused() {
            continue;
        }
        if entry.flags().contains(PteFlags::GLOBAL) {
            // Kernel half: copy the PTE value verbatim, sharing the page(s).
            dst[i] = entry;
            continue;
        }
        if entry.is_leaf() {
            if level == 0 {
                // 4 KiB leaf: allocate a fresh page and copy contents.
                let new_page = alloc_pages(1);
                // SAFETY: `entry.addr()` is a live mapped data page owned by
                // the source space; `new_page` is freshly allocated and
                // exclusively owned; both are exactly one page.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        entry.addr() as *const u8,
                        new_page as *mut u8,
                        PAGE_SIZE,
                    );
                }
                dst[i].set_leaf(new_page, entry.flags());
            } else {
                // Large-page (megapage) leaf: share directly.
                dst[i] = entry;
            }
            continue;
        }
        // Non-leaf: recurse into a freshly allocated child table.
        let child_paddr = alloc_pages(1);
        // SAFETY: freshly allocated, exclusively owned page.
        unsafe { table_at_mut(child_paddr) }.zero();
        dst[i].set_child(child_paddr);
        // SAFETY: `entry.addr()` names the live child table at this level.
        let src_child = unsafe { table_at(entry.addr()) };
        // SAFETY: just allocated and linked above.
        let dst_child = unsafe { table_at_mut(child_paddr) };
        clone_table_level(src_child, dst_child, level - 1);
    }
}

/// Frees every non-global data page and intermediate table reachable from
/// the active root, leaving the kernel half intact.
pub fn reset_active_mspace() {
    let root_paddr = active_mspace().root_paddr();
    // SAFETY: `root_paddr` is the live root of the active space.
    let root = unsafe { table_at_mut(root_paddr) };
    free_table_level(root, 2);
    // SAFETY: active space's own root table.
    unsafe {
        asm!("sfence.vma");
    }
}

fn free_table_level(table: &mut PageTable, level: usize) {
    for i in 0..crate::mm::page_table::PAGE_TABLE_ENTRIES {
        let entry = table[i];
        if entry.is_unused() || entry.flags().contains(PteFlags::GLOBAL) {
            continue;
        }
        if entry.is_leaf() {
            free_pages(entry.addr(), 1);
        } else if level > 0 {
            // SAFETY: `entry.addr()` names a live child table owned solely
            // by this address space (non-global, so not shared).
            let child = unsafe { table_at_mut(entry.addr()) };
            free_table_level(child, level - 1);
            free_pages(entry.addr(), 1);
        }
        table[i].clear();
    }
}

/// `reset` followed by switching back to kernel space and freeing the root.
pub fn discard_active_mspace() {
    let root_paddr = active_mspace().root_paddr();
    reset_active_mspace();
    switch_mspace(kernel_tag());
    free_pages(root_paddr, 1);
}

/// Demand-fault handler: allocates and maps one zeroed page for a fault
/// inside the user region. `is_store`/`is_exec` select which extra
/// permission bit to grant beyond R|U.
pub fn handle_umode_page_fault(faulting_vaddr: usize, is_store: bool, is_exec: bool) -> bool {
    if faulting_vaddr < UMEM_START || faulting_vaddr >= UMEM_END {
        return false;
    }
    let page_vaddr = faulting_vaddr & !(PAGE_SIZE - 1);
    let mut flags = PteFlags::READ | PteFlags::USER;
    if is_store {
        flags |= PteFlags::WRITE;
    }
    if is_exec {
        flags |= PteFlags::EXEC;
    }
    alloc_and_map_range(page_vaddr, PAGE_SIZE, flags);
    true
}

/// Checks that every page covering `[p, p+len)` is mapped in the active
/// space with at least `required` permissions.
pub fn validate_vptr(p: usize, len: usize, required: PteFlags) -> KernelResult<()> {
    if len == 0 {
        return Ok(());
    }
    let end = p.checked_add(len).ok_or(KernelError::InvalidArgument)?;
    if !crate::mm::page_table::is_canonical(p) || !crate::mm::page_table::is_canonical(end) {
        return Err(KernelError::InvalidArgument);
    }
    let root = active_mspace().root_paddr();
    let first_page = p & !(PAGE_SIZE - 1);
    let last_page = (end - 1) & !(PAGE_SIZE - 1);
    let mut page = first_page;
    loop {
        let ok = walk_leaf_mut(root, page, false, |table, idx| {
            table[idx].is_valid() && table[idx].flags().contains(required)
        });
        match ok {
            Some(true) => {}
            _ => return Err(KernelError::AccessDenied),
        }
        if page == last_page {
            break;
        }
        page += PAGE_SIZE;
    }
    Ok(())
}

/// Validates a NUL-terminated user string: page-by-page, dereferencing only
/// after each page is confirmed mapped with `required` permissions.
pub fn validate_vstr(s: usize, required: PteFlags) -> KernelResult<usize> {
    if !crate::mm::page_table::is_canonical(s) {
        return Err(KernelError::InvalidArgument);
    }
    let root = active_mspace().root_paddr();
    let mut page = s & !(PAGE_SIZE - 1);
    let mut offset = s - page;
    let mut len = 0usize;
    loop {
        let ok = walk_leaf_mut(root, page, false, |table, idx| {
            table[idx].is_valid() && table[idx].flags().contains(required)
        });
        if ok != Some(true) {
            return Err(KernelError::AccessDenied);
        }
        while offset < PAGE_SIZE {
            // SAFETY: the page containing `page + offset` was just confirmed
            // mapped with read permission.
            let byte = unsafe { *((page + offset) as *const u8) };
            if byte == 0 {
                return Ok(len);
            }
            len += 1;
            offset += 1;
        }
        page += PAGE_SIZE;
        offset = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::frame_allocator::free_page_count;

    #[test_case]
    fn map_and_unmap_range_restores_free_page_count() {
        const SIZE: usize = 4 * PAGE_SIZE;
        let vaddr = UMEM_START;
        let flags = PteFlags::READ | PteFlags::WRITE | PteFlags::USER;

        // First touch of this region may allocate intermediate page-table
        // pages that `unmap_and_free_range` never reclaims; settle those
        // before measuring the steady-state round trip.
        let paddr = crate::mm::frame_allocator::alloc_pages(4);
        map_range(vaddr, SIZE, paddr, flags);
        unmap_and_free_range(vaddr, SIZE);

        let steady = free_page_count();
        let paddr2 = crate::mm::frame_allocator::alloc_pages(4);
        map_range(vaddr, SIZE, paddr2, flags);
        assert_eq!(free_page_count(), steady - 4);
        unmap_and_free_range(vaddr, SIZE);
        assert_eq!(free_page_count(), steady);
    }

    #[test_case]
    fn reset_clears_user_mappings_but_not_kernel_identity_map() {
        let vaddr = UMEM_START + 8 * PAGE_SIZE;
        alloc_and_map_range(vaddr, PAGE_SIZE, PteFlags::READ | PteFlags::WRITE | PteFlags::USER);
        validate_vptr(vaddr, PAGE_SIZE, PteFlags::READ).expect("freshly mapped page must validate");

        reset_active_mspace();

        assert!(validate_vptr(vaddr, PAGE_SIZE, PteFlags::READ).is_err());
        // The kernel's own gigapage mapping carries the global bit, so it
        // must survive a reset of the (here, identical) active space.
        // SAFETY: `PHYS_MEM_BASE` is inside the kernel's permanent identity map.
        unsafe { core::ptr::read_volatile(PHYS_MEM_BASE as *const u8) };
    }

    #[test_case]
    fn clone_produces_distinct_pages_with_identical_contents() {
        let vaddr = UMEM_START + 16 * PAGE_SIZE;
        let flags = PteFlags::READ | PteFlags::WRITE | PteFlags::USER;
        alloc_and_map_range(vaddr, PAGE_SIZE, flags);
        // SAFETY: `vaddr` was just mapped above with write permission.
        unsafe { core::ptr::write_bytes(vaddr as *mut u8, 0xAB, PAGE_SIZE) };

        let parent = active_mspace();
        let child = clone_active_mspace();
        assert_ne!(child.root_paddr(), parent.root_paddr());

        switch_mspace(child);
        // SAFETY: `vaddr` is mapped in `child`, cloned from the parent above.
        let inherited = unsafe { core::ptr::read_volatile(vaddr as *const u8) };
        assert_eq!(inherited, 0xAB, "clone must carry the parent's bytes");
        // SAFETY: same mapping, still active.
        unsafe { core::ptr::write_bytes(vaddr as *mut u8, 0xCD, PAGE_SIZE) };

        // Frees the clone's private copy of the page and its root table,
        // then switches back to `parent`.
        discard_active_mspace();
        assert_eq!(active_mspace(), parent);
        // SAFETY: `vaddr` is still mapped in `parent`, untouched by the clone.
        let original = unsafe { core::ptr::read_volatile(vaddr as *const u8) };
        assert_eq!(original, 0xAB, "writes through the clone must not be visible in the parent");

        unmap_and_free_range(vaddr, PAGE_SIZE);
    }

    #[test_case]
    fn demand_fault_maps_a_zeroed_page_inside_user_region() {
        let vaddr = UMEM_START + 32 * PAGE_SIZE;
        assert!(validate_vptr(vaddr, 1, PteFlags::READ).is_err(), "page must start out unmapped");

        assert!(handle_umode_page_fault(vaddr + 5, false, false));
        validate_vptr(vaddr, PAGE_SIZE, PteFlags::READ).expect("fault handler must map the page");
        // SAFETY: just validated as mapped with read permission.
        let byte = unsafe { core::ptr::read_volatile(vaddr as *const u8) };
        assert_eq!(byte, 0, "demand-paged pages must be zeroed");

        assert!(!handle_umode_page_fault(UMEM_END, false, false), "faults outside the user region are rejected");

        unmap_and_free_range(vaddr, PAGE_SIZE);
    }
}
