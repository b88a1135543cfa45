//! Compile-time kernel configuration.
//!
//! An embedded kernel has no runtime configuration source; everything here
//! is a `const` baked in at build time. Grouped by subsystem rather than
//! alphabetically so a reader can see what a given component depends on.

/// Size of one physical/virtual page (Sv39 base page size).
pub const PAGE_SIZE: usize = 4096;

/// Maximum number of kernel threads, including the idle thread.
pub const NTHR: usize = 64;

/// Thread-table slot reserved for the idle thread.
pub const IDLE_TID: usize = NTHR - 1;

/// Kernel stack size for a spawned thread.
pub const STACK_SIZE: usize = 4 * PAGE_SIZE;

/// Maximum number of processes, including the static main process at slot 0.
pub const NPROC: usize = 32;

/// Per-process I/O table size.
pub const PROCESS_IOMAX: usize = 16;

/// Block-cache capacity, in entries.
pub const CACHE_CAPACITY: usize = 64;

/// Block-cache / backing-device block size, in bytes.
pub const CACHE_BLKSZ: usize = 512;

/// KTFS on-disk block size (equal to the cache block size).
pub const KTFS_BLKSZ: usize = 512;

/// KTFS on-disk inode size, in bytes.
pub const KTFS_INOSZ: usize = 32;

/// KTFS on-disk directory-entry size, in bytes.
pub const KTFS_DENSZ: usize = 32;

/// Maximum filename length, not counting the terminating NUL.
pub const KTFS_MAX_FILENAME_LEN: usize = KTFS_DENSZ - 2 - 1;

/// Direct block pointers carried in each inode.
pub const KTFS_NUM_DIRECT_DATA_BLOCKS: usize = 4;

/// Double-indirect block pointers carried in each inode.
pub const KTFS_NUM_DINDIRECT_BLOCKS: usize = 1;

/// Monotonic tick rate of the timer subsystem.
pub const TIMER_FREQ: u64 = 1_000_000;

/// Preemption quantum: the longest a thread runs before the timer ISR
/// requests a yield at the next trap-return safe point. 10ms at `TIMER_FREQ`.
pub const PREEMPT_QUANTUM_TICKS: u64 = TIMER_FREQ / 100;

/// Lowest user-mappable virtual address (page 0 stays unmapped to catch
/// null-pointer dereferences).
pub const UMEM_START: usize = 0x1000;

/// First address past the user region. The kernel identity-maps physical
/// RAM starting at [`PHYS_MEM_BASE`], so the user region is capped here to
/// keep the two halves of the address space disjoint.
pub const UMEM_END: usize = PHYS_MEM_BASE;

/// QEMU `virt` machine platform addresses.
pub const UART0_BASE: usize = 0x1000_0000;
pub const VIRTIO_MMIO_BASE: usize = 0x1000_1000;
pub const VIRTIO_MMIO_STRIDE: usize = 0x1000;
pub const VIRTIO_MMIO_SLOTS: usize = 8;
pub const CLINT_BASE: usize = 0x0200_0000;
pub const CLINT_MTIME_OFFSET: usize = 0xBFF8;
pub const CLINT_MTIMECMP_OFFSET: usize = 0x4000;
pub const PLIC_BASE: usize = 0x0C00_0000;
pub const PHYS_MEM_BASE: usize = 0x8000_0000;

/// UART interrupt source on the PLIC.
pub const IRQ_UART0: u32 = 10;
/// First VirtIO MMIO interrupt source on the PLIC (inclusive).
pub const IRQ_VIRTIO_START: u32 = 1;
/// Last VirtIO MMIO interrupt source on the PLIC (inclusive).
pub const IRQ_VIRTIO_END: u32 = 8;
