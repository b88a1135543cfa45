//! Virtio subsystem -- MMIO transport and device drivers.
//!
//! QEMU's RISC-V `virt` machine exposes virtio devices as memory-mapped
//! regions rather than behind PCI; see [`mmio`] for the register layout and
//! [`queue`] for the shared split-virtqueue implementation both device
//! drivers build on.
//!
//! ```text
//!   VirtioMmioTransport (mmio.rs)
//!     +-- VirtQueue (queue.rs)         -- split virtqueue
//!     +-- VirtioBlkDevice (blk.rs)     -- block device driver
//! ```

#![allow(dead_code)]

pub mod blk;
pub mod mmio;
pub mod queue;
