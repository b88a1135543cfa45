//! Block cache: a bounded write-back cache sitting between the filesystem
//! and a block device.
//!
//! Entries live in a fixed-capacity arena so a slot's address never moves
//! once assigned; callers hold a slot index across `get_block`/
//! `release_block` rather than a raw pointer, the safe equivalent of the
//! pointer handle a C cache would hand back.

use alloc::boxed::Box;
use alloc::collections::VecDeque;

use crate::config::CACHE_BLKSZ;
use crate::error::{KernelError, KernelResult};
use crate::io::{ioaddref, ioreadat, iowriteat, IoObject};

struct CacheEntry {
    block_num: u64,
    data: [u8; CACHE_BLKSZ],
    valid: bool,
    dirty: bool,
}

impl CacheEntry {
    const fn empty() -> Self {
        Self {
            block_num: 0,
            data: [0u8; CACHE_BLKSZ],
            valid: false,
            dirty: false,
        }
    }
}

/// A write-back block cache of fixed capacity, FIFO eviction.
pub struct Cache {
    bdev: *mut IoObject,
    entries: Box<[CacheEntry]>,
    /// Slot indices in insertion order; the head is the next eviction
    /// candidate.
    order: VecDeque<usize>,
}

// SAFETY: the cache is only ever touched while the filesystem's single
// global lock is held (see `fs::ktfs`); no concurrent access is possible on
// this single-hart kernel.
unsafe impl Send for Cache {}

impl Cache {
    /// Creates a cache backed by `bdev`, taking a new reference on it.
    ///
    /// # Safety
    /// `bdev` must be a live `IoObject` pointer with at least one
    /// outstanding reference.
    pub unsafe fn create(bdev: *mut IoObject, capacity: usize) -> Self {
        // SAFETY: caller contract.
        unsafe { ioaddref(bdev) };
        let mut entries = alloc::vec::Vec::with_capacity(capacity);
        for _ in 0..capacity {
            entries.push(CacheEntry::empty());
        }
        Self {
            bdev,
            entries: entries.into_boxed_slice(),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Returns the slot index holding `pos`'s block, reading it from the
    /// backing device on a miss and evicting the oldest entry (writing it
    /// back first if dirty) if the cache is full. `pos` must be
    /// block-aligned.
    pub fn get_block(&mut self, pos: u64) -> KernelResult<usize> {
        let block_num = pos / CACHE_BLKSZ as u64;

        for (idx, entry) in self.entries.iter().enumerate() {
            if entry.valid && entry.block_num == block_num {
                return Ok(idx);
            }
        }

        let idx = if self.order.len() < self.entries.len() {
            self.order.len()
        } else {
            let evict = self.order.pop_front().expect("cache at capacity has an order entry");
            if self.entries[evict].dirty {
                self.writeback(evict)?;
            }
            evict
        };

        let mut data = [0u8; CACHE_BLKSZ];
        // SAFETY: `self.bdev` holds a reference for the cache's lifetime.
        unsafe { ioreadat(self.bdev, pos, &mut data) }?;

        self.entries[idx] = CacheEntry {
            block_num,
            data,
            valid: true,
            dirty: false,
        };
        self.order.push_back(idx);
        Ok(idx)
    }

    /// Mutable access to a slot's 512-byte buffer, valid between
    /// `get_block` and `release_block`.
    pub fn block_data(&mut self, idx: usize) -> &mut [u8; CACHE_BLKSZ] {
        &mut self.entries[idx].data
    }

    /// Marks a slot dirty if the caller modified its buffer.
    pub fn release_block(&mut self, idx: usize, dirty: bool) {
        if dirty {
            self.entries[idx].dirty = true;
        }
    }

    fn writeback(&mut self, idx: usize) -> KernelResult<()> {
        let entry = &self.entries[idx];
        let pos = entry.block_num * CACHE_BLKSZ as u64;
        // SAFETY: `self.bdev` holds a reference for the cache's lifetime.
        let n = unsafe { iowriteat(self.bdev, pos, &entry.data) }?;
        if n != CACHE_BLKSZ {
            return Err(KernelError::IoError);
        }
        self.entries[idx].dirty = false;
        Ok(())
    }

    /// Writes back every dirty entry.
    pub fn flush(&mut self) -> KernelResult<()> {
        for idx in 0..self.entries.len() {
            if self.entries[idx].valid && self.entries[idx].dirty {
                self.writeback(idx)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{ioinit1, IoKind};

    #[test_case]
    fn get_block_then_release_marks_dirty() {
        // A bare RamBlockDevice isn't reachable as an IoObject without the
        // filesystem's own device plumbing (see fs::ktfs tests for an
        // end-to-end exercise); this test only checks read-through on a
        // fresh cache entry using a memory-backed I/O object as the stand-in
        // block device.
        let dev = ioinit1(IoKind::Memory(crate::io::MemoryIo::new(
            alloc::vec![0xABu8; CACHE_BLKSZ * 4].into_boxed_slice(),
        )));
        // SAFETY: freshly created, single reference, test-only.
        let mut cache = unsafe { Cache::create(dev, 2) };
        let idx = cache.get_block(0).unwrap();
        assert_eq!(cache.block_data(idx)[0], 0xAB);
        cache.block_data(idx)[0] = 0x11;
        cache.release_block(idx, true);
        cache.flush().unwrap();
        // SAFETY: test-only cleanup of the one reference we hold.
        unsafe { crate::io::ioclose(dev) }.unwrap();
    }

    #[test_case]
    fn eviction_writes_back_the_oldest_dirty_entry_before_reuse() {
        let dev = ioinit1(IoKind::Memory(crate::io::MemoryIo::new(
            alloc::vec![0u8; CACHE_BLKSZ * 4].into_boxed_slice(),
        )));
        // SAFETY: freshly created, single reference, test-only.
        let mut cache = unsafe { Cache::create(dev, 2) };

        let idx0 = cache.get_block(0).unwrap();
        cache.block_data(idx0)[0] = 0xAA;
        cache.release_block(idx0, true);

        let idx1 = cache.get_block(CACHE_BLKSZ as u64).unwrap();

        // Capacity is 2 and both slots are in use; a third distinct block
        // evicts block 0 (the oldest entry), writing its dirty data back
        // first.
        let idx2 = cache.get_block(2 * CACHE_BLKSZ as u64).unwrap();
        assert_ne!(idx2, idx1);

        // Re-reading block 0 forces a fresh read-through; it must observe
        // the byte written before eviction, proving the writeback happened.
        let idx0_again = cache.get_block(0).unwrap();
        assert_eq!(cache.block_data(idx0_again)[0], 0xAA);

        // SAFETY: test-only cleanup of the one reference we hold.
        unsafe { crate::io::ioclose(dev) }.unwrap();
    }
}
