//! Reentrant mutual-exclusion lock.
//!
//! `acquire` is reentrant: a thread that already owns the lock just bumps
//! the recursion count. Otherwise it waits on the lock's own condition.
//! `release` asserts ownership and, on the final matching release, hands the
//! lock to whichever waiter `broadcast` wakes next.

use core::cell::Cell;

use crate::arch::riscv64::disable_interrupts;
use crate::sched;
use crate::sched::condvar::Condition;
use crate::sched::thread::ThreadId;

pub struct Lock {
    owner: Cell<Option<ThreadId>>,
    count: Cell<usize>,
    cond: Condition,
}

// SAFETY: `owner`/`count` are only mutated with interrupts disabled, this
// kernel's stand-in for a real spinlock on a single hart.
unsafe impl Sync for Lock {}

impl Lock {
    pub const fn new() -> Self {
        Self {
            owner: Cell::new(None),
            count: Cell::new(0),
            cond: Condition::new(),
        }
    }

    pub fn acquire(&self) {
        loop {
            let acquired = {
                let _guard = disable_interrupts();
                let me = sched::current_tid();
                if self.owner.get() == Some(me) {
                    self.count.set(self.count.get() + 1);
                    true
                } else if self.owner.get().is_none() {
                    self.owner.set(Some(me));
                    self.count.set(1);
                    sched::with_current_thread(|t| t.held_locks.push(self as *const Lock));
                    true
                } else {
                    false
                }
            };
            if acquired {
                return;
            }
            self.cond.wait();
        }
    }

    /// Releases one level of ownership. Panics if the caller does not hold
    /// the lock, mirroring the panic-on-invariant-violation policy for
    /// freeing a non-owned lock.
    pub fn release(&self) {
        let _guard = disable_interrupts();
        let me = sched::current_tid();
        assert_eq!(self.owner.get(), Some(me), "release of lock not held by caller");
        let count = self.count.get() - 1;
        self.count.set(count);
        if count > 0 {
            return;
        }
        self.owner.set(None);
        sched::with_current_thread(|t| {
            if let Some(pos) = t.held_locks.iter().position(|p| core::ptr::eq(*p, self as *const Lock)) {
                t.held_locks.remove(pos);
            }
        });
        drop(_guard);
        self.cond.broadcast();
    }

    pub fn is_held_by_current(&self) -> bool {
        let _guard = disable_interrupts();
        self.owner.get() == Some(sched::current_tid())
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn reentrant_acquire_release_tracks_nesting() {
        let lock = Lock::new();
        assert!(!lock.is_held_by_current());
        lock.acquire();
        lock.acquire();
        assert!(lock.is_held_by_current(), "second acquire by the same thread must not block");
        lock.release();
        assert!(lock.is_held_by_current(), "lock stays held until the matching release count is reached");
        lock.release();
        assert!(!lock.is_held_by_current());
    }
}
