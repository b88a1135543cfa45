//! Condition variables.
//!
//! A condition is just a FIFO of waiting thread ids. `wait` is atomic with
//! respect to interrupts: disable, enqueue, mark the caller waiting, suspend;
//! on wake the caller's own interrupt-enable state is restored by the
//! `InterruptGuard` it took out before suspending (see `sched::reschedule`).

use alloc::collections::VecDeque;
use core::cell::UnsafeCell;

use crate::arch::riscv64::disable_interrupts;
use crate::sched;
use crate::sched::thread::ThreadState;

pub struct Condition {
    waiters: UnsafeCell<VecDeque<usize>>,
}

// SAFETY: `waiters` is only ever touched with interrupts disabled on this
// single-hart kernel, which is this type's substitute for a real lock.
unsafe impl Sync for Condition {}
// SAFETY: see above; moving a `Condition` across threads is likewise only
// ever done while interrupts are disabled.
unsafe impl Send for Condition {}

impl Condition {
    pub const fn new() -> Self {
        Self {
            waiters: UnsafeCell::new(VecDeque::new()),
        }
    }

    /// Suspends the calling thread until `broadcast` is called on this
    /// condition.
    pub fn wait(&self) {
        let _guard = disable_interrupts();
        // SAFETY: interrupts are disabled, so this is the only code able to
        // touch `waiters` on this single hart.
        let waiters = unsafe { &mut *self.waiters.get() };
        let me = sched::current_tid();
        waiters.push_back(me);
        sched::set_current_state(ThreadState::Waiting);
        sched::reschedule();
    }

    /// Moves every current waiter to the ready list. Waiters added after this
    /// call returns are not woken.
    pub fn broadcast(&self) {
        let _guard = disable_interrupts();
        // SAFETY: interrupts disabled, exclusive access on this hart.
        let waiters = unsafe { &mut *self.waiters.get() };
        while let Some(tid) = waiters.pop_front() {
            sched::wake(tid);
        }
    }

    pub fn has_waiters(&self) -> bool {
        let _guard = disable_interrupts();
        // SAFETY: interrupts disabled, exclusive access on this hart.
        !unsafe { &*self.waiters.get() }.is_empty()
    }
}

impl Default for Condition {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static WAIT_COND: Condition = Condition::new();

    fn waiter_thread(_arg: usize) {
        WAIT_COND.wait();
    }

    #[test_case]
    fn broadcast_wakes_every_waiter_and_empties_the_list() {
        assert!(!WAIT_COND.has_waiters());
        let tid = sched::spawn("cond-waiter", waiter_thread, 0).expect("spawn");
        while !WAIT_COND.has_waiters() {
            sched::yield_now();
        }
        WAIT_COND.broadcast();
        assert!(!WAIT_COND.has_waiters());
        sched::join(tid).expect("join");
    }
}
