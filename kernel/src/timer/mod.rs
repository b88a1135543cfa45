//! Monotonic tick counter, the sorted alarm list backing `sleep`, and the
//! periodic tick that drives preemption.
//!
//! Ticks are raw hardware timer units (see [`crate::arch::riscv::timer`]);
//! `TIMER_FREQ` ticks/second. The sleep list is a singly linked list of
//! [`Alarm`]s, sorted ascending by wake time, manipulated only with
//! interrupts disabled. The hardware compare register always tracks
//! `min(sleep list head's wake time, next preemption deadline)` — unlike the
//! sleep list, the preemption deadline is never empty, so the compare
//! register is always armed: a CPU-bound thread with no sleepers anywhere
//! still takes a timer interrupt at least every [`PREEMPT_QUANTUM_TICKS`].

use core::cell::Cell;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::arch::riscv::timer;
use crate::arch::riscv64::disable_interrupts;
use crate::config::PREEMPT_QUANTUM_TICKS;
use crate::sched::Condition;

struct SleepListCell(Cell<*const Alarm>);
// SAFETY: the list head is only read/written with interrupts disabled, this
// kernel's stand-in for an exclusive lock on a single hart.
unsafe impl Sync for SleepListCell {}

static SLEEP_LIST: SleepListCell = SleepListCell(Cell::new(ptr::null()));

/// Tick value at which the next preemption request is due.
static NEXT_PREEMPT: AtomicU64 = AtomicU64::new(0);

/// Set by `handle_interrupt` when a quantum has expired; cleared by whichever
/// trap handler acts on it at its trap-return safe point.
static PREEMPT_REQUESTED: AtomicBool = AtomicBool::new(false);

/// A pending wake request. Typically stack-allocated by the waiting thread
/// and linked into the global sleep list for the duration of the wait.
pub struct Alarm {
    wake: Cell<u64>,
    cond: Condition,
    next: Cell<*const Alarm>,
}

// SAFETY: `wake`/`next` are only mutated with interrupts disabled; `cond` is
// itself `Sync`.
unsafe impl Sync for Alarm {}

impl Alarm {
    pub const fn new() -> Self {
        Self {
            wake: Cell::new(0),
            cond: Condition::new(),
            next: Cell::new(ptr::null()),
        }
    }
}

impl Default for Alarm {
    fn default() -> Self {
        Self::new()
    }
}

/// Current value of the free-running tick counter.
pub fn now() -> u64 {
    timer::read_time()
}

/// Inserts `al` into the sorted sleep list (interrupts must already be
/// disabled by the caller).
fn insert_sorted(al: &Alarm) {
    let wake = al.wake.get();
    let mut prev: *const Alarm = ptr::null();
    let mut cur = SLEEP_LIST.0.get();
    // SAFETY: every pointer in the list was installed by `insert_sorted`
    // from a live `&Alarm` and removed before that alarm's frame returns.
    while !cur.is_null() && unsafe { (*cur).wake.get() } <= wake {
        prev = cur;
        cur = unsafe { (*cur).next.get() };
    }
    al.next.set(cur);
    if prev.is_null() {
        SLEEP_LIST.0.set(al as *const Alarm);
    } else {
        // SAFETY: `prev` is a live list node.
        unsafe { (*prev).next.set(al as *const Alarm) };
    }
}

fn remove(al: &Alarm) {
    let target = al as *const Alarm;
    let mut prev: *const Alarm = ptr::null();
    let mut cur = SLEEP_LIST.0.get();
    while !cur.is_null() {
        if ptr::eq(cur, target) {
            // SAFETY: `cur` is a live list node with a valid `next`.
            let next = unsafe { (*cur).next.get() };
            if prev.is_null() {
                SLEEP_LIST.0.set(next);
            } else {
                unsafe { (*prev).next.set(next) };
            }
            return;
        }
        prev = cur;
        // SAFETY: `cur` is a live list node.
        cur = unsafe { (*cur).next.get() };
    }
}

fn reprogram_compare() {
    let head = SLEEP_LIST.0.get();
    let preempt_deadline = NEXT_PREEMPT.load(Ordering::Relaxed);
    let deadline = if head.is_null() {
        preempt_deadline
    } else {
        // SAFETY: `head` is a live list node.
        unsafe { (*head).wake.get() }.min(preempt_deadline)
    };
    timer::arm(deadline);
}

/// Arms the first preemption tick. Called once at boot, after the scheduler
/// is up and before interrupts are enabled.
pub fn init() {
    NEXT_PREEMPT.store(now().saturating_add(PREEMPT_QUANTUM_TICKS), Ordering::Relaxed);
    reprogram_compare();
}

/// Consumes a pending preemption request set by `handle_interrupt`. Checked
/// at a trap-return safe point, never called from inside the ISR itself —
/// yielding there would context-switch away before the rest of the trap
/// handler (mspace switch, trap-frame restore) has run.
pub fn take_preempt_request() -> bool {
    PREEMPT_REQUESTED.swap(false, Ordering::Relaxed)
}

/// Suspends the caller until `ticks` have elapsed, or returns immediately if
/// `ticks` is already in the past.
pub fn alarm_sleep(al: &Alarm, ticks: u64) {
    // Held across `insert_sorted`/`reprogram_compare`/`wait` so no timer
    // interrupt can fire between arming the compare register and the caller
    // actually being enqueued on `al.cond` — `wait`'s own nested guard is
    // what restores the interrupt-enable state on wake, exactly like every
    // other condition wait in this kernel.
    let guard = disable_interrupts();
    let n = now();
    let wake = n.saturating_add(ticks);
    al.wake.set(wake);
    if wake <= n {
        return;
    }
    insert_sorted(al);
    reprogram_compare();
    al.cond.wait();
    drop(guard);
}

/// Convenience wrapper around [`alarm_sleep`] for callers with no alarm of
/// their own to reuse.
pub fn sleep_ticks(ticks: u64) {
    let al = Alarm::new();
    alarm_sleep(&al, ticks);
}

/// Timer interrupt handler: drains every expired alarm, broadcasting its
/// condition, marks a preemption request if the current quantum has expired,
/// and reprograms the compare register. Must be called with interrupts
/// disabled (true of any trap handler before `sret`).
pub fn handle_interrupt() {
    loop {
        let head = SLEEP_LIST.0.get();
        if head.is_null() {
            break;
        }
        // SAFETY: `head` is a live list node.
        let al = unsafe { &*head };
        if al.wake.get() > now() {
            break;
        }
        remove(al);
        al.cond.broadcast();
    }

    let n = now();
    if n >= NEXT_PREEMPT.load(Ordering::Relaxed) {
        NEXT_PREEMPT.store(n.saturating_add(PREEMPT_QUANTUM_TICKS), Ordering::Relaxed);
        PREEMPT_REQUESTED.store(true, Ordering::Relaxed);
    }

    reprogram_compare();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn sleep_list_starts_empty() {
        assert!(SLEEP_LIST.0.get().is_null());
    }

    #[test_case]
    fn expired_quantum_requests_preemption_until_consumed() {
        assert!(!take_preempt_request(), "no request pending before the quantum elapses");
        NEXT_PREEMPT.store(now(), Ordering::Relaxed);
        handle_interrupt();
        assert!(take_preempt_request(), "quantum already elapsed, request must be set");
        assert!(!take_preempt_request(), "request is consumed by the first check");
    }
}
