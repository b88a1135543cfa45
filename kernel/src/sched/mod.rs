//! Scheduler: fixed thread table, FIFO ready list, idle thread, and the
//! spawn/exit/join/yield primitives everything else suspends through.
//!
//! Single hart, cooperative scheduling punctuated by preemption from the
//! timer interrupt. List manipulation is protected by disabling interrupts,
//! never by a blocking lock (a blocking lock would itself need the
//! scheduler to unblock).

pub mod condvar;
pub mod lock;
pub mod thread;

pub use condvar::Condition;
pub use lock::Lock;
pub use thread::{Thread, ThreadId, ThreadState};

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use core::cell::UnsafeCell;

use crate::arch::riscv::context::{context_switch, Context};
use crate::arch::riscv64::disable_interrupts;
use crate::config::{IDLE_TID, NTHR, STACK_SIZE};
use crate::error::{KernelError, KernelResult};

const NONE_THREAD: Option<Box<Thread>> = None;

struct Scheduler {
    threads: [Option<Box<Thread>>; NTHR],
    ready: VecDeque<ThreadId>,
    current: ThreadId,
}

struct SchedCell(UnsafeCell<Option<Scheduler>>);
// SAFETY: `Scheduler` is only ever accessed through `sched()`, which is only
// called with interrupts disabled -- this kernel's uniprocessor stand-in for
// holding an exclusive lock. A real lock guard cannot be held across
// `context_switch`: the thread holding it never releases it while suspended,
// so any other thread that later needs scheduler state would block forever.
unsafe impl Sync for SchedCell {}

static SCHED: SchedCell = SchedCell(UnsafeCell::new(None));

/// Caller must already hold interrupts disabled for the lifetime of the
/// returned reference.
fn sched() -> &'static mut Scheduler {
    // SAFETY: see `SchedCell`; every call site below disables interrupts
    // first and does not call back into `sched()` while holding the
    // reference across a reschedule.
    unsafe { (*SCHED.0.get()).as_mut().expect("sched not initialized") }
}

/// Brings up the scheduler: thread 0 becomes the calling (boot) thread,
/// slot `IDLE_TID` becomes the idle thread. Must run after the kernel heap
/// is available.
pub fn init() {
    let mut threads: [Option<Box<Thread>>; NTHR] = [NONE_THREAD; NTHR];
    let mut main = Box::new(Thread::new(0, "main"));
    main.state = ThreadState::Running;
    threads[0] = Some(main);

    // SAFETY: first write, before any other code has a chance to call
    // `sched()`.
    unsafe {
        *SCHED.0.get() = Some(Scheduler {
            threads,
            ready: VecDeque::new(),
            current: 0,
        });
    }

    spawn_at(IDLE_TID, "idle", idle_main, 0);
}

extern "C" fn thread_trampoline() -> ! {
    let (entry, arg) = with_current_thread(|t| (t.entry, t.arg));
    // SAFETY: `entry` was stored by `spawn`/`spawn_at` as a `fn(usize)`
    // pointer cast to `usize` and has not been touched since.
    let f: fn(usize) = unsafe { core::mem::transmute(entry) };
    f(arg);
    exit();
}

fn idle_main(_arg: usize) {
    loop {
        crate::arch::riscv64::idle();
    }
}

fn init_thread_context(t: &mut Thread, entry: fn(usize), arg: usize) {
    let stack = alloc::vec![0u8; STACK_SIZE].into_boxed_slice();
    let top = stack.as_ptr() as usize + stack.len();
    let sp = top & !0xF;
    t.stack = Some(stack);
    t.entry = entry as usize;
    t.arg = arg;
    t.ctx = Context::zeroed();
    t.ctx.ra = thread_trampoline as usize;
    t.ctx.sp = sp;
    t.state = ThreadState::Ready;
}

fn spawn_at(slot: ThreadId, name: &'static str, entry: fn(usize), arg: usize) {
    let _guard = disable_interrupts();
    let s = sched();
    let mut t = Box::new(Thread::new(slot, name));
    init_thread_context(&mut t, entry, arg);
    t.parent = Some(s.current);
    s.threads[slot] = Some(t);
    s.ready.push_back(slot);
}

/// Allocates a free slot, initializes a stack and saved context, and
/// enqueues the new thread. Fails with `TooManyThreads` if the table is full.
pub fn spawn(name: &'static str, entry: fn(usize), arg: usize) -> KernelResult<ThreadId> {
    let _guard = disable_interrupts();
    let s = sched();
    let slot = (0..NTHR)
        .find(|&i| i != IDLE_TID && s.threads[i].is_none())
        .ok_or(KernelError::TooManyThreads)?;
    let mut t = Box::new(Thread::new(slot, name));
    init_thread_context(&mut t, entry, arg);
    t.parent = Some(s.current);
    s.threads[slot] = Some(t);
    s.ready.push_back(slot);
    Ok(slot)
}

pub fn current_tid() -> ThreadId {
    let _guard = disable_interrupts();
    sched().current
}

/// Top-of-stack value for the calling thread's kernel stack: the fixed
/// resting `sp` every trap taken from this thread's user half restores
/// before calling into Rust. Only meaningful for a thread with an allocated
/// stack (i.e. not the main thread, slot 0, which never runs user code).
pub fn current_kernel_stack_top() -> usize {
    with_current_thread(|t| {
        let stack = t.stack.as_ref().expect("thread has no kernel stack");
        (stack.as_ptr() as usize + stack.len()) & !0xF
    })
}

pub fn current_name() -> &'static str {
    let _guard = disable_interrupts();
    let s = sched();
    s.threads[s.current].as_ref().unwrap().name
}

pub fn with_current_thread<R>(f: impl FnOnce(&mut Thread) -> R) -> R {
    let _guard = disable_interrupts();
    let s = sched();
    f(s.threads[s.current].as_mut().unwrap())
}

pub(crate) fn set_current_state(state: ThreadState) {
    let _guard = disable_interrupts();
    let s = sched();
    s.threads[s.current].as_mut().unwrap().state = state;
}

/// Moves a waiting thread back onto the ready list. Called with interrupts
/// already disabled by the condition variable doing the broadcasting.
pub(crate) fn wake(tid: ThreadId) {
    let s = sched();
    if let Some(t) = s.threads[tid].as_mut() {
        if t.state != ThreadState::Exited {
            t.state = ThreadState::Ready;
            s.ready.push_back(tid);
        }
    }
}

/// Switches away from the current thread to the next ready thread (or idle,
/// if none is ready). Must be called with interrupts already disabled by an
/// `InterruptGuard` the caller is still holding; when this thread is later
/// resumed, execution returns right here, and that guard's `Drop` restores
/// exactly the interrupt-enable state this thread had when it suspended.
pub fn reschedule() {
    let s = sched();
    let cur = s.current;
    let next = s.ready.pop_front().unwrap_or(IDLE_TID);
    s.current = next;
    s.threads[next].as_mut().unwrap().state = ThreadState::Running;
    let old_ctx: *mut Context = &mut s.threads[cur].as_mut().unwrap().ctx;
    let new_ctx: *const Context = &s.threads[next].as_ref().unwrap().ctx;
    // SAFETY: both point at `ctx` fields of live thread-table slots; `cur`'s
    // slot is not freed while `cur` is the thread being switched away from.
    unsafe { context_switch(old_ctx, new_ctx) };
}

/// Suspends the caller and re-enqueues it at the tail of the ready list.
pub fn yield_now() {
    let _guard = disable_interrupts();
    let s = sched();
    if s.current != IDLE_TID {
        s.threads[s.current].as_mut().unwrap().state = ThreadState::Ready;
        s.ready.push_back(s.current);
    }
    reschedule();
}

/// Terminates the calling thread. Fatal if called by the main thread (id 0).
/// Never returns.
pub fn exit() -> ! {
    let me = current_tid();
    if me == 0 {
        panic!("main thread called sched::exit");
    }

    // Release every lock the exiting thread still holds; `Lock::release`
    // disables interrupts itself, so this runs with them enabled.
    let locks = with_current_thread(|t| core::mem::take(&mut t.held_locks));
    for lock in locks {
        // SAFETY: each pointer was pushed by `Lock::acquire` while owned by
        // this thread and refers to a `'static` lock.
        unsafe { &*lock }.release();
    }

    let _guard = disable_interrupts();
    let s = sched();
    s.threads[me].as_mut().unwrap().state = ThreadState::Exited;
    let parent = s.threads[me].as_ref().unwrap().parent;
    for i in 0..NTHR {
        if let Some(t) = s.threads[i].as_mut() {
            if t.parent == Some(me) {
                t.parent = parent;
            }
        }
    }
    if let Some(p) = parent {
        if let Some(pt) = s.threads[p].as_ref() {
            pt.child_exit.broadcast();
        }
    }
    reschedule();
    unreachable!("exited thread resumed");
}

/// Waits for a child to exit: a specific `tid` if nonzero, otherwise any
/// child. Reclaims the joined thread's slot and returns its id. Fails with
/// `InvalidArgument` if the caller has no matching child.
pub fn join(tid: ThreadId) -> KernelResult<ThreadId> {
    loop {
        let outcome = {
            let _guard = disable_interrupts();
            let s = sched();
            let me = s.current;
            let mut exited = None;
            let mut has_matching_child = false;
            for i in 0..NTHR {
                if let Some(t) = s.threads[i].as_ref() {
                    if t.parent == Some(me) && (tid == 0 || i == tid) {
                        has_matching_child = true;
                        if t.state == ThreadState::Exited {
                            exited = Some(i);
                            break;
                        }
                    }
                }
            }
            if let Some(i) = exited {
                s.threads[i].as_mut().unwrap().stack = None;
                s.threads[i] = None;
                Ok(Some(i))
            } else if !has_matching_child {
                Err(KernelError::InvalidArgument)
            } else {
                Ok(None)
            }
        };
        match outcome {
            Ok(Some(i)) => return Ok(i),
            Err(e) => return Err(e),
            Ok(None) => {
                let cond_ptr: *const Condition =
                    with_current_thread(|t| &t.child_exit as *const Condition);
                // SAFETY: points at the calling thread's own `child_exit`,
                // which outlives this wait (the thread cannot exit while
                // blocked here).
                unsafe { &*cond_ptr }.wait();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn thread_state_transitions_are_distinct() {
        assert_ne!(ThreadState::Ready, ThreadState::Running);
        assert_ne!(ThreadState::Waiting, ThreadState::Exited);
    }

    #[test_case]
    fn join_reaps_an_exited_child_and_frees_its_slot() {
        fn child_body(_arg: usize) {}

        let tid = spawn("join-child", child_body, 0).expect("spawn");
        let reaped = join(tid).expect("join");
        assert_eq!(reaped, tid);

        // The slot is fully reclaimed: joining it again now reports no
        // matching child rather than the same thread twice.
        assert!(join(tid).is_err());

        // And it is available for reuse.
        let tid2 = spawn("join-child-2", child_body, 0).expect("spawn");
        assert_eq!(tid2, tid);
        join(tid2).expect("join");
    }
}
