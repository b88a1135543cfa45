//! Thread table entry.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::arch::riscv::context::Context;
use crate::sched::condvar::Condition;
use crate::sched::lock::Lock;

pub type ThreadId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Uninitialized,
    Ready,
    Running,
    Waiting,
    Exited,
}

/// One slot of the fixed-size thread table.
pub struct Thread {
    pub id: ThreadId,
    pub name: &'static str,
    pub state: ThreadState,
    pub ctx: Context,
    /// Kernel stack backing store; kept alive for as long as the thread is
    /// allocated, freed when the slot is reclaimed by `join`.
    pub stack: Option<Box<[u8]>>,
    pub parent: Option<ThreadId>,
    /// Entry function and argument, read once by the trampoline on first run.
    pub entry: usize,
    pub arg: usize,
    /// Broadcast when this thread exits; `join` waits on it.
    pub child_exit: Condition,
    /// Locks currently held by this thread, used to release them all on exit.
    pub held_locks: Vec<*const Lock>,
}

impl Thread {
    pub fn new(id: ThreadId, name: &'static str) -> Self {
        Self {
            id,
            name,
            state: ThreadState::Uninitialized,
            ctx: Context::zeroed(),
            stack: None,
            parent: None,
            entry: 0,
            arg: 0,
            child_exit: Condition::new(),
            held_locks: Vec::new(),
        }
    }
}
