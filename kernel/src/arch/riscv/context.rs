//! Kernel-thread context switching.
//!
//! Only the callee-saved register set needs to survive a switch: the caller
//! of `context_switch` is always deep inside the scheduler, so everything
//! caller-saved is already dead by the time we get here. Interrupt-enable
//! state is deliberately *not* part of this struct — it is tracked
//! per-thread in `sched` and restored by the scheduler itself right after
//! the switch returns, once it knows which thread is running again.

use core::arch::global_asm;

/// Saved callee-saved RISC-V register set for one suspended thread.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,
    pub s0: usize,
    pub s1: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
}

impl Context {
    pub const fn zeroed() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s0: 0,
            s1: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
        }
    }
}

extern "C" {
    /// Saves the caller's callee-saved registers into `*old`, then loads
    /// `*new`'s into the live registers and returns into whatever `new.ra`
    /// points at. When a previously-switched-away thread is resumed, it
    /// re-enters here and returns to its own caller inside `sched`.
    pub fn context_switch(old: *mut Context, new: *const Context);
}

global_asm!(
    r#"
    .section .text
    .global context_switch
context_switch:
    sd ra,  0(a0)
    sd sp,  8(a0)
    sd s0, 16(a0)
    sd s1, 24(a0)
    sd s2, 32(a0)
    sd s3, 40(a0)
    sd s4, 48(a0)
    sd s5, 56(a0)
    sd s6, 64(a0)
    sd s7, 72(a0)
    sd s8, 80(a0)
    sd s9, 88(a0)
    sd s10, 96(a0)
    sd s11, 104(a0)

    ld ra,  0(a1)
    ld sp,  8(a1)
    ld s0, 16(a1)
    ld s1, 24(a1)
    ld s2, 32(a1)
    ld s3, 40(a1)
    ld s4, 48(a1)
    ld s5, 56(a1)
    ld s6, 64(a1)
    ld s7, 72(a1)
    ld s8, 80(a1)
    ld s9, 88(a1)
    ld s10, 96(a1)
    ld s11, 104(a1)
    ret
    "#
);
