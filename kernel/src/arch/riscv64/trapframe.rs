//! Saved user register state for one trap.
//!
//! Laid out in RISC-V register-number order (`x1`..`x31`, skipping the
//! always-zero `x0`) so the assembly trap entry/return in [`super::trap`]
//! can address every field by a fixed offset. `sepc` and `kernel_sp` follow
//! the general-purpose registers; `kernel_sp` is the value the trap entry
//! restores `sp` to before calling into Rust, filled in once per process by
//! whoever builds the frame.

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    pub ra: usize,
    pub sp: usize,
    pub gp: usize,
    pub tp: usize,
    pub t0: usize,
    pub t1: usize,
    pub t2: usize,
    pub s0: usize,
    pub s1: usize,
    pub a0: usize,
    pub a1: usize,
    pub a2: usize,
    pub a3: usize,
    pub a4: usize,
    pub a5: usize,
    pub a6: usize,
    pub a7: usize,
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
    pub t3: usize,
    pub t4: usize,
    pub t5: usize,
    pub t6: usize,
    /// Saved `sepc`, the instruction the trap occurred at (or the entry
    /// point, for a frame built for the first transfer to user mode).
    pub sepc: usize,
    /// Kernel stack top the trap entry switches to before calling the Rust
    /// handler. Never touched after the frame is built.
    pub kernel_sp: usize,
}

impl TrapFrame {
    pub const fn zeroed() -> Self {
        Self {
            ra: 0,
            sp: 0,
            gp: 0,
            tp: 0,
            t0: 0,
            t1: 0,
            t2: 0,
            s0: 0,
            s1: 0,
            a0: 0,
            a1: 0,
            a2: 0,
            a3: 0,
            a4: 0,
            a5: 0,
            a6: 0,
            a7: 0,
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
            t3: 0,
            t4: 0,
            t5: 0,
            t6: 0,
            sepc: 0,
            kernel_sp: 0,
        }
    }

    /// Advances the saved program counter by one instruction width, as the
    /// syscall dispatcher does after servicing an `ecall`.
    pub fn advance_pc(&mut self) {
        self.sepc += 4;
    }
}
