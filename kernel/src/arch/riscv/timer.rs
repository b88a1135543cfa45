//! Low-level access to the CLINT-backed timer.
//!
//! `mtime` is readable directly from S-mode via the `time` CSR. `mtimecmp`
//! lives in M-mode-owned CLINT memory under OpenSBI, so the next deadline is
//! programmed through the SBI timer extension rather than a raw MMIO store
//! (functionally the same "hardware compare register", reached the way
//! S-mode software actually reaches it under OpenSBI).

use core::arch::asm;

use crate::arch::riscv::sbi;

/// Reads the free-running `mtime` counter.
pub fn read_time() -> u64 {
    let time: u64;
    // SAFETY: `rdtime` is a read-only CSR access available to S-mode.
    unsafe { asm!("rdtime {}", out(reg) time) };
    time
}

/// Programs the next timer interrupt deadline and enables STIE.
pub fn arm(deadline: u64) {
    sbi::set_timer(deadline);
    // SAFETY: setting bit 5 (STIE) of `sie` only affects this hart's timer
    // interrupt enable and is always a valid CSR write from S-mode.
    unsafe { asm!("csrs sie, {0}", in(reg) 1usize << 5) };
}

/// Disables the supervisor timer interrupt.
pub fn disable() {
    // SAFETY: clearing bit 5 (STIE) of `sie` is always a valid CSR write.
    unsafe { asm!("csrc sie, {0}", in(reg) 1usize << 5) };
}
