//! Trap entry/return and dispatch.
//!
//! `sscratch` always holds a pointer to the current thread's [`TrapFrame`]
//! while it runs in U-mode (primed by [`trap_return`], which doubles as both
//! "return from a trap" and "first transfer to user mode" — a synthetic
//! frame built by `exec`/`fork` looks exactly like one captured by a real
//! trap). The entry swaps `sp` for that pointer, spills every GPR into it,
//! switches to the frame's kernel stack, and calls into Rust; `trap_return`
//! is the mirror image.

use core::arch::{asm, global_asm};

use crate::arch::riscv64::trapframe::TrapFrame;
use crate::config::IRQ_UART0;
use crate::{irq, println, sched, syscall, timer};

/// Installs `kernel_trap_entry` as the supervisor trap vector. The kernel
/// boots, and always returns to, in S-mode; `stvec` only ever points at
/// `trap_entry` (the `sscratch`-swapping, full-register-save path) for the
/// instant between `trap_return` and the matching trap back in, since that
/// is the only window `sscratch` holds a trap-frame pointer instead of
/// being unused.
pub fn init() {
    set_kernel_vec();
}

fn set_kernel_vec() {
    // SAFETY: `kernel_trap_entry` is a valid, `.align 4` code address.
    unsafe { asm!("csrw stvec, {v}", v = in(reg) kernel_trap_entry as usize) };
}

fn set_user_vec() {
    // SAFETY: `trap_entry` is a valid, `.align 4` code address.
    unsafe { asm!("csrw stvec, {v}", v = in(reg) trap_entry as usize) };
}

extern "C" {
    fn trap_entry();
    fn kernel_trap_entry();
}

/// Restores every register in `*frame` and returns to U-mode at `frame.sepc`.
/// Used both to resume a thread after a real trap and to make the first
/// jump into a freshly built user image.
///
/// # Safety
/// `frame` must describe a fully-populated frame for the address space
/// currently active in `satp`.
pub unsafe fn trap_return(frame: *const TrapFrame) -> ! {
    extern "C" {
        fn trap_return_asm(frame: *const TrapFrame) -> !;
    }
    set_user_vec();
    // SAFETY: caller contract.
    unsafe { trap_return_asm(frame) }
}

const SCAUSE_INTERRUPT_BIT: usize = 1 << 63;
const EXC_ECALL_FROM_U: usize = 8;
const EXC_INSTR_PAGE_FAULT: usize = 12;
const EXC_LOAD_PAGE_FAULT: usize = 13;
const EXC_STORE_PAGE_FAULT: usize = 15;
const IRQ_SUPERVISOR_TIMER: usize = 5;
const IRQ_SUPERVISOR_EXTERNAL: usize = 9;

/// Entered from `trap_entry` with `sp` already switched to the interrupted
/// thread's kernel stack and `a0` holding a pointer to its trap frame. Never
/// returns to its caller; always ends in `trap_return`.
#[no_mangle]
extern "C" fn rust_trap_handler(frame: *mut TrapFrame) -> ! {
    // Hardware already cleared SIE on trap entry; switch the vector so a
    // spurious re-entry here (there shouldn't be one) lands on the
    // lightweight kernel path rather than reinterpreting a live `sscratch`.
    set_kernel_vec();
    let scause: usize;
    let stval: usize;
    // SAFETY: reading supervisor trap-cause/value CSRs is always valid.
    unsafe {
        asm!("csrr {}, scause", out(reg) scause);
        asm!("csrr {}, stval", out(reg) stval);
    }

    if scause & SCAUSE_INTERRUPT_BIT != 0 {
        match scause & !SCAUSE_INTERRUPT_BIT {
            IRQ_SUPERVISOR_TIMER => timer::handle_interrupt(),
            IRQ_SUPERVISOR_EXTERNAL => handle_external_interrupt(),
            other => println!("[trap] unhandled interrupt cause {other}"),
        }
    } else {
        match scause {
            EXC_ECALL_FROM_U => {
                // SAFETY: `frame` was handed to us by the asm trap entry and
                // is valid for the duration of this call.
                let frame_ref = unsafe { &mut *frame };
                frame_ref.advance_pc();
                let result = syscall::dispatch(frame_ref);
                frame_ref.a0 = result as usize;
            }
            EXC_INSTR_PAGE_FAULT | EXC_LOAD_PAGE_FAULT | EXC_STORE_PAGE_FAULT => {
                let is_store = scause == EXC_STORE_PAGE_FAULT;
                let is_exec = scause == EXC_INSTR_PAGE_FAULT;
                let handled =
                    crate::mm::address_space::handle_umode_page_fault(stval, is_store, is_exec);
                if !handled {
                    println!(
                        "[trap] fatal page fault: tid={} addr={stval:#x} scause={scause}",
                        sched::current_tid()
                    );
                    sched::exit();
                }
            }
            other => {
                println!(
                    "[trap] fatal exception: tid={} cause={other} stval={stval:#x} sepc={:#x}",
                    // SAFETY: `frame` is valid for the duration of this call.
                    unsafe { (*frame).sepc }
                );
                sched::exit();
            }
        }
    }

    // A timer tick may have used up this thread's quantum; yield here, at a
    // safe point with the trap frame fully formed and no locks held, rather
    // than from inside the ISR itself.
    if timer::take_preempt_request() {
        sched::yield_now();
    }

    // A syscall that blocked (join, usleep, a lock wait) may have let other
    // processes' threads run in between, leaving their space active; a pure
    // page fault or a non-blocking syscall leaves this as a no-op comparison.
    crate::process::switch_to_current_mspace();

    // SAFETY: `frame` still describes the (possibly just-updated) state of
    // the thread that trapped, now in its own address space.
    unsafe { trap_return(frame) }
}

/// Entered from `kernel_trap_entry` for a trap taken while the hart was
/// already running S-mode kernel code (the common case: the timer tick
/// arriving while a kernel thread runs with interrupts enabled). Only
/// interrupts are expected here; any exception is a kernel bug.
#[no_mangle]
extern "C" fn rust_kernel_trap_handler() {
    let scause: usize;
    // SAFETY: reading the trap-cause CSR is always valid.
    unsafe { asm!("csrr {}, scause", out(reg) scause) };

    if scause & SCAUSE_INTERRUPT_BIT != 0 {
        match scause & !SCAUSE_INTERRUPT_BIT {
            IRQ_SUPERVISOR_TIMER => timer::handle_interrupt(),
            IRQ_SUPERVISOR_EXTERNAL => handle_external_interrupt(),
            other => println!("[trap] unhandled interrupt cause {other} in kernel mode"),
        }
    } else {
        panic!("exception {scause} trapped while running kernel code");
    }

    // Safe point: the asm stub has only the caller-saved registers left to
    // restore, and `yield_now` preserves those across the context switch like
    // any other function call, so resuming here lands us back in the
    // interrupted kernel code exactly where it left off.
    if timer::take_preempt_request() {
        sched::yield_now();
    }
}

/// Claims and finishes the highest-priority pending PLIC source. The kernel
/// has no device that needs servicing on the interrupt path (the block
/// device driver polls its virtqueue directly), so external interrupts
/// other than a spurious UART edge are just acknowledged.
fn handle_external_interrupt() {
    if let Some(source) = irq::plic::claim() {
        if source != IRQ_UART0 {
            println!("[trap] external irq {source} (unserviced)");
        }
        let _ = irq::plic::finish(source);
    }
}

global_asm!(
    r#"
    .section .text
    .align 4
    .global kernel_trap_entry
kernel_trap_entry:
    addi sp, sp, -136
    sd ra,    0(sp)
    sd t0,    8(sp)
    sd t1,   16(sp)
    sd t2,   24(sp)
    sd a0,   32(sp)
    sd a1,   40(sp)
    sd a2,   48(sp)
    sd a3,   56(sp)
    sd a4,   64(sp)
    sd a5,   72(sp)
    sd a6,   80(sp)
    sd a7,   88(sp)
    sd t3,   96(sp)
    sd t4,  104(sp)
    sd t5,  112(sp)
    sd t6,  120(sp)
    call rust_kernel_trap_handler
    ld ra,    0(sp)
    ld t0,    8(sp)
    ld t1,   16(sp)
    ld t2,   24(sp)
    ld a0,   32(sp)
    ld a1,   40(sp)
    ld a2,   48(sp)
    ld a3,   56(sp)
    ld a4,   64(sp)
    ld a5,   72(sp)
    ld a6,   80(sp)
    ld a7,   88(sp)
    ld t3,   96(sp)
    ld t4,  104(sp)
    ld t5,  112(sp)
    ld t6,  120(sp)
    addi sp, sp, 136
    sret

    .align 4
    .global trap_entry
trap_entry:
    csrrw sp, sscratch, sp
    sd ra,    0(sp)
    sd gp,   16(sp)
    sd tp,   24(sp)
    sd t0,   32(sp)
    sd t1,   40(sp)
    sd t2,   48(sp)
    sd s0,   56(sp)
    sd s1,   64(sp)
    sd a0,   72(sp)
    sd a1,   80(sp)
    sd a2,   88(sp)
    sd a3,   96(sp)
    sd a4,  104(sp)
    sd a5,  112(sp)
    sd a6,  120(sp)
    sd a7,  128(sp)
    sd s2,  136(sp)
    sd s3,  144(sp)
    sd s4,  152(sp)
    sd s5,  160(sp)
    sd s6,  168(sp)
    sd s7,  176(sp)
    sd s8,  184(sp)
    sd s9,  192(sp)
    sd s10, 200(sp)
    sd s11, 208(sp)
    sd t3,  216(sp)
    sd t4,  224(sp)
    sd t5,  232(sp)
    sd t6,  240(sp)

    csrr t0, sscratch
    sd t0, 8(sp)
    csrr t0, sepc
    sd t0, 248(sp)

    mv a0, sp
    ld sp, 256(sp)
    call rust_trap_handler

    .global trap_return_asm
trap_return_asm:
    mv sp, a0
    ld t0, 248(sp)
    csrw sepc, t0
    csrw sscratch, sp

    # Every target of trap_return is U-mode: drop SPP, set SPIE so
    # interrupts are live again once there. t0/t1 are scratch here and
    # reloaded with their real values below before sret.
    li t0, (1 << 8)
    csrc sstatus, t0
    li t1, (1 << 5)
    csrs sstatus, t1

    ld ra,    0(sp)
    ld gp,   16(sp)
    ld tp,   24(sp)
    ld t0,   32(sp)
    ld t1,   40(sp)
    ld t2,   48(sp)
    ld s0,   56(sp)
    ld s1,   64(sp)
    ld a1,   80(sp)
    ld a2,   88(sp)
    ld a3,   96(sp)
    ld a4,  104(sp)
    ld a5,  112(sp)
    ld a6,  120(sp)
    ld a7,  128(sp)
    ld s2,  136(sp)
    ld s3,  144(sp)
    ld s4,  152(sp)
    ld s5,  160(sp)
    ld s6,  168(sp)
    ld s7,  176(sp)
    ld s8,  184(sp)
    ld s9,  192(sp)
    ld s10, 200(sp)
    ld s11, 208(sp)
    ld t3,  216(sp)
    ld t4,  224(sp)
    ld t5,  232(sp)
    ld t6,  240(sp)
    ld a0,   72(sp)
    ld sp,    8(sp)
    sret
    "#
);
