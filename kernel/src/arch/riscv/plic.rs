//! Platform-Level Interrupt Controller driver (SiFive PLIC, QEMU `virt`).
//!
//! Exposes exactly the surface the core calls through: enable a source,
//! claim the highest-priority pending one, and signal completion. Source
//! and context addressing follow the SiFive PLIC spec.
//!
//! | Region            | Offset    | Size per entry | Description       |
//! |--------------------|-----------|-----------------|-------------------|
//! | Priority           | 0x00_0000 | 4 bytes         | per-source        |
//! | Pending            | 0x00_1000 | 1 bit/source    | packed into words |
//! | Enable             | 0x00_2000 | 0x80/context    | 1 bit/source      |
//! | Priority threshold | 0x20_0000 | 0x1000/context  | minimum delivered |
//! | Claim/complete     | 0x20_0004 | 0x1000/context  | claim / EOI       |
//!
//! Hart 0's S-mode context (the only context this single-hart kernel uses)
//! is context 1 (`hart*2 + 1`).

use core::sync::atomic::{fence, Ordering};

use spin::Mutex;

use crate::config::PLIC_BASE;
use crate::error::{KernelError, KernelResult};
use crate::sync::once_lock::GlobalState;

const PRIORITY_OFFSET: usize = 0x00_0000;
const PENDING_OFFSET: usize = 0x00_1000;
const ENABLE_OFFSET: usize = 0x00_2000;
const ENABLE_STRIDE: usize = 0x80;
const THRESHOLD_OFFSET: usize = 0x20_0000;
const CLAIM_OFFSET: usize = 0x20_0004;
const CONTEXT_STRIDE: usize = 0x1000;

const MAX_SOURCES: u32 = 128;
const MAX_PRIORITY: u32 = 7;
const S_CONTEXT: u32 = 1; // hart 0, S-mode

static PLIC: GlobalState<Mutex<Plic>> = GlobalState::new();

struct Plic {
    base: usize,
}

impl Plic {
    fn validate(&self, irq: u32) -> KernelResult<()> {
        if irq == 0 || irq >= MAX_SOURCES {
            return Err(KernelError::InvalidArgument);
        }
        Ok(())
    }

    fn priority_addr(&self, irq: u32) -> *mut u32 {
        (self.base + PRIORITY_OFFSET + irq as usize * 4) as *mut u32
    }

    fn enable_addr(&self, irq: u32) -> *mut u32 {
        (self.base + ENABLE_OFFSET + S_CONTEXT as usize * ENABLE_STRIDE + (irq as usize / 32) * 4)
            as *mut u32
    }

    fn threshold_addr(&self) -> *mut u32 {
        (self.base + THRESHOLD_OFFSET + S_CONTEXT as usize * CONTEXT_STRIDE) as *mut u32
    }

    fn claim_addr(&self) -> *mut u32 {
        (self.base + CLAIM_OFFSET + S_CONTEXT as usize * CONTEXT_STRIDE) as *mut u32
    }

    fn enable_source(&self, irq: u32, priority: u32) -> KernelResult<()> {
        self.validate(irq)?;
        if priority == 0 || priority > MAX_PRIORITY {
            return Err(KernelError::InvalidArgument);
        }
        // SAFETY: addresses are computed from a validated source number and
        // the fixed S-mode context, landing inside the PLIC's MMIO window.
        unsafe {
            core::ptr::write_volatile(self.priority_addr(irq), priority);
            let addr = self.enable_addr(irq);
            let bit = 1u32 << (irq % 32);
            let cur = core::ptr::read_volatile(addr);
            core::ptr::write_volatile(addr, cur | bit);
            core::ptr::write_volatile(self.threshold_addr(), 0);
        }
        fence(Ordering::SeqCst);
        Ok(())
    }

    fn claim(&self) -> Option<u32> {
        // SAFETY: the claim register always exists at this fixed offset for
        // the boot hart's S-mode context.
        let irq = unsafe { core::ptr::read_volatile(self.claim_addr()) };
        (irq != 0).then_some(irq)
    }

    fn finish(&self, irq: u32) -> KernelResult<()> {
        self.validate(irq)?;
        // SAFETY: writing the claimed source id back signals EOI to the PLIC.
        unsafe { core::ptr::write_volatile(self.claim_addr(), irq) };
        fence(Ordering::SeqCst);
        Ok(())
    }
}

/// Resets all priorities/enables and installs the PLIC singleton.
pub fn init() {
    let plic = Plic { base: PLIC_BASE };
    for irq in 1..MAX_SOURCES {
        // SAFETY: `irq` ranges over all valid source numbers.
        unsafe { core::ptr::write_volatile(plic.priority_addr(irq), 0) };
    }
    // SAFETY: fixed threshold register for the boot hart's S-mode context.
    unsafe { core::ptr::write_volatile(plic.threshold_addr(), 0) };
    fence(Ordering::SeqCst);
    PLIC.init(Mutex::new(plic))
        .unwrap_or_else(|_| panic!("PLIC initialized twice"));
}

/// Enables `irq` at the given priority (1..=7) for the boot hart.
pub fn enable_source(irq: u32, priority: u32) -> KernelResult<()> {
    PLIC.with(|mtx| mtx.lock().enable_source(irq, priority))
        .unwrap_or(Err(KernelError::NotSupported))
}

/// Claims the highest-priority pending interrupt, if any.
pub fn claim() -> Option<u32> {
    PLIC.with(|mtx| mtx.lock().claim()).flatten()
}

/// Signals end-of-interrupt for a source previously returned by `claim`.
pub fn finish(irq: u32) -> KernelResult<()> {
    PLIC.with(|mtx| mtx.lock().finish(irq))
        .unwrap_or(Err(KernelError::NotSupported))
}
