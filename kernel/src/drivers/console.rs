//! 16550-compatible UART console.
//!
//! QEMU's RISC-V `virt` machine wires a ns16550a-compatible UART at
//! [`crate::config::UART0_BASE`]; firmware (OpenSBI) has already programmed
//! the baud rate by the time the kernel starts, so `Console` only needs the
//! transmit/receive data paths.

use core::fmt;

use crate::config::UART0_BASE;

const THR_RBR: usize = 0x00;
const LSR: usize = 0x05;
const LSR_DATA_READY: u8 = 1 << 0;
const LSR_THR_EMPTY: u8 = 1 << 5;

/// Handle for the single UART0 console. Carries no state of its own; every
/// method re-reads the line-status register before touching the data
/// register.
pub struct Console {
    base: usize,
}

/// The kernel's single console instance.
pub static CONSOLE: Console = Console::new(UART0_BASE);

impl Console {
    const fn new(base: usize) -> Self {
        Self { base }
    }

    #[inline]
    fn read_reg(&self, offset: usize) -> u8 {
        // SAFETY: `base + offset` lies in the identity-mapped UART0 MMIO window.
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u8) }
    }

    #[inline]
    fn write_reg(&self, offset: usize, value: u8) {
        // SAFETY: see `read_reg`.
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u8, value) }
    }

    /// Blocking write of a single byte.
    pub fn putc(&self, byte: u8) {
        while self.read_reg(LSR) & LSR_THR_EMPTY == 0 {
            core::hint::spin_loop();
        }
        self.write_reg(THR_RBR, byte);
    }

    /// Non-blocking read. Returns `None` if no byte is waiting.
    pub fn try_getc(&self) -> Option<u8> {
        if self.read_reg(LSR) & LSR_DATA_READY != 0 {
            Some(self.read_reg(THR_RBR))
        } else {
            None
        }
    }
}

impl fmt::Write for &Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.putc(byte);
        }
        Ok(())
    }
}

// SAFETY: every access is a single volatile MMIO load/store to a
// fixed register; concurrent callers interleave at the byte granularity,
// which is acceptable for a diagnostic console on a single-hart kernel.
unsafe impl Sync for Console {}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    let _ = (&CONSOLE).write_fmt(args);
}
