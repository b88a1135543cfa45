//! Binary entry point. `arch::riscv64::boot`'s assembly stub calls
//! `kernel_main` by name once it has set up a boot stack; everything else
//! lives in the `veridian_kernel` library.

#![no_std]
#![no_main]

use veridian_kernel::{arch, println};

#[no_mangle]
extern "C" fn kernel_main() -> ! {
    veridian_kernel::boot();
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    println!("[panic] {info}");
    arch::riscv64::halt();
}
