//! Kernel library: every subsystem except the bare-metal entry point and
//! panic handler, which live in the `veridian-kernel` binary crate (`main.rs`)
//! so that `cargo test`'s bare-metal harness (built from this crate alone)
//! can supply its own.

#![no_std]
#![cfg_attr(test, no_main)]
#![feature(custom_test_frameworks)]
#![feature(alloc_error_handler)]
#![cfg_attr(test, test_runner(crate::test_runner))]
#![cfg_attr(test, reexport_test_harness_main = "test_main")]

extern crate alloc;

#[macro_use]
pub mod print;

pub mod arch;
pub mod config;
pub mod drivers;
pub mod elf;
pub mod error;
pub mod fs;
pub mod io;
pub mod irq;
pub mod mm;
pub mod process;
pub mod sched;
pub mod sync;
mod syscall;
pub mod timer;

/// Name user code sees when it asks the kernel to load its first program.
const INIT_PROGRAM: &str = "init";

/// Brings every subsystem up in the order each one depends on, mounts the
/// root filesystem, loads the first user program, and settles into the
/// role of reaper for every future child of the boot thread. Never returns.
pub fn boot() -> ! {
    println!("[boot] veridian-kernel starting on riscv64");
    println!("[boot] build {} ({})", env!("GIT_HASH"), env!("BUILD_TIMESTAMP"));

    arch::riscv64::trap::init();
    arch::riscv::plic::init();
    arch::riscv::sbi::init();
    println!("[boot] interrupts routed");

    mm::init();
    println!("[boot] memory management online");

    drivers::init();

    sched::init();
    process::procmgr_init();
    println!("[boot] scheduler and process table online");

    mount_root();

    timer::init();
    println!("[boot] preemption tick armed");

    arch::riscv64::enable_interrupts();

    spawn_init();

    reap_loop();
}

/// Opens the block device and mounts KTFS on it. Fatal if no block device
/// was found at `drivers::init` time or the volume fails to mount — there is
/// no other source for the first user program.
fn mount_root() {
    let endpoint = drivers::open_named("blk", 0).unwrap_or_else(|e| {
        panic!("no root block device available: {e}");
    });
    let obj = io::ioinit1(io::IoKind::Device(endpoint));
    // SAFETY: `obj` was just created with a single reference, which `mount`
    // leaves untouched (it takes its own via `ioaddref`); closing it below
    // drops only this boot-sequence's reference.
    let result = unsafe { fs::ktfs::mount(obj) };
    // SAFETY: `obj` still holds the reference `ioinit1` gave it.
    let _ = unsafe { io::ioclose(obj) };
    result.unwrap_or_else(|e| panic!("failed to mount root filesystem: {e}"));
    println!("[boot] root filesystem mounted");
}

/// Looks up and spawns [`INIT_PROGRAM`] as the kernel's first user process.
fn spawn_init() {
    let obj = fs::ktfs::lookup(INIT_PROGRAM)
        .unwrap_or_else(|e| panic!("cannot find '{INIT_PROGRAM}': {e}"));
    let argv = alloc::vec![INIT_PROGRAM.as_bytes().to_vec()];
    process::spawn_initial(INIT_PROGRAM, obj, argv)
        .unwrap_or_else(|e| panic!("failed to spawn '{INIT_PROGRAM}': {e}"));
    println!("[boot] '{INIT_PROGRAM}' spawned");
}

/// The boot thread never does anything else once the system is up: it just
/// reaps whatever children of its own exit, forever, the same role a real
/// PID 1 plays once its own init chain has taken over.
fn reap_loop() -> ! {
    loop {
        let _ = sched::join(0);
    }
}

#[cfg(test)]
mod test_harness {
    use super::*;

    pub trait Testable {
        fn run(&self);
    }

    impl<T: Fn()> Testable for T {
        fn run(&self) {
            println!("{}...", core::any::type_name::<T>());
            self();
            println!("[ok]");
        }
    }

    pub fn test_runner(tests: &[&dyn Testable]) {
        println!("running {} tests", tests.len());
        for test in tests {
            test.run();
        }
        arch::riscv::sbi::shutdown();
    }

    #[no_mangle]
    extern "C" fn kernel_main() -> ! {
        mm::init();
        sched::init();
        process::procmgr_init();
        test_main();
        arch::riscv::sbi::shutdown();
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        println!("[test failed] {info}");
        arch::riscv::sbi::shutdown();
    }
}

#[cfg(test)]
use test_harness::{test_runner, Testable};

/// Heap allocation failure is unrecoverable in a `no_std` kernel.
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {layout:?}");
}
