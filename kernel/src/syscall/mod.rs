//! Syscall dispatch: the closed set of operations user code may ask the
//! kernel to perform, numbered in `a7` and dispatched from the ecall trap.
//!
//! Every argument that is a user pointer is validated against the calling
//! process's own address space (`mm::address_space::validate_vptr`/
//! `validate_vstr`) before being dereferenced — a user program can hand the
//! kernel any bit pattern in a register, and nothing upstream of this module
//! checks it.

use alloc::vec::Vec;

use crate::arch::riscv64::trapframe::TrapFrame;
use crate::drivers;
use crate::error::KernelError;
use crate::fs::ktfs;
use crate::io::{self, IoKind};
use crate::mm::address_space;
use crate::mm::page_table::PteFlags;
use crate::process;
use crate::sched;
use crate::timer;

const SYS_EXIT: usize = 0;
const SYS_EXEC: usize = 1;
const SYS_FORK: usize = 2;
const SYS_WAIT: usize = 3;
const SYS_PRINT: usize = 4;
const SYS_USLEEP: usize = 5;
const SYS_DEVOPEN: usize = 6;
const SYS_FSOPEN: usize = 7;
const SYS_CLOSE: usize = 8;
const SYS_READ: usize = 9;
const SYS_WRITE: usize = 10;
const SYS_IOCTL: usize = 11;
const SYS_PIPE: usize = 12;
const SYS_FSCREATE: usize = 13;
const SYS_FSDELETE: usize = 14;

const READ_USER: PteFlags = PteFlags::READ.union(PteFlags::USER);
const WRITE_USER: PteFlags = PteFlags::WRITE.union(PteFlags::USER);

/// Dispatches one ecall. `frame.a7` selects the syscall, `frame.a0..a2` carry
/// its arguments; the return value is stashed into `frame.a0` by the caller.
/// `SYS_EXIT` and a successful `SYS_EXEC` never return to their caller here —
/// they fall straight through to `trap_return` — so this function's `i64`
/// result type is only ever observed for every other syscall.
pub fn dispatch(frame: &mut TrapFrame) -> i64 {
    match frame.a7 {
        SYS_EXIT => process::exit(),
        SYS_EXEC => sys_exec(frame),
        SYS_FORK => sys_fork(frame),
        SYS_WAIT => sys_wait(frame.a0),
        SYS_PRINT => sys_print(frame.a0),
        SYS_USLEEP => sys_usleep(frame.a0),
        SYS_DEVOPEN => sys_devopen(frame.a0 as i64, frame.a1, frame.a2 as u32),
        SYS_FSOPEN => sys_fsopen(frame.a0 as i64, frame.a1),
        SYS_CLOSE => sys_close(frame.a0 as i64),
        SYS_READ => sys_read(frame.a0 as i64, frame.a1, frame.a2),
        SYS_WRITE => sys_write(frame.a0 as i64, frame.a1, frame.a2),
        SYS_IOCTL => sys_ioctl(frame.a0 as i64, frame.a1 as u32, frame.a2 as i64),
        SYS_PIPE => sys_pipe(frame.a0, frame.a1),
        SYS_FSCREATE => sys_fscreate(frame.a0),
        SYS_FSDELETE => sys_fsdelete(frame.a0),
        _ => KernelError::InvalidArgument.code(),
    }
}

/// Copies a NUL-terminated user string out of the current address space.
fn read_user_str(ptr: usize) -> Result<Vec<u8>, KernelError> {
    let len = address_space::validate_vstr(ptr, READ_USER)?;
    let mut buf = alloc::vec![0u8; len];
    // SAFETY: `validate_vstr` confirmed `[ptr, ptr + len)` is mapped with
    // `READ_USER` permissions in the active space.
    unsafe { core::ptr::copy_nonoverlapping(ptr as *const u8, buf.as_mut_ptr(), len) };
    Ok(buf)
}

fn read_user_utf8(ptr: usize) -> Result<alloc::string::String, i64> {
    let bytes = read_user_str(ptr).map_err(|e| e.code())?;
    alloc::string::String::from_utf8(bytes).map_err(|_| KernelError::InvalidArgument.code())
}

fn collect_argv(argc: usize, argv_ptr: usize) -> Result<Vec<Vec<u8>>, KernelError> {
    address_space::validate_vptr(argv_ptr, argc * core::mem::size_of::<usize>(), READ_USER)?;
    let mut args = Vec::with_capacity(argc);
    for i in 0..argc {
        // SAFETY: validated above, one full pointer per entry.
        let str_ptr = unsafe { *((argv_ptr + i * 8) as *const usize) };
        args.push(read_user_str(str_ptr)?);
    }
    Ok(args)
}

/// `EXEC(fd, argc, argv) -> never returns on success, EBADFD/EINVAL on
/// failure`. The fd stays open in the process's own table — `exec` only
/// borrows it to read the image.
fn sys_exec(frame: &TrapFrame) -> i64 {
    let fd = frame.a0 as i64;
    let argc = frame.a1;
    let argv_ptr = frame.a2;

    let obj = match process::io_get(fd) {
        Ok(obj) => obj,
        Err(e) => return e.code(),
    };
    let args = match collect_argv(argc, argv_ptr) {
        Ok(a) => a,
        Err(e) => return e.code(),
    };
    // SAFETY: `io_get` confirmed `obj` is a live fd owned by this process,
    // and the active address space belongs to the calling process (no
    // reschedule happens between a trap and its dispatch).
    unsafe { process::exec(obj, &args) }
}

/// `FORK() -> child tid to the parent, 0 to the child, negative on failure`.
/// The child's own copy of `frame` already has `a0` zeroed by `process::fork`
/// before it ever runs; only the parent observes this return value.
fn sys_fork(frame: &TrapFrame) -> i64 {
    match process::fork(frame) {
        Ok(tid) => tid as i64,
        Err(e) => e.code(),
    }
}

/// `WAIT(tid) -> exited child's tid, or EINVAL if no matching child exists`.
/// `tid == 0` means "any child".
fn sys_wait(tid: usize) -> i64 {
    match sched::join(tid) {
        Ok(tid) => tid as i64,
        Err(e) => e.code(),
    }
}

/// `PRINT(str) -> 0 or EACCES`. Writes `<name:tid> text` to the console.
fn sys_print(str_ptr: usize) -> i64 {
    let bytes = match read_user_str(str_ptr) {
        Ok(b) => b,
        Err(e) => return e.code(),
    };
    let text = core::str::from_utf8(&bytes).unwrap_or("<invalid utf8>");
    crate::println!("<{}:{}> {}", sched::current_name(), sched::current_tid(), text);
    0
}

/// `USLEEP(micros) -> 0`. `TIMER_FREQ` is exactly 1MHz, so microseconds and
/// timer ticks are the same unit.
fn sys_usleep(micros: usize) -> i64 {
    timer::sleep_ticks(micros as u64);
    0
}

/// `DEVOPEN(fd, name, instance) -> fd or ENOENT/EMFILE/EBADFD`.
fn sys_devopen(requested_fd: i64, name_ptr: usize, instance: u32) -> i64 {
    let name = match read_user_utf8(name_ptr) {
        Ok(n) => n,
        Err(code) => return code,
    };
    let endpoint = match drivers::open_named(&name, instance) {
        Ok(e) => e,
        Err(e) => return e.code(),
    };
    let obj = io::ioinit1(IoKind::Device(endpoint));
    install_fd(requested_fd, obj)
}

/// `FSOPEN(fd, name) -> fd or ENOENT/EMFILE/EBADFD`.
fn sys_fsopen(requested_fd: i64, name_ptr: usize) -> i64 {
    let name = match read_user_utf8(name_ptr) {
        Ok(n) => n,
        Err(code) => return code,
    };
    let obj = match ktfs::lookup(&name) {
        Ok(o) => o,
        Err(e) => return e.code(),
    };
    install_fd(requested_fd, obj)
}

fn install_fd(requested_fd: i64, obj: *mut io::IoObject) -> i64 {
    match process::io_alloc(requested_fd, obj) {
        Ok(fd) => fd,
        Err(e) => {
            // SAFETY: `obj` was just created with its sole reference still
            // held here; no other fd table has seen it.
            let _ = unsafe { io::ioclose(obj) };
            e.code()
        }
    }
}

/// `CLOSE(fd) -> 0 or EBADFD`.
fn sys_close(fd: i64) -> i64 {
    match process::io_close(fd) {
        Ok(()) => 0,
        Err(e) => e.code(),
    }
}

/// `READ(fd, buf, len) -> bytes read or EBADFD/EINVAL/EIO`.
fn sys_read(fd: i64, buf_ptr: usize, len: usize) -> i64 {
    if let Err(e) = address_space::validate_vptr(buf_ptr, len, WRITE_USER) {
        return e.code();
    }
    let obj = match process::io_get(fd) {
        Ok(o) => o,
        Err(e) => return e.code(),
    };
    // SAFETY: just validated as mapped writable in the active space.
    let buf = unsafe { core::slice::from_raw_parts_mut(buf_ptr as *mut u8, len) };
    // SAFETY: `io_get` confirmed `obj` is a live fd.
    match unsafe { io::ioread(obj, buf) } {
        Ok(n) => n as i64,
        Err(e) => e.code(),
    }
}

/// `WRITE(fd, buf, len) -> bytes written or EBADFD/EINVAL/EIO`. Writes
/// shorter than the object's own block size are routed through
/// read-position/`writeat`/advance-position instead of the cursor `write`,
/// which on a block-granular object demands at least one full block.
fn sys_write(fd: i64, buf_ptr: usize, len: usize) -> i64 {
    if let Err(e) = address_space::validate_vptr(buf_ptr, len, READ_USER) {
        return e.code();
    }
    let obj = match process::io_get(fd) {
        Ok(o) => o,
        Err(e) => return e.code(),
    };
    // SAFETY: just validated as mapped readable in the active space.
    let buf = unsafe { core::slice::from_raw_parts(buf_ptr as *const u8, len) };
    // SAFETY: `io_get` confirmed `obj` is a live fd.
    let block_size = unsafe { io::ioctl(obj, io::IOCTL_GETBLKSZ, 0) }.unwrap_or(1).max(1) as usize;
    if len < block_size {
        // SAFETY: same.
        let pos = match unsafe { io::ioctl(obj, io::IOCTL_GETPOS, 0) } {
            Ok(p) => p,
            Err(e) => return e.code(),
        };
        // SAFETY: same.
        let n = match unsafe { io::iowriteat(obj, pos as u64, buf) } {
            Ok(n) => n,
            Err(e) => return e.code(),
        };
        // SAFETY: same.
        let _ = unsafe { io::ioctl(obj, io::IOCTL_SETPOS, pos + n as i64) };
        return n as i64;
    }
    // SAFETY: same.
    match unsafe { io::iowrite(obj, buf) } {
        Ok(n) => n as i64,
        Err(e) => e.code(),
    }
}

/// `IOCTL(fd, cmd, arg) -> result or EBADFD/ENOTSUP`.
fn sys_ioctl(fd: i64, cmd: u32, arg: i64) -> i64 {
    let obj = match process::io_get(fd) {
        Ok(o) => o,
        Err(e) => return e.code(),
    };
    // SAFETY: `io_get` confirmed `obj` is a live fd.
    match unsafe { io::ioctl(obj, cmd, arg) } {
        Ok(v) => v,
        Err(e) => e.code(),
    }
}

/// `PIPE(*wfd, *rfd) -> 0 or EMFILE`. Both out-parameters are written only
/// after both fds are installed, so a mid-way allocation failure never
/// leaves a half-built pipe visible to user code.
fn sys_pipe(wfd_ptr: usize, rfd_ptr: usize) -> i64 {
    if let Err(e) = address_space::validate_vptr(wfd_ptr, 8, WRITE_USER) {
        return e.code();
    }
    if let Err(e) = address_space::validate_vptr(rfd_ptr, 8, WRITE_USER) {
        return e.code();
    }
    let (w, r) = io::new_pipe();
    let w_obj = io::ioinit1(IoKind::PipeWrite(w));
    let r_obj = io::ioinit1(IoKind::PipeRead(r));

    let wfd = match process::io_alloc(-1, w_obj) {
        Ok(fd) => fd,
        Err(e) => {
            // SAFETY: both ends were just created; neither has a second
            // reference anywhere yet.
            unsafe {
                let _ = io::ioclose(w_obj);
                let _ = io::ioclose(r_obj);
            }
            return e.code();
        }
    };
    let rfd = match process::io_alloc(-1, r_obj) {
        Ok(fd) => fd,
        Err(e) => {
            let _ = process::io_close(wfd);
            // SAFETY: `r_obj` was just created and never installed anywhere.
            unsafe {
                let _ = io::ioclose(r_obj);
            }
            return e.code();
        }
    };

    // SAFETY: validated writable above.
    unsafe {
        *(wfd_ptr as *mut i64) = wfd;
        *(rfd_ptr as *mut i64) = rfd;
    }
    0
}

/// `FSCREATE(name) -> 0 or EEXIST/EINVAL/ENOSPC`.
fn sys_fscreate(name_ptr: usize) -> i64 {
    let name = match read_user_utf8(name_ptr) {
        Ok(n) => n,
        Err(code) => return code,
    };
    match ktfs::create(&name) {
        Ok(()) => 0,
        Err(e) => e.code(),
    }
}

/// `FSDELETE(name) -> 0 or ENOENT/EINVAL`.
fn sys_fsdelete(name_ptr: usize) -> i64 {
    let name = match read_user_utf8(name_ptr) {
        Ok(n) => n,
        Err(code) => return code,
    };
    match ktfs::delete(&name) {
        Ok(()) => 0,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn syscall_numbers_are_distinct() {
        let nums = [
            SYS_EXIT, SYS_EXEC, SYS_FORK, SYS_WAIT, SYS_PRINT, SYS_USLEEP, SYS_DEVOPEN,
            SYS_FSOPEN, SYS_CLOSE, SYS_READ, SYS_WRITE, SYS_IOCTL, SYS_PIPE, SYS_FSCREATE,
            SYS_FSDELETE,
        ];
        for (i, &a) in nums.iter().enumerate() {
            for &b in &nums[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
