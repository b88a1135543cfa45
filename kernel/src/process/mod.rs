//! Process table and lifecycle: `exec`, `fork`, `exit`.
//!
//! A process is a thin wrapper around one kernel thread: an address space, a
//! fixed I/O table, and the single [`TrapFrame`] that thread's user half
//! runs under. Slot 0 is the static main process, bound to the kernel's own
//! address space and never torn down. Every other slot is allocated by
//! [`spawn_initial`] (the boot-time "load the first program" path) or
//! [`fork`].

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::arch::riscv64::trap::trap_return;
use crate::arch::riscv64::trapframe::TrapFrame;
use crate::config::{NPROC, PAGE_SIZE, PROCESS_IOMAX, UMEM_END};
use crate::elf;
use crate::error::{KernelError, KernelResult};
use crate::io::{self, IoObject};
use crate::mm::address_space::{self, MsTag};
use crate::mm::page_table::PteFlags;
use crate::sched::{self, Condition, ThreadId};
use crate::sync::once_lock::GlobalState;

struct Process {
    /// Thread currently running this process. `usize::MAX` until the owning
    /// thread has started and claimed its slot.
    tid: ThreadId,
    mspace: MsTag,
    io: [Option<*mut IoObject>; PROCESS_IOMAX],
    /// This process's permanent trap-frame storage, reused in place across
    /// every trap and every `exec` for its whole lifetime.
    frame: *mut TrapFrame,
}

// SAFETY: every field above is touched only through `PROCS`'s internal spin
// lock, which serializes all access on this single-hart kernel.
unsafe impl Send for Process {}

const NONE_PROC: Option<Process> = None;

static PROCS: GlobalState<[Option<Process>; NPROC]> = GlobalState::new();

/// Brings up the process table: slot 0 is the static main process, bound to
/// the kernel address space. Must run after the scheduler and address space
/// subsystems are initialized.
pub fn procmgr_init() {
    let mut table: [Option<Process>; NPROC] = [NONE_PROC; NPROC];
    let frame = Box::into_raw(Box::new(TrapFrame::zeroed()));
    table[0] = Some(Process {
        tid: 0,
        mspace: address_space::kernel_tag(),
        io: [None; PROCESS_IOMAX],
        frame,
    });
    PROCS.init(table).unwrap_or_else(|_| panic!("process table initialized twice"));
}

fn current_pid() -> usize {
    let tid = sched::current_tid();
    PROCS
        .with(|procs| procs.iter().position(|p| p.as_ref().is_some_and(|p| p.tid == tid)))
        .flatten()
        .expect("current thread has no owning process")
}

/// Installs the current process's own address space if it isn't already
/// active. Called once at the end of every trap, since a blocking syscall
/// (`join`, `usleep`, a lock wait) may have let an unrelated process's
/// thread run in between and leave a different space active.
pub fn switch_to_current_mspace() {
    let tid = sched::current_tid();
    let tag = PROCS
        .with(|procs| procs.iter().find_map(|p| p.as_ref().filter(|p| p.tid == tid).map(|p| p.mspace)))
        .flatten();
    if let Some(tag) = tag {
        if address_space::active_mspace() != tag {
            address_space::switch_mspace(tag);
        }
    }
}

fn discard_mspace(tag: MsTag) {
    let saved = address_space::active_mspace();
    address_space::switch_mspace(tag);
    address_space::discard_active_mspace();
    address_space::switch_mspace(saved);
}

/// Looks up an open I/O object by file descriptor in the current process.
pub fn io_get(fd: i64) -> KernelResult<*mut IoObject> {
    let idx = usize::try_from(fd).map_err(|_| KernelError::BadFileDescriptor)?;
    let pid = current_pid();
    PROCS
        .with(|procs| procs[pid].as_ref().unwrap().io.get(idx).copied())
        .flatten()
        .flatten()
        .ok_or(KernelError::BadFileDescriptor)
}

/// Installs `obj` at `requested_fd`, or at the lowest free slot if it is -1.
pub fn io_alloc(requested_fd: i64, obj: *mut IoObject) -> KernelResult<i64> {
    let pid = current_pid();
    PROCS
        .with_mut(|procs| {
            let p = procs[pid].as_mut().unwrap();
            if requested_fd == -1 {
                let slot = (0..PROCESS_IOMAX)
                    .find(|&i| p.io[i].is_none())
                    .ok_or(KernelError::TooManyOpenFiles)?;
                p.io[slot] = Some(obj);
                Ok(slot as i64)
            } else {
                let idx = usize::try_from(requested_fd).map_err(|_| KernelError::BadFileDescriptor)?;
                if idx >= PROCESS_IOMAX || p.io[idx].is_some() {
                    return Err(KernelError::BadFileDescriptor);
                }
                p.io[idx] = Some(obj);
                Ok(requested_fd)
            }
        })
        .expect("current process vanished mid-call")
}

/// Closes the I/O object at `fd` in the current process's table.
pub fn io_close(fd: i64) -> KernelResult<()> {
    let idx = usize::try_from(fd).map_err(|_| KernelError::BadFileDescriptor)?;
    let pid = current_pid();
    let obj = PROCS
        .with_mut(|procs| procs[pid].as_mut().unwrap().io.get_mut(idx).and_then(|slot| slot.take()))
        .flatten()
        .ok_or(KernelError::BadFileDescriptor)?;
    // SAFETY: this process held a reference to `obj` through its io table.
    unsafe { io::ioclose(obj) }
}

/// Lays out argv strings and pointer array at the top of one freshly mapped
/// user stack page: high end of the page holds the `argc+1`-entry pointer
/// array (NUL-terminated), the NUL-terminated argument strings sit just
/// below it, and the whole block is padded at its low end to a 16-byte
/// boundary. Returns `(initial sp, argv array address)`.
fn build_user_stack(args: &[Vec<u8>]) -> KernelResult<(usize, usize)> {
    let argc = args.len();
    let strings_len: usize = args.iter().map(|a| a.len() + 1).sum();
    let argv_len = (argc + 1) * core::mem::size_of::<usize>();
    let raw_total = strings_len + argv_len;
    let total = (raw_total + 15) & !15;
    if total > PAGE_SIZE {
        return Err(KernelError::OutOfMemory);
    }

    let page_base = UMEM_END - PAGE_SIZE;
    address_space::alloc_and_map_range(
        page_base,
        PAGE_SIZE,
        PteFlags::READ | PteFlags::WRITE | PteFlags::USER,
    );

    let region_start = UMEM_END - total;
    let pad = total - raw_total;
    let mut cursor = region_start + pad;
    let mut str_addrs = Vec::with_capacity(argc);
    for a in args {
        // SAFETY: `[cursor, cursor + a.len() + 1)` lies inside the page just
        // mapped above, within the reserved `strings_len` budget.
        unsafe {
            core::ptr::copy_nonoverlapping(a.as_ptr(), cursor as *mut u8, a.len());
            *((cursor + a.len()) as *mut u8) = 0;
        }
        str_addrs.push(cursor);
        cursor += a.len() + 1;
    }
    let argv_addr = cursor;
    for (i, &addr) in str_addrs.iter().enumerate() {
        // SAFETY: the argv array occupies the final `argv_len` bytes of the
        // same mapped, bounds-checked region.
        unsafe { *((argv_addr + i * 8) as *mut usize) = addr };
    }
    // SAFETY: same.
    unsafe { *((argv_addr + argc * 8) as *mut usize) = 0 };

    Ok((region_start, argv_addr))
}

/// Resets the active address space, loads `io` as an ELF image, builds a
/// fresh user stack from `args`, and jumps to it. Never returns: any failure
/// along the way tears the process down exactly as [`exit`] would.
///
/// `io` is borrowed, not consumed — exactly like every other caller of the
/// I/O layer, the process's own fd table (unaffected by `exec`) still owns
/// whatever reference it held on this object.
///
/// # Safety
/// `io` must be a live `IoObject` pointer with at least one outstanding
/// reference, and the active address space must belong to the calling
/// process.
pub unsafe fn exec(io: *mut IoObject, args: &[Vec<u8>]) -> ! {
    address_space::reset_active_mspace();

    // SAFETY: caller contract.
    let entry = match unsafe { elf::load(io) } {
        Ok(e) => e,
        Err(_) => self::exit(),
    };
    let (sp, argv_addr) = match build_user_stack(args) {
        Ok(v) => v,
        Err(_) => self::exit(),
    };

    let pid = current_pid();
    let frame_ptr = PROCS.with(|procs| procs[pid].as_ref().unwrap().frame).unwrap();
    // SAFETY: `frame_ptr` is this process's own permanent trap-frame storage.
    let frame = unsafe { &mut *frame_ptr };
    *frame = TrapFrame::zeroed();
    frame.sp = sp;
    frame.sepc = entry;
    frame.ra = entry;
    frame.a0 = args.len();
    frame.a1 = argv_addr;
    frame.kernel_sp = sched::current_kernel_stack_top();

    // SAFETY: `frame` is fully populated for the address space now active.
    unsafe { trap_return(frame_ptr) }
}

struct ForkChildInit {
    pid: usize,
    frame_ptr: *const TrapFrame,
    done: *const Condition,
}

fn fork_child_entry(arg: usize) {
    // SAFETY: built and leaked by `fork` just below, consumed exactly once.
    let init = unsafe { Box::from_raw(arg as *mut ForkChildInit) };
    PROCS.with_mut(|procs| procs[init.pid].as_mut().unwrap().tid = sched::current_tid());
    let mspace = PROCS.with(|procs| procs[init.pid].as_ref().unwrap().mspace).unwrap();
    address_space::switch_mspace(mspace);
    // SAFETY: `done` points at a `Condition` living on the forking thread's
    // stack, kept alive until that thread observes this broadcast.
    unsafe { &*init.done }.broadcast();
    // SAFETY: built by `fork` for this exact process and address space.
    unsafe { trap_return(init.frame_ptr) }
}

/// Duplicates the calling process: a cloned address space, shared (ref-
/// counted) I/O table, and a heap copy of `frame` with `a0` zeroed for the
/// child. Blocks until the child thread has taken over its slot and its own
/// trap frame, then returns the child's tid to the parent.
pub fn fork(frame: &TrapFrame) -> KernelResult<ThreadId> {
    let parent_pid = current_pid();
    let child_mspace = address_space::clone_active_mspace();

    let child_pid = PROCS.with_mut(|procs| (0..NPROC).find(|&i| procs[i].is_none())).flatten();
    let Some(child_pid) = child_pid else {
        discard_mspace(child_mspace);
        return Err(KernelError::NoChildren);
    };

    let mut child_io: [Option<*mut IoObject>; PROCESS_IOMAX] = [None; PROCESS_IOMAX];
    PROCS.with(|procs| {
        let parent = procs[parent_pid].as_ref().unwrap();
        for i in 0..PROCESS_IOMAX {
            if let Some(obj) = parent.io[i] {
                // SAFETY: the parent holds a live reference to `obj`.
                unsafe { io::ioaddref(obj) };
                child_io[i] = Some(obj);
            }
        }
    });

    let child_frame = Box::into_raw(Box::new(*frame));
    // SAFETY: freshly boxed, sole owner until `fork_child_entry` reclaims it.
    unsafe { (*child_frame).a0 = 0 };

    PROCS.with_mut(|procs| {
        procs[child_pid] = Some(Process {
            tid: ThreadId::MAX,
            mspace: child_mspace,
            io: child_io,
            frame: child_frame,
        });
    });

    let done = Condition::new();
    let init = Box::into_raw(Box::new(ForkChildInit {
        pid: child_pid,
        frame_ptr: child_frame as *const TrapFrame,
        done: &done as *const Condition,
    })) as usize;

    let _guard = crate::arch::riscv64::disable_interrupts();
    let child_tid = match sched::spawn("fork-child", fork_child_entry, init) {
        Ok(tid) => tid,
        Err(e) => {
            // SAFETY: not yet handed to any thread.
            unsafe {
                let _ = Box::from_raw(init as *mut ForkChildInit);
                let _ = Box::from_raw(child_frame);
            }
            PROCS.with_mut(|procs| {
                if let Some(p) = procs[child_pid].take() {
                    for obj in p.io.into_iter().flatten() {
                        // SAFETY: reference added above, not yet shared.
                        unsafe {
                            let _ = io::ioclose(obj);
                        }
                    }
                }
            });
            discard_mspace(child_mspace);
            return Err(e);
        }
    };
    done.wait();
    Ok(child_tid)
}

struct InitialSpawnInit {
    pid: usize,
    io: *mut IoObject,
    args: Vec<Vec<u8>>,
}

fn initial_entry(arg: usize) {
    // SAFETY: built and leaked by `spawn_initial` just below, consumed
    // exactly once.
    let init = unsafe { Box::from_raw(arg as *mut InitialSpawnInit) };
    PROCS.with_mut(|procs| procs[init.pid].as_mut().unwrap().tid = sched::current_tid());
    let mspace = PROCS.with(|procs| procs[init.pid].as_ref().unwrap().mspace).unwrap();
    address_space::switch_mspace(mspace);
    let _ = self::io_alloc(0, init.io);
    // SAFETY: `init.io` was opened by the caller of `spawn_initial` for
    // exactly this purpose and is now installed in this process's own fd 0.
    unsafe { exec(init.io, &init.args) }
}

/// Boot-time equivalent of `fork` + `exec` with no parent to wait on: clones
/// the currently active (kernel) space, allocates a process slot, and spawns
/// a kernel thread whose body loads `io` as the first user program. `io`'s
/// single reference transfers to the new process's fd 0.
pub fn spawn_initial(name: &'static str, io: *mut IoObject, args: Vec<Vec<u8>>) -> KernelResult<ThreadId> {
    let mspace = address_space::clone_active_mspace();
    let pid = PROCS
        .with_mut(|procs| {
            (0..NPROC).find(|&i| procs[i].is_none()).map(|slot| {
                let frame = Box::into_raw(Box::new(TrapFrame::zeroed()));
                procs[slot] = Some(Process {
                    tid: ThreadId::MAX,
                    mspace,
                    io: [None; PROCESS_IOMAX],
                    frame,
                });
                slot
            })
        })
        .flatten();
    let Some(pid) = pid else {
        discard_mspace(mspace);
        return Err(KernelError::NoChildren);
    };

    let init = Box::into_raw(Box::new(InitialSpawnInit { pid, io, args })) as usize;
    match sched::spawn(name, initial_entry, init) {
        Ok(tid) => Ok(tid),
        Err(e) => {
            // SAFETY: not yet handed to any thread.
            unsafe {
                let boxed = Box::from_raw(init as *mut InitialSpawnInit);
                PROCS.with_mut(|procs| {
                    if let Some(p) = procs[boxed.pid].take() {
                        let _ = Box::from_raw(p.frame);
                    }
                });
            }
            discard_mspace(mspace);
            Err(e)
        }
    }
}

/// Tears down the calling process: flushes the filesystem, closes every open
/// I/O object, discards the address space, frees its trap-frame storage, and
/// exits the owning thread. Never returns. Fatal if called by the static
/// main process (slot 0), mirroring `sched::exit`'s guard for the main
/// thread.
pub fn exit() -> ! {
    let pid = current_pid();
    if pid == 0 {
        panic!("static main process called process::exit");
    }
    let _ = crate::fs::ktfs::flush();

    let (io, mspace, frame) = PROCS
        .with_mut(|procs| {
            let p = procs[pid].take().unwrap();
            (p.io, p.mspace, p.frame)
        })
        .unwrap();

    for obj in io.into_iter().flatten() {
        // SAFETY: this process held a reference to `obj` through its io table.
        unsafe {
            let _ = io::ioclose(obj);
        }
    }

    discard_mspace(mspace);
    // SAFETY: this process's own trap-frame storage, no longer referenced by
    // anyone now that the process is gone.
    unsafe {
        let _ = Box::from_raw(frame);
    }

    sched::exit()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn user_stack_layout_fits_and_terminates() {
        let args: Vec<Vec<u8>> = alloc::vec![alloc::vec![b'a'], alloc::vec![b'b', b'c']];
        let argc = args.len();
        let strings_len: usize = args.iter().map(|a| a.len() + 1).sum();
        let argv_len = (argc + 1) * 8;
        let total = (strings_len + argv_len + 15) & !15;
        assert!(total <= PAGE_SIZE);
        assert_eq!(total % 16, 0);
    }
}
