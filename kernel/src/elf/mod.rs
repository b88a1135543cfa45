//! ELF64 loader for user-space executables.
//!
//! Accepts only statically-linked `ET_EXEC` little-endian 64-bit images
//! targeting this hardware's ISA. Loads every `PT_LOAD` segment into the
//! address space that is active when `load` is called (the caller,
//! `process::exec`, has already reset it to a fresh, empty space).

use alloc::vec;

use crate::config::{PAGE_SIZE, UMEM_END, UMEM_START};
use crate::error::{KernelError, KernelResult};
use crate::io::{ioreadat, IoObject};
use crate::mm::address_space;
use crate::mm::page_table::PteFlags;

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const EI_VERSION: usize = 6;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;
const ET_EXEC: u16 = 2;
/// `e_machine` value for RISC-V (the only ISA this kernel runs on).
const EM_RISCV: u16 = 243;

const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

fn u16_at(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}

fn u32_at(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn u64_at(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

/// Validates and loads every `PT_LOAD` segment of the ELF image read from
/// `io`, into the currently active address space. Returns the entry point
/// on success.
///
/// # Safety
/// `io` must be a live `IoObject` pointer with at least one outstanding
/// reference. All reads are by absolute offset, so the object's own seek
/// position is irrelevant.
pub unsafe fn load(io: *mut IoObject) -> KernelResult<usize> {
    let mut ehdr = [0u8; EHDR_SIZE];
    // SAFETY: caller contract.
    let n = unsafe { ioreadat(io, 0, &mut ehdr) }?;
    if n != EHDR_SIZE {
        return Err(KernelError::IoError);
    }
    if ehdr[0..4] != [0x7f, b'E', b'L', b'F'] {
        return Err(KernelError::BadExecutableFormat);
    }
    if ehdr[EI_CLASS] != ELFCLASS64
        || ehdr[EI_DATA] != ELFDATA2LSB
        || ehdr[EI_VERSION] != EV_CURRENT
    {
        return Err(KernelError::InvalidArgument);
    }
    if u16_at(&ehdr, 16) != ET_EXEC || u16_at(&ehdr, 18) != EM_RISCV {
        return Err(KernelError::InvalidArgument);
    }

    let entry = u64_at(&ehdr, 24) as usize;
    let phoff = u64_at(&ehdr, 32);
    let phentsize = u16_at(&ehdr, 54) as usize;
    let phnum = u16_at(&ehdr, 56) as usize;
    if phentsize < PHDR_SIZE {
        return Err(KernelError::InvalidArgument);
    }

    for i in 0..phnum {
        let mut phdr = vec![0u8; phentsize];
        // SAFETY: caller contract, forwarded.
        let n = unsafe { ioreadat(io, phoff + (i * phentsize) as u64, &mut phdr) }?;
        if n != phentsize {
            return Err(KernelError::IoError);
        }
        if u32_at(&phdr, 0) != PT_LOAD {
            continue;
        }
        // SAFETY: `io` is forwarded under the same caller contract; the
        // segment descriptor is validated inside.
        unsafe { load_segment(io, &phdr) }?;
    }

    Ok(entry)
}

/// # Safety
/// Same contract as [`load`].
unsafe fn load_segment(io: *mut IoObject, phdr: &[u8]) -> KernelResult<()> {
    let p_flags = u32_at(phdr, 4);
    let p_offset = u64_at(phdr, 8);
    let p_vaddr = u64_at(phdr, 16) as usize;
    let p_filesz = u64_at(phdr, 32) as usize;
    let p_memsz = u64_at(phdr, 40) as usize;

    if p_filesz > p_memsz {
        return Err(KernelError::InvalidArgument);
    }
    let seg_end = p_vaddr.checked_add(p_memsz).ok_or(KernelError::InvalidArgument)?;
    if p_vaddr < UMEM_START || seg_end > UMEM_END {
        return Err(KernelError::InvalidArgument);
    }

    let mut flags = PteFlags::USER;
    if p_flags & PF_R != 0 {
        flags |= PteFlags::READ;
    }
    if p_flags & PF_W != 0 {
        flags |= PteFlags::WRITE;
    }
    if p_flags & PF_X != 0 {
        flags |= PteFlags::EXEC;
    }

    let map_start = p_vaddr & !(PAGE_SIZE - 1);
    let map_end = (seg_end + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let map_size = map_end - map_start;

    // Map writable first so the copy below always succeeds even for a
    // read-only or execute-only segment; real permissions are set at the end.
    address_space::alloc_and_map_range(map_start, map_size, flags | PteFlags::WRITE);

    if p_filesz > 0 {
        // SAFETY: `[p_vaddr, p_vaddr + p_filesz)` was just mapped writable
        // above and lies inside the bounds checked above.
        let dst = unsafe { core::slice::from_raw_parts_mut(p_vaddr as *mut u8, p_filesz) };
        // SAFETY: caller contract.
        let n = unsafe { ioreadat(io, p_offset, dst) }?;
        if n != p_filesz {
            return Err(KernelError::IoError);
        }
    }
    if p_memsz > p_filesz {
        // SAFETY: `[p_vaddr + p_filesz, p_vaddr + p_memsz)` lies inside the
        // same mapped, bounds-checked range.
        unsafe { core::ptr::write_bytes((p_vaddr + p_filesz) as *mut u8, 0, p_memsz - p_filesz) };
    }

    address_space::set_range_flags(map_start, map_size, flags);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn rejects_bad_magic() {
        let buf = [0u8; EHDR_SIZE];
        assert_ne!(buf[0..4], [0x7f, b'E', b'L', b'F']);
    }

    #[test_case]
    fn phdr_field_offsets_match_elf64_layout() {
        let mut phdr = [0u8; PHDR_SIZE];
        phdr[0..4].copy_from_slice(&PT_LOAD.to_le_bytes());
        phdr[4..8].copy_from_slice(&(PF_R | PF_X).to_le_bytes());
        phdr[16..24].copy_from_slice(&0x1000u64.to_le_bytes());
        phdr[32..40].copy_from_slice(&100u64.to_le_bytes());
        phdr[40..48].copy_from_slice(&200u64.to_le_bytes());
        assert_eq!(u32_at(&phdr, 0), PT_LOAD);
        assert_eq!(u32_at(&phdr, 4), PF_R | PF_X);
        assert_eq!(u64_at(&phdr, 16), 0x1000);
        assert_eq!(u64_at(&phdr, 32), 100);
        assert_eq!(u64_at(&phdr, 40), 200);
    }
}
