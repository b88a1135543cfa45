//! KTFS: the kernel's on-disk filesystem.
//!
//! A superblock-based layout with a single root directory, fixed-size
//! inodes carrying direct/single-indirect/double-indirect block pointers,
//! and a bitmap allocator. All global state (backing device, superblock,
//! block cache) lives behind one lock; every public operation here holds it
//! for its entire body.
//!
//! Data-area block index 0 is never handed out by [`alloc_data_block`]:
//! inode and indirect-block pointers use 0 to mean "no block", so the first
//! data-area block is permanently reserved to keep that sentinel
//! unambiguous.

use crate::config::{
    KTFS_BLKSZ, KTFS_DENSZ, KTFS_INOSZ, KTFS_MAX_FILENAME_LEN, KTFS_NUM_DINDIRECT_BLOCKS,
    KTFS_NUM_DIRECT_DATA_BLOCKS,
};
use crate::error::{KernelError, KernelResult};
use crate::fs::cache::Cache;
use crate::io::{ioaddref, ioclose, ioinit1, IoKind, IoObject, IOCTL_GETBLKSZ, IOCTL_GETEND, IOCTL_SETEND};
use crate::sync::once_lock::GlobalState;

const PTRS_PER_BLOCK: usize = KTFS_BLKSZ / 4;
const DIRENTS_PER_BLOCK: usize = KTFS_BLKSZ / KTFS_DENSZ;
const INODES_PER_BLOCK: usize = KTFS_BLKSZ / KTFS_INOSZ;
const NAME_FIELD_LEN: usize = KTFS_DENSZ - 2;

const INODE_FLAG_INUSE: u32 = 1;

#[derive(Clone, Copy, Default)]
struct Superblock {
    block_count: u32,
    bitmap_block_count: u32,
    inode_block_count: u32,
    root_directory_inode: u32,
}

impl Superblock {
    fn decode(block: &[u8; KTFS_BLKSZ]) -> Self {
        Self {
            block_count: u32::from_le_bytes(block[0..4].try_into().unwrap()),
            bitmap_block_count: u32::from_le_bytes(block[4..8].try_into().unwrap()),
            inode_block_count: u32::from_le_bytes(block[8..12].try_into().unwrap()),
            root_directory_inode: u32::from_le_bytes(block[12..16].try_into().unwrap()),
        }
    }

    fn inode_table_start(&self) -> u64 {
        1 + self.bitmap_block_count as u64
    }

    fn data_start(&self) -> u64 {
        self.inode_table_start() + self.inode_block_count as u64
    }
}

#[derive(Clone, Copy, Default)]
struct Inode {
    size: u32,
    flags: u32,
    direct: [u32; KTFS_NUM_DIRECT_DATA_BLOCKS],
    indirect: u32,
    dindirect: [u32; KTFS_NUM_DINDIRECT_BLOCKS],
}

impl Inode {
    fn decode(bytes: &[u8]) -> Self {
        let mut off = 0;
        let read_u32 = |bytes: &[u8], off: &mut usize| -> u32 {
            let v = u32::from_le_bytes(bytes[*off..*off + 4].try_into().unwrap());
            *off += 4;
            v
        };
        let size = read_u32(bytes, &mut off);
        let flags = read_u32(bytes, &mut off);
        let mut direct = [0u32; KTFS_NUM_DIRECT_DATA_BLOCKS];
        for slot in direct.iter_mut() {
            *slot = read_u32(bytes, &mut off);
        }
        let indirect = read_u32(bytes, &mut off);
        let mut dindirect = [0u32; KTFS_NUM_DINDIRECT_BLOCKS];
        for slot in dindirect.iter_mut() {
            *slot = read_u32(bytes, &mut off);
        }
        Self {
            size,
            flags,
            direct,
            indirect,
            dindirect,
        }
    }

    fn encode(&self, out: &mut [u8]) {
        let mut off = 0;
        let mut write_u32 = |out: &mut [u8], off: &mut usize, v: u32| {
            out[*off..*off + 4].copy_from_slice(&v.to_le_bytes());
            *off += 4;
        };
        write_u32(out, &mut off, self.size);
        write_u32(out, &mut off, self.flags);
        for slot in self.direct {
            write_u32(out, &mut off, slot);
        }
        write_u32(out, &mut off, self.indirect);
        for slot in self.dindirect {
            write_u32(out, &mut off, slot);
        }
    }

    fn in_use(&self) -> bool {
        self.flags & INODE_FLAG_INUSE != 0
    }
}

fn decode_name(field: &[u8]) -> &[u8] {
    let len = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    &field[..len]
}

/// Global filesystem state behind the single KTFS lock.
struct Fs {
    bdev: *mut IoObject,
    sb: Superblock,
    cache: Cache,
}

// SAFETY: `Fs` is only ever touched through `FS`'s internal mutex; this
// single-hart kernel never accesses it concurrently.
unsafe impl Send for Fs {}

static FS: GlobalState<Fs> = GlobalState::new();

/// Mounts KTFS on `bdev`, taking a new reference on it.
///
/// # Safety
/// `bdev` must be a live `IoObject` pointer with at least one outstanding
/// reference.
pub unsafe fn mount(bdev: *mut IoObject) -> KernelResult<()> {
    // SAFETY: caller contract.
    unsafe { ioaddref(bdev) };
    // SAFETY: `bdev` now holds the reference just taken.
    let mut cache = unsafe { Cache::create(bdev, crate::config::CACHE_CAPACITY) };

    let mut block0 = [0u8; KTFS_BLKSZ];
    let idx = cache.get_block(0).inspect_err(|_| {
        // SAFETY: the reference taken above is still live.
        let _ = unsafe { ioclose(bdev) };
    })?;
    block0.copy_from_slice(cache.block_data(idx));
    cache.release_block(idx, false);

    let sb = Superblock::decode(&block0);
    if sb.block_count == 0 || sb.inode_block_count == 0 {
        // SAFETY: the reference taken above is still live.
        let _ = unsafe { ioclose(bdev) };
        return Err(KernelError::IoError);
    }

    FS.init(Fs { bdev, sb, cache })
        .map_err(|_| KernelError::AccessDenied)
}

fn with_fs<R>(f: impl FnOnce(&mut Fs) -> KernelResult<R>) -> KernelResult<R> {
    FS.with_mut(f).ok_or(KernelError::NotFound)?
}

/// Writes back every dirty cache entry. A no-op (not an error) if KTFS was
/// never mounted.
pub fn flush() -> KernelResult<()> {
    match FS.with_mut(|fs| fs.cache.flush()) {
        Some(result) => result,
        None => Ok(()),
    }
}

fn read_inode(fs: &mut Fs, inode_num: u32) -> KernelResult<Inode> {
    let block = fs.sb.inode_table_start() + (inode_num as u64) / INODES_PER_BLOCK as u64;
    let slot = (inode_num as usize) % INODES_PER_BLOCK;
    let idx = fs.cache.get_block(block * KTFS_BLKSZ as u64)?;
    let data = fs.cache.block_data(idx);
    let inode = Inode::decode(&data[slot * KTFS_INOSZ..(slot + 1) * KTFS_INOSZ]);
    fs.cache.release_block(idx, false);
    Ok(inode)
}

fn write_inode(fs: &mut Fs, inode_num: u32, inode: &Inode) -> KernelResult<()> {
    let block = fs.sb.inode_table_start() + (inode_num as u64) / INODES_PER_BLOCK as u64;
    let slot = (inode_num as usize) % INODES_PER_BLOCK;
    let idx = fs.cache.get_block(block * KTFS_BLKSZ as u64)?;
    let data = fs.cache.block_data(idx);
    inode.encode(&mut data[slot * KTFS_INOSZ..(slot + 1) * KTFS_INOSZ]);
    fs.cache.release_block(idx, true);
    Ok(())
}

fn read_ptr_block(fs: &mut Fs, block_num: u64) -> KernelResult<[u32; PTRS_PER_BLOCK]> {
    let idx = fs.cache.get_block(block_num * KTFS_BLKSZ as u64)?;
    let data = fs.cache.block_data(idx);
    let mut ptrs = [0u32; PTRS_PER_BLOCK];
    for (i, slot) in ptrs.iter_mut().enumerate() {
        *slot = u32::from_le_bytes(data[i * 4..i * 4 + 4].try_into().unwrap());
    }
    fs.cache.release_block(idx, false);
    Ok(ptrs)
}

/// Resolves the data-area-relative index covering `file_block_index` in
/// `inode`, returning `ENOENT` if any pointer along the path is unallocated.
fn get_blocknum_for_offset(fs: &mut Fs, inode: &Inode, mut index: usize) -> KernelResult<u32> {
    if index < KTFS_NUM_DIRECT_DATA_BLOCKS {
        let ptr = inode.direct[index];
        return if ptr == 0 { Err(KernelError::NotFound) } else { Ok(ptr) };
    }
    index -= KTFS_NUM_DIRECT_DATA_BLOCKS;

    if index < PTRS_PER_BLOCK {
        if inode.indirect == 0 {
            return Err(KernelError::NotFound);
        }
        let table = read_ptr_block(fs, data_block_to_global(&fs.sb, inode.indirect))?;
        let ptr = table[index];
        return if ptr == 0 { Err(KernelError::NotFound) } else { Ok(ptr) };
    }
    index -= PTRS_PER_BLOCK;

    let span = PTRS_PER_BLOCK * PTRS_PER_BLOCK;
    for &dind in &inode.dindirect {
        if index < span {
            if dind == 0 {
                return Err(KernelError::NotFound);
            }
            let level1 = read_ptr_block(fs, data_block_to_global(&fs.sb, dind))?;
            let mid = level1[index / PTRS_PER_BLOCK];
            if mid == 0 {
                return Err(KernelError::NotFound);
            }
            let level2 = read_ptr_block(fs, data_block_to_global(&fs.sb, mid))?;
            let ptr = level2[index % PTRS_PER_BLOCK];
            return if ptr == 0 { Err(KernelError::NotFound) } else { Ok(ptr) };
        }
        index -= span;
    }
    Err(KernelError::NotFound)
}

fn data_block_to_global(sb: &Superblock, data_relative: u32) -> u64 {
    sb.data_start() + data_relative as u64
}

/// Bit `global_block` corresponds to the device's global block number, per
/// the on-disk layout (block 0's bit is never touched here, but the
/// addressing is uniform). Returns the bitmap-region block offset, the byte
/// within it, and the bit mask.
fn bit_word_mask(global_block: u64) -> (u64, usize, u8) {
    let block_off = global_block / (KTFS_BLKSZ as u64 * 8);
    let byte_in_block = (global_block % (KTFS_BLKSZ as u64 * 8)) / 8;
    let mask = 1u8 << (global_block % 8);
    (block_off, byte_in_block as usize, mask)
}

fn bitmap_test(fs: &mut Fs, global_block: u64) -> KernelResult<bool> {
    let (block_off, byte, mask) = bit_word_mask(global_block);
    let idx = fs.cache.get_block((1 + block_off) * KTFS_BLKSZ as u64)?;
    let bit = fs.cache.block_data(idx)[byte] & mask != 0;
    fs.cache.release_block(idx, false);
    Ok(bit)
}

fn bitmap_set(fs: &mut Fs, global_block: u64) -> KernelResult<()> {
    let (block_off, byte, mask) = bit_word_mask(global_block);
    let idx = fs.cache.get_block((1 + block_off) * KTFS_BLKSZ as u64)?;
    fs.cache.block_data(idx)[byte] |= mask;
    fs.cache.release_block(idx, true);
    Ok(())
}

fn bitmap_clear_bit(fs: &mut Fs, global_block: u64) -> KernelResult<()> {
    let (block_off, byte, mask) = bit_word_mask(global_block);
    let idx = fs.cache.get_block((1 + block_off) * KTFS_BLKSZ as u64)?;
    fs.cache.block_data(idx)[byte] &= !mask;
    fs.cache.release_block(idx, true);
    Ok(())
}

/// Scans past the reserved first data block for the first clear bit, sets
/// it, and returns its data-area-relative index.
fn alloc_data_block(fs: &mut Fs) -> KernelResult<u32> {
    let data_start = fs.sb.data_start();
    for global_block in (data_start + 1)..fs.sb.block_count as u64 {
        if !bitmap_test(fs, global_block)? {
            bitmap_set(fs, global_block)?;
            let idx = fs.cache.get_block(global_block * KTFS_BLKSZ as u64)?;
            fs.cache.block_data(idx).fill(0);
            fs.cache.release_block(idx, true);
            return Ok((global_block - data_start) as u32);
        }
    }
    Err(KernelError::NoDataBlocks)
}

fn free_data_block(fs: &mut Fs, data_relative: u32) -> KernelResult<()> {
    if data_relative == 0 {
        return Ok(());
    }
    bitmap_clear_bit(fs, data_block_to_global(&fs.sb, data_relative))
}

/// Grows the root inode's first directory block into existence if it is not
/// yet allocated, returning its data-area-relative index.
fn ensure_root_dir_block(fs: &mut Fs, inode: &mut Inode) -> KernelResult<u32> {
    if inode.direct[0] == 0 {
        let block = alloc_data_block(fs)?;
        inode.direct[0] = block;
        write_inode(fs, fs.sb.root_directory_inode, inode)?;
    }
    Ok(inode.direct[0])
}

/// Number of root-directory blocks currently allocated. Directory blocks
/// are allocated strictly in `direct[]` order and never freed, so the
/// count of leading nonzero pointers is exact regardless of `inode.size`
/// (which tracks live entry count, not block count, and shrinks on delete).
fn root_dir_block_count(inode: &Inode) -> usize {
    inode.direct.iter().take_while(|&&p| p != 0).count()
}

/// Looks up `name` in the root directory, opening a wrapped handle on match.
/// `NotFound` if KTFS is not yet mounted (see [`mount`]) or `name` has no
/// entry.
pub fn lookup(name: &str) -> KernelResult<*mut IoObject> {
    if name.len() > KTFS_MAX_FILENAME_LEN {
        return Err(KernelError::InvalidArgument);
    }
    let (inode_num, size) = with_fs(|fs| {
        let root = fs.sb.root_directory_inode;
        let root_inode = read_inode(fs, root)?;
        for block_idx in 0..root_dir_block_count(&root_inode) {
            let data_rel = match get_blocknum_for_offset(fs, &root_inode, block_idx) {
                Ok(p) => p,
                Err(_) => continue,
            };
            let idx = fs.cache.get_block(data_block_to_global(&fs.sb, data_rel) * KTFS_BLKSZ as u64)?;
            let block = *fs.cache.block_data(idx);
            fs.cache.release_block(idx, false);
            for entry in 0..DIRENTS_PER_BLOCK {
                let raw = &block[entry * KTFS_DENSZ..(entry + 1) * KTFS_DENSZ];
                let inode_num = u16::from_le_bytes(raw[NAME_FIELD_LEN..NAME_FIELD_LEN + 2].try_into().unwrap());
                if inode_num == 0 {
                    continue;
                }
                if decode_name(&raw[..NAME_FIELD_LEN]) == name.as_bytes() {
                    let file_inode = read_inode(fs, inode_num as u32)?;
                    return Ok((inode_num as u32, file_inode.size));
                }
            }
        }
        Err(KernelError::NotFound)
    })?;

    let file = KtfsFile { inode_num, size };
    let raw = ioinit1(IoKind::KtfsFile(file));
    match unsafe { crate::io::seekable::SeekableIo::new(raw) } {
        Ok(seekable) => Ok(ioinit1(IoKind::Seekable(seekable))),
        Err(e) => {
            // SAFETY: `raw` was just created with refcount 1, closed here on
            // the wrap-failure path.
            let _ = unsafe { ioclose(raw) };
            Err(e)
        }
    }
}

/// Creates a new, empty file named `name` in the root directory.
pub fn create(name: &str) -> KernelResult<()> {
    if name.is_empty() || name.len() > KTFS_MAX_FILENAME_LEN {
        return Err(KernelError::InvalidArgument);
    }
    with_fs(|fs| {
        let root = fs.sb.root_directory_inode;
        let mut root_inode = read_inode(fs, root)?;
        ensure_root_dir_block(fs, &mut root_inode)?;

        let mut free_slot: Option<(u32, usize)> = None;
        for block_idx in 0..root_dir_block_count(&root_inode) {
            let data_rel = get_blocknum_for_offset(fs, &root_inode, block_idx)?;
            let idx = fs.cache.get_block(data_block_to_global(&fs.sb, data_rel) * KTFS_BLKSZ as u64)?;
            let block = *fs.cache.block_data(idx);
            fs.cache.release_block(idx, false);
            for entry in 0..DIRENTS_PER_BLOCK {
                let raw = &block[entry * KTFS_DENSZ..(entry + 1) * KTFS_DENSZ];
                let inode_num = u16::from_le_bytes(raw[NAME_FIELD_LEN..NAME_FIELD_LEN + 2].try_into().unwrap());
                if inode_num == 0 {
                    if free_slot.is_none() {
                        free_slot = Some((data_rel, entry));
                    }
                    continue;
                }
                if decode_name(&raw[..NAME_FIELD_LEN]) == name.as_bytes() {
                    return Err(KernelError::InvalidArgument);
                }
            }
        }

        let (dir_block, entry) = match free_slot {
            Some(slot) => slot,
            None => {
                let block = alloc_data_block(fs)?;
                let index = root_dir_block_count(&root_inode);
                if index >= KTFS_NUM_DIRECT_DATA_BLOCKS {
                    free_data_block(fs, block)?;
                    return Err(KernelError::NoDataBlocks);
                }
                root_inode.direct[index] = block;
                (block, 0)
            }
        };

        let total_inodes = fs.sb.inode_block_count as usize * INODES_PER_BLOCK;
        let mut new_inode_num = None;
        for candidate in 1..total_inodes as u32 {
            if !read_inode(fs, candidate)?.in_use() {
                new_inode_num = Some(candidate);
                break;
            }
        }
        let new_inode_num = new_inode_num.ok_or(KernelError::NoInodeBlocks)?;

        write_inode(
            fs,
            new_inode_num,
            &Inode {
                size: 0,
                flags: INODE_FLAG_INUSE,
                ..Default::default()
            },
        )?;

        let idx = fs.cache.get_block(data_block_to_global(&fs.sb, dir_block) * KTFS_BLKSZ as u64)?;
        let data = fs.cache.block_data(idx);
        let raw = &mut data[entry * KTFS_DENSZ..(entry + 1) * KTFS_DENSZ];
        raw.fill(0);
        raw[..name.len()].copy_from_slice(name.as_bytes());
        raw[NAME_FIELD_LEN..NAME_FIELD_LEN + 2].copy_from_slice(&(new_inode_num as u16).to_le_bytes());
        fs.cache.release_block(idx, true);

        root_inode.size += KTFS_DENSZ as u32;
        write_inode(fs, root, &root_inode)
    })
}

/// Deletes `name` from the root directory, freeing every block it owns.
pub fn delete(name: &str) -> KernelResult<()> {
    with_fs(|fs| {
        let root = fs.sb.root_directory_inode;
        let mut root_inode = read_inode(fs, root)?;

        let mut found = None;
        'outer: for block_idx in 0..root_dir_block_count(&root_inode) {
            let data_rel = get_blocknum_for_offset(fs, &root_inode, block_idx)?;
            let idx = fs.cache.get_block(data_block_to_global(&fs.sb, data_rel) * KTFS_BLKSZ as u64)?;
            let block = *fs.cache.block_data(idx);
            fs.cache.release_block(idx, false);
            for entry in 0..DIRENTS_PER_BLOCK {
                let raw = &block[entry * KTFS_DENSZ..(entry + 1) * KTFS_DENSZ];
                let inode_num = u16::from_le_bytes(raw[NAME_FIELD_LEN..NAME_FIELD_LEN + 2].try_into().unwrap());
                if inode_num != 0 && decode_name(&raw[..NAME_FIELD_LEN]) == name.as_bytes() {
                    found = Some((data_rel, entry, inode_num as u32));
                    break 'outer;
                }
            }
        }
        let (dir_block, entry, inode_num) = found.ok_or(KernelError::NotFound)?;

        let file_inode = read_inode(fs, inode_num)?;
        free_inode_blocks(fs, &file_inode)?;
        write_inode(fs, inode_num, &Inode::default())?;

        compact_dir_entry(fs, dir_block, entry)?;
        root_inode.size -= KTFS_DENSZ as u32;
        write_inode(fs, root, &root_inode)
    })
}

fn free_inode_blocks(fs: &mut Fs, inode: &Inode) -> KernelResult<()> {
    for &ptr in &inode.direct {
        if ptr != 0 {
            free_data_block(fs, ptr)?;
        }
    }
    if inode.indirect != 0 {
        let table = read_ptr_block(fs, data_block_to_global(&fs.sb, inode.indirect))?;
        for &ptr in &table {
            if ptr != 0 {
                free_data_block(fs, ptr)?;
            }
        }
        free_data_block(fs, inode.indirect)?;
    }
    for &dind in &inode.dindirect {
        if dind == 0 {
            continue;
        }
        let level1 = read_ptr_block(fs, data_block_to_global(&fs.sb, dind))?;
        for &mid in &level1 {
            if mid == 0 {
                continue;
            }
            let level2 = read_ptr_block(fs, data_block_to_global(&fs.sb, mid))?;
            for &ptr in &level2 {
                if ptr != 0 {
                    free_data_block(fs, ptr)?;
                }
            }
            free_data_block(fs, mid)?;
        }
        free_data_block(fs, dind)?;
    }
    Ok(())
}

fn compact_dir_entry(fs: &mut Fs, dir_block: u32, entry: usize) -> KernelResult<()> {
    let idx = fs.cache.get_block(data_block_to_global(&fs.sb, dir_block) * KTFS_BLKSZ as u64)?;
    let data = fs.cache.block_data(idx);
    for e in entry..DIRENTS_PER_BLOCK - 1 {
        let (left, right) = data.split_at_mut((e + 1) * KTFS_DENSZ);
        left[e * KTFS_DENSZ..(e + 1) * KTFS_DENSZ].copy_from_slice(&right[..KTFS_DENSZ]);
    }
    data[(DIRENTS_PER_BLOCK - 1) * KTFS_DENSZ..].fill(0);
    fs.cache.release_block(idx, true);
    Ok(())
}

/// A single open KTFS file, identified by its inode number. Always reached
/// wrapped in a `SeekableIo` (see [`lookup`]); `read`/`write` are therefore
/// unsupported at this layer.
pub struct KtfsFile {
    inode_num: u32,
    size: u32,
}

impl KtfsFile {
    pub fn close(&mut self) -> KernelResult<()> {
        Ok(())
    }

    pub(crate) fn read(&mut self, _buf: &mut [u8]) -> KernelResult<usize> {
        Err(KernelError::NotSupported)
    }

    pub(crate) fn write(&mut self, _buf: &[u8]) -> KernelResult<usize> {
        Err(KernelError::NotSupported)
    }

    pub(crate) fn readat(&mut self, pos: u64, buf: &mut [u8]) -> KernelResult<usize> {
        with_fs(|fs| {
            let inode = read_inode(fs, self.inode_num)?;
            if pos >= inode.size as u64 {
                return Ok(0);
            }
            let len = buf.len().min((inode.size as u64 - pos) as usize);
            let mut done = 0;
            while done < len {
                let file_pos = pos + done as u64;
                let block_idx = (file_pos / KTFS_BLKSZ as u64) as usize;
                let off_in_block = (file_pos % KTFS_BLKSZ as u64) as usize;
                let chunk = (KTFS_BLKSZ - off_in_block).min(len - done);

                let data_rel = get_blocknum_for_offset(fs, &inode, block_idx)?;
                let idx = fs.cache.get_block(data_block_to_global(&fs.sb, data_rel) * KTFS_BLKSZ as u64)?;
                buf[done..done + chunk]
                    .copy_from_slice(&fs.cache.block_data(idx)[off_in_block..off_in_block + chunk]);
                fs.cache.release_block(idx, false);
                done += chunk;
            }
            Ok(done)
        })
    }

    pub(crate) fn writeat(&mut self, pos: u64, buf: &[u8]) -> KernelResult<usize> {
        with_fs(|fs| {
            let mut inode = read_inode(fs, self.inode_num)?;
            if pos + buf.len() as u64 > inode.size as u64 {
                grow(fs, self.inode_num, &mut inode, pos + buf.len() as u64)?;
                self.size = inode.size;
            }

            let mut done = 0;
            while done < buf.len() {
                let file_pos = pos + done as u64;
                let block_idx = (file_pos / KTFS_BLKSZ as u64) as usize;
                let off_in_block = (file_pos % KTFS_BLKSZ as u64) as usize;
                let chunk = (KTFS_BLKSZ - off_in_block).min(buf.len() - done);

                let data_rel = get_blocknum_for_offset(fs, &inode, block_idx)?;
                let idx = fs.cache.get_block(data_block_to_global(&fs.sb, data_rel) * KTFS_BLKSZ as u64)?;
                fs.cache.block_data(idx)[off_in_block..off_in_block + chunk]
                    .copy_from_slice(&buf[done..done + chunk]);
                fs.cache.release_block(idx, true);
                done += chunk;
            }
            Ok(done)
        })
    }

    pub(crate) fn cntl(&mut self, cmd: u32, arg: i64) -> KernelResult<i64> {
        match cmd {
            IOCTL_GETBLKSZ => Ok(1),
            IOCTL_GETEND => Ok(self.size as i64),
            IOCTL_SETEND => with_fs(|fs| {
                let mut inode = read_inode(fs, self.inode_num)?;
                let new_end = u64::try_from(arg).map_err(|_| KernelError::InvalidArgument)?;
                if new_end > inode.size as u64 {
                    grow(fs, self.inode_num, &mut inode, new_end)?;
                    self.size = inode.size;
                }
                Ok(0)
            }),
            _ => Err(KernelError::NotSupported),
        }
    }
}

/// Grows `inode` to cover `new_end` bytes, allocating only direct blocks.
/// Only direct-block growth is supported; a file that would need indirect
/// blocks to grow further is rejected with `NotSupported`.
fn grow(fs: &mut Fs, inode_num: u32, inode: &mut Inode, new_end: u64) -> KernelResult<()> {
    let blocks_needed = (new_end as usize).div_ceil(KTFS_BLKSZ);
    if blocks_needed > KTFS_NUM_DIRECT_DATA_BLOCKS {
        return Err(KernelError::NotSupported);
    }
    for slot in inode.direct.iter_mut().take(blocks_needed) {
        if *slot == 0 {
            *slot = alloc_data_block(fs)?;
        }
    }
    inode.size = new_end as u32;
    write_inode(fs, inode_num, inode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{ioreadat, iowriteat, MemoryIo};

    const BLOCK_COUNT: u32 = 32;
    const BITMAP_BLOCKS: u32 = 1;
    const INODE_BLOCKS: u32 = 2;
    const ROOT_INODE: u32 = 1;

    /// Builds a fresh, empty KTFS image: superblock, zeroed bitmap/inode
    /// table, and an allocated (but empty) root directory inode/block.
    fn fresh_image() -> *mut IoObject {
        let total_bytes = BLOCK_COUNT as usize * KTFS_BLKSZ;
        let dev = ioinit1(IoKind::Memory(MemoryIo::new(
            alloc::vec![0u8; total_bytes].into_boxed_slice(),
        )));

        let mut sb = [0u8; KTFS_BLKSZ];
        sb[0..4].copy_from_slice(&BLOCK_COUNT.to_le_bytes());
        sb[4..8].copy_from_slice(&BITMAP_BLOCKS.to_le_bytes());
        sb[8..12].copy_from_slice(&INODE_BLOCKS.to_le_bytes());
        sb[12..16].copy_from_slice(&ROOT_INODE.to_le_bytes());
        unsafe { iowriteat(dev, 0, &sb) }.unwrap();

        // The root directory occupies data-relative block 1 (data-relative 0
        // is permanently reserved by `alloc_data_block`), global block
        // `data_start + 1`.
        let data_start = (1 + BITMAP_BLOCKS + INODE_BLOCKS) as u64;
        let root_dir_global = data_start + 1;
        let mut bitmap = [0u8; KTFS_BLKSZ];
        bitmap[(root_dir_global / 8) as usize] |= 1 << (root_dir_global % 8);
        unsafe { iowriteat(dev, KTFS_BLKSZ as u64, &bitmap) }.unwrap();

        let root_inode = Inode {
            size: 0,
            flags: INODE_FLAG_INUSE,
            direct: [1, 0, 0, 0],
            ..Default::default()
        };
        // Slot within the inode table block is `ROOT_INODE % INODES_PER_BLOCK`.
        let mut inode_block = [0u8; KTFS_BLKSZ];
        let root_slot = ROOT_INODE as usize % INODES_PER_BLOCK;
        root_inode.encode(&mut inode_block[root_slot * KTFS_INOSZ..(root_slot + 1) * KTFS_INOSZ]);
        unsafe { iowriteat(dev, (1 + BITMAP_BLOCKS as u64) * KTFS_BLKSZ as u64, &inode_block) }.unwrap();

        let empty_dir = [0u8; KTFS_BLKSZ];
        unsafe { iowriteat(dev, root_dir_global * KTFS_BLKSZ as u64, &empty_dir) }.unwrap();

        dev
    }

    // A single test function: `FS` is a process-wide `GlobalState` that
    // panics on a second `init`, so (as with every other `GlobalState`
    // singleton in this kernel, e.g. `frame_allocator`) only one test_case
    // may mount it.
    #[test_case]
    fn ktfs_roundtrip() {
        let dev = fresh_image();
        unsafe { mount(dev) }.unwrap();

        assert!(matches!(lookup("nope"), Err(KernelError::NotFound)));

        create("hello").unwrap();
        let file = lookup("hello").unwrap();
        let payload = b"hello, ktfs";
        let n = unsafe { iowriteat(file, 0, payload) }.unwrap();
        assert_eq!(n, payload.len());
        let mut out = [0u8; 32];
        let n = unsafe { ioreadat(file, 0, &mut out) }.unwrap();
        assert_eq!(&out[..n], payload);
        unsafe { ioclose(file) }.unwrap();

        assert!(matches!(create("hello"), Err(KernelError::InvalidArgument)));

        create("doomed").unwrap();
        let file = lookup("doomed").unwrap();
        unsafe { iowriteat(file, 0, &[0xAAu8; 16]) }.unwrap();
        unsafe { ioclose(file) }.unwrap();

        delete("doomed").unwrap();
        assert!(matches!(lookup("doomed"), Err(KernelError::NotFound)));

        // The freed data block is available for reuse.
        create("again").unwrap();
        let file = lookup("again").unwrap();
        unsafe { ioclose(file) }.unwrap();
    }
}
