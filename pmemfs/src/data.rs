//! Block index and data transfer.
//!
//! Each open regular file carries a sorted map from file offset to block
//! descriptor, built lazily from the persistent block list on first data
//! access. On top of it sit the allocation policy (fixed block size from
//! the environment, or demand-sized blocks with overallocation on append),
//! interval allocation and removal, and the read/write loops with
//! sparse-file semantics: holes and never-written blocks read as zeros.

use std::sync::LazyLock;

use pmem_store::{PObj, Tx};

use crate::{
    block_array::{self, inline_array},
    error::{Error, Result},
    inode::{current_time, Vinode},
    layout::{type_tag, BlockArray, BlockDesc, BLOCK_INITIALIZED},
    pool::FsCore,
};

/// Granularity of block allocation.
pub const FILE_PAGE_SIZE: u64 = 4096;

/// Largest single block: the biggest page-multiple a u32 size field holds.
pub const MAX_BLOCK_SIZE: u64 = (u32::MAX - (u32::MAX % FILE_PAGE_SIZE as u32)) as u64;

struct DataConfig {
    /// Fixed block size; 0 means size blocks on demand.
    block_size: u64,
    overallocate_on_append: bool,
}

/// `PMEMFILE_BLOCK_SIZE` and `PMEMFILE_OVERALLOCATE_ON_APPEND`, parsed once
/// at first use.
static CONFIG: LazyLock<DataConfig> = LazyLock::new(|| {
    let mut block_size = 0u64;
    if let Ok(raw) = std::env::var("PMEMFILE_BLOCK_SIZE") {
        match raw.parse::<u64>() {
            Ok(n) => block_size = page_roundup(n).min(MAX_BLOCK_SIZE),
            Err(_) => log::warn!("invalid value of PMEMFILE_BLOCK_SIZE"),
        }
    }

    let mut overallocate_on_append = block_size == 0;
    if block_size == 0 {
        if let Ok(raw) = std::env::var("PMEMFILE_OVERALLOCATE_ON_APPEND") {
            if raw.starts_with('0') {
                overallocate_on_append = false;
            }
        }
    }

    log::debug!("block size {block_size}, overallocate_on_append {overallocate_on_append}");
    DataConfig {
        block_size,
        overallocate_on_append,
    }
});

pub(crate) fn page_rounddown(n: u64) -> u64 {
    n & !(FILE_PAGE_SIZE - 1)
}

pub(crate) fn page_roundup(n: u64) -> u64 {
    page_rounddown(n + FILE_PAGE_SIZE - 1)
}

/// Widens `[offset, offset + size)` to whole pages.
pub(crate) fn expand_to_full_pages(offset: u64, size: u64) -> (u64, u64) {
    let end = page_roundup(offset + size);
    let offset = page_rounddown(offset);
    (offset, end - offset)
}

fn desc<'f>(fs: &'f FsCore, obj: PObj<BlockDesc>) -> &'f mut BlockDesc {
    unsafe { fs.store.at(obj).as_mut() }
}

/// Rebuilds the offset → block map by walking the block-array chain.
/// Caller holds the vinode's write lock.
pub(crate) fn rebuild_block_tree(fs: &FsCore, vinode: &Vinode) {
    let mut tree = std::collections::BTreeMap::new();
    let mut first: PObj<BlockDesc> = PObj::NULL;
    let mut first_off = u64::MAX;

    let mut cur = inline_array(vinode);
    while !cur.is_null() {
        let arr: &BlockArray = unsafe { fs.store.at(cur).as_ref() };
        for block in unsafe { arr.blocks() } {
            if block.size == 0 {
                break;
            }
            let handle = fs.store.handle_of(block);
            tree.insert(block.offset, handle);
            if block.offset < first_off {
                first_off = block.offset;
                first = handle;
            }
        }
        cur = arr.next;
    }

    let state = vinode.state();
    state.first_block = first;
    state.blocks = Some(tree);
}

/// Makes sure the block tree exists. Caller holds the write lock.
pub(crate) fn ensure_block_tree(fs: &FsCore, vinode: &Vinode) {
    if vinode.state().blocks.is_none() {
        rebuild_block_tree(fs, vinode);
    }
}

/// Read-locks the vinode with the block tree present, upgrading to a write
/// lock for the rebuild when a reader arrives first.
pub(crate) fn rdlock_with_block_tree<'a>(
    fs: &FsCore,
    vinode: &'a Vinode,
) -> parking_lot::RwLockReadGuard<'a, ()> {
    let guard = vinode.lock.read();
    if vinode.state().blocks.is_some() {
        return guard;
    }
    drop(guard);

    let wguard = vinode.lock.write();
    ensure_block_tree(fs, vinode);
    parking_lot::RwLockWriteGuard::downgrade(wguard)
}

/// The block with the highest offset at or below `off`.
pub(crate) fn find_closest_block(vinode: &Vinode, off: u64) -> Option<PObj<BlockDesc>> {
    let state = vinode.state();
    let tree = state.blocks.as_ref().expect("block tree built");
    tree.range(..=off).next_back().map(|(_, b)| *b)
}

/// As [`find_closest_block`], but trusting a cached block when it already
/// covers the offset.
pub(crate) fn find_closest_block_with_hint(
    fs: &FsCore,
    vinode: &Vinode,
    off: u64,
    hint: Option<PObj<BlockDesc>>,
) -> Option<PObj<BlockDesc>> {
    if let Some(h) = hint {
        if desc(fs, h).contains(off) {
            return Some(h);
        }
    }
    find_closest_block(vinode, off)
}

fn find_last_block(vinode: &Vinode) -> Option<PObj<BlockDesc>> {
    find_closest_block(vinode, u64::MAX)
}

/// Is a write of `[offset, offset + size)` going to append past the last
/// allocated block?
fn is_append(fs: &FsCore, vinode: &Vinode, offset: u64, size: u64) -> bool {
    if vinode.inode(fs).size >= offset + size {
        return false;
    }
    match find_last_block(vinode) {
        None => true,
        Some(last) => desc(fs, last).end() < offset + size,
    }
}

/// The over-rounded request size used while appending.
fn overallocate_size(size: u64) -> u64 {
    if size <= 4096 {
        16 * 1024
    } else if size <= 64 * 1024 {
        256 * 1024
    } else if size <= 1024 * 1024 {
        4 * 1024 * 1024
    } else if size <= 64 * 1024 * 1024 {
        64 * 1024 * 1024
    } else {
        size
    }
}

/// Allocates data for a freshly claimed descriptor. The new block carries
/// no `BLOCK_INITIALIZED` flag, so its memory needs no zeroing up front.
fn allocate_block_data(
    fs: &FsCore,
    tx: &Tx<'_>,
    block: PObj<BlockDesc>,
    count: u64,
    use_usable_size: bool,
) -> Result<u32> {
    debug_assert!(count > 0 && count % FILE_PAGE_SIZE == 0);

    let config = &*CONFIG;
    let mut size = if config.block_size != 0 {
        config.block_size as u32
    } else {
        count.min(MAX_BLOCK_SIZE) as u32
    };

    let data_off = fs
        .store
        .alloc_unzeroed(tx, type_tag::BLOCK_DATA, u64::from(size))?;
    if use_usable_size {
        let usable = fs.store.usable_size(data_off);
        debug_assert!(usable >= u64::from(size));
        size = usable.min(MAX_BLOCK_SIZE).min(page_rounddown(usable)) as u32;
    }

    let b = desc(fs, block);
    b.data = PObj::from_off(data_off);
    b.size = size;
    b.flags = 0;
    Ok(size)
}

/// Fills every hole intersecting `[offset, offset + size)` with newly
/// allocated blocks, returning the number of bytes of data allocated.
///
/// Case analysis per iteration, with `block` the closest block at or below
/// the interval's lower edge:
///  1. the edge is inside `block` — skip the intersection;
///  2. no blocks at all — allocate, hopefully covering the whole interval;
///  3. before the first block — allocate up to the first block;
///  4. after the last block — allocate, possibly overallocating;
///  5. between two blocks — fill the hole up to the next block.
pub(crate) fn allocate_interval(
    fs: &FsCore,
    tx: &Tx<'_>,
    vinode: &Vinode,
    offset: u64,
    size: u64,
) -> Result<u64> {
    debug_assert!(size > 0);
    ensure_block_tree(fs, vinode);

    let over = CONFIG.overallocate_on_append && is_append(fs, vinode, offset, size);
    let size = if over { overallocate_size(size) } else { size };

    let (mut offset, mut size) = expand_to_full_pages(offset, size);
    let mut allocated = 0u64;

    let mut block = find_closest_block(vinode, offset);

    loop {
        if let Some(b) = block.filter(|b| desc(fs, *b).contains(offset)) {
            // Not in a hole; skip over the intersection.
            let available = desc(fs, b).end() - offset;
            if available >= size {
                break;
            }
            offset += available;
            size -= available;
        } else if block.is_none() && vinode.state().first_block.is_null() {
            // Empty file; the first block may cover the whole interval.
            let new = block_array::block_list_insert_after(fs, tx, vinode, None)?;
            desc(fs, new).offset = offset;
            allocated += u64::from(allocate_block_data(fs, tx, new, size, over)?);
            tree_insert(vinode, fs, new);
            block = Some(new);
        } else if block.is_none() {
            // Hole before the first block.
            let first_offset = desc(fs, vinode.state().first_block).offset;
            let count = size.min(first_offset - offset);

            let new = block_array::block_list_insert_after(fs, tx, vinode, None)?;
            desc(fs, new).offset = offset;
            allocated += u64::from(allocate_block_data(fs, tx, new, count, false)?);
            tree_insert(vinode, fs, new);
            block = Some(new);
        } else if desc(fs, block.unwrap()).next.is_null() {
            // Past the last allocated block.
            let new = block_array::block_list_insert_after(fs, tx, vinode, block)?;
            desc(fs, new).offset = offset;
            allocated += u64::from(allocate_block_data(fs, tx, new, size, over)?);
            tree_insert(vinode, fs, new);
            block = Some(new);
        } else {
            // Possibly a hole between two allocated blocks.
            let next = desc(fs, block.unwrap()).next;
            let hole = (desc(fs, next).offset - offset).min(size);

            if hole > 0 {
                let new = block_array::block_list_insert_after(fs, tx, vinode, block)?;
                desc(fs, new).offset = offset;
                allocated += u64::from(allocate_block_data(fs, tx, new, hole, false)?);
                if u64::from(desc(fs, new).size) > hole {
                    // Never let a filler block overlap its successor.
                    allocated -= u64::from(desc(fs, new).size) - hole;
                    desc(fs, new).size = hole as u32;
                }
                tree_insert(vinode, fs, new);
                block = Some(new);
            } else {
                block = Some(next);
            }
        }

        if size == 0 {
            break;
        }
    }

    Ok(allocated)
}

fn tree_insert(vinode: &Vinode, fs: &FsCore, block: PObj<BlockDesc>) {
    let offset = desc(fs, block).offset;
    vinode
        .state()
        .blocks
        .as_mut()
        .expect("block tree built")
        .insert(offset, block);
}

/// Punches `[offset, offset + len)` out of the file: blocks wholly inside
/// the interval are deallocated, partial overlaps are zeroed (with the
/// zeroed bytes snapshotted, so an abort cannot leave spurious zeros).
/// Returns the number of data bytes released.
pub(crate) fn remove_interval(
    fs: &FsCore,
    tx: &Tx<'_>,
    vinode: &Vinode,
    offset: u64,
    len: u64,
) -> u64 {
    debug_assert!(len > 0);
    ensure_block_tree(fs, vinode);
    vinode.state().data_gen += 1;

    let mut released = 0u64;
    let mut block = find_closest_block(vinode, offset + len - 1);

    while let Some(b) = block {
        let d = *desc(fs, b);
        if d.end() <= offset {
            break;
        }

        if d.offset >= offset && d.end() <= offset + len {
            // Wholly inside the interval; deallocate.
            vinode
                .state()
                .blocks
                .as_mut()
                .expect("block tree built")
                .remove(&d.offset);
            let prev = block_array::block_list_remove(fs, tx, vinode, b);
            released += u64::from(d.size);
            block = (!prev.is_null()).then_some(prev);
        } else if d.offset < offset && d.end() > offset + len {
            // Interval wholly inside the block; zero the middle.
            if d.is_initialized() {
                let data_off = d.data.off() + (offset - d.offset);
                tx.add_range(data_off, len);
                tx.memzero(data_off, len);
            }
            break;
        } else if d.end() > offset + len {
            // Block hangs over the right edge; zero its head.
            if d.is_initialized() {
                let count = offset + len - d.offset;
                tx.add_range(d.data.off(), count);
                tx.memzero(d.data.off(), count);
            }
            block = (!d.prev.is_null()).then_some(d.prev);
        } else {
            // Block hangs over the left edge; zero its tail.
            if d.is_initialized() {
                let in_block = offset - d.offset;
                let count = u64::from(d.size) - in_block;
                tx.add_range(d.data.off() + in_block, count);
                tx.memzero(d.data.off() + in_block, count);
            }
            block = (!d.prev.is_null()).then_some(d.prev);
        }
    }

    released
}

/// Copies from the file into `buf`, starting at `offset`. Missing blocks
/// and never-written blocks read as zeros. Never allocates. Returns the
/// block that served the final bytes, as a cursor hint.
///
/// Caller holds a read lock with the block tree built and has clamped
/// `buf` to the file size.
pub(crate) fn read_range(
    fs: &FsCore,
    vinode: &Vinode,
    mut offset: u64,
    buf: &mut [u8],
    hint: Option<PObj<BlockDesc>>,
) -> Option<PObj<BlockDesc>> {
    let mut block = find_closest_block_with_hint(fs, vinode, offset, hint);
    let mut last = block;
    let mut buf = buf;

    while !buf.is_empty() {
        match block.filter(|b| desc(fs, *b).contains(offset)) {
            None => {
                // A hole; zero-fill until the next block (or the end).
                let next = match block {
                    None => {
                        let first = vinode.state().first_block;
                        (!first.is_null()).then_some(first)
                    }
                    Some(b) => {
                        let n = desc(fs, b).next;
                        (!n.is_null()).then_some(n)
                    }
                };

                let mut count = buf.len() as u64;
                if let Some(n) = next {
                    count = count.min(desc(fs, n).offset - offset);
                    block = Some(n);
                }

                let (zeroed, rest) = std::mem::take(&mut buf).split_at_mut(count as usize);
                zeroed.fill(0);
                offset += count;
                buf = rest;
            }
            Some(b) => {
                let d = *desc(fs, b);
                let in_block_start = offset - d.offset;
                let in_block_len = (u64::from(d.size) - in_block_start).min(buf.len() as u64);

                let (filled, rest) =
                    std::mem::take(&mut buf).split_at_mut(in_block_len as usize);
                if d.is_initialized() {
                    let src = fs.store.at_off(d.data.off() + in_block_start);
                    unsafe {
                        std::ptr::copy_nonoverlapping(src, filled.as_mut_ptr(), filled.len());
                    }
                } else {
                    filled.fill(0);
                }

                offset += in_block_len;
                buf = rest;
                last = Some(b);
                block = (!d.next.is_null()).then_some(d.next);
            }
        }
    }

    last
}

/// Writes one range into a single block, zeroing the fringe of a block on
/// its first write and marking it initialized.
fn write_block_range(
    fs: &FsCore,
    tx: &Tx<'_>,
    block: PObj<BlockDesc>,
    in_block_start: u64,
    buf: &[u8],
) {
    let d = *desc(fs, block);
    debug_assert!(in_block_start + buf.len() as u64 <= u64::from(d.size));

    if !d.is_initialized() {
        if in_block_start > 0 {
            tx.memzero(d.data.off(), in_block_start);
        }
        let tail = in_block_start + buf.len() as u64;
        if tail < u64::from(d.size) {
            tx.memzero(d.data.off() + tail, u64::from(d.size) - tail);
        }
        let b = desc(fs, block);
        tx.set(&mut b.flags, d.flags | BLOCK_INITIALIZED);
    }

    tx.write_bytes(d.data.off() + in_block_start, buf);
}

/// Copies `buf` into the file at `offset`. The interval must already be
/// fully allocated. Returns the block that took the final bytes.
pub(crate) fn write_range(
    fs: &FsCore,
    tx: &Tx<'_>,
    vinode: &Vinode,
    mut offset: u64,
    mut buf: &[u8],
    hint: Option<PObj<BlockDesc>>,
) -> Option<PObj<BlockDesc>> {
    let mut block = find_closest_block_with_hint(fs, vinode, offset, hint);
    let mut last = block;

    while !buf.is_empty() {
        let b = block.expect("write range allocated");
        let d = *desc(fs, b);
        debug_assert!(d.contains(offset));

        let in_block_start = offset - d.offset;
        let in_block_len = (u64::from(d.size) - in_block_start).min(buf.len() as u64);

        write_block_range(fs, tx, b, in_block_start, &buf[..in_block_len as usize]);

        offset += in_block_len;
        buf = &buf[in_block_len as usize..];
        last = Some(b);
        block = (!d.next.is_null()).then_some(d.next);
    }

    last
}

/// Truncation: shrinking releases `[new_size, old_size)`, growing leaves a
/// hole. Updates size, allocated space and times.
pub(crate) fn truncate(fs: &FsCore, tx: &Tx<'_>, vinode: &Vinode, new_size: u64) -> Result<()> {
    let inode = vinode.inode(fs);
    let old_size = inode.size;

    if new_size < old_size {
        ensure_block_tree(fs, vinode);
        let released = remove_interval(fs, tx, vinode, new_size, old_size - new_size);
        let inode = vinode.inode_mut(fs);
        let allocated = inode.allocated_space;
        tx.set(&mut inode.allocated_space, allocated - released);
    }

    let t = current_time();
    let inode = vinode.inode_mut(fs);
    tx.set(&mut inode.size, new_size);
    tx.set(&mut inode.ctime, t);
    tx.set(&mut inode.mtime, t);
    Ok(())
}

/// First data offset at or after `off`, for `lseek(SEEK_DATA)`.
/// Caller holds a read lock with the block tree built.
pub(crate) fn seek_data(fs: &FsCore, vinode: &Vinode, off: u64) -> Result<u64> {
    let size = vinode.inode(fs).size;
    if off >= size {
        return Err(Error::NoSuchAddress);
    }

    let mut block = find_closest_block(vinode, off);
    if let Some(b) = block.filter(|b| desc(fs, *b).contains(off)) {
        if desc(fs, b).is_initialized() {
            return Ok(off);
        }
    }

    // Scan forward for the next initialized block.
    let mut cur = match block.take() {
        Some(b) => desc(fs, b).next,
        None => vinode.state().first_block,
    };
    while !cur.is_null() {
        let d = desc(fs, cur);
        if d.is_initialized() && d.end() > off && d.offset < size {
            return Ok(d.offset.max(off));
        }
        cur = d.next;
    }

    Err(Error::NoSuchAddress)
}

/// First hole offset at or after `off`, for `lseek(SEEK_HOLE)`; the
/// implicit hole at end-of-file counts.
pub(crate) fn seek_hole(fs: &FsCore, vinode: &Vinode, off: u64) -> Result<u64> {
    let size = vinode.inode(fs).size;
    if off >= size {
        return Err(Error::NoSuchAddress);
    }

    let mut off = off;
    loop {
        if off >= size {
            return Ok(size);
        }
        match find_closest_block(vinode, off).filter(|b| desc(fs, *b).contains(off)) {
            Some(b) if desc(fs, b).is_initialized() => off = desc(fs, b).end(),
            _ => return Ok(off),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overallocation_ladder() {
        assert_eq!(overallocate_size(1), 16 * 1024);
        assert_eq!(overallocate_size(4096), 16 * 1024);
        assert_eq!(overallocate_size(4097), 256 * 1024);
        assert_eq!(overallocate_size(64 * 1024), 256 * 1024);
        assert_eq!(overallocate_size(1024 * 1024), 4 * 1024 * 1024);
        assert_eq!(overallocate_size(64 * 1024 * 1024), 64 * 1024 * 1024);
        assert_eq!(overallocate_size(65 * 1024 * 1024), 65 * 1024 * 1024);
    }

    #[test]
    fn page_expansion() {
        assert_eq!(expand_to_full_pages(0, 1), (0, 4096));
        assert_eq!(expand_to_full_pages(4095, 2), (0, 8192));
        assert_eq!(expand_to_full_pages(4096, 4096), (4096, 4096));
        assert_eq!(expand_to_full_pages(5000, 100), (4096, 4096));
    }

    #[test]
    fn max_block_size_is_page_aligned() {
        assert_eq!(MAX_BLOCK_SIZE % FILE_PAGE_SIZE, 0);
        assert!(MAX_BLOCK_SIZE <= u64::from(u32::MAX));
    }
}
