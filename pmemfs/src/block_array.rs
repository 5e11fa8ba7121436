//! Block-descriptor slot management.
//!
//! Descriptors live in block-array pages; the first page is inlined in the
//! inode payload, later pages are spliced in as the second page of the
//! chain. The vinode caches the first free slot; the invariant maintained
//! on removal is that *all* free slots live in a single page, which is why
//! removing a descriptor relocates the most recently used one into the
//! freed slot.

use dataview::PodMethods as _;
use pmem_store::{PObj, Tx};

use crate::{
    error::Result,
    inode::{FreeSlot, Vinode},
    layout::{type_tag, BlockArray, BlockDesc, Inode, METADATA_BLOCK_SIZE},
    pool::FsCore,
};

fn arr<'f>(fs: &'f FsCore, obj: PObj<BlockArray>) -> &'f mut BlockArray {
    unsafe { fs.store.at(obj).as_mut() }
}

fn desc<'f>(fs: &'f FsCore, obj: PObj<BlockDesc>) -> &'f mut BlockDesc {
    unsafe { fs.store.at(obj).as_mut() }
}

/// Handle of the block array inlined in the inode payload.
pub(crate) fn inline_array(vinode: &Vinode) -> PObj<BlockArray> {
    PObj::from_off(vinode.tinode.off() + std::mem::offset_of!(Inode, file_data) as u64)
}

/// Lazily initializes the vinode's first-free-slot cache by scanning the
/// page that holds free slots (the inline page, or the page linked right
/// after it).
pub(crate) fn update_first_block_info(fs: &FsCore, vinode: &Vinode) {
    let state = vinode.state();
    if state.first_free_block.is_some() {
        return;
    }

    let inline = inline_array(vinode);
    let mut cur = inline;
    if !arr(fs, inline).next.is_null() {
        cur = arr(fs, inline).next;
    }

    let page = arr(fs, cur);
    let blocks = unsafe { page.blocks() };
    let mut idx = 0u32;
    while (idx as usize) < blocks.len() && blocks[idx as usize].size != 0 {
        idx += 1;
    }

    state.first_free_block = Some(FreeSlot { arr: cur, idx });
}

fn has_free_block_entry(fs: &FsCore, vinode: &Vinode) -> bool {
    let slot = vinode.state().first_free_block.unwrap();
    slot.idx < arr(fs, slot.arr).length
}

/// Splices a fresh page in as the second page of the chain and points the
/// free-slot cache at it.
fn allocate_new_block_array(fs: &FsCore, tx: &Tx<'_>, vinode: &Vinode) -> Result<()> {
    debug_assert!(!has_free_block_entry(fs, vinode));

    let off = fs
        .store
        .alloc_zeroed(tx, type_tag::BLOCK_ARRAY, METADATA_BLOCK_SIZE as u64)?;
    let new: PObj<BlockArray> = PObj::from_off(off);
    let usable = fs.store.usable_size(off);
    let slots = (usable as usize - std::mem::size_of::<BlockArray>())
        / std::mem::size_of::<BlockDesc>();

    let inline = inline_array(vinode);
    let inline_arr = arr(fs, inline);
    arr(fs, new).init(slots as u32, inline_arr.next);
    tx.set(&mut inline_arr.next, new);

    vinode.state().first_free_block = Some(FreeSlot { arr: new, idx: 0 });
    Ok(())
}

/// Claims the first free descriptor slot, snapshotting it for the caller
/// to fill in.
fn acquire_new_entry(fs: &FsCore, tx: &Tx<'_>, vinode: &Vinode) -> Result<PObj<BlockDesc>> {
    if !has_free_block_entry(fs, vinode) {
        allocate_new_block_array(fs, tx, vinode)?;
    }
    debug_assert!(has_free_block_entry(fs, vinode));

    let state = vinode.state();
    let slot = state.first_free_block.as_mut().unwrap();
    let page = arr(fs, slot.arr);
    let block = &mut unsafe { page.blocks_mut() }[slot.idx as usize];
    slot.idx += 1;

    debug_assert_eq!(block.size, 0);
    tx.add_ptr(block);

    Ok(fs.store.handle_of(block))
}

/// Claims a slot and links it into the block list right after `prev`
/// (`None` means at the head).
pub(crate) fn block_list_insert_after(
    fs: &FsCore,
    tx: &Tx<'_>,
    vinode: &Vinode,
    prev: Option<PObj<BlockDesc>>,
) -> Result<PObj<BlockDesc>> {
    update_first_block_info(fs, vinode);

    let new = acquire_new_entry(fs, tx, vinode)?;
    let state = vinode.state();

    match prev {
        None => {
            if !state.first_block.is_null() {
                let first = state.first_block;
                desc(fs, new).next = first;
                tx.set(&mut desc(fs, first).prev, new);
            }
            state.first_block = new;
        }
        Some(prev) => {
            let prev_desc = desc(fs, prev);
            let next = prev_desc.next;
            desc(fs, new).prev = prev;
            desc(fs, new).next = next;
            tx.set(&mut prev_desc.next, new);
            if !next.is_null() {
                tx.set(&mut desc(fs, next).prev, new);
            }
        }
    }

    Ok(new)
}

/// The most recently claimed descriptor: the one right before the first
/// free slot.
fn last_used_block(fs: &FsCore, vinode: &Vinode) -> PObj<BlockDesc> {
    let slot = vinode.state().first_free_block.unwrap();
    debug_assert!(slot.idx > 0);
    let page = arr(fs, slot.arr);
    let block = &unsafe { page.blocks() }[slot.idx as usize - 1];
    fs.store.handle_of(block)
}

fn unlink_block(fs: &FsCore, tx: &Tx<'_>, block: PObj<BlockDesc>) {
    let b = *desc(fs, block);
    if !b.prev.is_null() {
        tx.set(&mut desc(fs, b.prev).next, b.next);
    }
    if !b.next.is_null() {
        tx.set(&mut desc(fs, b.next).prev, b.prev);
    }
}

/// Moves the descriptor at `src` into the slot at `dst`, fixing up the
/// neighbors' links. Whatever was at `dst` is discarded.
fn relocate_block(fs: &FsCore, tx: &Tx<'_>, dst: PObj<BlockDesc>, src: PObj<BlockDesc>) {
    debug_assert!(dst != src);

    tx.add_obj(dst);
    let s = *desc(fs, src);
    if !s.prev.is_null() {
        tx.set(&mut desc(fs, s.prev).next, dst);
    }
    if !s.next.is_null() {
        tx.set(&mut desc(fs, s.next).prev, dst);
    }
    *desc(fs, dst) = s;
}

fn is_first_block_array_empty(fs: &FsCore, vinode: &Vinode) -> bool {
    let slot = vinode.state().first_free_block.unwrap();
    slot.idx == 0 && slot.arr != inline_array(vinode)
}

/// Unlinks and frees the (empty, non-inline) page holding the free slots.
fn remove_first_block_array(fs: &FsCore, tx: &Tx<'_>, vinode: &Vinode) {
    let inline = inline_array(vinode);
    let to_remove = arr(fs, inline).next;
    let new_next = arr(fs, to_remove).next;

    tx.set(&mut arr(fs, inline).next, new_next);

    let cur = if new_next.is_null() { inline } else { new_next };
    let idx = arr(fs, cur).length;
    vinode.state().first_free_block = Some(FreeSlot { arr: cur, idx });

    fs.store.free(tx, to_remove.off());
}

/// Removes a descriptor from the block list, freeing its data and keeping
/// the free slots in a single page. Returns the descriptor preceding the
/// removed one, accounting for the relocation.
pub(crate) fn block_list_remove(
    fs: &FsCore,
    tx: &Tx<'_>,
    vinode: &Vinode,
    block: PObj<BlockDesc>,
) -> PObj<BlockDesc> {
    update_first_block_info(fs, vinode);
    debug_assert!(vinode.state().first_free_block.unwrap().idx > 0);

    let moving = last_used_block(fs, vinode);

    unlink_block(fs, tx, block);

    let mut prev = desc(fs, block).prev;
    if moving == prev {
        prev = block;
    }

    let state = vinode.state();
    if state.first_block == block {
        state.first_block = desc(fs, block).next;
    }

    let data = desc(fs, block).data;
    if !data.is_null() {
        fs.store.free(tx, data.off());
    }

    if moving != block {
        if state.first_block == moving {
            state.first_block = block;
        }
        if let Some(tree) = state.blocks.as_mut() {
            tree.remove(&desc(fs, moving).offset);
        }
        relocate_block(fs, tx, block, moving);
        if let Some(tree) = vinode.state().blocks.as_mut() {
            tree.insert(desc(fs, block).offset, block);
        }
    }

    tx.set(desc(fs, moving), BlockDesc::zeroed());

    let slot = vinode.state().first_free_block.as_mut().unwrap();
    slot.idx -= 1;

    if is_first_block_array_empty(fs, vinode) {
        remove_first_block_array(fs, tx, vinode);
    }

    prev
}
