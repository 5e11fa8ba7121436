//! Inode-array pages: the storage behind the orphan list.
//!
//! Pages hold a fixed number of inode slots and chain through `prev`/`next`.
//! Each page carries a pool mutex taken with lock handoff, so slot updates
//! stay serialized without blocking the whole list.

use pmem_store::{PObj, Tx};

use crate::{
    error::Result,
    inode::OrphanSlot,
    layout::{type_tag, Inode, InodeArray, INODE_ARRAY_VERSION, NUM_INODES_PER_PAGE},
    pool::FsCore,
};

fn page_mutex_off(page: PObj<InodeArray>) -> u64 {
    page.off() + std::mem::offset_of!(InodeArray, mutex) as u64
}

fn page<'f>(fs: &'f FsCore, obj: PObj<InodeArray>) -> &'f mut InodeArray {
    let arr = unsafe { fs.store.at(obj).as_mut() };
    assert_eq!(arr.version, INODE_ARRAY_VERSION, "bad inode-array version");
    arr
}

/// Allocates an empty page. Must be called in a transaction; the page is
/// unreachable until the caller links it somewhere.
pub(crate) fn alloc_page(fs: &FsCore, tx: &Tx<'_>) -> Result<PObj<InodeArray>> {
    let obj: PObj<InodeArray> = fs.store.alloc_typed(tx, type_tag::INODE_ARRAY)?;
    let arr = unsafe { fs.store.at(obj).as_mut() };
    arr.version = INODE_ARRAY_VERSION;
    Ok(obj)
}

/// Adds `tinode` to the array chain starting at `head`, returning the slot
/// it landed in. Must be called in a transaction.
pub(crate) fn add(
    fs: &FsCore,
    tx: &Tx<'_>,
    head: PObj<InodeArray>,
    tinode: PObj<Inode>,
) -> Result<OrphanSlot> {
    let mut cur = head;

    loop {
        fs.store.lock_pool_mutex_handoff(tx, page_mutex_off(cur));
        let arr = page(fs, cur);

        if (arr.used as usize) < NUM_INODES_PER_PAGE {
            if let Some(i) = arr.inodes.iter().position(|s| s.is_null()) {
                tx.set(&mut arr.inodes[i], tinode);
                let used = arr.used;
                tx.set(&mut arr.used, used + 1);
                return Ok(OrphanSlot {
                    arr: cur,
                    idx: i as u32,
                });
            }
        }

        if arr.next.is_null() {
            let new = alloc_page(fs, tx)?;
            page(fs, new).prev = cur;
            tx.set(&mut arr.next, new);
        }
        cur = arr.next;
    }
}

/// Clears one slot. Must be called in a transaction.
pub(crate) fn unregister(fs: &FsCore, tx: &Tx<'_>, slot: OrphanSlot) {
    fs.store.lock_pool_mutex_handoff(tx, page_mutex_off(slot.arr));
    let arr = page(fs, slot.arr);

    debug_assert!(arr.used > 0);
    tx.set(&mut arr.inodes[slot.idx as usize], PObj::NULL);
    let used = arr.used;
    tx.set(&mut arr.used, used - 1);
}

/// Calls `f` for every inode in the chain.
pub(crate) fn traverse(fs: &FsCore, head: PObj<InodeArray>, mut f: impl FnMut(PObj<Inode>)) {
    let mut cur = head;
    while !cur.is_null() {
        let arr = page(fs, cur);
        let mut remaining = arr.used;
        for slot in &arr.inodes {
            if remaining == 0 {
                break;
            }
            if !slot.is_null() {
                f(*slot);
                remaining -= 1;
            }
        }
        cur = arr.next;
    }
}

/// Is the whole chain free of inodes?
pub(crate) fn is_empty(fs: &FsCore, head: PObj<InodeArray>) -> bool {
    let mut cur = head;
    while !cur.is_null() {
        let arr = page(fs, cur);
        if arr.used != 0 {
            return false;
        }
        cur = arr.next;
    }
    true
}

/// Does the chain consist of a single page?
pub(crate) fn is_single_page(fs: &FsCore, head: PObj<InodeArray>) -> bool {
    head.is_null() || page(fs, head).next.is_null()
}

/// Frees every page of the chain. Does not free the inodes.
pub(crate) fn free_chain(fs: &FsCore, tx: &Tx<'_>, head: PObj<InodeArray>) {
    let mut cur = head;
    while !cur.is_null() {
        let next = page(fs, cur).next;
        fs.store.free(tx, cur.off());
        cur = next;
    }
}
