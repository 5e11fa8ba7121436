//! Directory engine.
//!
//! A directory is a chain of fixed-size dirent pages starting inside the
//! inode payload. Slot order is not significant; a free slot has a NUL
//! first name byte and a null inode handle. Every directory carries `.`
//! and `..`, and a directory's link count is 2 plus its subdirectory
//! count.

use pmem_store::{PObj, Tx};

use crate::{
    cred::Credentials,
    error::{Error, Result},
    inode::{self, current_time, Vinode, Vref},
    layout::{
        type_tag, Dir, Dirent, Inode, Time, ACCESSPERMS, MAX_FILE_NAME, METADATA_BLOCK_SIZE,
        S_IFDIR,
    },
    path::ResolveFlags,
    pool::FsCore,
};

fn page<'f>(fs: &'f FsCore, obj: PObj<Dir>) -> &'f mut Dir {
    unsafe { fs.store.at(obj).as_mut() }
}

fn dirent<'f>(fs: &'f FsCore, obj: PObj<Dirent>) -> &'f mut Dirent {
    unsafe { fs.store.at(obj).as_mut() }
}

/// Handle of the dirent page inlined in an inode's payload.
pub(crate) fn inline_dir(tinode: PObj<Inode>) -> PObj<Dir> {
    PObj::from_off(tinode.off() + std::mem::offset_of!(Inode, file_data) as u64)
}

/// Bytes a chained dirent page accounts for in the directory's size.
fn dir_page_size(fs: &FsCore, obj: PObj<Dir>) -> u64 {
    fs.store.usable_size(obj.off())
}

/// A dirent looked up together with the vinode it points to.
pub(crate) struct DirentInfo {
    pub dirent: PObj<Dirent>,
    pub vinode: Vref,
}

/// Adds a `name → child` entry to the directory inode `parent`.
///
/// Must be called in a transaction; the caller holds the parent's write
/// lock. Fails with `EEXIST` on a name clash and refuses to create entries
/// in deleted directories.
pub(crate) fn add_dirent(
    fs: &FsCore,
    tx: &Tx<'_>,
    parent: PObj<Inode>,
    name: &[u8],
    child: PObj<Inode>,
    tm: Time,
) -> Result<()> {
    log::trace!(
        "add_dirent parent {:#x} name {:?} child {:#x}",
        parent.off(),
        String::from_utf8_lossy(name),
        child.off()
    );

    if name.len() > MAX_FILE_NAME {
        return Err(Error::NameTooLong);
    }
    assert!(
        !name.contains(&b'/'),
        "trying to add dirent with slash: {:?}",
        String::from_utf8_lossy(name)
    );

    let parent_inode = unsafe { fs.store.at(parent).as_mut() };

    // No new names in deleted directories, except the "." of a directory
    // being born.
    if parent_inode.nlink == 0 && name != b"." {
        return Err(Error::NotFound);
    }

    let mut free: Option<PObj<Dirent>> = None;
    let mut cur = inline_dir(parent);

    loop {
        let dir = page(fs, cur);
        for d in unsafe { dir.dirents() } {
            if d.name_eq(name) {
                return Err(Error::Exists);
            }
            if free.is_none() && d.is_free() {
                free = Some(fs.store.handle_of(d));
            }
        }

        if free.is_none() && dir.next.is_null() {
            let off = fs
                .store
                .alloc_zeroed(tx, type_tag::DIR, METADATA_BLOCK_SIZE as u64)?;
            let new: PObj<Dir> = PObj::from_off(off);
            let sz = dir_page_size(fs, new);
            let slots = (sz as usize - std::mem::size_of::<Dir>()) / std::mem::size_of::<Dirent>();
            page(fs, new).init(slots as u32, PObj::NULL);

            tx.set(&mut dir.next, new);
            let size = parent_inode.size;
            tx.set(&mut parent_inode.size, size + sz);
        }

        if dir.next.is_null() {
            break;
        }
        cur = dir.next;
    }

    let slot = free.expect("a free dirent slot exists after page growth");
    let d = dirent(fs, slot);

    // Snapshot the handle plus the name bytes to be written in one range.
    tx.add_ptr_range(d, (8 + name.len() + 1) as u64);
    d.inode = child;
    d.name[..name.len()].copy_from_slice(name);
    d.name[name.len()] = 0;

    let child_inode = unsafe { fs.store.at(child).as_mut() };
    let nlink = child_inode.nlink;
    tx.set(&mut child_inode.nlink, nlink + 1);

    // st_ctime changes when link count does; st_mtime of the directory
    // changes when entries come and go.
    tx.set(&mut child_inode.ctime, tm);
    tx.set(&mut parent_inode.mtime, tm);

    Ok(())
}

/// Allocates a directory inode with `.` and `..`, and, unless it is the
/// root, links it into `parent` under `name`.
///
/// Must be called in a transaction; the caller holds the parent's write
/// lock.
pub(crate) fn new_dir_inode(
    fs: &FsCore,
    tx: &Tx<'_>,
    parent: Option<(PObj<Inode>, &[u8])>,
    cred: &Credentials,
    mode: u64,
) -> Result<PObj<Inode>> {
    if mode & !ACCESSPERMS != 0 {
        log::warn!("invalid mode flags {mode:#o}");
        return Err(Error::InvalidArgument);
    }

    let child = inode::inode_alloc(fs, tx, cred, S_IFDIR | mode)?;
    let t = unsafe { fs.store.at(child).as_ref() }.ctime;

    add_dirent(fs, tx, child, b".", child, t)?;
    match parent {
        None => {
            // The root: its ".." points back at itself.
            add_dirent(fs, tx, child, b"..", child, t)?;
        }
        Some((parent, name)) => {
            add_dirent(fs, tx, child, b"..", parent, t)?;
            add_dirent(fs, tx, parent, name, child, t)?;
        }
    }

    Ok(child)
}

/// Finds `name` in the directory. Caller holds the parent's lock.
pub(crate) fn lookup_dirent_by_name_locked(
    fs: &FsCore,
    parent: &Vinode,
    name: &[u8],
) -> Result<PObj<Dirent>> {
    let parent_inode = parent.inode(fs);
    if !parent_inode.is_dir() {
        return Err(Error::NotADirectory);
    }
    debug_assert!(!name.is_empty());

    let mut cur = inline_dir(parent.tinode);
    while !cur.is_null() {
        let dir = page(fs, cur);
        for d in unsafe { dir.dirents() } {
            if d.name_eq(name) {
                return Ok(fs.store.handle_of(d));
            }
        }
        cur = dir.next;
    }

    Err(Error::NotFound)
}

/// Finds `name` and takes a reference on the inode it points to. Caller
/// holds the parent's lock.
pub(crate) fn lookup_vinode_by_name_locked(
    fs: &std::sync::Arc<FsCore>,
    parent: &Vref,
    name: &[u8],
) -> Result<DirentInfo> {
    let slot = lookup_dirent_by_name_locked(fs, parent, name)?;
    let child = dirent(fs, slot).inode;
    let vinode = fs.map.get(fs, child, Some(parent.arc()), Some(name), None)?;
    Ok(DirentInfo {
        dirent: slot,
        vinode,
    })
}

/// Finds the entry pointing at `child`. Caller holds the parent's lock.
pub(crate) fn lookup_dirent_by_vinode_locked(
    fs: &FsCore,
    parent: &Vinode,
    child: &Vinode,
) -> Result<PObj<Dirent>> {
    let parent_inode = parent.inode(fs);
    if !parent_inode.is_dir() {
        return Err(Error::NotADirectory);
    }

    let mut cur = inline_dir(parent.tinode);
    while !cur.is_null() {
        let dir = page(fs, cur);
        for d in unsafe { dir.dirents() } {
            if d.inode == child.tinode {
                return Ok(fs.store.handle_of(d));
            }
        }
        cur = dir.next;
    }

    Err(Error::NotFound)
}

/// Looks `name` up in `parent`, taking a reference on the result. Takes
/// the parent's read lock; must not be called in a transaction.
pub(crate) fn lookup_dirent(
    fs: &std::sync::Arc<FsCore>,
    parent: &Vref,
    name: &[u8],
    flags: ResolveFlags,
) -> Result<Vref> {
    if name.is_empty() {
        return Err(Error::NotFound);
    }

    if flags.contains(ResolveFlags::STOP_AT_ROOT) && fs.is_root(parent) && name == b".." {
        return Err(Error::CrossDevice);
    }

    let _guard = parent.lock.read();

    if name == b".." {
        let state = parent.state();
        if let Some(p) = state.parent.as_ref() {
            return Ok(Vref::adopt(std::sync::Arc::clone(p)));
        }
        return Err(Error::NotFound);
    }

    Ok(lookup_vinode_by_name_locked(fs, parent, name)?.vinode)
}

/// Clears one file entry: the slot, the child's link count, and the
/// timestamps. Must be called in a transaction; caller holds write locks
/// on the parent and the child.
pub(crate) fn unlink_file_dirent(
    fs: &FsCore,
    tx: &Tx<'_>,
    parent: &Vinode,
    slot: PObj<Dirent>,
    child: &Vinode,
) {
    let d = dirent(fs, slot);
    let child_inode = child.inode_mut(fs);
    debug_assert!(child_inode.nlink > 0);
    debug_assert!(d.inode == child.tinode);

    // One byte of the name is enough: a NUL first byte frees the slot.
    tx.add_ptr_range(d, 8 + 1);

    let tm = current_time();

    let nlink = child_inode.nlink - 1;
    tx.set(&mut child_inode.nlink, nlink);
    if nlink > 0 {
        tx.set(&mut child_inode.ctime, tm);
    }
    let parent_inode = parent.inode_mut(fs);
    tx.set(&mut parent_inode.mtime, tm);

    d.name[0] = 0;
    d.inode = PObj::NULL;
}

/// Unlinks the empty directory `child` from `parent` through `slot`:
/// clears `.` and `..`, zeroes the child's link count, and drops the
/// parent's link for the vanished `..`.
///
/// Must be called in a transaction; caller holds write locks on both.
pub(crate) fn unlink_dir_dirent(
    fs: &FsCore,
    tx: &Tx<'_>,
    parent: &Vinode,
    slot: PObj<Dirent>,
    child: &Vinode,
) -> Result<()> {
    let child_inode = child.inode_mut(fs);
    let head = page(fs, inline_dir(child.tinode));

    if !head.next.is_null() {
        return Err(Error::NotEmpty);
    }

    let slots = unsafe { head.dirents() };
    let dot = &slots[0];
    let dotdot = &slots[1];
    debug_assert!(dot.name_eq(b"."));
    debug_assert!(dot.inode == child.tinode);
    debug_assert!(dotdot.name_eq(b".."));
    debug_assert!(dotdot.inode == parent.tinode);

    if slots.iter().skip(2).any(|d| !d.inode.is_null()) {
        return Err(Error::NotEmpty);
    }

    let dot = fs.store.handle_of(dot);
    let dotdot = fs.store.handle_of(dotdot);
    for entry in [dot, dotdot] {
        let d = dirent(fs, entry);
        tx.add_ptr_range(d, 8 + 1);
        d.name[0] = 0;
        d.inode = PObj::NULL;
    }

    debug_assert_eq!(child_inode.nlink, 2);
    tx.set(&mut child_inode.nlink, 0);

    let d = dirent(fs, slot);
    tx.add_ptr_range(d, 8 + 1);
    d.name[0] = 0;
    d.inode = PObj::NULL;

    let parent_inode = parent.inode_mut(fs);
    let nlink = parent_inode.nlink;
    tx.set(&mut parent_inode.nlink, nlink - 1);

    let tm = current_time();
    tx.set(&mut parent_inode.ctime, tm);
    tx.set(&mut parent_inode.mtime, tm);

    Ok(())
}

// Directory readout. The 64-bit file offset encodes a cursor: the high 32
// bits are the page id, the low 32 bits the slot index within that page.

pub(crate) const DIRENT_ID_MASK: u64 = 0xffff_ffff;

pub(crate) fn dir_id(offset: u64) -> u32 {
    (offset >> 32) as u32
}

pub(crate) fn dirent_id(offset: u64) -> u32 {
    (offset & DIRENT_ID_MASK) as u32
}

pub(crate) fn pack_offset(dir_id: u32, dirent_id: u32) -> u64 {
    (u64::from(dir_id) << 32) | u64::from(dirent_id)
}

/// Cached readout position of an open directory.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DirPos {
    pub dir: PObj<Dir>,
    pub dir_id: u32,
}

/// Translates an open file's offset into a page and slot index, walking
/// the chain when the cached position does not match. Returns `None` at
/// end of directory.
pub(crate) fn seek_dir(
    fs: &FsCore,
    inode_head: PObj<Dir>,
    offset: &mut u64,
    pos: &mut DirPos,
) -> Option<(PObj<Dir>, u32)> {
    let mut cur;

    if *offset == 0 {
        cur = inode_head;
        pos.dir = cur;
        pos.dir_id = 0;
    } else if dir_id(*offset) == pos.dir_id && !pos.dir.is_null() {
        cur = pos.dir;
    } else {
        cur = inode_head;
        let mut id = 0;
        while dir_id(*offset) != id {
            let next = page(fs, cur).next;
            if next.is_null() {
                return None;
            }
            cur = next;
            id += 1;
        }
        pos.dir = cur;
        pos.dir_id = id;
    }

    let mut slot = dirent_id(*offset);
    while slot >= page(fs, cur).num_elements {
        let next = page(fs, cur).next;
        if next.is_null() {
            return None;
        }
        slot -= page(fs, cur).num_elements;
        cur = next;
        pos.dir = cur;
        pos.dir_id += 1;
    }

    *offset = pack_offset(pos.dir_id, slot);
    Some((cur, slot))
}

/// One visible directory entry during readout.
pub(crate) struct ReadDirEntry<'n> {
    pub ino: u64,
    pub next_off: u64,
    pub name: &'n [u8],
    pub file_type: u8,
}

/// Walks entries from the cursor, calling `emit` for each non-free slot.
/// `emit` returns the number of bytes it consumed, or `None` when the
/// caller's buffer is full. Returns the total bytes consumed.
pub(crate) fn read_dir(
    fs: &FsCore,
    inode_head: PObj<Dir>,
    offset: &mut u64,
    pos: &mut DirPos,
    mut emit: impl FnMut(&ReadDirEntry<'_>) -> Option<usize>,
) -> usize {
    let Some((mut cur, mut slot)) = seek_dir(fs, inode_head, offset, pos) else {
        return 0;
    };

    let mut read = 0usize;

    loop {
        if slot >= page(fs, cur).num_elements {
            let next = page(fs, cur).next;
            if next.is_null() {
                break;
            }
            cur = next;
            pos.dir = cur;
            pos.dir_id += 1;
            slot = 0;
            *offset = pack_offset(pos.dir_id, 0);
        }

        let cur_page = page(fs, cur);
        let d = &unsafe { cur_page.dirents() }[slot as usize];
        if d.inode.is_null() {
            slot += 1;
            *offset += 1;
            continue;
        }

        let mut next_off = *offset + 1;
        if slot + 1 >= page(fs, cur).num_elements {
            next_off = pack_offset(dir_id(next_off) + 1, 0);
        }

        let child = unsafe { fs.store.at(d.inode).as_ref() };
        let file_type = if child.is_regular_file() {
            libc::DT_REG
        } else if child.is_symlink() {
            libc::DT_LNK
        } else if child.is_dir() {
            libc::DT_DIR
        } else {
            unreachable!("unknown inode type {:#o}", child.flags)
        };

        let entry = ReadDirEntry {
            ino: d.inode.off(),
            next_off,
            name: d.name(),
            file_type,
        };
        let Some(consumed) = emit(&entry) else { break };
        read += consumed;

        slot += 1;
        *offset += 1;
    }

    read
}
