//! Volatile inode handles.
//!
//! A [`Vinode`] is the in-memory side of a persistent inode: a reference
//! count, an rwlock, and the derived state the data engine builds lazily
//! (block tree, cached first block, first free descriptor slot). Vinodes
//! are registered in the pool's inode map and handed out as [`Vref`]s.
//!
//! Lifecycle: the first reference creates the vinode, the last reference
//! drops it — and if the inode's link count is zero by then, the inode and
//! its data are freed inside the drop transaction. Dropping a directory's
//! last reference releases the reference it held on its parent, so the
//! release walks up the parent chain, never past the root.
//!
//! Lock discipline: `lock` guards the persistent inode fields and all of
//! [`VinodeState`]. Multi-vinode acquisitions sort the vinodes by address
//! and lock in ascending order.

use std::{
    cell::UnsafeCell,
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Weak,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use arrayvec::ArrayVec;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use pmem_store::{PObj, Tx};

use crate::{
    cred::Credentials,
    error::Result,
    inode_array,
    layout::{
        type_tag, BlockArray, BlockDesc, Dir, Inode, InodeArray, Time, INLINE_BLOCK_SLOTS,
        INLINE_DIRENT_SLOTS, INODE_VERSION, IN_INODE_STORAGE, S_IFDIR,
    },
    pool::FsCore,
};

/// Position of an inode inside an orphan-list page.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OrphanSlot {
    pub arr: PObj<InodeArray>,
    pub idx: u32,
}

/// Position of the first free descriptor slot in the block-array chain.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FreeSlot {
    pub arr: PObj<BlockArray>,
    pub idx: u32,
}

/// Snapshot of the volatile fields a transaction may clobber; restored on
/// abort.
#[derive(Debug, Clone, Copy)]
pub(crate) struct VolatileSnapshot {
    first_block: PObj<BlockDesc>,
    first_free_block: Option<FreeSlot>,
}

/// Everything guarded by the vinode lock.
pub(crate) struct VinodeState {
    /// Parent directory; holds one reference. Directories only (and the
    /// root, whose parent is itself, without a reference).
    pub parent: Option<Arc<Vinode>>,
    /// Where this inode sits in the orphan list, if it does.
    pub orphan: Option<OrphanSlot>,
    /// Offset → block descriptor, built lazily on first data access.
    pub blocks: Option<BTreeMap<u64, PObj<BlockDesc>>>,
    /// Block with the lowest file offset.
    pub first_block: PObj<BlockDesc>,
    /// First free descriptor slot, lazily initialized.
    pub first_free_block: Option<FreeSlot>,
    pub snapshot: Option<VolatileSnapshot>,
    /// Bumped whenever block descriptors move or disappear; open files
    /// drop their cached block pointer when it changes.
    pub data_gen: u64,
    /// Volatile access time; flushed to the inode by the next transaction
    /// that touches it.
    pub atime: Time,
    pub atime_dirty: bool,
    #[cfg(debug_assertions)]
    pub path: Option<String>,
}

pub(crate) struct Vinode {
    refcnt: AtomicU32,
    /// Set when the registering transaction aborted; the handle is then a
    /// shell whose persistent inode no longer exists.
    defunct: AtomicBool,
    pub(crate) tinode: PObj<Inode>,
    pub(crate) lock: RwLock<()>,
    state: UnsafeCell<VinodeState>,
    pub(crate) fs: Weak<FsCore>,
}

// State access is guarded by `lock`; the refcount and map registration
// serialize creation and destruction.
unsafe impl Send for Vinode {}
unsafe impl Sync for Vinode {}

impl Vinode {
    pub(crate) fn new(fs: Weak<FsCore>, tinode: PObj<Inode>) -> Self {
        Self {
            refcnt: AtomicU32::new(0),
            defunct: AtomicBool::new(false),
            tinode,
            lock: RwLock::new(()),
            fs,
            state: UnsafeCell::new(VinodeState {
                parent: None,
                orphan: None,
                blocks: None,
                first_block: PObj::NULL,
                first_free_block: None,
                snapshot: None,
                data_gen: 0,
                atime: Time::ZERO,
                atime_dirty: false,
                #[cfg(debug_assertions)]
                path: None,
            }),
        }
    }

    /// Shared view of the volatile state. Caller must hold `lock` (any
    /// mode) or otherwise have exclusive access.
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn state(&self) -> &mut VinodeState {
        unsafe { &mut *self.state.get() }
    }

    /// Direct reference to the persistent inode.
    ///
    /// Caller must hold `lock`; write access additionally requires being
    /// inside a transaction with the fields snapshotted.
    pub(crate) fn inode<'f>(&self, fs: &'f FsCore) -> &'f Inode {
        unsafe { fs.store.at(self.tinode).as_ref() }
    }

    #[allow(clippy::mut_from_ref)]
    pub(crate) fn inode_mut<'f>(&self, fs: &'f FsCore) -> &'f mut Inode {
        unsafe { fs.store.at(self.tinode).as_mut() }
    }

    pub(crate) fn is_dir(&self, fs: &FsCore) -> bool {
        self.inode(fs).is_dir()
    }

    pub(crate) fn is_regular_file(&self, fs: &FsCore) -> bool {
        self.inode(fs).is_regular_file()
    }

    pub(crate) fn is_symlink(&self, fs: &FsCore) -> bool {
        self.inode(fs).is_symlink()
    }

    pub(crate) fn incref(&self) {
        self.refcnt.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn set_parent(&self, parent: Arc<Vinode>) {
        parent.incref();
        self.state().parent = Some(parent);
    }

    pub(crate) fn mark_defunct(&self) {
        self.defunct.store(true, Ordering::Release);
    }

    /// Saves the volatile fields a transaction may clobber.
    pub(crate) fn snapshot_volatile(&self) {
        let state = self.state();
        state.snapshot = Some(VolatileSnapshot {
            first_block: state.first_block,
            first_free_block: state.first_free_block,
        });
    }

    /// Restores the volatile fields after an abort. The block tree may
    /// reference rolled-back descriptors, so it is discarded and rebuilt
    /// lazily.
    pub(crate) fn restore_volatile(&self) {
        let state = self.state();
        if let Some(snap) = state.snapshot.take() {
            state.first_block = snap.first_block;
            state.first_free_block = snap.first_free_block;
        }
        state.blocks = None;
        state.data_gen += 1;
    }

    pub(crate) fn discard_volatile_snapshot(&self) {
        self.state().snapshot = None;
    }

    #[cfg(debug_assertions)]
    pub(crate) fn set_debug_path(
        &self,
        fs: &FsCore,
        parent: Option<&Arc<Vinode>>,
        name: Option<&[u8]>,
    ) {
        let _ = fs;
        let state = self.state();
        if state.path.is_some() {
            return;
        }
        let name = name.map(|n| String::from_utf8_lossy(n).into_owned());
        state.path = match (parent, name) {
            (Some(p), Some(n)) => {
                let base = p.state().path.clone().unwrap_or_default();
                if base == "/" {
                    Some(format!("/{n}"))
                } else {
                    Some(format!("{base}/{n}"))
                }
            }
            (None, Some(n)) => Some(n),
            _ => None,
        };
    }
}

/// A counted reference to a vinode. Dropping the last reference releases
/// the inode (and frees it when its link count reached zero).
pub(crate) struct Vref {
    v: Option<Arc<Vinode>>,
}

impl Vref {
    /// Wraps `arc`, taking a new reference.
    pub(crate) fn adopt(arc: Arc<Vinode>) -> Self {
        arc.incref();
        Self { v: Some(arc) }
    }

    /// Wraps `arc`, taking over a reference the caller already owns.
    pub(crate) fn from_owned(arc: Arc<Vinode>) -> Self {
        Self { v: Some(arc) }
    }

    pub(crate) fn arc(&self) -> &Arc<Vinode> {
        self.v.as_ref().unwrap()
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(self.arc(), other.arc())
    }
}

impl std::ops::Deref for Vref {
    type Target = Vinode;

    fn deref(&self) -> &Vinode {
        self.arc()
    }
}

impl Clone for Vref {
    fn clone(&self) -> Self {
        Self::adopt(Arc::clone(self.arc()))
    }
}

impl Drop for Vref {
    fn drop(&mut self) {
        let Some(arc) = self.v.take() else { return };
        let Some(fs) = Weak::upgrade(&arc.fs) else {
            // The pool is already shutting down; nothing to release against.
            return;
        };
        unref(&fs, arc);
    }
}

/// Releases one reference, walking up the parent chain as directories drop
/// their last reference. Inodes with `nlink == 0` are freed inside a
/// transaction.
///
/// Must not be called with the transaction lock held.
pub(crate) fn unref(fs: &FsCore, first: Arc<Vinode>) {
    if pmem_store::tx_active_on_this_thread() {
        // Dropped while this thread's transaction is still open, which only
        // happens when the transaction itself is unwinding a freshly created
        // vinode. The registration callback owns the cleanup.
        first.refcnt.fetch_sub(1, Ordering::AcqRel);
        return;
    }

    let mut cur = Some(first);

    while let Some(arc) = cur.take() {
        if arc.defunct.load(Ordering::Acquire) {
            // Registration rolled back; the handle is a shell.
            continue;
        }

        // Transaction first, then the map lock: the same order the map's
        // in-transaction registration uses.
        let tx = fs.store.begin();
        let mut map = fs.map.write();

        let prev = arc.refcnt.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev >= 1);
        if prev > 1 {
            return;
        }

        // Last reference: nobody else can hold the lock.
        let state = arc.state();
        let inode = arc.inode(fs);

        if inode.nlink == 0 {
            if let Some(slot) = state.orphan.take() {
                inode_array::unregister(fs, &tx, slot);
            }
            inode_free(fs, &tx, arc.tinode);
            tx.commit();
        } else if state.atime_dirty {
            let inode = arc.inode_mut(fs);
            tx.set(&mut inode.atime, state.atime);
            state.atime_dirty = false;
            tx.commit();
        } else {
            drop(tx);
        }

        map.unregister(&arc);
        drop(map);

        let parent = state.parent.take();
        let is_root = fs.is_root(&arc);
        drop(arc);

        if !is_root {
            cur = parent;
        }
    }
}

/// Current wall-clock time.
pub(crate) fn current_time() -> Time {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    Time {
        sec: now.as_secs() as i64,
        nsec: i64::from(now.subsec_nanos()),
    }
}

/// Allocates and initializes a persistent inode. Must be called inside a
/// transaction.
pub(crate) fn inode_alloc(
    fs: &FsCore,
    tx: &Tx<'_>,
    cred: &Credentials,
    flags: u64,
) -> Result<PObj<Inode>> {
    log::trace!("inode_alloc flags {flags:#o}");

    let tinode: PObj<Inode> = fs.store.alloc_typed(tx, type_tag::INODE)?;
    let inode = unsafe { fs.store.at(tinode).as_mut() };

    let t = current_time();
    inode.version = INODE_VERSION;
    inode.flags = flags;
    inode.atime = t;
    inode.ctime = t;
    inode.mtime = t;
    inode.nlink = 0;
    inode.uid = cred.euid;
    inode.gid = cred.egid;

    if inode.is_regular_file() {
        inode
            .block_array_mut()
            .init(INLINE_BLOCK_SLOTS as u32, PObj::NULL);
    } else if inode.is_dir() {
        inode
            .dir_mut()
            .init(INLINE_DIRENT_SLOTS as u32, PObj::NULL);
        inode.size = IN_INODE_STORAGE as u64;
    }

    Ok(tinode)
}

/// Frees an inode and everything it owns. Must be called inside a
/// transaction; directories must already be empty.
pub(crate) fn inode_free(fs: &FsCore, tx: &Tx<'_>, tinode: PObj<Inode>) {
    log::trace!("inode_free {:#x}", tinode.off());

    let inode = unsafe { fs.store.at(tinode).as_ref() };

    if inode.is_dir() {
        let mut dir = inode.dir();
        let mut page: PObj<Dir> = PObj::NULL;
        loop {
            for d in unsafe { dir.dirents() } {
                assert!(d.inode.is_null(), "freeing non-empty directory");
            }
            let next = dir.next;
            if !page.is_null() {
                fs.store.free(tx, page.off());
            }
            if next.is_null() {
                break;
            }
            page = next;
            dir = unsafe { fs.store.at(page).as_ref() };
        }
    } else if inode.is_regular_file() {
        let mut arr = inode.block_array();
        let mut page: PObj<BlockArray> = PObj::NULL;
        loop {
            for block in unsafe { arr.blocks() } {
                if !block.data.is_null() {
                    fs.store.free(tx, block.data.off());
                }
            }
            let next = arr.next;
            if !page.is_null() {
                fs.store.free(tx, page.off());
            }
            if next.is_null() {
                break;
            }
            page = next;
            arr = unsafe { fs.store.at(page).as_ref() };
        }
    } else if inode.is_symlink() {
        // nothing to be done
    } else {
        panic!("unknown inode type {:#o}", inode.flags);
    }

    fs.store.free(tx, tinode.off());
}

/// Registers a vinode whose link count dropped to zero in the orphan list.
/// Caller holds the super rwlock in write mode, the vinode's write lock,
/// and runs inside a transaction.
pub(crate) fn vinode_orphan(fs: &FsCore, tx: &Tx<'_>, vinode: &Arc<Vinode>) -> Result<()> {
    let state = vinode.state();
    debug_assert!(state.orphan.is_none());

    let head = fs.sb().orphaned_inodes;
    let slot = inode_array::add(fs, tx, head, vinode.tinode)?;
    state.orphan = Some(slot);

    let doomed = Arc::clone(vinode);
    tx.on_abort(move || {
        doomed.state().orphan = None;
    });

    Ok(())
}

/// The directory-ness test usable without the inode: flag bits only.
pub(crate) fn flags_is_dir(flags: u64) -> bool {
    flags & crate::layout::S_IFMT == S_IFDIR
}

pub(crate) fn flags_is_symlink(flags: u64) -> bool {
    flags & crate::layout::S_IFMT == crate::layout::S_IFLNK
}

// Multi-vinode lock helpers. All of them sort by address so concurrent
// multi-lock acquisitions cannot deadlock.

pub(crate) fn rdlock2<'a>(
    a: &'a Vinode,
    b: &'a Vinode,
) -> ArrayVec<RwLockReadGuard<'a, ()>, 2> {
    let mut guards = ArrayVec::new();
    if std::ptr::eq(a, b) {
        guards.push(a.lock.read());
    } else if (a as *const Vinode) < (b as *const Vinode) {
        guards.push(a.lock.read());
        guards.push(b.lock.read());
    } else {
        guards.push(b.lock.read());
        guards.push(a.lock.read());
    }
    guards
}

pub(crate) fn wrlock2<'a>(
    a: &'a Vinode,
    b: &'a Vinode,
) -> ArrayVec<RwLockWriteGuard<'a, ()>, 2> {
    let mut guards = ArrayVec::new();
    if std::ptr::eq(a, b) {
        guards.push(a.lock.write());
    } else if (a as *const Vinode) < (b as *const Vinode) {
        guards.push(a.lock.write());
        guards.push(b.lock.write());
    } else {
        guards.push(b.lock.write());
        guards.push(a.lock.write());
    }
    guards
}

