//! Pool lifecycle and runtime state.
//!
//! A [`Filesystem`] owns the object store, the superblock handle, the root
//! and current-directory vinodes, the pool credentials, and the inode map.
//! Creating a pool lays down the superblock, the root directory, and an
//! empty orphan list; opening one validates the superblock version and
//! frees every inode the orphan list kept alive across the last close.

use std::{
    path::Path,
    sync::{Arc, OnceLock},
};

use parking_lot::RwLock;
use pmem_store::{PObj, Store};

use crate::{
    cred::Credentials,
    dir,
    error::{Error, Result},
    inode::{self, Vinode, Vref},
    inode_array,
    inode_map::InodeMap,
    layout::{Inode, SuperBlock, ACCESSPERMS, SUPER_VERSION},
};

/// Store type tag of the superblock; not reported by [`Stats`].
const TAG_SUPER: u32 = 6;

pub(crate) struct FsCore {
    pub(crate) store: Store,
    super_obj: OnceLock<PObj<SuperBlock>>,
    root_tinode: OnceLock<PObj<Inode>>,
    pub(crate) root: RwLock<Option<Vref>>,
    pub(crate) cwd: RwLock<Option<Vref>>,
    pub(crate) cred: RwLock<Credentials>,
    /// Held in write mode across cross-directory renames and while touching
    /// the orphan-list header.
    pub(crate) super_lock: RwLock<()>,
    pub(crate) map: InodeMap,
}

impl FsCore {
    fn new(store: Store) -> Self {
        Self {
            store,
            super_obj: OnceLock::new(),
            root_tinode: OnceLock::new(),
            root: RwLock::new(None),
            cwd: RwLock::new(None),
            cred: RwLock::new(Credentials::from_process()),
            super_lock: RwLock::new(()),
            map: InodeMap::new(),
        }
    }

    pub(crate) fn sb(&self) -> &SuperBlock {
        let obj = *self.super_obj.get().expect("superblock initialized");
        unsafe { self.store.at(obj).as_ref() }
    }

    #[allow(clippy::mut_from_ref)]
    pub(crate) fn sb_mut(&self) -> &mut SuperBlock {
        let obj = *self.super_obj.get().expect("superblock initialized");
        unsafe { self.store.at(obj).as_mut() }
    }

    /// A fresh reference to the root directory.
    pub(crate) fn root(&self) -> Vref {
        self.root.read().clone().expect("root initialized")
    }

    pub(crate) fn is_root(&self, v: &Vinode) -> bool {
        self.root_tinode.get() == Some(&v.tinode)
    }

    /// A fresh reference to the current working directory.
    pub(crate) fn cwd(&self) -> Vref {
        self.cwd.read().clone().expect("cwd initialized")
    }

    pub(crate) fn cred_snapshot(&self) -> Credentials {
        self.cred.read().clone()
    }
}

/// Per-type object counts, as reported by [`Filesystem::stats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub inodes: u64,
    pub dirs: u64,
    pub block_arrays: u64,
    pub inode_arrays: u64,
    pub blocks: u64,
}

/// An open pool.
pub struct Filesystem {
    pub(crate) core: Arc<FsCore>,
}

impl Filesystem {
    /// Creates a file-system pool of `poolsize` bytes at `path`.
    pub fn create_pool(path: &Path, poolsize: u64) -> Result<Self> {
        let store = Store::create(path, poolsize)?;
        let core = Arc::new(FsCore::new(store));
        let cred = core.cred_snapshot();

        let root_tinode;
        {
            let tx = core.store.begin();
            let super_obj: PObj<SuperBlock> = core.store.alloc_typed(&tx, TAG_SUPER)?;
            core.super_obj.set(super_obj).unwrap();

            root_tinode = dir::new_dir_inode(&core, &tx, None, &cred, ACCESSPERMS)?;
            let orphaned = inode_array::alloc_page(&core, &tx)?;

            let sb = core.sb_mut();
            sb.version = SUPER_VERSION;
            sb.root_inode = root_tinode;
            sb.orphaned_inodes = orphaned;
            core.store.set_root(&tx, super_obj);
            tx.commit();
        }

        let fs = Self { core };
        fs.install_root(root_tinode)?;
        Ok(fs)
    }

    /// Opens an existing pool, recovering orphaned inodes left behind by a
    /// crash or by files that were still open at the last close.
    pub fn open_pool(path: &Path) -> Result<Self> {
        let store = Store::open(path)?;
        let core = Arc::new(FsCore::new(store));

        let super_obj: PObj<SuperBlock> = core.store.root();
        if super_obj.is_null() {
            return Err(Error::Store(pmem_store::StoreError::BadHeader));
        }
        core.super_obj.set(super_obj).unwrap();

        let sb = core.sb();
        if sb.version != SUPER_VERSION {
            log::error!("unknown superblock version {:#x}", sb.version);
            return Err(Error::InvalidArgument);
        }
        let root_tinode = sb.root_inode;

        recover_orphans(&core)?;

        let fs = Self { core };
        fs.install_root(root_tinode)?;
        Ok(fs)
    }

    fn install_root(&self, root_tinode: PObj<Inode>) -> Result<()> {
        let core = &self.core;
        core.root_tinode.set(root_tinode).unwrap();

        let root = core.map.get(core, root_tinode, None, Some(b"/"), None)?;
        // The root is its own parent; the self-link carries no reference,
        // the release walk stops at the root instead.
        root.state().parent = Some(Arc::clone(root.arc()));

        *core.cwd.write() = Some(root.clone());
        *core.root.write() = Some(root);
        Ok(())
    }

    /// Closes the pool. Any still-open file handles keep their inodes on
    /// the orphan list for the next open to reap.
    pub fn close(self) {
        drop(self);
    }

    /// Counts the live objects of each kind in the pool.
    #[must_use]
    pub fn stats(&self) -> Stats {
        use crate::layout::type_tag;
        let raw = self.core.store.stats();
        Stats {
            inodes: raw.count(type_tag::INODE),
            dirs: raw.count(type_tag::DIR),
            block_arrays: raw.count(type_tag::BLOCK_ARRAY),
            inode_arrays: raw.count(type_tag::INODE_ARRAY),
            blocks: raw.count(type_tag::BLOCK_DATA),
        }
    }

    /// The message of the most recent error returned to this thread.
    #[must_use]
    pub fn errormsg(&self) -> String {
        crate::error::errormsg()
    }
}

impl Drop for Filesystem {
    fn drop(&mut self) {
        let core = &self.core;

        let cwd = core.cwd.write().take();
        drop(cwd);
        let root = core.root.write().take();
        drop(root);

        let leaked = core.map.len();
        if leaked != 0 {
            log::warn!("{leaked} vinode(s) still referenced at pool close");
        }
    }
}

/// Frees every inode the orphan list recorded, then resets the list to one
/// empty page.
fn recover_orphans(core: &Arc<FsCore>) -> Result<()> {
    let head = core.sb().orphaned_inodes;
    if head.is_null() {
        return Err(Error::Store(pmem_store::StoreError::BadHeader));
    }

    if inode_array::is_empty(core, head) && inode_array::is_single_page(core, head) {
        return Ok(());
    }

    let mut freed = 0u64;
    let tx = core.store.begin();

    let sb = core.sb_mut();
    tx.add_ptr(&sb.orphaned_inodes);

    inode_array::traverse(core, head, |tinode| {
        let inode = unsafe { core.store.at(tinode).as_ref() };
        debug_assert_eq!(inode.nlink, 0);
        if inode.nlink == 0 {
            inode::inode_free(core, &tx, tinode);
            freed += 1;
        }
    });
    inode_array::free_chain(core, &tx, head);
    sb.orphaned_inodes = inode_array::alloc_page(core, &tx)?;

    tx.commit();
    log::debug!("recovered {freed} orphaned inode(s)");
    Ok(())
}
