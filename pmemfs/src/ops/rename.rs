//! rename, renameat, renameat2.

use std::sync::Arc;

use crate::{
    cred::{can_access, Access, InodePerms},
    dir,
    error::{Error, Result},
    inode::{current_time, Vinode, Vref},
    layout::MAX_FILE_NAME,
    ops::{at_dir, finish, At},
    path::{self, PathInfo, ResolveFlags},
    pool::FsCore,
    Filesystem,
};

/// `renameat2` flag: fail when the destination exists.
pub const RENAME_NOREPLACE: u32 = libc::RENAME_NOREPLACE;
/// `renameat2` flag: atomically exchange source and destination.
pub const RENAME_EXCHANGE: u32 = libc::RENAME_EXCHANGE;

impl Filesystem {
    /// `rename(2)`.
    pub fn rename(&self, oldpath: impl AsRef<[u8]>, newpath: impl AsRef<[u8]>) -> Result<()> {
        self.renameat2(At::Cwd, oldpath, At::Cwd, newpath, 0)
    }

    /// `renameat(2)`.
    pub fn renameat(
        &self,
        oldat: At<'_>,
        oldpath: impl AsRef<[u8]>,
        newat: At<'_>,
        newpath: impl AsRef<[u8]>,
    ) -> Result<()> {
        self.renameat2(oldat, oldpath, newat, newpath, 0)
    }

    /// `renameat2(2)` with `RENAME_NOREPLACE` / `RENAME_EXCHANGE`.
    pub fn renameat2(
        &self,
        oldat: At<'_>,
        oldpath: impl AsRef<[u8]>,
        newat: At<'_>,
        newpath: impl AsRef<[u8]>,
        flags: u32,
    ) -> Result<()> {
        finish(self.renameat2_inner(oldat, oldpath.as_ref(), newat, newpath.as_ref(), flags))
    }

    fn renameat2_inner(
        &self,
        oldat: At<'_>,
        oldpath: &[u8],
        newat: At<'_>,
        newpath: &[u8],
        flags: u32,
    ) -> Result<()> {
        log::debug!(
            "rename {:?} -> {:?} flags {flags:#x}",
            String::from_utf8_lossy(oldpath),
            String::from_utf8_lossy(newpath)
        );

        let known = RENAME_EXCHANGE | RENAME_NOREPLACE | libc::RENAME_WHITEOUT;
        if flags & !known != 0 {
            return Err(Error::InvalidArgument);
        }
        if flags & libc::RENAME_WHITEOUT != 0 {
            log::warn!("RENAME_WHITEOUT is not supported");
            return Err(Error::InvalidArgument);
        }
        if flags & (RENAME_EXCHANGE | RENAME_NOREPLACE) == (RENAME_EXCHANGE | RENAME_NOREPLACE) {
            return Err(Error::InvalidArgument);
        }
        let exchange = flags & RENAME_EXCHANGE != 0;

        let fs = &self.core;
        let cred = fs.cred_snapshot();

        let src_start = at_dir(fs, oldat, oldpath);
        let dst_start = at_dir(fs, newat, newpath);
        let src = path::resolve_pathat(fs, &cred, &src_start, oldpath, ResolveFlags::empty())?;
        let dst = path::resolve_pathat(fs, &cred, &dst_start, newpath, ResolveFlags::empty())?;
        drop(src_start);
        drop(dst_start);

        let src_namelen = path::component_length(&src.remaining);
        let dst_namelen = path::component_length(&dst.remaining);
        for name in [&src.remaining[..src_namelen], &dst.remaining[..dst_namelen]] {
            if name.is_empty() || name == b"." || name == b".." {
                return Err(Error::Busy);
            }
            if name.len() > MAX_FILE_NAME {
                return Err(Error::NameTooLong);
            }
        }

        let (set, src_info, dst_info) = path::lock_parents_and_children(fs, &src, &dst)?;

        let cross_dir = !src.parent.ptr_eq(&dst.parent);

        // Two racing cross-directory renames could otherwise braid an
        // unreachable cycle of directories; the pool-wide lock serializes
        // them. Replacing a destination also touches the orphan list.
        let _super_guard =
            (cross_dir || dst_info.is_some()).then(|| fs.super_lock.write());

        if exchange && dst_info.is_none() {
            return Err(Error::NotFound);
        }

        for parent in [&src.parent, &dst.parent] {
            if !can_access(&cred, InodePerms::of(parent.inode(fs)), Access::WANT_WRITE) {
                return Err(Error::PermissionDenied);
            }
        }

        // Hard links to the same inode: nothing to do.
        if let Some(d) = &dst_info {
            if d.vinode.ptr_eq(&src_info.vinode) {
                return Ok(());
            }
        }

        if dst_info.is_some() && flags & RENAME_NOREPLACE != 0 {
            return Err(Error::Exists);
        }

        let src_is_dir = src_info.vinode.is_dir(fs);
        if let Some(d) = &dst_info {
            let dst_is_dir = d.vinode.is_dir(fs);
            if !exchange {
                if dst_is_dir && !src_is_dir {
                    return Err(Error::IsADirectory);
                }
                if !dst_is_dir && src_is_dir {
                    return Err(Error::NotADirectory);
                }
            }
        }

        // A directory must never become a descendant of itself.
        if cross_dir {
            if src_is_dir && dir_is_parent_of(fs, &src_info.vinode, &dst.parent) {
                return Err(Error::InvalidArgument);
            }
            if exchange {
                let d = dst_info.as_ref().unwrap();
                if d.vinode.is_dir(fs) && dir_is_parent_of(fs, &d.vinode, &src.parent) {
                    return Err(Error::InvalidArgument);
                }
            }
        }

        if exchange {
            self.exchange_entries(&src, &src_info, &dst, dst_info.as_ref().unwrap(), cross_dir)?;
        } else {
            self.rename_entry(&src, &src_info, &dst, dst_info.as_ref(), cross_dir)?;
        }

        drop(set);
        Ok(())
    }

    /// Plain rename: unlink a replaced destination, enter the new name,
    /// drop the old one, and rewire `..` when a directory changed parents.
    fn rename_entry(
        &self,
        src: &PathInfo,
        src_info: &dir::DirentInfo,
        dst: &PathInfo,
        dst_info: Option<&dir::DirentInfo>,
        cross_dir: bool,
    ) -> Result<()> {
        let fs = &self.core;
        let dst_namelen = path::component_length(&dst.remaining);
        let dst_name = &dst.remaining[..dst_namelen];
        let src_is_dir = src_info.vinode.is_dir(fs);

        let tx = fs.store.begin();

        if let Some(d) = dst_info {
            if d.vinode.is_dir(fs) {
                dir::unlink_dir_dirent(fs, &tx, &dst.parent, d.dirent, &d.vinode)?;
            } else {
                dir::unlink_file_dirent(fs, &tx, &dst.parent, d.dirent, &d.vinode);
            }
            super::link::orphan_if_unlinked(fs, &tx, d.vinode.arc())?;
        }

        let t = current_time();

        if !cross_dir {
            // Same parent: rewrite the name in place.
            let slot = unsafe { fs.store.at(src_info.dirent).as_mut() };
            tx.add_ptr_range(slot.name.as_ptr(), (dst_namelen + 1) as u64);
            slot.name[..dst_namelen].copy_from_slice(dst_name);
            slot.name[dst_namelen] = 0;

            let parent_inode = src.parent.inode_mut(fs);
            tx.set(&mut parent_inode.mtime, t);
        } else {
            dir::add_dirent(fs, &tx, dst.parent.tinode, dst_name, src_info.vinode.tinode, t)?;
            dir::unlink_file_dirent(fs, &tx, &src.parent, src_info.dirent, &src_info.vinode);

            if src_is_dir {
                update_parent_entry(fs, &tx, &src_info.vinode, &src.parent, &dst.parent)?;
            }
        }

        tx.commit();

        if cross_dir && src_is_dir {
            switch_parent_link(&src_info.vinode, &dst.parent);
        }

        Ok(())
    }

    /// `RENAME_EXCHANGE`: swap the two dirents, then patch parent link
    /// counts and `..` entries when directories moved between parents.
    fn exchange_entries(
        &self,
        src: &PathInfo,
        src_info: &dir::DirentInfo,
        dst: &PathInfo,
        dst_info: &dir::DirentInfo,
        cross_dir: bool,
    ) -> Result<()> {
        let fs = &self.core;
        let src_is_dir = src_info.vinode.is_dir(fs);
        let dst_is_dir = dst_info.vinode.is_dir(fs);

        let tx = fs.store.begin();

        let src_slot = unsafe { fs.store.at(src_info.dirent).as_mut() };
        let dst_slot = unsafe { fs.store.at(dst_info.dirent).as_mut() };
        tx.set(&mut src_slot.inode, dst_info.vinode.tinode);
        tx.set(&mut dst_slot.inode, src_info.vinode.tinode);

        if (src_is_dir || dst_is_dir) && cross_dir {
            // With only one directory in the pair, both parents' link
            // counts shift by one.
            if src_is_dir != dst_is_dir {
                let src_parent = src.parent.inode_mut(fs);
                let dst_parent = dst.parent.inode_mut(fs);
                let (src_nlink, dst_nlink) = (src_parent.nlink, dst_parent.nlink);
                if src_is_dir {
                    tx.set(&mut src_parent.nlink, src_nlink - 1);
                    tx.set(&mut dst_parent.nlink, dst_nlink + 1);
                } else {
                    tx.set(&mut src_parent.nlink, src_nlink + 1);
                    tx.set(&mut dst_parent.nlink, dst_nlink - 1);
                }
            }

            if src_is_dir {
                let dotdot = dir::lookup_dirent_by_name_locked(fs, &src_info.vinode, b"..")?;
                let slot = unsafe { fs.store.at(dotdot).as_mut() };
                tx.set(&mut slot.inode, dst.parent.tinode);
            }
            if dst_is_dir {
                let dotdot = dir::lookup_dirent_by_name_locked(fs, &dst_info.vinode, b"..")?;
                let slot = unsafe { fs.store.at(dotdot).as_mut() };
                tx.set(&mut slot.inode, src.parent.tinode);
            }
        }

        tx.commit();

        if cross_dir {
            if src_is_dir {
                switch_parent_link(&src_info.vinode, &dst.parent);
            }
            if dst_is_dir {
                switch_parent_link(&dst_info.vinode, &src.parent);
            }
        }

        Ok(())
    }
}

/// Is `maybe_parent` an ancestor of `vinode` (or the same directory)?
/// The super lock is held, so the chain cannot shift underneath us.
fn dir_is_parent_of(fs: &FsCore, maybe_parent: &Vref, vinode: &Vref) -> bool {
    let mut cur = Arc::clone(vinode.arc());
    loop {
        if Arc::ptr_eq(&cur, maybe_parent.arc()) {
            return true;
        }
        if fs.is_root(&cur) {
            return false;
        }
        let Some(parent) = cur.state().parent.clone() else {
            return false;
        };
        cur = parent;
    }
}

/// Updates the persistent side of a directory changing parents: the `..`
/// entry plus both parents' link counts. In-transaction.
fn update_parent_entry(
    fs: &FsCore,
    tx: &pmem_store::Tx<'_>,
    vinode: &Vref,
    src_parent: &Vref,
    dst_parent: &Vref,
) -> Result<()> {
    let dotdot = dir::lookup_dirent_by_name_locked(fs, vinode, b"..")?;
    let slot = unsafe { fs.store.at(dotdot).as_mut() };
    debug_assert!(slot.inode == src_parent.tinode);

    let src_inode = src_parent.inode_mut(fs);
    let nlink = src_inode.nlink;
    tx.set(&mut src_inode.nlink, nlink - 1);

    let dst_inode = dst_parent.inode_mut(fs);
    let nlink = dst_inode.nlink;
    tx.set(&mut dst_inode.nlink, nlink + 1);

    tx.set(&mut slot.inode, dst_parent.tinode);
    Ok(())
}

/// Repoints the volatile parent link after a committed directory move,
/// releasing the reference held on the old parent.
fn switch_parent_link(vinode: &Vref, new_parent: &Vref) {
    new_parent.incref();
    let old: Option<Arc<Vinode>> = vinode
        .state()
        .parent
        .replace(Arc::clone(new_parent.arc()));
    if let Some(old) = old {
        drop(Vref::from_owned(old));
    }
}
