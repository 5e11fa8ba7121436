//! link, unlink, symlink, readlink and their *at variants.

use std::sync::Arc;

use crate::{
    cred::{can_access, Access, InodePerms},
    dir,
    error::{Error, Result},
    inode::{self, current_time, inode_alloc, vinode_orphan},
    layout::{ACCESSPERMS, IN_INODE_STORAGE, S_IFLNK},
    ops::{at_dir, finish, At},
    path::{self, ResolveFlags},
    Filesystem,
};

impl Filesystem {
    /// `link(2)`: hard-link `oldpath` to `newpath`.
    pub fn link(&self, oldpath: impl AsRef<[u8]>, newpath: impl AsRef<[u8]>) -> Result<()> {
        self.linkat(At::Cwd, oldpath, At::Cwd, newpath, 0)
    }

    /// `linkat(2)`. `AT_SYMLINK_FOLLOW` resolves a trailing symlink in
    /// `oldpath`; `AT_EMPTY_PATH` links the object `oldat` refers to.
    pub fn linkat(
        &self,
        oldat: At<'_>,
        oldpath: impl AsRef<[u8]>,
        newat: At<'_>,
        newpath: impl AsRef<[u8]>,
        flags: i32,
    ) -> Result<()> {
        finish(self.linkat_inner(oldat, oldpath.as_ref(), newat, newpath.as_ref(), flags))
    }

    fn linkat_inner(
        &self,
        oldat: At<'_>,
        oldpath: &[u8],
        newat: At<'_>,
        newpath: &[u8],
        flags: i32,
    ) -> Result<()> {
        if flags & !(libc::AT_SYMLINK_FOLLOW | libc::AT_EMPTY_PATH) != 0 {
            return Err(Error::InvalidArgument);
        }

        let fs = &self.core;
        let cred = fs.cred_snapshot();

        let src_vinode = if oldpath.is_empty() && flags & libc::AT_EMPTY_PATH != 0 {
            match oldat {
                At::Dir(file) => file.vinode.clone(),
                At::Cwd => fs.cwd(),
            }
        } else {
            let start = at_dir(fs, oldat, oldpath);
            let resolved = path::resolve_pathat_full(
                fs,
                &cred,
                &start,
                oldpath,
                ResolveFlags::empty(),
                flags & libc::AT_SYMLINK_FOLLOW != 0,
            )?;
            if !resolved.vinode.is_dir(fs)
                && path::more_than_one_component(&resolved.info.remaining)
            {
                return Err(Error::NotADirectory);
            }
            resolved.vinode
        };

        if src_vinode.is_dir(fs) {
            return Err(Error::NotPermitted);
        }

        let start = at_dir(fs, newat, newpath);
        let dst = path::resolve_pathat(fs, &cred, &start, newpath, ResolveFlags::empty())?;
        let namelen = path::component_length(&dst.remaining);

        let _guards = inode::wrlock2(&dst.parent, &src_vinode);

        if !can_access(&cred, InodePerms::of(dst.parent.inode(fs)), Access::WANT_WRITE) {
            return Err(Error::PermissionDenied);
        }

        let tx = fs.store.begin();
        dir::add_dirent(
            fs,
            &tx,
            dst.parent.tinode,
            &dst.remaining[..namelen],
            src_vinode.tinode,
            current_time(),
        )?;

        // Giving a name back to an orphaned inode (an O_TMPFILE one, via
        // AT_EMPTY_PATH) takes it off the orphan list.
        if let Some(slot) = src_vinode.state().orphan.take() {
            crate::inode_array::unregister(fs, &tx, slot);
            let restore = Arc::clone(src_vinode.arc());
            tx.on_abort(move || {
                restore.state().orphan = Some(slot);
            });
        }
        tx.commit();

        Ok(())
    }

    /// `unlink(2)`.
    pub fn unlink(&self, path: impl AsRef<[u8]>) -> Result<()> {
        self.unlinkat(At::Cwd, path, 0)
    }

    /// `unlinkat(2)`; `AT_REMOVEDIR` removes a directory instead.
    pub fn unlinkat(&self, at: At<'_>, path: impl AsRef<[u8]>, flags: i32) -> Result<()> {
        let path = path.as_ref();
        if flags & libc::AT_REMOVEDIR != 0 {
            return finish(self.rmdirat_inner(at, path));
        }
        if flags != 0 {
            return finish(Err(Error::InvalidArgument));
        }
        finish(self.unlinkat_inner(at, path))
    }

    fn unlinkat_inner(&self, at: At<'_>, path: &[u8]) -> Result<()> {
        log::debug!("unlink {:?}", String::from_utf8_lossy(path));

        let fs = &self.core;
        let cred = fs.cred_snapshot();
        let start = at_dir(fs, at, path);

        let info = path::resolve_pathat(fs, &cred, &start, path, ResolveFlags::empty())?;
        if path::more_than_one_component(&info.remaining)
            || info.remaining.contains(&b'/')
        {
            return Err(Error::NotADirectory);
        }

        let (set, dirent_info) = path::lock_parent_and_child(fs, &info)?;

        if !can_access(&cred, InodePerms::of(info.parent.inode(fs)), Access::WANT_WRITE) {
            return Err(Error::PermissionDenied);
        }
        if dirent_info.vinode.is_dir(fs) {
            return Err(Error::IsADirectory);
        }

        let child = &dirent_info.vinode;
        let orphans = child.inode(fs).nlink == 1;
        let _super_guard = orphans.then(|| fs.super_lock.write());

        let tx = fs.store.begin();
        dir::unlink_file_dirent(fs, &tx, &info.parent, dirent_info.dirent, child);
        if child.inode(fs).nlink == 0 {
            vinode_orphan(fs, &tx, child.arc())?;
        }
        tx.commit();

        drop(set);
        Ok(())
    }

    /// `symlink(2)`.
    pub fn symlink(&self, target: impl AsRef<[u8]>, linkpath: impl AsRef<[u8]>) -> Result<()> {
        self.symlinkat(target, At::Cwd, linkpath)
    }

    /// `symlinkat(2)`.
    pub fn symlinkat(
        &self,
        target: impl AsRef<[u8]>,
        at: At<'_>,
        linkpath: impl AsRef<[u8]>,
    ) -> Result<()> {
        finish(self.symlinkat_inner(target.as_ref(), at, linkpath.as_ref()))
    }

    fn symlinkat_inner(&self, target: &[u8], at: At<'_>, linkpath: &[u8]) -> Result<()> {
        log::debug!(
            "symlink target {:?} linkpath {:?}",
            String::from_utf8_lossy(target),
            String::from_utf8_lossy(linkpath)
        );

        let fs = &self.core;
        let cred = fs.cred_snapshot();
        let start = at_dir(fs, at, linkpath);

        let info = path::resolve_pathat(fs, &cred, &start, linkpath, ResolveFlags::empty())?;
        let namelen = path::component_length(&info.remaining);
        let name = &info.remaining[..namelen];

        if dir::lookup_dirent(fs, &info.parent, name, ResolveFlags::empty()).is_ok() {
            return Err(Error::Exists);
        }

        // The target must fit the inline payload, NUL included.
        if target.len() >= IN_INODE_STORAGE {
            return Err(Error::NameTooLong);
        }

        let _guard = info.parent.lock.write();

        if !can_access(&cred, InodePerms::of(info.parent.inode(fs)), Access::WANT_WRITE) {
            return Err(Error::PermissionDenied);
        }

        let tx = fs.store.begin();
        let tinode = inode_alloc(fs, &tx, &cred, S_IFLNK | ACCESSPERMS)?;
        {
            let inode = unsafe { fs.store.at(tinode).as_mut() };
            inode.file_data[..target.len()].copy_from_slice(target);
            inode.size = target.len() as u64;
        }
        let t = unsafe { fs.store.at(tinode).as_ref() }.ctime;
        dir::add_dirent(fs, &tx, info.parent.tinode, name, tinode, t)?;
        tx.commit();

        Ok(())
    }

    /// `readlink(2)`.
    pub fn readlink(&self, path: impl AsRef<[u8]>, buf: &mut [u8]) -> Result<usize> {
        self.readlinkat(At::Cwd, path, buf)
    }

    /// `readlinkat(2)`. Like the syscall, truncates silently when `buf` is
    /// too small.
    pub fn readlinkat(
        &self,
        at: At<'_>,
        path: impl AsRef<[u8]>,
        buf: &mut [u8],
    ) -> Result<usize> {
        finish(self.readlinkat_inner(at, path.as_ref(), buf))
    }

    fn readlinkat_inner(&self, at: At<'_>, path: &[u8], buf: &mut [u8]) -> Result<usize> {
        let fs = &self.core;
        let cred = fs.cred_snapshot();
        let start = at_dir(fs, at, path);

        let info = path::resolve_pathat(fs, &cred, &start, path, ResolveFlags::empty())?;
        let namelen = path::component_length(&info.remaining);
        let vinode = dir::lookup_dirent(
            fs,
            &info.parent,
            &info.remaining[..namelen],
            ResolveFlags::empty(),
        )?;

        if !vinode.is_symlink(fs) {
            return Err(Error::InvalidArgument);
        }
        if info.remaining[namelen..].contains(&b'/') {
            return Err(Error::NotADirectory);
        }

        let _guard = vinode.lock.read();
        let target = vinode.inode(fs).symlink_target();
        let len = target.len().min(buf.len());
        buf[..len].copy_from_slice(&target[..len]);
        Ok(len)
    }
}

/// Registers an inode whose link count reached zero on the orphan list;
/// shared by unlink, rmdir and rename.
pub(crate) fn orphan_if_unlinked(
    fs: &crate::pool::FsCore,
    tx: &pmem_store::Tx<'_>,
    vinode: &Arc<inode::Vinode>,
) -> Result<()> {
    if unsafe { fs.store.at(vinode.tinode).as_ref() }.nlink == 0 {
        vinode_orphan(fs, tx, vinode)?;
    }
    Ok(())
}
