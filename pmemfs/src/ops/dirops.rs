//! mkdir, rmdir, directory readout, chdir and getcwd.

use crate::{
    cred::{can_access, Access, InodePerms},
    dir,
    error::{Error, Result},
    file::File,
    inode::{vinode_orphan, Vref},
    layout::{MAX_FILE_NAME, PATH_MAX},
    ops::{at_dir, finish, At},
    path::{self, ResolveFlags},
    Filesystem,
};

impl Filesystem {
    /// `mkdir(2)`.
    pub fn mkdir(&self, path: impl AsRef<[u8]>, mode: u32) -> Result<()> {
        self.mkdirat(At::Cwd, path, mode)
    }

    /// `mkdirat(2)`.
    pub fn mkdirat(&self, at: At<'_>, path: impl AsRef<[u8]>, mode: u32) -> Result<()> {
        finish(self.mkdirat_inner(at, path.as_ref(), mode))
    }

    fn mkdirat_inner(&self, at: At<'_>, path: &[u8], mode: u32) -> Result<()> {
        log::debug!("mkdir {:?} mode {mode:#o}", String::from_utf8_lossy(path));

        let fs = &self.core;
        let cred = fs.cred_snapshot();
        let start = at_dir(fs, at, path);

        let info = path::resolve_pathat(fs, &cred, &start, path, ResolveFlags::empty())?;
        let namelen = path::component_length(&info.remaining);

        // mkdir("/")
        if namelen == 0 {
            debug_assert!(fs.is_root(&info.parent));
            return Err(Error::Exists);
        }
        if namelen > MAX_FILE_NAME {
            return Err(Error::NameTooLong);
        }

        let _guard = info.parent.lock.write();

        if !can_access(&cred, InodePerms::of(info.parent.inode(fs)), Access::WANT_WRITE) {
            return Err(Error::PermissionDenied);
        }

        let tx = fs.store.begin();
        dir::new_dir_inode(
            fs,
            &tx,
            Some((info.parent.tinode, &info.remaining[..namelen])),
            &cred,
            u64::from(mode),
        )?;
        tx.commit();

        Ok(())
    }

    /// `rmdir(2)`.
    pub fn rmdir(&self, path: impl AsRef<[u8]>) -> Result<()> {
        finish(self.rmdirat_inner(At::Cwd, path.as_ref()))
    }

    pub(crate) fn rmdirat_inner(&self, at: At<'_>, path: &[u8]) -> Result<()> {
        log::debug!("rmdir {:?}", String::from_utf8_lossy(path));

        let fs = &self.core;
        let cred = fs.cred_snapshot();
        let start = at_dir(fs, at, path);

        let info = path::resolve_pathat(fs, &cred, &start, path, ResolveFlags::empty())?;
        let namelen = path::component_length(&info.remaining);
        let name = &info.remaining[..namelen];

        // Specified by POSIX, senseless or not.
        if name == b"." {
            return Err(Error::InvalidArgument);
        }
        // Having entered the directory proves the parent is not empty.
        if name == b".." {
            return Err(Error::NotEmpty);
        }
        if namelen == 0 {
            debug_assert!(fs.is_root(&info.parent));
            return Err(Error::Busy);
        }

        let (set, dirent_info) = path::lock_parent_and_child(fs, &info)?;

        if !dirent_info.vinode.is_dir(fs) {
            return Err(Error::NotADirectory);
        }
        if fs.is_root(&dirent_info.vinode) {
            return Err(Error::Busy);
        }
        if !can_access(&cred, InodePerms::of(info.parent.inode(fs)), Access::WANT_WRITE) {
            return Err(Error::PermissionDenied);
        }

        let _super_guard = fs.super_lock.write();

        let tx = fs.store.begin();
        dir::unlink_dir_dirent(fs, &tx, &info.parent, dirent_info.dirent, &dirent_info.vinode)?;
        vinode_orphan(fs, &tx, dirent_info.vinode.arc())?;
        tx.commit();

        drop(set);
        Ok(())
    }

    /// `getdents(2)`: fills `buf` with `linux_dirent` records.
    pub fn getdents(&self, file: &File, buf: &mut [u8]) -> Result<usize> {
        finish(self.getdents_inner(file, buf, false))
    }

    /// `getdents64(2)`: fills `buf` with `linux_dirent64` records.
    pub fn getdents64(&self, file: &File, buf: &mut [u8]) -> Result<usize> {
        finish(self.getdents_inner(file, buf, true))
    }

    fn getdents_inner(&self, file: &File, buf: &mut [u8], wide: bool) -> Result<usize> {
        let fs = &self.core;
        let vinode = &file.vinode;

        if !vinode.is_dir(fs) {
            return Err(Error::NotADirectory);
        }
        if !file.readable() {
            return Err(Error::BadFileHandle);
        }

        let mut pos = file.pos.lock();
        let _guard = vinode.lock.read();

        let head = dir::inline_dir(vinode.tinode);
        let mut offset = pos.offset;
        let mut dir_pos = pos.dir_pos;
        let mut written = 0usize;

        let read = dir::read_dir(fs, head, &mut offset, &mut dir_pos, |entry| {
            let namelen = entry.name.len();
            let reclen = if wide {
                align8(8 + 8 + 2 + 1 + namelen + 1)
            } else {
                align8(8 + 8 + 2 + namelen + 1 + 1)
            };
            if written + reclen > buf.len() {
                return None;
            }

            let rec = &mut buf[written..written + reclen];
            rec.fill(0);
            rec[..8].copy_from_slice(&entry.ino.to_ne_bytes());
            rec[8..16].copy_from_slice(&entry.next_off.to_ne_bytes());
            rec[16..18].copy_from_slice(&(reclen as u16).to_ne_bytes());
            if wide {
                rec[18] = entry.file_type;
                rec[19..19 + namelen].copy_from_slice(entry.name);
            } else {
                rec[18..18 + namelen].copy_from_slice(entry.name);
                // d_type lives in the final byte of the record.
                rec[reclen - 1] = entry.file_type;
            }

            written += reclen;
            Some(reclen)
        });

        pos.offset = offset;
        pos.dir_pos = dir_pos;
        Ok(read)
    }

    /// `chdir(2)`.
    pub fn chdir(&self, path: impl AsRef<[u8]>) -> Result<()> {
        finish(self.chdir_inner(path.as_ref()))
    }

    fn chdir_inner(&self, path: &[u8]) -> Result<()> {
        let fs = &self.core;
        let cred = fs.cred_snapshot();
        let start = at_dir(fs, At::Cwd, path);

        let resolved =
            path::resolve_pathat_full(fs, &cred, &start, path, ResolveFlags::empty(), true)?;
        self.change_cwd(&cred, resolved.vinode)
    }

    /// `fchdir(2)`.
    pub fn fchdir(&self, dir: &File) -> Result<()> {
        let cred = self.core.cred_snapshot();
        finish(self.change_cwd(&cred, dir.vinode.clone()))
    }

    fn change_cwd(&self, cred: &crate::cred::Credentials, dir: Vref) -> Result<()> {
        let fs = &self.core;

        let perms = {
            let _guard = dir.lock.read();
            InodePerms::of(dir.inode(fs))
        };
        if !crate::inode::flags_is_dir(perms.flags) {
            return Err(Error::NotADirectory);
        }
        if !can_access(cred, perms, Access::WANT_EXECUTE) {
            return Err(Error::PermissionDenied);
        }

        let old = {
            let mut cwd = fs.cwd.write();
            cwd.replace(dir)
        };
        drop(old);
        Ok(())
    }

    /// `getcwd(3)`.
    pub fn getcwd(&self) -> Result<Vec<u8>> {
        finish(self.dir_path(self.core.cwd()))
    }

    /// The absolute path of an open directory handle.
    pub fn get_dir_path(&self, dir: &File) -> Result<Vec<u8>> {
        finish(self.dir_path(dir.vinode.clone()))
    }

    /// Walks parent pointers up to the root, assembling the path from the
    /// tail. An orphaned directory no longer has a path.
    fn dir_path(&self, vinode: Vref) -> Result<Vec<u8>> {
        let fs = &self.core;

        let mut names: Vec<Vec<u8>> = Vec::new();
        let mut child = vinode;

        {
            let _guard = child.lock.read();
            if child.state().orphan.is_some() {
                return Err(Error::NotFound);
            }
        }

        loop {
            if fs.is_root(&child) {
                break;
            }

            let parent = {
                let _guard = child.lock.read();
                let Some(p) = child.state().parent.as_ref() else {
                    return Err(Error::NotFound);
                };
                Vref::adopt(std::sync::Arc::clone(p))
            };

            {
                let _guard = parent.lock.read();
                let slot = dir::lookup_dirent_by_vinode_locked(fs, &parent, &child)?;
                let entry = unsafe { fs.store.at(slot).as_ref() };
                names.push(entry.name().to_vec());
            }

            child = parent;
        }

        let mut out = Vec::new();
        if names.is_empty() {
            out.push(b'/');
        } else {
            for name in names.iter().rev() {
                out.push(b'/');
                out.extend_from_slice(name);
            }
        }

        if out.len() >= PATH_MAX {
            return Err(Error::OutOfRange);
        }
        Ok(out)
    }
}

fn align8(n: usize) -> usize {
    (n + 7) & !7
}
