//! Metadata: stat, chmod, chown, access, utimes.

use crate::{
    cred::{can_access, Access, Credentials, InodePerms, CAP_CHOWN, CAP_FOWNER},
    dir,
    error::{Error, Result},
    file::File,
    inode::{current_time, Vref},
    layout::{self, Time, ALLPERMS, S_IFMT},
    ops::{at_dir, finish, At},
    path::{self, ResolveFlags},
    pool::FsCore,
    Filesystem,
};

/// `struct stat`, pool flavored: `st_dev` is the pool identity, `st_ino`
/// the inode's offset within the pool.
#[derive(Debug, Clone, Copy, Default)]
#[allow(clippy::struct_field_names)]
pub struct Stat {
    pub st_dev: u64,
    pub st_ino: u64,
    pub st_mode: u32,
    pub st_nlink: u64,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_rdev: u64,
    pub st_size: i64,
    pub st_blksize: i64,
    pub st_blocks: i64,
    pub st_atim: Time,
    pub st_mtim: Time,
    pub st_ctim: Time,
}

impl Stat {
    #[must_use]
    pub fn is_dir(&self) -> bool {
        u64::from(self.st_mode) & S_IFMT == layout::S_IFDIR
    }

    #[must_use]
    pub fn is_regular_file(&self) -> bool {
        u64::from(self.st_mode) & S_IFMT == layout::S_IFREG
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        u64::from(self.st_mode) & S_IFMT == layout::S_IFLNK
    }
}

fn vinode_stat(fs: &FsCore, vinode: &Vref) -> Result<Stat> {
    let _guard = vinode.lock.read();
    let inode = vinode.inode(fs);

    let st_size: i64 = inode.size.try_into().map_err(|_| Error::Overflow)?;

    let byte_count = if inode.is_regular_file() {
        // Sum of the block sizes, straight from the descriptor chain.
        let mut sum = 0u64;
        let mut cur = crate::block_array::inline_array(vinode);
        while !cur.is_null() {
            let arr: &layout::BlockArray = unsafe { fs.store.at(cur).as_ref() };
            for block in unsafe { arr.blocks() } {
                sum += u64::from(block.size);
            }
            cur = arr.next;
        }
        sum
    } else if inode.is_dir() {
        // Chained dirent pages only; the inline page rides in the inode.
        let mut sum = 0u64;
        let mut cur = unsafe { fs.store.at(dir::inline_dir(vinode.tinode)).as_ref() }.next;
        while !cur.is_null() {
            sum += fs.store.usable_size(cur.off());
            cur = unsafe { fs.store.at(cur).as_ref() }.next;
        }
        sum
    } else {
        0
    };

    let state = vinode.state();
    let atime = if state.atime_dirty {
        state.atime
    } else {
        inode.atime
    };

    Ok(Stat {
        st_dev: fs.store.uuid_lo(),
        st_ino: vinode.tinode.off(),
        st_mode: (inode.flags & (S_IFMT | ALLPERMS)) as u32,
        st_nlink: inode.nlink,
        st_uid: inode.uid,
        st_gid: inode.gid,
        st_rdev: 0,
        st_size,
        st_blksize: 1,
        // Not the device's real block size; carried over as documented.
        st_blocks: ((byte_count + 511) / 512) as i64,
        st_atim: atime,
        st_mtim: inode.mtime,
        st_ctim: inode.ctime,
    })
}

impl Filesystem {
    /// `stat(2)`.
    pub fn stat(&self, path: impl AsRef<[u8]>) -> Result<Stat> {
        self.fstatat(At::Cwd, path, 0)
    }

    /// `lstat(2)`.
    pub fn lstat(&self, path: impl AsRef<[u8]>) -> Result<Stat> {
        self.fstatat(At::Cwd, path, libc::AT_SYMLINK_NOFOLLOW)
    }

    /// `fstat(2)`.
    pub fn fstat(&self, file: &File) -> Result<Stat> {
        finish(vinode_stat(&self.core, &file.vinode))
    }

    /// `fstatat(2)`.
    pub fn fstatat(&self, at: At<'_>, path: impl AsRef<[u8]>, flags: i32) -> Result<Stat> {
        finish(self.fstatat_inner(at, path.as_ref(), flags))
    }

    fn fstatat_inner(&self, at: At<'_>, path: &[u8], flags: i32) -> Result<Stat> {
        let fs = &self.core;

        if path.is_empty() && flags & libc::AT_EMPTY_PATH != 0 {
            let vinode = match at {
                At::Dir(file) => file.vinode.clone(),
                At::Cwd => fs.cwd(),
            };
            return vinode_stat(fs, &vinode);
        }

        if flags & !(libc::AT_NO_AUTOMOUNT | libc::AT_SYMLINK_NOFOLLOW | libc::AT_EMPTY_PATH) != 0
        {
            return Err(Error::InvalidArgument);
        }

        let cred = fs.cred_snapshot();
        let start = at_dir(fs, at, path);
        let resolved = path::resolve_pathat_full(
            fs,
            &cred,
            &start,
            path,
            ResolveFlags::empty(),
            flags & libc::AT_SYMLINK_NOFOLLOW == 0,
        )?;

        if !resolved.vinode.is_dir(fs)
            && path::more_than_one_component(&resolved.info.remaining)
        {
            return Err(Error::NotADirectory);
        }

        vinode_stat(fs, &resolved.vinode)
    }

    /// `chmod(2)`.
    pub fn chmod(&self, path: impl AsRef<[u8]>, mode: u32) -> Result<()> {
        self.fchmodat(At::Cwd, path, mode, 0)
    }

    /// `fchmod(2)`.
    pub fn fchmod(&self, file: &File, mode: u32) -> Result<()> {
        let cred = self.core.cred_snapshot();
        finish(self.vinode_chmod(&cred, &file.vinode, mode))
    }

    /// `fchmodat(2)`.
    pub fn fchmodat(&self, at: At<'_>, path: impl AsRef<[u8]>, mode: u32, flags: i32) -> Result<()> {
        finish(self.fchmodat_inner(at, path.as_ref(), mode, flags))
    }

    fn fchmodat_inner(&self, at: At<'_>, path: &[u8], mode: u32, flags: i32) -> Result<()> {
        if flags & libc::AT_SYMLINK_NOFOLLOW != 0 {
            return Err(Error::Unsupported);
        }
        if flags != 0 {
            return Err(Error::InvalidArgument);
        }

        let fs = &self.core;
        let cred = fs.cred_snapshot();
        let start = at_dir(fs, at, path);
        let resolved =
            path::resolve_pathat_full(fs, &cred, &start, path, ResolveFlags::empty(), true)?;

        if !resolved.vinode.is_dir(fs)
            && path::more_than_one_component(&resolved.info.remaining)
        {
            return Err(Error::NotADirectory);
        }

        self.vinode_chmod(&cred, &resolved.vinode, mode)
    }

    fn vinode_chmod(&self, cred: &Credentials, vinode: &Vref, mode: u32) -> Result<()> {
        let fs = &self.core;
        let mode = u64::from(mode) & ALLPERMS;

        let _guard = vinode.lock.write();
        let inode = vinode.inode_mut(fs);

        // Owner or CAP_FOWNER only.
        if inode.uid != cred.fsuid && !cred.has_cap(CAP_FOWNER) {
            return Err(Error::NotPermitted);
        }

        let tx = fs.store.begin();
        let flags = inode.flags;
        tx.set(&mut inode.flags, (flags & !ALLPERMS) | mode);
        tx.set(&mut inode.ctime, current_time());
        tx.commit();
        Ok(())
    }

    /// `chown(2)`. `None` leaves the respective id unchanged.
    pub fn chown(
        &self,
        path: impl AsRef<[u8]>,
        owner: Option<u32>,
        group: Option<u32>,
    ) -> Result<()> {
        self.fchownat(At::Cwd, path, owner, group, 0)
    }

    /// `lchown(2)`.
    pub fn lchown(
        &self,
        path: impl AsRef<[u8]>,
        owner: Option<u32>,
        group: Option<u32>,
    ) -> Result<()> {
        self.fchownat(At::Cwd, path, owner, group, libc::AT_SYMLINK_NOFOLLOW)
    }

    /// `fchown(2)`.
    pub fn fchown(&self, file: &File, owner: Option<u32>, group: Option<u32>) -> Result<()> {
        let cred = self.core.cred_snapshot();
        finish(self.vinode_chown(&cred, &file.vinode, owner, group))
    }

    /// `fchownat(2)`.
    pub fn fchownat(
        &self,
        at: At<'_>,
        path: impl AsRef<[u8]>,
        owner: Option<u32>,
        group: Option<u32>,
        flags: i32,
    ) -> Result<()> {
        finish(self.fchownat_inner(at, path.as_ref(), owner, group, flags))
    }

    fn fchownat_inner(
        &self,
        at: At<'_>,
        path: &[u8],
        owner: Option<u32>,
        group: Option<u32>,
        flags: i32,
    ) -> Result<()> {
        if flags & !(libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW) != 0 {
            return Err(Error::InvalidArgument);
        }

        let fs = &self.core;
        let cred = fs.cred_snapshot();

        if path.is_empty() && flags & libc::AT_EMPTY_PATH != 0 {
            let vinode = match at {
                At::Dir(file) => file.vinode.clone(),
                At::Cwd => fs.cwd(),
            };
            return self.vinode_chown(&cred, &vinode, owner, group);
        }

        let start = at_dir(fs, at, path);
        let resolved = path::resolve_pathat_full(
            fs,
            &cred,
            &start,
            path,
            ResolveFlags::empty(),
            flags & libc::AT_SYMLINK_NOFOLLOW == 0,
        )?;

        self.vinode_chown(&cred, &resolved.vinode, owner, group)
    }

    fn vinode_chown(
        &self,
        cred: &Credentials,
        vinode: &Vref,
        owner: Option<u32>,
        group: Option<u32>,
    ) -> Result<()> {
        if owner.is_none() && group.is_none() {
            return Ok(());
        }

        let fs = &self.core;
        let _guard = vinode.lock.write();
        let inode = vinode.inode_mut(fs);

        if !cred.has_cap(CAP_CHOWN) {
            if inode.uid != cred.fsuid {
                return Err(Error::NotPermitted);
            }
            if owner.is_some_and(|o| o != inode.uid) {
                return Err(Error::NotPermitted);
            }
            if let Some(g) = group {
                // Handing a file to a foreign group requires membership.
                if g != inode.gid && g != cred.fsgid && !cred.gid_in_groups(g) {
                    return Err(Error::NotPermitted);
                }
            }
        }

        let tx = fs.store.begin();
        tx.add_ptr_range(&inode.uid, 8);
        if let Some(o) = owner {
            inode.uid = o;
        }
        if let Some(g) = group {
            inode.gid = g;
        }
        tx.set(&mut inode.ctime, current_time());
        tx.commit();
        Ok(())
    }

    /// `access(2)`.
    pub fn access(&self, path: impl AsRef<[u8]>, mode: i32) -> Result<()> {
        self.faccessat(At::Cwd, path, mode, 0)
    }

    /// `euidaccess(3)`.
    pub fn euidaccess(&self, path: impl AsRef<[u8]>, mode: i32) -> Result<()> {
        self.faccessat(At::Cwd, path, mode, libc::AT_EACCESS)
    }

    /// `faccessat(2)`.
    pub fn faccessat(&self, at: At<'_>, path: impl AsRef<[u8]>, mode: i32, flags: i32) -> Result<()> {
        finish(self.faccessat_inner(at, path.as_ref(), mode, flags))
    }

    fn faccessat_inner(&self, at: At<'_>, path: &[u8], mode: i32, flags: i32) -> Result<()> {
        if flags & !(libc::AT_EACCESS | libc::AT_SYMLINK_NOFOLLOW) != 0 {
            return Err(Error::InvalidArgument);
        }

        let fs = &self.core;
        let cred = fs.cred_snapshot();
        let start = at_dir(fs, at, path);

        let resolve_flags = if flags & libc::AT_EACCESS != 0 {
            ResolveFlags::USE_EACCESS
        } else {
            ResolveFlags::USE_RACCESS
        };

        let resolved = path::resolve_pathat_full(
            fs,
            &cred,
            &start,
            path,
            resolve_flags,
            flags & libc::AT_SYMLINK_NOFOLLOW == 0,
        )?;

        let mut acc = Access::empty();
        if mode & libc::R_OK != 0 {
            acc |= Access::WANT_READ;
        }
        if mode & libc::W_OK != 0 {
            acc |= Access::WANT_WRITE;
        }
        if mode & libc::X_OK != 0 {
            acc |= Access::WANT_EXECUTE;
        }
        acc |= if flags & libc::AT_EACCESS != 0 {
            Access::USE_EACCESS
        } else {
            Access::USE_RACCESS
        };

        let perms = {
            let _guard = resolved.vinode.lock.read();
            InodePerms::of(resolved.vinode.inode(fs))
        };
        if !can_access(&cred, perms, acc) {
            return Err(Error::PermissionDenied);
        }
        Ok(())
    }

    /// `utime(2)`: whole seconds.
    pub fn utime(&self, path: impl AsRef<[u8]>, times: Option<(i64, i64)>) -> Result<()> {
        let times = times.map(|(actime, modtime)| {
            [
                Time {
                    sec: actime,
                    nsec: 0,
                },
                Time {
                    sec: modtime,
                    nsec: 0,
                },
            ]
        });
        self.utimensat(At::Cwd, path, times, 0)
    }

    /// `utimes(2)`.
    pub fn utimes(&self, path: impl AsRef<[u8]>, times: Option<[Time; 2]>) -> Result<()> {
        self.utimensat(At::Cwd, path, times, 0)
    }

    /// `futimes(3)`.
    pub fn futimes(&self, file: &File, times: Option<[Time; 2]>) -> Result<()> {
        self.futimens(file, times)
    }

    /// `futimens(3)`.
    pub fn futimens(&self, file: &File, times: Option<[Time; 2]>) -> Result<()> {
        let cred = self.core.cred_snapshot();
        finish(self.vinode_utimes(&cred, &file.vinode, times))
    }

    /// `utimensat(2)`. `times[_].nsec` understands `UTIME_NOW` and
    /// `UTIME_OMIT`.
    pub fn utimensat(
        &self,
        at: At<'_>,
        path: impl AsRef<[u8]>,
        times: Option<[Time; 2]>,
        flags: i32,
    ) -> Result<()> {
        finish(self.utimensat_inner(at, path.as_ref(), times, flags))
    }

    fn utimensat_inner(
        &self,
        at: At<'_>,
        path: &[u8],
        times: Option<[Time; 2]>,
        flags: i32,
    ) -> Result<()> {
        if flags & !libc::AT_SYMLINK_NOFOLLOW != 0 {
            return Err(Error::InvalidArgument);
        }

        let fs = &self.core;
        let cred = fs.cred_snapshot();
        let start = at_dir(fs, at, path);
        let resolved = path::resolve_pathat_full(
            fs,
            &cred,
            &start,
            path,
            ResolveFlags::empty(),
            flags & libc::AT_SYMLINK_NOFOLLOW == 0,
        )?;

        self.vinode_utimes(&cred, &resolved.vinode, times)
    }

    fn vinode_utimes(
        &self,
        cred: &Credentials,
        vinode: &Vref,
        times: Option<[Time; 2]>,
    ) -> Result<()> {
        let fs = &self.core;
        let now = current_time();

        let _guard = vinode.lock.write();
        let inode = vinode.inode_mut(fs);

        let owner = inode.uid == cred.fsuid || cred.has_cap(CAP_FOWNER);

        let explicit = times.is_some_and(|t| {
            t.iter()
                .any(|tm| tm.nsec != libc::UTIME_NOW && tm.nsec != libc::UTIME_OMIT)
        });
        if explicit {
            // Arbitrary timestamps are for the owner only.
            if !owner {
                return Err(Error::NotPermitted);
            }
        } else if !owner
            && !can_access(
                cred,
                InodePerms::of(inode),
                Access::WANT_WRITE,
            )
        {
            return Err(Error::PermissionDenied);
        }

        let [atime, mtime] = times.unwrap_or([
            Time {
                sec: 0,
                nsec: libc::UTIME_NOW,
            },
            Time {
                sec: 0,
                nsec: libc::UTIME_NOW,
            },
        ]);

        let tx = fs.store.begin();

        let new_atime = match atime.nsec {
            n if n == libc::UTIME_OMIT => None,
            n if n == libc::UTIME_NOW => Some(now),
            _ => Some(atime),
        };
        if let Some(t) = new_atime {
            tx.set(&mut inode.atime, t);
            let state = vinode.state();
            state.atime = t;
            state.atime_dirty = false;
        }

        match mtime.nsec {
            n if n == libc::UTIME_OMIT => {}
            n if n == libc::UTIME_NOW => tx.set(&mut inode.mtime, now),
            _ => tx.set(&mut inode.mtime, mtime),
        }

        tx.set(&mut inode.ctime, now);
        tx.commit();
        Ok(())
    }
}
