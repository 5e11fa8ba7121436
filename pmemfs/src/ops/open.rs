//! open / openat / create / open_parent / close.

use crate::{
    cred::{can_access, Access, InodePerms},
    data,
    dir,
    error::{Error, Result},
    file::{check_flags, is_tmpfile, File, OpenFlags},
    inode::{self, inode_alloc, Vref},
    layout::{ALLPERMS, S_IFREG},
    ops::{at_dir, finish, At},
    path::{self, ResolveFlags, SYMLOOP_MAX},
    Filesystem,
};

impl Filesystem {
    /// `open(2)`. `mode` is consulted only with `O_CREAT` / `O_TMPFILE`.
    pub fn open(&self, path: impl AsRef<[u8]>, flags: i32, mode: u32) -> Result<File> {
        self.openat(At::Cwd, path, flags, mode)
    }

    /// `openat(2)`.
    pub fn openat(
        &self,
        at: At<'_>,
        path: impl AsRef<[u8]>,
        flags: i32,
        mode: u32,
    ) -> Result<File> {
        finish(self.openat_inner(at, path.as_ref(), flags, mode))
    }

    /// `creat(2)`.
    pub fn create(&self, path: impl AsRef<[u8]>, mode: u32) -> Result<File> {
        self.open(
            path,
            libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC,
            mode,
        )
    }

    fn openat_inner(&self, at: At<'_>, path: &[u8], flags: i32, mode: u32) -> Result<File> {
        log::debug!(
            "open path {:?} flags {flags:#x}",
            String::from_utf8_lossy(path)
        );

        check_flags(flags)?;
        let fs = &self.core;
        let cred = fs.cred_snapshot();
        let mode = u64::from(mode) & ALLPERMS;

        let start = at_dir(fs, at, path);
        let mut info = path::resolve_pathat(fs, &cred, &start, path, ResolveFlags::empty())?;
        drop(start);

        let mut vinode: Option<Vref> = None;
        let mut namelen = 0;
        for step in 0.. {
            if step > SYMLOOP_MAX {
                return Err(Error::SymlinkLoop);
            }
            namelen = path::component_length(&info.remaining);

            vinode = if namelen == 0 {
                Some(info.parent.clone())
            } else {
                match dir::lookup_dirent(
                    fs,
                    &info.parent,
                    &info.remaining[..namelen],
                    ResolveFlags::empty(),
                ) {
                    Ok(v) => Some(v),
                    Err(Error::NotFound) => None,
                    Err(e) => return Err(e),
                }
            };

            match vinode.as_ref() {
                Some(v) if v.is_symlink(fs) => {
                    if flags & libc::O_NOFOLLOW != 0 {
                        return Err(Error::SymlinkLoop);
                    }
                    // With O_CREAT|O_EXCL a trailing symlink is not
                    // followed: the open fails on the link itself.
                    if flags & (libc::O_CREAT | libc::O_EXCL)
                        == (libc::O_CREAT | libc::O_EXCL)
                    {
                        break;
                    }
                    let v = vinode.take().unwrap();
                    info = path::resolve_symlink(fs, &cred, v, &info)?;
                }
                _ => break,
            }
        }

        if let Some(v) = vinode.as_ref() {
            if !v.is_dir(fs) && info.remaining[namelen..].contains(&b'/') {
                return Err(Error::NotADirectory);
            }
        }

        let accmode = flags & libc::O_ACCMODE;
        let mut parent = info.parent.clone();

        if is_tmpfile(flags) {
            let Some(v) = vinode.take() else {
                return Err(Error::NotFound);
            };
            if !v.is_dir(fs) {
                return Err(Error::NotADirectory);
            }
            if accmode == libc::O_RDONLY {
                return Err(Error::InvalidArgument);
            }
            parent = v;
        } else if flags & (libc::O_CREAT | libc::O_EXCL) == (libc::O_CREAT | libc::O_EXCL) {
            if vinode.is_some() {
                log::debug!("file {:?} already exists", String::from_utf8_lossy(path));
                return Err(Error::Exists);
            }
        } else if flags & libc::O_CREAT != 0 {
            // May create, may open.
        } else if vinode.is_none() {
            return Err(Error::NotFound);
        }

        let vref = match vinode {
            None => self.create_at(
                &cred,
                &parent,
                &info.remaining[..namelen],
                flags,
                mode,
            )?,
            Some(v) => {
                self.open_existing(&cred, &v, flags)?;
                v
            }
        };

        let mut open_flags = match accmode {
            libc::O_RDONLY => OpenFlags::READ,
            libc::O_WRONLY => OpenFlags::WRITE,
            libc::O_RDWR => OpenFlags::READ | OpenFlags::WRITE,
            _ => return Err(Error::InvalidArgument),
        };
        if flags & libc::O_NOATIME != 0 {
            open_flags |= OpenFlags::NOATIME;
        }
        if flags & libc::O_APPEND != 0 {
            open_flags |= OpenFlags::APPEND;
        }

        Ok(File::new(vref, open_flags))
    }

    /// Creates a regular file in `parent`; with `O_TMPFILE`, the new inode
    /// goes straight to the orphan list instead of getting a name.
    fn create_at(
        &self,
        cred: &crate::cred::Credentials,
        parent: &Vref,
        name: &[u8],
        flags: i32,
        mode: u64,
    ) -> Result<Vref> {
        let fs = &self.core;
        let tmpfile = is_tmpfile(flags);

        let _guard = parent.lock.write();
        // Orphaning touches the orphan-list header.
        let _super_guard = tmpfile.then(|| fs.super_lock.write());

        if !can_access(cred, InodePerms::of(parent.inode(fs)), Access::WANT_WRITE) {
            return Err(Error::PermissionDenied);
        }

        let mut orphan_slot = None;
        let tinode;
        {
            let tx = fs.store.begin();
            tinode = inode_alloc(fs, &tx, cred, S_IFREG | mode)?;

            if tmpfile {
                let head = fs.sb().orphaned_inodes;
                orphan_slot = Some(crate::inode_array::add(fs, &tx, head, tinode)?);
            } else {
                let t = inode::current_time();
                dir::add_dirent(fs, &tx, parent.tinode, name, tinode, t)?;
            }
            tx.commit();
        }

        let vref = fs.map.get(fs, tinode, Some(parent.arc()), Some(name), None)?;
        if let Some(slot) = orphan_slot {
            vref.state().orphan = Some(slot);
        }
        Ok(vref)
    }

    /// Permission and type checks for opening an existing object, plus the
    /// `O_TRUNC` side effect.
    fn open_existing(
        &self,
        cred: &crate::cred::Credentials,
        vinode: &Vref,
        flags: i32,
    ) -> Result<()> {
        let fs = &self.core;

        let want = match flags & libc::O_ACCMODE {
            libc::O_RDONLY => Access::WANT_READ,
            libc::O_WRONLY => Access::WANT_WRITE,
            libc::O_RDWR => Access::WANT_READ | Access::WANT_WRITE,
            _ => return Err(Error::InvalidArgument),
        };

        let perms = {
            let _guard = vinode.lock.read();
            InodePerms::of(vinode.inode(fs))
        };
        if !can_access(cred, perms, want) {
            return Err(Error::PermissionDenied);
        }

        if flags & libc::O_DIRECTORY != 0 && !vinode.is_dir(fs) {
            return Err(Error::NotADirectory);
        }

        if flags & libc::O_TRUNC != 0 {
            if !vinode.is_regular_file(fs) {
                log::debug!("O_TRUNC on a non-regular file");
                return Err(Error::InvalidArgument);
            }
            if flags & libc::O_ACCMODE == libc::O_RDONLY {
                log::debug!("O_TRUNC without write permission");
                return Err(Error::PermissionDenied);
            }

            let _guard = vinode.lock.write();
            vinode.snapshot_volatile();
            let tx = fs.store.begin();
            let restore = std::sync::Arc::clone(vinode.arc());
            tx.on_abort(move || restore.restore_volatile());
            data::truncate(fs, &tx, vinode, 0)?;
            tx.commit();
            vinode.discard_volatile_snapshot();
        }

        Ok(())
    }

    /// Opens the parent directory of `path`, returning the handle and the
    /// final component. `follow` resolves a trailing symlink first.
    pub fn open_parent(
        &self,
        at: At<'_>,
        path: impl AsRef<[u8]>,
        follow: bool,
    ) -> Result<(File, Vec<u8>)> {
        finish(self.open_parent_inner(at, path.as_ref(), follow))
    }

    fn open_parent_inner(&self, at: At<'_>, path: &[u8], follow: bool) -> Result<(File, Vec<u8>)> {
        let fs = &self.core;
        let cred = fs.cred_snapshot();
        let start = at_dir(fs, at, path);

        let flags = ResolveFlags::STOP_AT_ROOT;
        let mut info = path::resolve_pathat(fs, &cred, &start, path, flags)?;

        if follow {
            for step in 0.. {
                if step > SYMLOOP_MAX {
                    return Err(Error::SymlinkLoop);
                }
                if path::more_than_one_component(&info.remaining) {
                    break;
                }
                let namelen = path::component_length(&info.remaining);
                if namelen == 0 {
                    break;
                }

                match dir::lookup_dirent(
                    fs,
                    &info.parent,
                    &info.remaining[..namelen],
                    ResolveFlags::empty(),
                ) {
                    Ok(v) if v.is_symlink(fs) => {
                        info = path::resolve_symlink(fs, &cred, v, &info)?;
                    }
                    _ => break,
                }
            }
        }

        let file = File::new(
            info.parent.clone(),
            OpenFlags::READ | OpenFlags::NOATIME,
        );
        Ok((file, info.remaining))
    }
}
