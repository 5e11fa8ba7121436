//! Data I/O: read, write, seek, truncate, fallocate.

use std::sync::Arc;

use crate::{
    cred::{can_access, Access, InodePerms},
    data,
    error::{Error, Result},
    file::{File, OpenFlags},
    inode::{current_time, Vinode},
    ops::finish,
    path::{self, ResolveFlags},
    pool::FsCore,
    Filesystem,
};

/// Where a seek is measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Set,
    Cur,
    End,
    /// Next data offset at or after the target.
    Data,
    /// Next hole offset at or after the target.
    Hole,
}

/// Checks shared by every read entry point.
fn readable_regular(fs: &FsCore, file: &File) -> Result<()> {
    let vinode = &file.vinode;
    if !vinode.is_regular_file(fs) {
        if vinode.is_dir(fs) {
            return Err(Error::IsADirectory);
        }
        return Err(Error::InvalidArgument);
    }
    if !file.readable() {
        return Err(Error::BadFileHandle);
    }
    Ok(())
}

fn writable_regular(fs: &FsCore, file: &File) -> Result<()> {
    let vinode = &file.vinode;
    if !vinode.is_regular_file(fs) {
        if vinode.is_dir(fs) {
            return Err(Error::IsADirectory);
        }
        return Err(Error::InvalidArgument);
    }
    if !file.writable() {
        return Err(Error::BadFileHandle);
    }
    Ok(())
}

/// relatime: bump the access time only when it trails the modification or
/// change time, or is older than a day. Takes the vinode write lock only
/// when an update is due.
fn handle_atime(fs: &FsCore, vinode: &Vinode, flags: OpenFlags) {
    if flags.contains(OpenFlags::NOATIME) {
        return;
    }

    let tm = current_time();
    let day_ago = crate::layout::Time {
        sec: tm.sec - 86400,
        nsec: tm.nsec,
    };

    let atime = vinode.state().atime;
    let inode = vinode.inode(fs);
    if atime >= day_ago && atime >= inode.ctime && atime >= inode.mtime {
        return;
    }

    let _guard = vinode.lock.write();
    let state = vinode.state();
    state.atime = tm;
    state.atime_dirty = true;
}

impl Filesystem {
    /// `read(2)`.
    pub fn read(&self, file: &File, buf: &mut [u8]) -> Result<usize> {
        self.readv(file, &mut [buf])
    }

    /// `readv(2)`.
    pub fn readv(&self, file: &File, bufs: &mut [&mut [u8]]) -> Result<usize> {
        finish(self.read_inner(file, None, bufs, true))
    }

    /// `pread(2)`.
    pub fn pread(&self, file: &File, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.preadv(file, &mut [buf], offset)
    }

    /// `preadv(2)`.
    pub fn preadv(&self, file: &File, bufs: &mut [&mut [u8]], offset: u64) -> Result<usize> {
        finish(self.read_inner(file, Some(offset), bufs, false))
    }

    fn read_inner(
        &self,
        file: &File,
        offset: Option<u64>,
        bufs: &mut [&mut [u8]],
        update_offset: bool,
    ) -> Result<usize> {
        let fs = &self.core;
        readable_regular(fs, file)?;

        let vinode = &file.vinode;
        let mut pos = file.pos.lock();
        let mut offset = offset.unwrap_or(pos.offset);

        let mut total = 0usize;
        let last;
        {
            let _guard = data::rdlock_with_block_tree(fs, vinode);

            let state = vinode.state();
            if pos.cache_gen != state.data_gen {
                pos.block_cache = None;
                pos.cache_gen = state.data_gen;
            }
            let mut hint = pos.block_cache;

            let size = vinode.inode(fs).size;
            for buf in bufs.iter_mut() {
                if offset >= size {
                    break;
                }
                let n = (buf.len() as u64).min(size - offset) as usize;
                if n == 0 {
                    continue;
                }
                hint = data::read_range(fs, vinode, offset, &mut buf[..n], hint);
                offset += n as u64;
                total += n;
                if n < buf.len() {
                    break;
                }
            }
            last = hint;
        }

        if update_offset {
            if total > 0 {
                pos.offset = offset;
            }
            pos.block_cache = last;
        }
        drop(pos);

        handle_atime(fs, vinode, file.flags);
        Ok(total)
    }

    /// `write(2)`.
    pub fn write(&self, file: &File, buf: &[u8]) -> Result<usize> {
        self.writev(file, &[buf])
    }

    /// `writev(2)`.
    pub fn writev(&self, file: &File, bufs: &[&[u8]]) -> Result<usize> {
        finish(self.write_inner(file, None, bufs, true))
    }

    /// `pwrite(2)`.
    pub fn pwrite(&self, file: &File, buf: &[u8], offset: u64) -> Result<usize> {
        self.pwritev(file, &[buf], offset)
    }

    /// `pwritev(2)`.
    pub fn pwritev(&self, file: &File, bufs: &[&[u8]], offset: u64) -> Result<usize> {
        finish(self.write_inner(file, Some(offset), bufs, false))
    }

    fn write_inner(
        &self,
        file: &File,
        offset: Option<u64>,
        bufs: &[&[u8]],
        update_offset: bool,
    ) -> Result<usize> {
        let fs = &self.core;
        writable_regular(fs, file)?;

        let len: u64 = bufs.iter().map(|b| b.len() as u64).sum();
        if len == 0 {
            return Ok(0);
        }

        let vinode = &file.vinode;
        let mut pos = file.pos.lock();

        let _guard = vinode.lock.write();
        data::ensure_block_tree(fs, vinode);

        let start = match offset {
            Some(off) => off,
            None if file.flags.contains(OpenFlags::APPEND) => vinode.inode(fs).size,
            None => pos.offset,
        };
        if start.checked_add(len).is_none() || start + len > i64::MAX as u64 {
            return Err(Error::FileTooBig);
        }

        vinode.snapshot_volatile();
        let tx = fs.store.begin();
        let restore = Arc::clone(vinode.arc());
        tx.on_abort(move || restore.restore_volatile());

        let allocated = data::allocate_interval(fs, &tx, vinode, start, len)?;

        let state = vinode.state();
        let mut hint = (pos.cache_gen == state.data_gen)
            .then_some(pos.block_cache)
            .flatten();

        let mut off = start;
        for buf in bufs {
            if buf.is_empty() {
                continue;
            }
            hint = data::write_range(fs, &tx, vinode, off, buf, hint);
            off += buf.len() as u64;
        }

        let inode = vinode.inode_mut(fs);
        if off > inode.size {
            tx.set(&mut inode.size, off);
        }
        let space = inode.allocated_space;
        tx.set(&mut inode.allocated_space, space + allocated);
        tx.set(&mut inode.mtime, current_time());

        tx.commit();
        vinode.discard_volatile_snapshot();

        if update_offset {
            pos.offset = off;
        }
        pos.block_cache = hint;
        pos.cache_gen = vinode.state().data_gen;

        Ok(len as usize)
    }

    /// `lseek(2)`, including `SEEK_DATA` / `SEEK_HOLE`.
    pub fn lseek(&self, file: &File, offset: i64, whence: SeekWhence) -> Result<u64> {
        finish(self.lseek_inner(file, offset, whence))
    }

    fn lseek_inner(&self, file: &File, offset: i64, whence: SeekWhence) -> Result<u64> {
        let fs = &self.core;
        let vinode = &file.vinode;
        let mut pos = file.pos.lock();

        let new = match whence {
            SeekWhence::Set => offset,
            SeekWhence::Cur => pos
                .offset
                .try_into()
                .ok()
                .and_then(|cur: i64| cur.checked_add(offset))
                .ok_or(Error::Overflow)?,
            SeekWhence::End => {
                let _guard = vinode.lock.read();
                let size: i64 = vinode
                    .inode(fs)
                    .size
                    .try_into()
                    .map_err(|_| Error::Overflow)?;
                size.checked_add(offset).ok_or(Error::Overflow)?
            }
            SeekWhence::Data | SeekWhence::Hole => {
                if !vinode.is_regular_file(fs) {
                    return Err(Error::InvalidArgument);
                }
                if offset < 0 {
                    return Err(Error::NoSuchAddress);
                }
                let _guard = data::rdlock_with_block_tree(fs, vinode);
                let found = if whence == SeekWhence::Data {
                    data::seek_data(fs, vinode, offset as u64)?
                } else {
                    data::seek_hole(fs, vinode, offset as u64)?
                };
                pos.offset = found;
                return Ok(found);
            }
        };

        if new < 0 {
            return Err(Error::InvalidArgument);
        }
        pos.offset = new as u64;
        Ok(new as u64)
    }

    /// `ftruncate(2)`.
    pub fn ftruncate(&self, file: &File, length: i64) -> Result<()> {
        finish(self.ftruncate_inner(file, length))
    }

    fn ftruncate_inner(&self, file: &File, length: i64) -> Result<()> {
        if length < 0 {
            return Err(Error::InvalidArgument);
        }
        if !file.writable() {
            return Err(Error::BadFileHandle);
        }
        let _pos = file.pos.lock();
        self.truncate_vinode(&file.vinode, length as u64)
    }

    /// `truncate(2)`.
    pub fn truncate(&self, path: impl AsRef<[u8]>, length: i64) -> Result<()> {
        finish(self.truncate_inner(path.as_ref(), length))
    }

    fn truncate_inner(&self, path: &[u8], length: i64) -> Result<()> {
        if length < 0 {
            return Err(Error::InvalidArgument);
        }
        let fs = &self.core;
        let cred = fs.cred_snapshot();
        let start = crate::ops::at_dir(fs, crate::ops::At::Cwd, path);

        let resolved =
            path::resolve_pathat_full(fs, &cred, &start, path, ResolveFlags::empty(), true)?;
        let vinode = resolved.vinode;

        {
            let _guard = vinode.lock.read();
            if !can_access(&cred, InodePerms::of(vinode.inode(fs)), Access::WANT_WRITE) {
                return Err(Error::PermissionDenied);
            }
        }
        if vinode.is_dir(fs) {
            return Err(Error::IsADirectory);
        }
        self.truncate_vinode(&vinode, length as u64)
    }

    fn truncate_vinode(&self, vinode: &crate::inode::Vref, length: u64) -> Result<()> {
        let fs = &self.core;
        if !vinode.is_regular_file(fs) {
            return Err(Error::InvalidArgument);
        }

        let _guard = vinode.lock.write();
        vinode.snapshot_volatile();
        let tx = fs.store.begin();
        let restore = Arc::clone(vinode.arc());
        tx.on_abort(move || restore.restore_volatile());

        data::truncate(fs, &tx, vinode, length)?;

        tx.commit();
        vinode.discard_volatile_snapshot();
        Ok(())
    }

    /// `fallocate(2)`: allocation and `PUNCH_HOLE | KEEP_SIZE`; the
    /// range-shifting modes are not supported.
    pub fn fallocate(&self, file: &File, mode: i32, offset: i64, length: i64) -> Result<()> {
        finish(self.fallocate_inner(file, mode, offset, length))
    }

    /// `posix_fallocate(3)`.
    pub fn posix_fallocate(&self, file: &File, offset: i64, length: i64) -> Result<()> {
        self.fallocate(file, 0, offset, length)
    }

    fn fallocate_inner(&self, file: &File, mode: i32, offset: i64, length: i64) -> Result<()> {
        if length <= 0 || offset < 0 {
            return Err(Error::InvalidArgument);
        }
        if (offset as u64) + (length as u64) > i64::MAX as u64 {
            return Err(Error::FileTooBig);
        }

        if mode & libc::FALLOC_FL_COLLAPSE_RANGE != 0
            || mode & libc::FALLOC_FL_ZERO_RANGE != 0
            || mode & libc::FALLOC_FL_INSERT_RANGE != 0
        {
            return Err(Error::Unsupported);
        }

        let punch = mode & libc::FALLOC_FL_PUNCH_HOLE != 0;
        if punch {
            // Punching must keep the size, even off the end of the file.
            if mode != libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE {
                return Err(Error::Unsupported);
            }
        } else if mode & !libc::FALLOC_FL_KEEP_SIZE != 0 {
            return Err(Error::InvalidArgument);
        }

        let fs = &self.core;
        if !file.writable() {
            return Err(Error::BadFileHandle);
        }
        let vinode = &file.vinode;
        if !vinode.is_regular_file(fs) {
            return Err(Error::BadFileHandle);
        }

        let (mut offset, mut length) = (offset as u64, length as u64);
        let end = offset + length;
        if !punch {
            (offset, length) = data::expand_to_full_pages(offset, length);
        }
        if length == 0 {
            return Ok(());
        }

        let _guard = vinode.lock.write();
        data::ensure_block_tree(fs, vinode);
        vinode.snapshot_volatile();
        let tx = fs.store.begin();
        let restore = Arc::clone(vinode.arc());
        tx.on_abort(move || restore.restore_volatile());

        let inode = vinode.inode_mut(fs);
        let mut allocated = inode.allocated_space;
        if punch {
            allocated -= data::remove_interval(fs, &tx, vinode, offset, length);
        } else {
            allocated += data::allocate_interval(fs, &tx, vinode, offset, length)?;
            if mode & libc::FALLOC_FL_KEEP_SIZE == 0 && inode.size < end {
                tx.set(&mut inode.size, end);
            }
        }
        if inode.allocated_space != allocated {
            tx.set(&mut inode.allocated_space, allocated);
        }

        tx.commit();
        vinode.discard_volatile_snapshot();
        Ok(())
    }
}
