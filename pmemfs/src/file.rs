//! Open-file handles.

use bitflags::bitflags;
use parking_lot::Mutex;
use pmem_store::PObj;

use crate::{
    dir::DirPos,
    error::{Error, Result},
    inode::Vref,
    layout::BlockDesc,
};

bitflags! {
    /// Internal open-file flag set, translated from `O_*` at open time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct OpenFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const APPEND = 1 << 2;
        const NOATIME = 1 << 3;
    }
}

/// Mutable per-handle state, guarded by the handle's mutex.
pub(crate) struct FilePos {
    pub offset: u64,
    /// Cached block for sequential access.
    pub block_cache: Option<PObj<BlockDesc>>,
    /// Data generation of the vinode the cache was taken from.
    pub cache_gen: u64,
    /// Directory readout cursor.
    pub dir_pos: DirPos,
}

/// An open file (or directory). Dropping the handle closes it.
pub struct File {
    pub(crate) vinode: Vref,
    pub(crate) flags: OpenFlags,
    pub(crate) pos: Mutex<FilePos>,
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File").field("flags", &self.flags).finish_non_exhaustive()
    }
}

impl File {
    pub(crate) fn new(vinode: Vref, flags: OpenFlags) -> Self {
        Self {
            vinode,
            flags,
            pos: Mutex::new(FilePos {
                offset: 0,
                block_cache: None,
                cache_gen: 0,
                dir_pos: DirPos::default(),
            }),
        }
    }

    pub(crate) fn readable(&self) -> bool {
        self.flags.contains(OpenFlags::READ)
    }

    pub(crate) fn writable(&self) -> bool {
        self.flags.contains(OpenFlags::WRITE)
    }
}

/// Checks and strips the `open(2)` flags down to the bits the pool keeps.
pub(crate) fn check_flags(flags: i32) -> Result<()> {
    if flags & libc::O_ASYNC != 0 {
        log::warn!("O_ASYNC is not supported");
        return Err(Error::InvalidArgument);
    }
    if flags & libc::O_PATH != 0 {
        log::warn!("O_PATH is not supported");
        return Err(Error::InvalidArgument);
    }

    let known = libc::O_APPEND
        | libc::O_CREAT
        | libc::O_CLOEXEC
        | libc::O_DIRECT
        | libc::O_TMPFILE
        | libc::O_DIRECTORY
        | libc::O_DSYNC
        | libc::O_EXCL
        | libc::O_NOCTTY
        | libc::O_NOATIME
        | libc::O_NOFOLLOW
        | libc::O_NONBLOCK
        | libc::O_SYNC
        | libc::O_TRUNC
        | libc::O_ACCMODE;
    if flags & !known != 0 {
        log::warn!("unknown open flag {:#x}", flags & !known);
        return Err(Error::InvalidArgument);
    }

    Ok(())
}

pub(crate) fn is_tmpfile(flags: i32) -> bool {
    flags & libc::O_TMPFILE == libc::O_TMPFILE
}
