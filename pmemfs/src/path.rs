//! Path resolution.
//!
//! The resolver consumes components up to the penultimate one, chasing
//! symlinks (with a depth cap) and checking execute permission on every
//! directory it descends through. The result is the parent vinode plus the
//! unresolved suffix; operations look the final component up themselves,
//! under the locks they need.
//!
//! The locking helpers at the bottom resolve the fundamental race between
//! lookup and lock acquisition: look the child up under the parent's read
//! lock, drop it, take write locks on both in canonical order, then verify
//! the dirent still matches. A mismatch means another thread won; retry.

use std::sync::Arc;

use arrayvec::ArrayVec;
use bitflags::bitflags;
use pmem_store::PObj;

use crate::{
    cred::{can_access, Access, Credentials, InodePerms},
    dir::{self, DirentInfo},
    error::{Error, Result},
    inode::Vref,
    layout::{Dirent, PATH_MAX},
    pool::FsCore,
};

/// Symlink nesting beyond this depth is a loop.
pub(crate) const SYMLOOP_MAX: u32 = 40;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct ResolveFlags: u32 {
        /// Refuse to climb past the pool root via `..`.
        const STOP_AT_ROOT = 1 << 0;
        /// Check traversal permission against effective ids.
        const USE_EACCESS = 1 << 1;
        /// Check traversal permission against real ids.
        const USE_RACCESS = 1 << 2;
        /// `open_parent` only: resolve a trailing symlink too.
        const SYMLINK_FOLLOW = 1 << 3;
    }
}

/// Resolution result: the parent directory plus the unresolved suffix
/// (typically the final component, possibly with trailing slashes).
pub(crate) struct PathInfo {
    pub parent: Vref,
    pub remaining: Vec<u8>,
}

/// Bytes of the next path component.
pub(crate) fn component_length(path: &[u8]) -> usize {
    memchr::memchr(b'/', path).unwrap_or(path.len())
}

/// Does `path` still contain more than one component? Trailing slashes do
/// not count.
pub(crate) fn more_than_one_component(path: &[u8]) -> bool {
    let Some(slash) = memchr::memchr(b'/', path) else {
        return false;
    };
    path[slash..].iter().any(|&c| c != b'/')
}

fn path_without_trailing_slashes(path: &[u8]) -> &[u8] {
    let end = path
        .iter()
        .rposition(|&c| c != b'/')
        .map_or(0, |p| p + 1);
    &path[..end]
}

fn resolve_nested(
    fs: &Arc<FsCore>,
    cred: &Credentials,
    start: &Vref,
    path: &[u8],
    flags: ResolveFlags,
    nest_level: u32,
) -> Result<PathInfo> {
    if nest_level > SYMLOOP_MAX {
        return Err(Error::SymlinkLoop);
    }
    if path.is_empty() {
        return Err(Error::NotFound);
    }
    if path.len() > PATH_MAX {
        return Err(Error::NameTooLong);
    }

    let mut path = path;
    let mut parent = if path[0] == b'/' {
        while let [b'/', rest @ ..] = path {
            path = rest;
        }
        fs.root()
    } else {
        start.clone()
    };

    loop {
        let effective = path_without_trailing_slashes(path);
        let Some(slash) = memchr::memchr(b'/', effective) else {
            break;
        };
        let name = &path[..slash];

        let child = dir::lookup_dirent(fs, &parent, name, flags)?;

        let child_perms = {
            let _guard = child.lock.read();
            InodePerms::of(child.inode(fs))
        };

        if crate::inode::flags_is_symlink(child_perms.flags) {
            let target = {
                let _guard = child.lock.read();
                child.inode(fs).symlink_target().to_vec()
            };
            drop(child);

            let mut new_path = target;
            new_path.push(b'/');
            new_path.extend_from_slice(&path[slash + 1..]);

            return resolve_nested(fs, cred, &parent, &new_path, flags, nest_level + 1);
        }

        if crate::inode::flags_is_dir(child_perms.flags) {
            let mut want = Access::WANT_EXECUTE;
            if flags.contains(ResolveFlags::USE_EACCESS) {
                want |= Access::USE_EACCESS;
            } else if flags.contains(ResolveFlags::USE_RACCESS) {
                want |= Access::USE_RACCESS;
            }
            if !can_access(cred, child_perms, want) {
                return Err(Error::PermissionDenied);
            }
        }

        parent = child;
        path = &path[slash + 1..];
        while let [b'/', rest @ ..] = path {
            path = rest;
        }
    }

    if !parent.is_dir(fs) {
        return Err(Error::NotADirectory);
    }
    if more_than_one_component(path) {
        return Err(Error::NotFound);
    }

    Ok(PathInfo {
        parent,
        remaining: path.to_vec(),
    })
}

/// Resolves `path` down to its parent directory.
pub(crate) fn resolve_pathat(
    fs: &Arc<FsCore>,
    cred: &Credentials,
    start: &Vref,
    path: &[u8],
    flags: ResolveFlags,
) -> Result<PathInfo> {
    resolve_nested(fs, cred, start, path, flags, 1)
}

/// Reads a symlink's target and restarts resolution against the
/// previously resolved parent.
pub(crate) fn resolve_symlink(
    fs: &Arc<FsCore>,
    cred: &Credentials,
    vinode: Vref,
    info: &PathInfo,
) -> Result<PathInfo> {
    let target = {
        let _guard = vinode.lock.read();
        vinode.inode(fs).symlink_target().to_vec()
    };
    drop(vinode);

    resolve_pathat(fs, cred, &info.parent, &target, ResolveFlags::empty())
}

/// Fully resolved path: the final vinode plus the parent-level info.
pub(crate) struct Resolved {
    pub info: PathInfo,
    pub vinode: Vref,
}

/// Resolves the whole of `path`, optionally following a trailing symlink.
pub(crate) fn resolve_pathat_full(
    fs: &Arc<FsCore>,
    cred: &Credentials,
    start: &Vref,
    path: &[u8],
    flags: ResolveFlags,
    resolve_last_symlink: bool,
) -> Result<Resolved> {
    let mut info = resolve_pathat(fs, cred, start, path, flags)?;

    for _ in 0..SYMLOOP_MAX {
        let namelen = component_length(&info.remaining);

        let vinode = if namelen == 0 {
            debug_assert!(fs.is_root(&info.parent));
            info.parent.clone()
        } else {
            dir::lookup_dirent(
                fs,
                &info.parent,
                &info.remaining[..namelen],
                ResolveFlags::empty(),
            )?
        };

        if resolve_last_symlink && vinode.is_symlink(fs) {
            info = resolve_symlink(fs, cred, vinode, &info)?;
            continue;
        }

        return Ok(Resolved { info, vinode });
    }

    Err(Error::SymlinkLoop)
}

// Multi-vinode locking with race verification.

/// A set of write-locked vinodes, unlocked (and the references dropped) at
/// scope exit. Always acquired in ascending address order.
pub(crate) struct WLockSet {
    locked: ArrayVec<Vref, 4>,
}

impl WLockSet {
    pub(crate) fn lock(vrefs: &[&Vref]) -> Self {
        let mut set: ArrayVec<&Vref, 4> = ArrayVec::new();
        for v in vrefs.iter().copied() {
            if !set
                .iter()
                .any(|x| std::ptr::eq(x.arc().as_ref(), v.arc().as_ref()))
            {
                set.push(v);
            }
        }
        set.sort_by_key(|v| Arc::as_ptr(v.arc()) as usize);

        let mut locked = ArrayVec::new();
        for v in set {
            std::mem::forget(v.lock.write());
            locked.push((*v).clone());
        }
        Self { locked }
    }
}

impl Drop for WLockSet {
    fn drop(&mut self) {
        for v in self.locked.iter().rev() {
            unsafe { v.lock.force_unlock_write() };
        }
    }
}

fn dirent_target(fs: &FsCore, slot: PObj<Dirent>) -> PObj<crate::layout::Inode> {
    unsafe { fs.store.at(slot).as_ref() }.inode
}

/// Looks the final component of `info` up and write-locks parent and child,
/// retrying until the dirent seen under the read lock is still in place
/// under the write locks.
pub(crate) fn lock_parent_and_child(
    fs: &Arc<FsCore>,
    info: &PathInfo,
) -> Result<(WLockSet, DirentInfo)> {
    let namelen = component_length(&info.remaining);
    let name = &info.remaining[..namelen];

    loop {
        let found = {
            let _guard = info.parent.lock.read();
            dir::lookup_vinode_by_name_locked(fs, &info.parent, name)?
        };

        let set = WLockSet::lock(&[&info.parent, &found.vinode]);

        // Another thread may have modified the parent; refresh.
        match dir::lookup_dirent_by_name_locked(fs, &info.parent, name) {
            Ok(slot) if dirent_target(fs, slot) == found.vinode.tinode => {
                return Ok((
                    set,
                    DirentInfo {
                        dirent: slot,
                        vinode: found.vinode,
                    },
                ));
            }
            _ => {
                // The entry vanished or points elsewhere now: a race.
                drop(set);
            }
        }
    }
}

/// As [`lock_parent_and_child`], for the two paths of a rename: locks both
/// parents and both children (the destination may not exist) with the same
/// verify-and-retry protocol.
pub(crate) fn lock_parents_and_children(
    fs: &Arc<FsCore>,
    src: &PathInfo,
    dst: &PathInfo,
) -> Result<(WLockSet, DirentInfo, Option<DirentInfo>)> {
    let src_namelen = component_length(&src.remaining);
    let src_name = &src.remaining[..src_namelen];
    let dst_namelen = component_length(&dst.remaining);
    let dst_name = &dst.remaining[..dst_namelen];

    loop {
        let (src_found, dst_found) = {
            let _guards = crate::inode::rdlock2(&src.parent, &dst.parent);

            let src_found = dir::lookup_vinode_by_name_locked(fs, &src.parent, src_name)?;
            let dst_found = match dir::lookup_vinode_by_name_locked(fs, &dst.parent, dst_name) {
                Ok(found) => Some(found),
                Err(Error::NotFound) => None,
                Err(e) => return Err(e),
            };
            (src_found, dst_found)
        };

        let mut to_lock: ArrayVec<&Vref, 4> = ArrayVec::new();
        to_lock.push(&src.parent);
        to_lock.push(&src_found.vinode);
        to_lock.push(&dst.parent);
        if let Some(d) = dst_found.as_ref() {
            to_lock.push(&d.vinode);
        }
        let set = WLockSet::lock(&to_lock);
        drop(to_lock);

        // Re-verify both sides under the write locks.
        let src_slot = dir::lookup_dirent_by_name_locked(fs, &src.parent, src_name).ok();
        let dst_slot = dir::lookup_dirent_by_name_locked(fs, &dst.parent, dst_name).ok();

        let src_ok =
            src_slot.is_some_and(|slot| dirent_target(fs, slot) == src_found.vinode.tinode);
        let dst_ok = match dst_found.as_ref() {
            None => dst_slot.is_none(),
            Some(found) => {
                dst_slot.is_some_and(|slot| dirent_target(fs, slot) == found.vinode.tinode)
            }
        };

        if src_ok && dst_ok {
            let src_info = DirentInfo {
                dirent: src_slot.unwrap(),
                vinode: src_found.vinode,
            };
            let dst_info = dst_found.map(|found| DirentInfo {
                dirent: dst_slot.unwrap(),
                vinode: found.vinode,
            });
            return Ok((set, src_info, dst_info));
        }

        drop(set);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_lengths() {
        assert_eq!(component_length(b"a/bb/c"), 1);
        assert_eq!(component_length(b"bb/c"), 2);
        assert_eq!(component_length(b"c"), 1);
        assert_eq!(component_length(b""), 0);
    }

    #[test]
    fn trailing_slashes_do_not_count_as_components() {
        assert!(!more_than_one_component(b"a"));
        assert!(!more_than_one_component(b"a/"));
        assert!(!more_than_one_component(b"a///"));
        assert!(more_than_one_component(b"a/b"));
        assert!(more_than_one_component(b"a//b"));
    }

    #[test]
    fn trailing_slash_stripping() {
        assert_eq!(path_without_trailing_slashes(b"a/b/"), b"a/b");
        assert_eq!(path_without_trailing_slashes(b"a"), b"a");
        assert_eq!(path_without_trailing_slashes(b"///"), b"");
    }
}
