//! Credentials and access checks.
//!
//! Each pool carries one credentials record guarded by `cred_rwlock`; every
//! operation takes a cheap snapshot of it up front. `can_access` implements
//! the owner/group/other permission-bit selection used by the resolver and
//! the operation layer.

use bitflags::bitflags;

use crate::{
    error::{Error, Result},
    layout::Inode,
    Filesystem,
};

/// Capability bit positions; values follow the kernel.
pub const CAP_CHOWN: u32 = 0;
pub const CAP_FOWNER: u32 = 3;

bitflags! {
    /// What an access check asks for: permission bits plus a selector
    /// choosing which of the caller's identities to check against.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u32 {
        const WANT_READ = 1 << 0;
        const WANT_WRITE = 1 << 1;
        const WANT_EXECUTE = 1 << 2;

        /// Check against fsuid/fsgid (default).
        const USE_FACCESS = 0 << 3;
        /// Check against effective ids, as `access(2)` with `AT_EACCESS`.
        const USE_EACCESS = 1 << 3;
        /// Check against real ids, as plain `access(2)`.
        const USE_RACCESS = 2 << 3;
    }
}

const ACCESS_MASK: u32 = 3 << 3;

/// Per-pool credentials.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub ruid: u32,
    pub rgid: u32,
    pub euid: u32,
    pub egid: u32,
    pub fsuid: u32,
    pub fsgid: u32,
    pub groups: Vec<u32>,
    /// Bitmask of `1 << CAP_*`.
    pub caps: u32,
}

impl Credentials {
    /// Credentials of the calling process, the state a fresh pool handle
    /// starts with.
    #[must_use]
    pub fn from_process() -> Self {
        let euid = unsafe { libc::geteuid() };
        let caps = if euid == 0 {
            1 << CAP_CHOWN | 1 << CAP_FOWNER
        } else {
            0
        };
        Self {
            ruid: unsafe { libc::getuid() },
            rgid: unsafe { libc::getgid() },
            euid,
            egid: unsafe { libc::getegid() },
            fsuid: euid,
            fsgid: unsafe { libc::getegid() },
            groups: Vec::new(),
            caps,
        }
    }

    #[must_use]
    pub fn has_cap(&self, cap: u32) -> bool {
        self.caps & (1 << cap) != 0
    }

    #[must_use]
    pub fn gid_in_groups(&self, gid: u32) -> bool {
        self.groups.contains(&gid)
    }
}

/// The owner/mode triple an access decision needs; copied out of the inode
/// so checks can run without holding its lock.
#[derive(Debug, Clone, Copy)]
pub struct InodePerms {
    pub flags: u64,
    pub uid: u32,
    pub gid: u32,
}

impl InodePerms {
    #[must_use]
    pub fn of(inode: &Inode) -> Self {
        Self {
            flags: inode.flags,
            uid: inode.uid,
            gid: inode.gid,
        }
    }
}

/// Does the caller have `acc` on an object with the given permissions?
#[must_use]
pub fn can_access(cred: &Credentials, perms: InodePerms, acc: Access) -> bool {
    let (uid, gid) = match acc.bits() & ACCESS_MASK {
        x if x == Access::USE_EACCESS.bits() => (cred.euid, cred.egid),
        x if x == Access::USE_RACCESS.bits() => (cred.ruid, cred.rgid),
        _ => (cred.fsuid, cred.fsgid),
    };

    let mode = perms.flags;
    let mut allowed = 0u64;
    if perms.uid == uid {
        if mode & 0o400 != 0 {
            allowed |= Access::WANT_READ.bits() as u64;
        }
        if mode & 0o200 != 0 {
            allowed |= Access::WANT_WRITE.bits() as u64;
        }
        if mode & 0o100 != 0 {
            allowed |= Access::WANT_EXECUTE.bits() as u64;
        }
    } else if perms.gid == gid || cred.gid_in_groups(perms.gid) {
        if mode & 0o040 != 0 {
            allowed |= Access::WANT_READ.bits() as u64;
        }
        if mode & 0o020 != 0 {
            allowed |= Access::WANT_WRITE.bits() as u64;
        }
        if mode & 0o010 != 0 {
            allowed |= Access::WANT_EXECUTE.bits() as u64;
        }
    } else {
        if mode & 0o004 != 0 {
            allowed |= Access::WANT_READ.bits() as u64;
        }
        if mode & 0o002 != 0 {
            allowed |= Access::WANT_WRITE.bits() as u64;
        }
        if mode & 0o001 != 0 {
            allowed |= Access::WANT_EXECUTE.bits() as u64;
        }
    }

    let wanted = (acc.bits() & !ACCESS_MASK) as u64;
    wanted & allowed == wanted
}

impl Filesystem {
    /// Snapshot of the pool credentials.
    #[must_use]
    pub fn credentials(&self) -> Credentials {
        self.core.cred.read().clone()
    }

    pub fn setreuid(&self, ruid: u32, euid: u32) -> Result<()> {
        let mut cred = self.core.cred.write();
        if ruid != u32::MAX {
            cred.ruid = ruid;
        }
        if euid != u32::MAX {
            cred.euid = euid;
            cred.fsuid = euid;
        }
        Ok(())
    }

    pub fn setregid(&self, rgid: u32, egid: u32) -> Result<()> {
        let mut cred = self.core.cred.write();
        if rgid != u32::MAX {
            cred.rgid = rgid;
        }
        if egid != u32::MAX {
            cred.egid = egid;
            cred.fsgid = egid;
        }
        Ok(())
    }

    pub fn setuid(&self, uid: u32) -> Result<()> {
        if uid == u32::MAX {
            return Err(Error::InvalidArgument);
        }
        let mut cred = self.core.cred.write();
        cred.ruid = uid;
        cred.euid = uid;
        cred.fsuid = uid;
        Ok(())
    }

    pub fn setgid(&self, gid: u32) -> Result<()> {
        if gid == u32::MAX {
            return Err(Error::InvalidArgument);
        }
        let mut cred = self.core.cred.write();
        cred.rgid = gid;
        cred.egid = gid;
        cred.fsgid = gid;
        Ok(())
    }

    pub fn seteuid(&self, euid: u32) -> Result<()> {
        if euid == u32::MAX {
            return Err(Error::InvalidArgument);
        }
        let mut cred = self.core.cred.write();
        cred.euid = euid;
        cred.fsuid = euid;
        Ok(())
    }

    pub fn setegid(&self, egid: u32) -> Result<()> {
        if egid == u32::MAX {
            return Err(Error::InvalidArgument);
        }
        let mut cred = self.core.cred.write();
        cred.egid = egid;
        cred.fsgid = egid;
        Ok(())
    }

    /// Returns the previous fsuid.
    pub fn setfsuid(&self, fsuid: u32) -> Result<u32> {
        if fsuid == u32::MAX {
            return Err(Error::InvalidArgument);
        }
        let mut cred = self.core.cred.write();
        Ok(std::mem::replace(&mut cred.fsuid, fsuid))
    }

    /// Returns the previous fsgid.
    pub fn setfsgid(&self, fsgid: u32) -> Result<u32> {
        if fsgid == u32::MAX {
            return Err(Error::InvalidArgument);
        }
        let mut cred = self.core.cred.write();
        Ok(std::mem::replace(&mut cred.fsgid, fsgid))
    }

    /// Copies the supplementary groups into `list`; fails with `EINVAL`
    /// when the buffer is too small, as `getgroups(2)` does.
    pub fn getgroups(&self, list: &mut [u32]) -> Result<usize> {
        let cred = self.core.cred.read();
        if cred.groups.len() > list.len() {
            return Err(Error::InvalidArgument);
        }
        list[..cred.groups.len()].copy_from_slice(&cred.groups);
        Ok(cred.groups.len())
    }

    pub fn setgroups(&self, list: &[u32]) -> Result<()> {
        let mut cred = self.core.cred.write();
        cred.groups.clear();
        cred.groups.extend_from_slice(list);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cred(fsuid: u32, fsgid: u32) -> Credentials {
        Credentials {
            ruid: 100,
            rgid: 100,
            euid: fsuid,
            egid: fsgid,
            fsuid,
            fsgid,
            groups: vec![42],
            caps: 0,
        }
    }

    fn perms(mode: u64, uid: u32, gid: u32) -> InodePerms {
        InodePerms {
            flags: mode,
            uid,
            gid,
        }
    }

    #[test]
    fn owner_bits_take_precedence() {
        let c = cred(1, 1);
        // Owner has no read bit even though group and other do.
        let p = perms(0o044, 1, 1);
        assert!(!can_access(&c, p, Access::WANT_READ));
        assert!(can_access(&c, perms(0o400, 1, 9), Access::WANT_READ));
    }

    #[test]
    fn supplementary_groups_grant_group_bits() {
        let c = cred(1, 1);
        let p = perms(0o040, 9, 42);
        assert!(can_access(&c, p, Access::WANT_READ));
        assert!(!can_access(&c, p, Access::WANT_WRITE));
    }

    #[test]
    fn other_bits_apply_to_strangers() {
        let c = cred(1, 1);
        assert!(can_access(&c, perms(0o001, 9, 9), Access::WANT_EXECUTE));
        assert!(!can_access(&c, perms(0o010, 9, 9), Access::WANT_EXECUTE));
    }

    #[test]
    fn real_ids_selected_by_raccess() {
        let c = cred(1, 1); // ruid = 100
        let p = perms(0o400, 100, 9);
        assert!(!can_access(&c, p, Access::WANT_READ));
        assert!(can_access(&c, p, Access::WANT_READ | Access::USE_RACCESS));
    }
}
