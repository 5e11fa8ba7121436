//! Permission checks, credentials, chmod/chown/access.

use pmemfs::Filesystem;
use tempfile::TempDir;

fn pool() -> (TempDir, Filesystem) {
    let dir = TempDir::new().unwrap();
    let fs = Filesystem::create_pool(&dir.path().join("pool"), 8 << 20).unwrap();
    (dir, fs)
}

#[test]
fn chmod_changes_the_mode_bits() {
    let (_dir, fs) = pool();

    fs.open("/f", libc::O_CREAT | libc::O_WRONLY, 0o644).unwrap();
    fs.chmod("/f", 0o400).unwrap();
    assert_eq!(fs.stat("/f").unwrap().st_mode & 0o7777, 0o400);

    // The file type bits are untouched.
    assert!(fs.stat("/f").unwrap().is_regular_file());
}

#[test]
fn mode_bits_gate_open() {
    let (_dir, fs) = pool();

    fs.open("/ro", libc::O_CREAT | libc::O_WRONLY, 0o644).unwrap();
    fs.chmod("/ro", 0o444).unwrap();

    let err = fs.open("/ro", libc::O_WRONLY, 0).unwrap_err();
    assert_eq!(err.errno(), libc::EACCES);
    assert!(fs.open("/ro", libc::O_RDONLY, 0).is_ok());

    fs.chmod("/ro", 0o000).unwrap();
    let err = fs.open("/ro", libc::O_RDONLY, 0).unwrap_err();
    assert_eq!(err.errno(), libc::EACCES);
}

#[test]
fn traversal_needs_execute_on_intermediate_dirs() {
    let (_dir, fs) = pool();

    fs.mkdir("/locked", 0o755).unwrap();
    fs.open("/locked/f", libc::O_CREAT | libc::O_WRONLY, 0o644)
        .unwrap();

    fs.chmod("/locked", 0o600).unwrap();
    let err = fs.open("/locked/f", libc::O_RDONLY, 0).unwrap_err();
    assert_eq!(err.errno(), libc::EACCES);

    fs.chmod("/locked", 0o700).unwrap();
    assert!(fs.open("/locked/f", libc::O_RDONLY, 0).is_ok());
}

#[test]
fn access_distinguishes_requests() {
    let (_dir, fs) = pool();

    fs.open("/f", libc::O_CREAT | libc::O_WRONLY, 0o640).unwrap();
    fs.chmod("/f", 0o640).unwrap();

    assert!(fs.access("/f", libc::F_OK).is_ok());
    assert!(fs.access("/f", libc::R_OK).is_ok());
    assert!(fs.access("/f", libc::W_OK).is_ok());
    let err = fs.access("/f", libc::X_OK).unwrap_err();
    assert_eq!(err.errno(), libc::EACCES);

    assert_eq!(fs.access("/nope", libc::F_OK).unwrap_err().errno(), libc::ENOENT);
}

#[test]
fn chown_to_self_is_a_no_op_everyone_may_do() {
    let (_dir, fs) = pool();

    fs.open("/f", libc::O_CREAT | libc::O_WRONLY, 0o644).unwrap();
    let st = fs.stat("/f").unwrap();

    fs.chown("/f", Some(st.st_uid), None).unwrap();
    fs.chown("/f", None, Some(st.st_gid)).unwrap();
    fs.chown("/f", None, None).unwrap();
}

#[test]
fn chown_away_requires_cap_chown() {
    if unsafe { libc::geteuid() } == 0 {
        // Root carries CAP_CHOWN; the restriction does not apply.
        return;
    }

    let (_dir, fs) = pool();
    fs.open("/f", libc::O_CREAT | libc::O_WRONLY, 0o644).unwrap();

    let st = fs.stat("/f").unwrap();
    let err = fs.chown("/f", Some(st.st_uid + 1), None).unwrap_err();
    assert_eq!(err.errno(), libc::EPERM);
}

#[test]
fn fsuid_switch_changes_ownership_of_new_files() {
    let (_dir, fs) = pool();

    // New inodes take the effective ids of the pool credentials.
    fs.seteuid(4242).unwrap();
    fs.open("/other", libc::O_CREAT | libc::O_WRONLY, 0o644)
        .unwrap();
    assert_eq!(fs.stat("/other").unwrap().st_uid, 4242);

    // And a stranger without matching bits is refused.
    fs.chmod("/other", 0o700).unwrap();
    fs.seteuid(7).unwrap();
    let err = fs.open("/other", libc::O_RDONLY, 0).unwrap_err();
    assert_eq!(err.errno(), libc::EACCES);
}

#[test]
fn supplementary_groups_grant_group_access() {
    let (_dir, fs) = pool();

    fs.open("/g", libc::O_CREAT | libc::O_WRONLY, 0o644).unwrap();
    fs.chown("/g", None, Some(fs.stat("/g").unwrap().st_gid)).unwrap();
    fs.chmod("/g", 0o040).unwrap();
    let gid = fs.stat("/g").unwrap().st_gid;

    // A different identity without the group: no access. The ids are
    // arbitrary, chosen not to collide with the file's owner.
    fs.setreuid(54321, 54321).unwrap();
    fs.setregid(54321, 54321).unwrap();
    if gid != 54321 {
        let err = fs.open("/g", libc::O_RDONLY, 0).unwrap_err();
        assert_eq!(err.errno(), libc::EACCES);
    }

    // With the file's group in the supplementary list it works.
    fs.setgroups(&[gid]).unwrap();
    assert!(fs.open("/g", libc::O_RDONLY, 0).is_ok());

    let mut list = [0u32; 8];
    assert_eq!(fs.getgroups(&mut list).unwrap(), 1);
    assert_eq!(list[0], gid);
}

#[test]
fn setfsuid_returns_the_previous_value() {
    let (_dir, fs) = pool();

    let orig = fs.credentials().fsuid;
    let prev = fs.setfsuid(12345).unwrap();
    assert_eq!(prev, orig);
    assert_eq!(fs.setfsuid(orig).unwrap(), 12345);
}

#[test]
fn utimes_sets_explicit_timestamps() {
    let (_dir, fs) = pool();

    fs.open("/t", libc::O_CREAT | libc::O_WRONLY, 0o644).unwrap();

    let times = [
        pmemfs::Time { sec: 1000, nsec: 1 },
        pmemfs::Time { sec: 2000, nsec: 2 },
    ];
    fs.utimes("/t", Some(times)).unwrap();

    let st = fs.stat("/t").unwrap();
    assert_eq!((st.st_atim.sec, st.st_atim.nsec), (1000, 1));
    assert_eq!((st.st_mtim.sec, st.st_mtim.nsec), (2000, 2));

    // Touch with "now" moves both timestamps forward.
    fs.utimes("/t", None).unwrap();
    let st = fs.stat("/t").unwrap();
    assert!(st.st_mtim.sec > 2000);
    assert!(st.st_atim.sec > 1000);
}
