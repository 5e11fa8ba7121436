//! Crash consistency: orphan recovery and reopen behavior.

use pmemfs::Filesystem;
use tempfile::TempDir;

#[test]
fn orphan_is_reaped_on_reopen_after_crash() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pool");

    {
        let fs = Filesystem::create_pool(&path, 8 << 20).unwrap();

        let f = fs
            .open("/bbb", libc::O_CREAT | libc::O_WRONLY, 0o644)
            .unwrap();
        fs.write(&f, b"kept").unwrap();
        drop(f);

        let aaa = fs
            .open("/aaa", libc::O_CREAT | libc::O_RDWR, 0o644)
            .unwrap();
        fs.write(&aaa, b"doomed").unwrap();
        fs.unlink("/aaa").unwrap();

        // The handle keeps the unlinked inode alive on the orphan list.
        assert_eq!(fs.stats().inodes, 3);

        // Crash: the process goes away without closing anything.
        std::mem::forget(aaa);
        std::mem::forget(fs);
    }

    let fs = Filesystem::open_pool(&path).unwrap();

    // Root and /bbb survive; the orphan was freed during reopen.
    assert_eq!(fs.stats().inodes, 2);
    assert_eq!(fs.stat("/aaa").unwrap_err().errno(), libc::ENOENT);
    assert_eq!(fs.stat("/bbb").unwrap().st_size, 4);
}

#[test]
fn unlinked_but_open_file_stays_readable() {
    let dir = TempDir::new().unwrap();
    let fs = Filesystem::create_pool(&dir.path().join("pool"), 8 << 20).unwrap();

    let f = fs
        .open("/ghost", libc::O_CREAT | libc::O_RDWR, 0o644)
        .unwrap();
    fs.write(&f, b"still visible through the fd").unwrap();
    fs.unlink("/ghost").unwrap();

    assert_eq!(fs.stat("/ghost").unwrap_err().errno(), libc::ENOENT);

    let mut buf = [0u8; 28];
    assert_eq!(fs.pread(&f, &mut buf, 0).unwrap(), 28);
    assert_eq!(&buf, b"still visible through the fd");

    // Closing the last handle frees the inode inside the drop transaction.
    let inodes = fs.stats().inodes;
    drop(f);
    assert_eq!(fs.stats().inodes, inodes - 1);
}

#[test]
fn normal_close_leaves_no_orphans() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pool");

    {
        let fs = Filesystem::create_pool(&path, 8 << 20).unwrap();
        let f = fs
            .open("/x", libc::O_CREAT | libc::O_WRONLY, 0o644)
            .unwrap();
        fs.write(&f, b"x").unwrap();
        fs.unlink("/x").unwrap();
        drop(f);
        fs.close();
    }

    let fs = Filesystem::open_pool(&path).unwrap();
    assert_eq!(fs.stats().inodes, 1); // just the root
}

#[test]
fn directory_tree_survives_crash_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pool");

    {
        let fs = Filesystem::create_pool(&path, 8 << 20).unwrap();
        fs.mkdir("/a", 0o755).unwrap();
        fs.mkdir("/a/b", 0o755).unwrap();
        let f = fs
            .open("/a/b/c", libc::O_CREAT | libc::O_WRONLY, 0o600)
            .unwrap();
        fs.write(&f, b"deep").unwrap();
        drop(f);
        std::mem::forget(fs);
    }

    let fs = Filesystem::open_pool(&path).unwrap();
    let st = fs.stat("/a/b/c").unwrap();
    assert_eq!(st.st_size, 4);
    assert_eq!(st.st_mode & 0o777, 0o600);
    assert_eq!(fs.stat("/a").unwrap().st_nlink, 3);
}

#[test]
fn rmdir_orphan_is_recovered_too() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pool");

    {
        let fs = Filesystem::create_pool(&path, 8 << 20).unwrap();
        fs.mkdir("/gone", 0o755).unwrap();
        let d = fs
            .open("/gone", libc::O_RDONLY | libc::O_DIRECTORY, 0)
            .unwrap();
        fs.rmdir("/gone").unwrap();
        std::mem::forget(d);
        std::mem::forget(fs);
    }

    let fs = Filesystem::open_pool(&path).unwrap();
    assert_eq!(fs.stats().inodes, 1);
}
