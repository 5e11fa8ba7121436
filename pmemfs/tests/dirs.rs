//! Directory semantics: mkdir/rmdir, rename, links, symlinks, readout.

use pmemfs::{At, Filesystem, RENAME_EXCHANGE, RENAME_NOREPLACE};
use tempfile::TempDir;

fn pool() -> (TempDir, Filesystem) {
    let dir = TempDir::new().unwrap();
    let fs = Filesystem::create_pool(&dir.path().join("pool"), 16 << 20).unwrap();
    (dir, fs)
}

fn touch(fs: &Filesystem, path: &str) {
    fs.open(path, libc::O_CREAT | libc::O_WRONLY, 0o644).unwrap();
}

#[test]
fn mkdir_rmdir_leaves_parent_unchanged() {
    let (_dir, fs) = pool();

    let before = fs.stat("/").unwrap();
    fs.mkdir("/d", 0o755).unwrap();

    let st = fs.stat("/d").unwrap();
    assert!(st.is_dir());
    assert_eq!(st.st_nlink, 2);
    assert_eq!(fs.stat("/").unwrap().st_nlink, before.st_nlink + 1);

    fs.rmdir("/d").unwrap();
    assert_eq!(fs.stat("/").unwrap().st_nlink, before.st_nlink);
    assert_eq!(fs.stat("/d").unwrap_err().errno(), libc::ENOENT);
}

#[test]
fn directory_nlink_counts_subdirectories() {
    let (_dir, fs) = pool();

    fs.mkdir("/p", 0o755).unwrap();
    assert_eq!(fs.stat("/p").unwrap().st_nlink, 2);

    fs.mkdir("/p/a", 0o755).unwrap();
    fs.mkdir("/p/b", 0o755).unwrap();
    touch(&fs, "/p/file");
    assert_eq!(fs.stat("/p").unwrap().st_nlink, 4);

    fs.rmdir("/p/a").unwrap();
    assert_eq!(fs.stat("/p").unwrap().st_nlink, 3);
}

#[test]
fn rmdir_refuses_nonempty_dot_and_root() {
    let (_dir, fs) = pool();

    fs.mkdir("/d", 0o755).unwrap();
    touch(&fs, "/d/f");
    assert_eq!(fs.rmdir("/d").unwrap_err().errno(), libc::ENOTEMPTY);

    fs.unlink("/d/f").unwrap();
    assert_eq!(fs.rmdir("/d/.").unwrap_err().errno(), libc::EINVAL);
    assert_eq!(fs.rmdir("/").unwrap_err().errno(), libc::EBUSY);
    assert_eq!(fs.rmdir("/d/f").unwrap_err().errno(), libc::ENOENT);
    fs.rmdir("/d").unwrap();
}

#[test]
fn unlink_directory_is_eisdir() {
    let (_dir, fs) = pool();
    fs.mkdir("/d", 0o755).unwrap();
    assert_eq!(fs.unlink("/d").unwrap_err().errno(), libc::EISDIR);
}

#[test]
fn hard_link_laws() {
    let (_dir, fs) = pool();

    touch(&fs, "/a");
    let before = fs.stat("/a").unwrap();

    fs.link("/a", "/b").unwrap();
    assert_eq!(fs.stat("/a").unwrap().st_nlink, before.st_nlink + 1);
    assert_eq!(fs.stat("/b").unwrap().st_ino, before.st_ino);

    fs.unlink("/b").unwrap();
    let after = fs.stat("/a").unwrap();
    assert_eq!(after.st_nlink, before.st_nlink);
    assert_eq!(after.st_ino, before.st_ino);
}

#[test]
fn hard_link_to_directory_is_rejected() {
    let (_dir, fs) = pool();
    fs.mkdir("/d", 0o755).unwrap();
    assert_eq!(fs.link("/d", "/d2").unwrap_err().errno(), libc::EPERM);
}

#[test]
fn rename_round_trip_preserves_identity() {
    let (_dir, fs) = pool();

    touch(&fs, "/a");
    let ino = fs.stat("/a").unwrap().st_ino;

    fs.rename("/a", "/b").unwrap();
    assert_eq!(fs.stat("/a").unwrap_err().errno(), libc::ENOENT);
    assert_eq!(fs.stat("/b").unwrap().st_ino, ino);

    fs.rename("/b", "/a").unwrap();
    assert_eq!(fs.stat("/a").unwrap().st_ino, ino);
}

#[test]
fn rename_into_own_subtree_is_rejected() {
    let (_dir, fs) = pool();

    fs.mkdir("/d1", 0o755).unwrap();
    fs.mkdir("/d1/d2", 0o755).unwrap();

    let err = fs.rename("/d1", "/d1/d2/x").unwrap_err();
    assert_eq!(err.errno(), libc::EINVAL);
}

#[test]
fn rename_directory_updates_dotdot_and_nlinks() {
    let (_dir, fs) = pool();

    fs.mkdir("/src", 0o755).unwrap();
    fs.mkdir("/dst", 0o755).unwrap();
    fs.mkdir("/src/child", 0o755).unwrap();
    assert_eq!(fs.stat("/src").unwrap().st_nlink, 3);

    fs.rename("/src/child", "/dst/child").unwrap();
    assert_eq!(fs.stat("/src").unwrap().st_nlink, 2);
    assert_eq!(fs.stat("/dst").unwrap().st_nlink, 3);

    // ".." follows the move.
    touch(&fs, "/dst/child/probe");
    assert!(fs.stat("/dst/child/../child/probe").is_ok());
}

#[test]
fn rename_noreplace_and_exchange() {
    let (_dir, fs) = pool();

    touch(&fs, "/a");
    touch(&fs, "/b");
    let (ino_a, ino_b) = (
        fs.stat("/a").unwrap().st_ino,
        fs.stat("/b").unwrap().st_ino,
    );

    let err = fs
        .renameat2(At::Cwd, "/a", At::Cwd, "/b", RENAME_NOREPLACE)
        .unwrap_err();
    assert_eq!(err.errno(), libc::EEXIST);

    // Exchange is its own inverse.
    fs.renameat2(At::Cwd, "/a", At::Cwd, "/b", RENAME_EXCHANGE)
        .unwrap();
    assert_eq!(fs.stat("/a").unwrap().st_ino, ino_b);
    assert_eq!(fs.stat("/b").unwrap().st_ino, ino_a);

    fs.renameat2(At::Cwd, "/a", At::Cwd, "/b", RENAME_EXCHANGE)
        .unwrap();
    assert_eq!(fs.stat("/a").unwrap().st_ino, ino_a);
    assert_eq!(fs.stat("/b").unwrap().st_ino, ino_b);
}

#[test]
fn rename_replaces_destination_file() {
    let (_dir, fs) = pool();

    let f = fs
        .open("/new", libc::O_CREAT | libc::O_WRONLY, 0o644)
        .unwrap();
    fs.write(&f, b"payload").unwrap();
    drop(f);
    touch(&fs, "/old");

    fs.rename("/new", "/old").unwrap();
    assert_eq!(fs.stat("/new").unwrap_err().errno(), libc::ENOENT);
    assert_eq!(fs.stat("/old").unwrap().st_size, 7);
}

#[test]
fn symlink_resolution_and_readlink() {
    let (_dir, fs) = pool();

    fs.mkdir("/real", 0o755).unwrap();
    touch(&fs, "/real/target");
    fs.symlink("/real", "/alias").unwrap();

    assert!(fs.stat("/alias/target").is_ok());

    let mut buf = [0u8; 64];
    let n = fs.readlink("/alias", &mut buf).unwrap();
    assert_eq!(&buf[..n], b"/real");

    // lstat sees the link itself.
    assert!(fs.lstat("/alias").unwrap().is_symlink());
    assert!(fs.stat("/alias").unwrap().is_dir());
}

#[test]
fn symlink_loop_is_detected() {
    let (_dir, fs) = pool();

    fs.symlink("/a", "/b").unwrap();
    fs.symlink("/b", "/a").unwrap();

    let err = fs.open("/a", libc::O_RDONLY, 0).unwrap_err();
    assert_eq!(err.errno(), libc::ELOOP);
}

#[test]
fn o_nofollow_refuses_trailing_symlinks() {
    let (_dir, fs) = pool();

    touch(&fs, "/file");
    fs.symlink("/file", "/link").unwrap();

    let err = fs
        .open("/link", libc::O_RDONLY | libc::O_NOFOLLOW, 0)
        .unwrap_err();
    assert_eq!(err.errno(), libc::ELOOP);
}

#[test]
fn getdents64_matches_directory() {
    let (_dir, fs) = pool();

    fs.mkdir("/d", 0o755).unwrap();
    touch(&fs, "/d/f1");
    touch(&fs, "/d/f2");
    touch(&fs, "/d/f3");

    let d = fs
        .open("/d", libc::O_RDONLY | libc::O_DIRECTORY, 0)
        .unwrap();
    let mut buf = [0u8; 4096];
    let n = fs.getdents64(&d, &mut buf).unwrap();
    assert!(n > 0);

    let mut seen = Vec::new();
    let mut off = 0usize;
    while off < n {
        let rec = &buf[off..];
        let reclen = u16::from_ne_bytes([rec[16], rec[17]]) as usize;
        let d_type = rec[18];
        let name_end = 19 + rec[19..reclen].iter().position(|&b| b == 0).unwrap();
        let name = String::from_utf8(rec[19..name_end].to_vec()).unwrap();

        let expected_type = if name == "." || name == ".." {
            libc::DT_DIR
        } else {
            libc::DT_REG
        };
        assert_eq!(d_type, expected_type, "d_type of {name}");

        seen.push(name);
        off += reclen;
    }

    seen.sort();
    assert_eq!(seen, [".", "..", "f1", "f2", "f3"]);

    // A second call continues at the cursor: nothing left.
    assert_eq!(fs.getdents64(&d, &mut buf).unwrap(), 0);
}

#[test]
fn getdents_skips_removed_names() {
    let (_dir, fs) = pool();

    fs.mkdir("/d", 0o755).unwrap();
    touch(&fs, "/d/gone");
    touch(&fs, "/d/kept");
    fs.unlink("/d/gone").unwrap();

    let d = fs
        .open("/d", libc::O_RDONLY | libc::O_DIRECTORY, 0)
        .unwrap();
    let mut buf = [0u8; 4096];
    let n = fs.getdents64(&d, &mut buf).unwrap();

    let mut names = Vec::new();
    let mut off = 0usize;
    while off < n {
        let rec = &buf[off..];
        let reclen = u16::from_ne_bytes([rec[16], rec[17]]) as usize;
        let name_end = 19 + rec[19..reclen].iter().position(|&b| b == 0).unwrap();
        names.push(String::from_utf8(rec[19..name_end].to_vec()).unwrap());
        off += reclen;
    }
    names.sort();
    assert_eq!(names, [".", "..", "kept"]);
}

#[test]
fn chdir_getcwd_and_relative_paths() {
    let (_dir, fs) = pool();

    fs.mkdir("/w", 0o755).unwrap();
    fs.mkdir("/w/sub", 0o755).unwrap();

    assert_eq!(fs.getcwd().unwrap(), b"/");

    fs.chdir("/w").unwrap();
    assert_eq!(fs.getcwd().unwrap(), b"/w");

    touch(&fs, "relative");
    assert!(fs.stat("/w/relative").is_ok());

    fs.chdir("sub").unwrap();
    assert_eq!(fs.getcwd().unwrap(), b"/w/sub");

    fs.chdir("..").unwrap();
    assert_eq!(fs.getcwd().unwrap(), b"/w");
    fs.chdir("/").unwrap();
}

#[test]
fn open_parent_returns_handle_and_component() {
    let (_dir, fs) = pool();

    fs.mkdir("/p", 0o755).unwrap();
    let (parent, name) = fs.open_parent(At::Cwd, "/p/leaf", false).unwrap();
    assert_eq!(name, b"leaf");
    assert_eq!(fs.get_dir_path(&parent).unwrap(), b"/p");
}

#[test]
fn name_length_boundaries() {
    let (_dir, fs) = pool();

    let name_255 = format!("/{}", "x".repeat(255));
    fs.open(&name_255, libc::O_CREAT | libc::O_WRONLY, 0o644)
        .unwrap();
    assert!(fs.stat(&name_255).is_ok());

    let name_256 = format!("/{}", "y".repeat(256));
    let err = fs
        .open(&name_256, libc::O_CREAT | libc::O_WRONLY, 0o644)
        .unwrap_err();
    assert_eq!(err.errno(), libc::ENAMETOOLONG);
}

#[test]
fn o_tmpfile_leaves_no_name_behind() {
    let (_dir, fs) = pool();

    fs.mkdir("/tmp", 0o755).unwrap();
    let inodes_before = fs.stats().inodes;

    {
        let f = fs
            .open("/tmp", libc::O_TMPFILE | libc::O_RDWR, 0o600)
            .unwrap();
        fs.write(&f, b"scratch").unwrap();
        assert_eq!(fs.stats().inodes, inodes_before + 1);

        // The anonymous file never shows up in the directory.
        let d = fs
            .open("/tmp", libc::O_RDONLY | libc::O_DIRECTORY, 0)
            .unwrap();
        let mut buf = [0u8; 4096];
        let n = fs.getdents64(&d, &mut buf).unwrap();
        let mut count = 0;
        let mut off = 0usize;
        while off < n {
            let reclen = u16::from_ne_bytes([buf[off + 16], buf[off + 17]]) as usize;
            count += 1;
            off += reclen;
        }
        assert_eq!(count, 2); // "." and ".."
    }

    // Closing the handle released the inode.
    assert_eq!(fs.stats().inodes, inodes_before);
}

#[test]
fn linkat_empty_path_links_an_open_file() {
    let (_dir, fs) = pool();

    fs.mkdir("/tmp", 0o755).unwrap();
    let f = fs
        .open("/tmp", libc::O_TMPFILE | libc::O_RDWR, 0o600)
        .unwrap();
    fs.write(&f, b"rescued").unwrap();

    fs.linkat(At::Dir(&f), "", At::Cwd, "/tmp/rescued", libc::AT_EMPTY_PATH)
        .unwrap();
    drop(f);

    assert_eq!(fs.stat("/tmp/rescued").unwrap().st_size, 7);
}
