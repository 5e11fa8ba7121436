//! Basic create/write/read behavior on a fresh pool.

use pmemfs::{Filesystem, SeekWhence};
use tempfile::TempDir;

fn pool(size: u64) -> (TempDir, Filesystem) {
    let dir = TempDir::new().unwrap();
    let fs = Filesystem::create_pool(&dir.path().join("pool"), size).unwrap();
    (dir, fs)
}

#[test]
fn create_write_read() {
    let (_dir, fs) = pool(8 << 20);

    let f = fs
        .open("/a", libc::O_CREAT | libc::O_RDWR, 0o644)
        .unwrap();

    let data = b"Marcin S\0";
    assert_eq!(fs.write(&f, data).unwrap(), data.len());

    assert_eq!(fs.lseek(&f, 0, SeekWhence::Set).unwrap(), 0);

    let mut buf = [0u8; 9];
    assert_eq!(fs.read(&f, &mut buf).unwrap(), data.len());
    assert_eq!(&buf, data);
}

#[test]
fn overallocate_on_append() {
    let (_dir, fs) = pool(8 << 20);

    let f = fs
        .open("/a", libc::O_CREAT | libc::O_WRONLY, 0o644)
        .unwrap();

    let zeros = vec![0u8; 4096];
    assert_eq!(fs.write(&f, &zeros).unwrap(), 4096);
    assert_eq!(fs.stat("/a").unwrap().st_size, 4096);

    assert_eq!(fs.write(&f, &zeros).unwrap(), 4096);
    assert_eq!(fs.stat("/a").unwrap().st_size, 8192);

    // Appending twice must not cost two blocks when the first write was
    // overallocated.
    assert!(fs.stats().blocks <= 2);
}

#[test]
fn pread_pwrite_do_not_move_the_offset() {
    let (_dir, fs) = pool(8 << 20);

    let f = fs
        .open("/f", libc::O_CREAT | libc::O_RDWR, 0o644)
        .unwrap();
    fs.write(&f, b"0123456789").unwrap();

    assert_eq!(fs.pwrite(&f, b"xx", 4).unwrap(), 2);
    let mut buf = [0u8; 4];
    assert_eq!(fs.pread(&f, &mut buf, 3).unwrap(), 4);
    assert_eq!(&buf, b"3xx6");

    // The handle offset is still at the end of the initial write.
    assert_eq!(fs.lseek(&f, 0, SeekWhence::Cur).unwrap(), 10);
}

#[test]
fn append_mode_writes_at_the_end() {
    let (_dir, fs) = pool(8 << 20);

    let f = fs
        .open("/log", libc::O_CREAT | libc::O_WRONLY | libc::O_APPEND, 0o644)
        .unwrap();
    fs.write(&f, b"one").unwrap();

    // A second handle writes concurrently; append still lands at the end.
    let g = fs.open("/log", libc::O_WRONLY | libc::O_APPEND, 0).unwrap();
    fs.write(&g, b"two").unwrap();
    fs.write(&f, b"!").unwrap();

    let mut buf = [0u8; 16];
    let r = fs.open("/log", libc::O_RDONLY, 0).unwrap();
    assert_eq!(fs.read(&r, &mut buf).unwrap(), 7);
    assert_eq!(&buf[..7], b"onetwo!");
}

#[test]
fn readv_writev_round_trip() {
    let (_dir, fs) = pool(8 << 20);

    let f = fs
        .open("/v", libc::O_CREAT | libc::O_RDWR, 0o644)
        .unwrap();
    assert_eq!(fs.writev(&f, &[b"hello ", b"vectored ", b"world"]).unwrap(), 20);

    fs.lseek(&f, 0, SeekWhence::Set).unwrap();
    let mut a = [0u8; 6];
    let mut b = [0u8; 14];
    assert_eq!(fs.readv(&f, &mut [&mut a, &mut b]).unwrap(), 20);
    assert_eq!(&a, b"hello ");
    assert_eq!(&b, b"vectored world");
}

#[test]
fn stat_synthesizes_pool_identity() {
    let (_dir, fs) = pool(8 << 20);

    let f = fs
        .open("/s", libc::O_CREAT | libc::O_WRONLY, 0o640)
        .unwrap();
    fs.write(&f, &[7u8; 100]).unwrap();

    let st = fs.stat("/s").unwrap();
    assert!(st.is_regular_file());
    assert_eq!(st.st_size, 100);
    assert_eq!(st.st_mode & 0o777, 0o640);
    assert_eq!(st.st_nlink, 1);
    assert_eq!(st.st_blksize, 1);
    assert_ne!(st.st_dev, 0);
    assert_ne!(st.st_ino, 0);
    // st_blocks counts allocated block bytes in 512-byte units.
    assert!(st.st_blocks > 0);

    let root = fs.stat("/").unwrap();
    assert!(root.is_dir());
    assert_eq!(root.st_dev, st.st_dev);
}

#[test]
fn read_from_write_only_handle_is_rejected() {
    let (_dir, fs) = pool(8 << 20);

    let f = fs
        .open("/w", libc::O_CREAT | libc::O_WRONLY, 0o644)
        .unwrap();
    let mut buf = [0u8; 4];
    let err = fs.read(&f, &mut buf).unwrap_err();
    assert_eq!(err.errno(), libc::EBADF);

    let r = fs.open("/w", libc::O_RDONLY, 0).unwrap();
    let err = fs.write(&r, b"x").unwrap_err();
    assert_eq!(err.errno(), libc::EBADF);
}

#[test]
fn o_excl_refuses_existing_files() {
    let (_dir, fs) = pool(8 << 20);

    fs.open("/x", libc::O_CREAT | libc::O_WRONLY, 0o644).unwrap();
    let err = fs
        .open("/x", libc::O_CREAT | libc::O_EXCL | libc::O_WRONLY, 0o644)
        .unwrap_err();
    assert_eq!(err.errno(), libc::EEXIST);
}

#[test]
fn o_path_is_rejected() {
    let (_dir, fs) = pool(8 << 20);
    let err = fs.open("/", libc::O_PATH, 0).unwrap_err();
    assert_eq!(err.errno(), libc::EINVAL);
}

#[test]
fn errormsg_reports_the_last_failure() {
    let (_dir, fs) = pool(8 << 20);

    assert!(fs.open("/absent", libc::O_RDONLY, 0).is_err());
    assert_eq!(fs.errormsg(), "no such file or directory");
}

#[test]
fn data_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pool");

    {
        let fs = Filesystem::create_pool(&path, 8 << 20).unwrap();
        let f = fs
            .open("/persist", libc::O_CREAT | libc::O_WRONLY, 0o644)
            .unwrap();
        fs.write(&f, b"still here").unwrap();
        drop(f);
        fs.close();
    }

    let fs = Filesystem::open_pool(&path).unwrap();
    let f = fs.open("/persist", libc::O_RDONLY, 0).unwrap();
    let mut buf = [0u8; 10];
    assert_eq!(fs.read(&f, &mut buf).unwrap(), 10);
    assert_eq!(&buf, b"still here");
}
