//! Sparse files: truncation, holes, fallocate, SEEK_HOLE / SEEK_DATA.

use pmemfs::{Filesystem, SeekWhence};
use tempfile::TempDir;

fn pool() -> (TempDir, Filesystem) {
    let dir = TempDir::new().unwrap();
    let fs = Filesystem::create_pool(&dir.path().join("pool"), 32 << 20).unwrap();
    (dir, fs)
}

#[test]
fn writing_past_the_end_reads_back_zeros() {
    let (_dir, fs) = pool();

    let f = fs
        .open("/sparse", libc::O_CREAT | libc::O_RDWR, 0o644)
        .unwrap();

    fs.pwrite(&f, b"tail", 100_000).unwrap();
    assert_eq!(fs.stat("/sparse").unwrap().st_size, 100_004);

    let mut buf = [1u8; 16];
    assert_eq!(fs.pread(&f, &mut buf, 50_000).unwrap(), 16);
    assert_eq!(buf, [0u8; 16]);

    let mut buf = [0u8; 4];
    assert_eq!(fs.pread(&f, &mut buf, 100_000).unwrap(), 4);
    assert_eq!(&buf, b"tail");
}

#[test]
fn truncate_extends_with_a_hole() {
    let (_dir, fs) = pool();

    let f = fs
        .open("/t", libc::O_CREAT | libc::O_RDWR, 0o644)
        .unwrap();
    fs.write(&f, b"data").unwrap();

    fs.ftruncate(&f, 8192).unwrap();
    assert_eq!(fs.stat("/t").unwrap().st_size, 8192);

    let mut buf = [9u8; 8];
    assert_eq!(fs.pread(&f, &mut buf, 4096).unwrap(), 8);
    assert_eq!(buf, [0u8; 8]);
}

#[test]
fn truncate_shrinks_and_releases_blocks() {
    let (_dir, fs) = pool();

    let f = fs
        .open("/t", libc::O_CREAT | libc::O_RDWR, 0o644)
        .unwrap();
    // Three well-separated extents, so shrinking can deallocate whole
    // blocks rather than just zeroing inside one.
    let chunk = vec![7u8; 64 * 1024];
    fs.pwrite(&f, &chunk, 0).unwrap();
    fs.pwrite(&f, &chunk, 8 << 20).unwrap();
    fs.pwrite(&f, &chunk, 16 << 20).unwrap();

    let blocks_full = fs.stat("/t").unwrap().st_blocks;
    fs.ftruncate(&f, 4096).unwrap();
    let st = fs.stat("/t").unwrap();
    assert_eq!(st.st_size, 4096);
    assert!(st.st_blocks < blocks_full);

    // Growing again: the released range reads as zeros.
    fs.ftruncate(&f, 8192).unwrap();
    let mut buf = [1u8; 16];
    fs.pread(&f, &mut buf, 6000).unwrap();
    assert_eq!(buf, [0u8; 16]);
}

#[test]
fn truncate_then_write_read_round_trip() {
    let (_dir, fs) = pool();

    let f = fs
        .open("/t", libc::O_CREAT | libc::O_RDWR, 0o644)
        .unwrap();
    fs.write(&f, b"0123456789").unwrap();
    fs.ftruncate(&f, 5).unwrap();

    let mut buf = [0u8; 10];
    assert_eq!(fs.pread(&f, &mut buf, 0).unwrap(), 5);
    assert_eq!(&buf[..5], b"01234");
}

#[test]
fn punch_hole_keeps_size_and_zeroes_the_range() {
    let (_dir, fs) = pool();

    let f = fs
        .open("/p", libc::O_CREAT | libc::O_RDWR, 0o644)
        .unwrap();
    let data = vec![0xabu8; 64 * 1024];
    fs.write(&f, &data).unwrap();

    let before = fs.stat("/p").unwrap();

    fs.fallocate(
        &f,
        libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
        8192,
        16384,
    )
    .unwrap();

    let after = fs.stat("/p").unwrap();
    assert_eq!(after.st_size, before.st_size);
    assert!(after.st_blocks <= before.st_blocks);

    let mut buf = vec![1u8; 16384];
    assert_eq!(fs.pread(&f, &mut buf, 8192).unwrap(), 16384);
    assert!(buf.iter().all(|&b| b == 0));

    // Bytes on both sides survive.
    let mut edge = [0u8; 1];
    fs.pread(&f, &mut edge, 8191).unwrap();
    assert_eq!(edge[0], 0xab);
    fs.pread(&f, &mut edge, 8192 + 16384).unwrap();
    assert_eq!(edge[0], 0xab);
}

#[test]
fn fallocate_reserves_space_without_data() {
    let (_dir, fs) = pool();

    let f = fs
        .open("/r", libc::O_CREAT | libc::O_RDWR, 0o644)
        .unwrap();

    fs.posix_fallocate(&f, 0, 65536).unwrap();
    let st = fs.stat("/r").unwrap();
    assert_eq!(st.st_size, 65536);
    assert!(st.st_blocks >= 65536 / 512);

    // Allocated but never written: reads as zeros.
    let mut buf = [1u8; 64];
    fs.pread(&f, &mut buf, 30_000).unwrap();
    assert_eq!(buf, [0u8; 64]);
}

#[test]
fn fallocate_keep_size_does_not_grow_the_file() {
    let (_dir, fs) = pool();

    let f = fs
        .open("/k", libc::O_CREAT | libc::O_RDWR, 0o644)
        .unwrap();
    fs.write(&f, b"x").unwrap();

    fs.fallocate(&f, libc::FALLOC_FL_KEEP_SIZE, 0, 8192).unwrap();
    assert_eq!(fs.stat("/k").unwrap().st_size, 1);
}

#[test]
fn unsupported_fallocate_modes_are_rejected() {
    let (_dir, fs) = pool();

    let f = fs
        .open("/u", libc::O_CREAT | libc::O_RDWR, 0o644)
        .unwrap();
    fs.write(&f, &[0u8; 8192]).unwrap();

    for mode in [
        libc::FALLOC_FL_COLLAPSE_RANGE,
        libc::FALLOC_FL_ZERO_RANGE,
        libc::FALLOC_FL_INSERT_RANGE,
        libc::FALLOC_FL_PUNCH_HOLE, // without KEEP_SIZE
    ] {
        let err = fs.fallocate(&f, mode, 0, 4096).unwrap_err();
        assert_eq!(err.errno(), libc::EOPNOTSUPP, "mode {mode:#x}");
    }

    let err = fs.fallocate(&f, 0, -1, 4096).unwrap_err();
    assert_eq!(err.errno(), libc::EINVAL);
    let err = fs.fallocate(&f, 0, 0, 0).unwrap_err();
    assert_eq!(err.errno(), libc::EINVAL);
}

#[test]
fn seek_hole_and_data() {
    let (_dir, fs) = pool();

    let f = fs
        .open("/s", libc::O_CREAT | libc::O_RDWR, 0o644)
        .unwrap();

    // Data at [0, 4096), hole, data at [1M, 1M + 4096).
    fs.pwrite(&f, &[1u8; 4096], 0).unwrap();
    fs.pwrite(&f, &[2u8; 4096], 1 << 20).unwrap();

    let size = (1 << 20) + 4096;
    assert_eq!(fs.stat("/s").unwrap().st_size, size);

    // SEEK_DATA within data stays put; on a hole it finds the next data.
    assert_eq!(fs.lseek(&f, 0, SeekWhence::Data).unwrap(), 0);
    let next = fs.lseek(&f, 8192, SeekWhence::Data).unwrap();
    assert!(next >= 8192 && next <= 1 << 20, "next data at {next}");

    // SEEK_HOLE inside the first block finds the gap after it.
    let hole = fs.lseek(&f, 0, SeekWhence::Hole).unwrap();
    assert!(hole >= 4096 && hole < 1 << 20, "hole at {hole}");

    // Past end of file: ENXIO.
    let err = fs.lseek(&f, size, SeekWhence::Hole).unwrap_err();
    assert_eq!(err.errno(), libc::ENXIO);
    let err = fs.lseek(&f, size + 1, SeekWhence::Data).unwrap_err();
    assert_eq!(err.errno(), libc::ENXIO);
}

#[test]
fn fixed_block_size_env_is_honored_per_process() {
    // The configuration is parsed once per process, so all this test can
    // safely assert is the default: no fixed block size, appends get
    // overallocated but interval math still lines up.
    let (_dir, fs) = pool();

    let f = fs
        .open("/cfg", libc::O_CREAT | libc::O_RDWR, 0o644)
        .unwrap();
    for i in 0..64u8 {
        fs.write(&f, &[i; 1024]).unwrap();
    }
    assert_eq!(fs.stat("/cfg").unwrap().st_size, 64 * 1024);

    let mut buf = [0u8; 1024];
    fs.pread(&f, &mut buf, 63 * 1024).unwrap();
    assert_eq!(buf, [63u8; 1024]);
}
