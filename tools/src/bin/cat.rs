//! Prints files from a pmemfs pool to stdout.
//!
//! Usage: `pmemfs-cat pool-path file...`

use std::{
    env,
    io::{self, Write as _},
    path::Path,
    process,
};

fn dump(fs: &pmemfs::Filesystem, path: &str) -> pmemfs::Result<()> {
    let file = fs.open(path, libc::O_RDONLY, 0)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = fs.read(&file, &mut buf)?;
        if n == 0 {
            break;
        }
        if out.write_all(&buf[..n]).is_err() {
            break;
        }
    }
    Ok(())
}

fn main() {
    env_logger::init();

    let args = env::args().collect::<Vec<String>>();
    if args.len() < 3 {
        eprintln!("Usage: {} pool-path file...", args[0]);
        process::exit(1);
    }

    let fs = match pmemfs::Filesystem::open_pool(Path::new(&args[1])) {
        Ok(fs) => fs,
        Err(err) => {
            eprintln!("{}: {}: {err}", args[0], args[1]);
            process::exit(1);
        }
    };

    let mut status = 0;
    for path in &args[2..] {
        if let Err(err) = dump(&fs, path) {
            eprintln!("{}: {path}: {err}", args[0]);
            status = 1;
        }
    }
    process::exit(status);
}
