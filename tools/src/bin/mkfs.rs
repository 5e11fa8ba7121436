//! Creates an empty pmemfs pool.
//!
//! Usage: `pmemfs-mkfs pool-path poolsize[k|m|g|t|p]`

use std::{env, path::Path, process};

fn parse_size(arg: &str) -> Option<u64> {
    let (digits, suffix) = match arg.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((i, _)) => arg.split_at(i),
        None => (arg, ""),
    };
    let base: u64 = digits.parse().ok()?;

    let shift = match suffix {
        "" => 0,
        "k" | "K" => 10,
        "m" | "M" => 20,
        "g" | "G" => 30,
        "t" | "T" => 40,
        "p" | "P" => 50,
        _ => return None,
    };
    base.checked_shl(shift)
}

fn main() {
    env_logger::init();

    let args = env::args().collect::<Vec<String>>();
    if args.len() != 3 {
        eprintln!("Usage: {} pool-path poolsize[k|m|g|t|p]", args[0]);
        process::exit(1);
    }

    let Some(size) = parse_size(&args[2]) else {
        eprintln!("{}: invalid size {:?}", args[0], args[2]);
        process::exit(1);
    };

    if let Err(err) = pmemfs::Filesystem::create_pool(Path::new(&args[1]), size) {
        eprintln!("{}: {}: {err}", args[0], args[1]);
        process::exit(1);
    }
}
