//! The POSIX operation layer.
//!
//! Every public call snapshots the pool credentials, resolves its paths,
//! takes vinode locks in canonical order, opens a transaction when it
//! mutates, and commits before the locks go. Failures are recorded in the
//! thread-local error buffer on the way out.

mod attr;
mod dirops;
mod io;
mod link;
mod open;
mod rename;

pub use attr::Stat;
pub use io::SeekWhence;
pub use rename::{RENAME_EXCHANGE, RENAME_NOREPLACE};

use crate::{
    error::{self, Result},
    file::File,
    inode::Vref,
    pool::FsCore,
};

/// Base directory of an `*at` call.
#[derive(Clone, Copy)]
pub enum At<'a> {
    /// The pool's current working directory.
    Cwd,
    /// An open directory handle.
    Dir(&'a File),
}

impl<'a> From<&'a File> for At<'a> {
    fn from(file: &'a File) -> Self {
        At::Dir(file)
    }
}

/// The directory a path is resolved against. Absolute paths start at the
/// root regardless of `at`.
pub(crate) fn at_dir(fs: &FsCore, at: At<'_>, path: &[u8]) -> Vref {
    if path.first() == Some(&b'/') {
        return fs.root();
    }
    match at {
        At::Cwd => fs.cwd(),
        At::Dir(file) => file.vinode.clone(),
    }
}

/// Records a failure in the thread-local error buffer.
pub(crate) fn finish<T>(result: Result<T>) -> Result<T> {
    if let Err(err) = &result {
        error::record(err);
        log::debug!("operation failed: {err}");
    }
    result
}
