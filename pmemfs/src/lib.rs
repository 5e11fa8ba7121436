//! A POSIX file system living entirely in a persistent-memory object pool.
//!
//! Applications obtain a [`Filesystem`] handle for a pool file and perform
//! file-system calls on paths interpreted inside the pool. All metadata
//! mutations run inside store transactions, so after a crash the pool
//! reopens in a state reflecting a prefix of committed operations.
//!
//! The layers, bottom up:
//!
//!   + `layout`: the on-media records, all version tagged.
//!   + `inode` / `inode_map`: volatile, reference-counted inode handles
//!     and the concurrent map from persistent inodes to them.
//!   + `block_array` / `data`: descriptor housekeeping and the data
//!     engine with sparse files, overallocation on append, and hole
//!     punching.
//!   + `dir`: dirent pages, `.`/`..` maintenance, directory readout.
//!   + `path`: the symlink-chasing resolver and the race-verified
//!     multi-vinode locking helpers.
//!   + `ops`: the POSIX operation surface on [`Filesystem`].
//!
//! Reads take vinode read locks only and never open transactions; every
//! mutation commits before its locks are released, so no caller observes
//! half-committed state.

mod block_array;
mod cred;
mod data;
mod dir;
mod error;
mod file;
mod inode;
mod inode_array;
mod inode_map;
pub mod layout;
mod ops;
mod path;
mod pool;

pub use cred::{Access, Credentials, CAP_CHOWN, CAP_FOWNER};
pub use error::{errormsg, Error, Result};
pub use file::File;
pub use layout::Time;
pub use ops::{At, SeekWhence, Stat};
pub use pool::{Filesystem, Stats};

/// `renameat2` flags.
pub use ops::{RENAME_EXCHANGE, RENAME_NOREPLACE};
