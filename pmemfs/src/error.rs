//! Error kinds with stable errno mappings, and the thread-local buffer
//! keeping the most recent error message.

use std::cell::RefCell;

use pmem_store::StoreError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no such file or directory")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("too many levels of symbolic links")]
    SymlinkLoop,
    #[error("cross-device link")]
    CrossDevice,
    #[error("file name too long")]
    NameTooLong,
    #[error("permission denied")]
    PermissionDenied,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("file exists")]
    Exists,
    #[error("directory not empty")]
    NotEmpty,
    #[error("device or resource busy")]
    Busy,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("file too large")]
    FileTooBig,
    #[error("no space left on pool")]
    NoSpace,
    #[error("bad file handle")]
    BadFileHandle,
    #[error("no such device or address")]
    NoSuchAddress,
    #[error("result not representable")]
    OutOfRange,
    #[error("value too large for defined data type")]
    Overflow,
    #[error("operation not supported")]
    Unsupported,
    #[error("pool error: {0}")]
    Store(#[from] StoreError),
}

impl Error {
    /// The errno a kernel would have set for this failure.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::NotADirectory => libc::ENOTDIR,
            Self::IsADirectory => libc::EISDIR,
            Self::SymlinkLoop => libc::ELOOP,
            Self::CrossDevice => libc::EXDEV,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::PermissionDenied => libc::EACCES,
            Self::NotPermitted => libc::EPERM,
            Self::Exists => libc::EEXIST,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::Busy => libc::EBUSY,
            Self::InvalidArgument => libc::EINVAL,
            Self::FileTooBig => libc::EFBIG,
            Self::NoSpace | Self::Store(StoreError::OutOfSpace) => libc::ENOSPC,
            Self::BadFileHandle => libc::EBADF,
            Self::NoSuchAddress => libc::ENXIO,
            Self::OutOfRange => libc::ERANGE,
            Self::Overflow => libc::EOVERFLOW,
            Self::Unsupported => libc::EOPNOTSUPP,
            Self::Store(StoreError::Io(_)) => libc::EIO,
            Self::Store(_) => libc::ENODEV,
        }
    }
}

thread_local! {
    static ERRORMSG: RefCell<String> = const { RefCell::new(String::new()) };
}

/// Remembers `err` as this thread's most recent failure.
pub(crate) fn record(err: &Error) {
    ERRORMSG.with(|buf| {
        let mut buf = buf.borrow_mut();
        buf.clear();
        use std::fmt::Write as _;
        let _ = write!(buf, "{err}");
    });
}

/// The message of the most recent error returned to this thread, or an
/// empty string when nothing failed yet.
#[must_use]
pub fn errormsg() -> String {
    ERRORMSG.with(|buf| buf.borrow().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_is_stable() {
        assert_eq!(Error::NotFound.errno(), libc::ENOENT);
        assert_eq!(Error::SymlinkLoop.errno(), libc::ELOOP);
        assert_eq!(Error::CrossDevice.errno(), libc::EXDEV);
        assert_eq!(Error::Unsupported.errno(), libc::EOPNOTSUPP);
    }

    #[test]
    fn errormsg_tracks_last_recorded_error() {
        record(&Error::Exists);
        assert_eq!(errormsg(), "file exists");
        record(&Error::NotFound);
        assert_eq!(errormsg(), "no such file or directory");
    }
}
