//! Error types for the blocksnap engine
//!
//! One unified [`Error`] enum covers every failure the storage core must
//! distinguish. The control surface reports errors as negative errno values,
//! so each variant maps onto exactly one errno via [`Error::errno`]; the
//! per-device sticky fail code is stored as that errno and turned back into
//! a displayable error with [`Error::from_errno`].

use std::io;
use thiserror::Error;

/// Result type alias for blocksnap operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errno values used by the control surface.
///
/// Stored positive; the control boundary negates them.
pub mod errno {
    /// No such file or directory / no free minor
    pub const ENOENT: i32 = 2;
    /// I/O error
    pub const EIO: i32 = 5;
    /// Out of memory
    pub const ENOMEM: i32 = 12;
    /// Permission denied (write on read-only base)
    pub const EACCES: i32 = 13;
    /// Device or resource busy
    pub const EBUSY: i32 = 16;
    /// No such device
    pub const ENODEV: i32 = 19;
    /// Invalid argument
    pub const EINVAL: i32 = 22;
    /// File too large
    pub const EFBIG: i32 = 27;
    /// Operation not supported
    pub const EOPNOTSUPP: i32 = 95;
}

/// Error types for the blocksnap engine
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying file or block I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Minor in use, refcount nonzero, or a transition requested in the
    /// wrong mount direction
    #[error("device busy: {0}")]
    Busy(String),

    /// Bad magic, wrong flag combination, unaligned or out-of-range
    /// parameters
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// Named block device not found or no matching tracer
    #[error("no such device: {0}")]
    NoDevice(String),

    /// Cache, section or clone allocation failure, or the memory-pressure
    /// probe tripped
    #[error("out of memory: {0}")]
    NoMemory(String),

    /// Data region would exceed the file size and auto-expand is not
    /// permitted
    #[error("cow file max size exceeded ({used}/{limit})")]
    FileTooBig {
        /// Bytes the write head has reached
        used: u64,
        /// Configured maximum file size in bytes
        limit: u64,
    },

    /// Named path not resolvable or no free minor
    #[error("not found: {0}")]
    NotFound(String),

    /// Write attempted on a read-only base device
    #[error("read-only device: {0}")]
    ReadOnly(String),

    /// Operation the device does not support (e.g. writes to the snapshot
    /// image)
    #[error("operation not supported: {0}")]
    NotSupported(String),
}

impl Error {
    /// Map this error to the negative errno the control surface returns.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Io(_) => -errno::EIO,
            Error::Busy(_) => -errno::EBUSY,
            Error::Invalid(_) => -errno::EINVAL,
            Error::NoDevice(_) => -errno::ENODEV,
            Error::NoMemory(_) => -errno::ENOMEM,
            Error::FileTooBig { .. } => -errno::EFBIG,
            Error::NotFound(_) => -errno::ENOENT,
            Error::ReadOnly(_) => -errno::EACCES,
            Error::NotSupported(_) => -errno::EOPNOTSUPP,
        }
    }

    /// Rebuild a displayable error from a stored (negative or positive)
    /// errno, as read back out of a tracer's sticky fail code.
    pub fn from_errno(code: i32) -> Self {
        match code.abs() {
            errno::EBUSY => Error::Busy("device in fail state".to_string()),
            errno::EINVAL => Error::Invalid("recorded fail state".to_string()),
            errno::ENODEV => Error::NoDevice("recorded fail state".to_string()),
            errno::ENOMEM => Error::NoMemory("recorded fail state".to_string()),
            errno::EFBIG => Error::FileTooBig { used: 0, limit: 0 },
            errno::ENOENT => Error::NotFound("recorded fail state".to_string()),
            errno::EACCES => Error::ReadOnly("recorded fail state".to_string()),
            errno::EOPNOTSUPP => Error::NotSupported("recorded fail state".to_string()),
            _ => Error::Io(io::Error::new(io::ErrorKind::Other, "device I/O failure")),
        }
    }

    /// Check if this is a busy error.
    pub fn is_busy(&self) -> bool {
        matches!(self, Error::Busy(_))
    }

    /// Check if this is an invalid-argument error.
    pub fn is_invalid(&self) -> bool {
        matches!(self, Error::Invalid(_))
    }

    /// Check if this error came from underlying I/O.
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::Busy("x".into()).errno(), -errno::EBUSY);
        assert_eq!(Error::Invalid("x".into()).errno(), -errno::EINVAL);
        assert_eq!(Error::NoDevice("x".into()).errno(), -errno::ENODEV);
        assert_eq!(Error::NoMemory("x".into()).errno(), -errno::ENOMEM);
        assert_eq!(
            Error::FileTooBig { used: 1, limit: 0 }.errno(),
            -errno::EFBIG
        );
        assert_eq!(Error::NotFound("x".into()).errno(), -errno::ENOENT);
        assert_eq!(Error::ReadOnly("x".into()).errno(), -errno::EACCES);
        assert_eq!(Error::NotSupported("x".into()).errno(), -errno::EOPNOTSUPP);
        let io_err = Error::Io(io::Error::new(io::ErrorKind::Other, "disk"));
        assert_eq!(io_err.errno(), -errno::EIO);
    }

    #[test]
    fn test_from_errno_round_trip() {
        for code in [
            -errno::EBUSY,
            -errno::EINVAL,
            -errno::ENODEV,
            -errno::ENOMEM,
            -errno::EFBIG,
            -errno::ENOENT,
            -errno::EIO,
        ] {
            assert_eq!(Error::from_errno(code).errno(), code);
        }
    }

    #[test]
    fn test_display_carries_context() {
        let err = Error::FileTooBig {
            used: 8192,
            limit: 4096,
        };
        let msg = err.to_string();
        assert!(msg.contains("8192"));
        assert!(msg.contains("4096"));
    }

    #[test]
    fn test_io_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing");
        let err: Error = io_err.into();
        assert!(err.is_io());
    }

    #[test]
    fn test_classification() {
        assert!(Error::Busy("b".into()).is_busy());
        assert!(!Error::Busy("b".into()).is_invalid());
        assert!(Error::Invalid("i".into()).is_invalid());
    }
}
