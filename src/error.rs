//! The error type shared by every fallible operation in the crate.
//!
//! Flash drivers themselves report failures as `anyhow::Error` (see
//! [`crate::flash::FlashDevice`]); anything crossing the filesystem boundary
//! is classified into one of the variants here so callers can tell a
//! recoverable out-of-space condition from structural corruption.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The wear allocator found no eligible block and a synchronous GC pass
    /// could not free one either.
    #[error("no space left on device")]
    OutOfSpace,

    /// The filesystem has been forced read-only (by an earlier consistency
    /// failure or by a read-only mount) and a write was attempted.
    #[error("filesystem is read-only")]
    ReadOnly,

    /// Space accounting would go negative or a block left the state machine.
    /// There is no recovery from this; the filesystem flips itself read-only
    /// when it is raised.
    #[error("filesystem inconsistent: {0}")]
    Inconsistent(String),

    /// An error reported by the underlying flash driver.
    #[error(transparent)]
    Flash(#[from] anyhow::Error),
}

impl Error {
    /// True for errors that poison the filesystem state rather than just the
    /// current operation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Inconsistent(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Shorthand for raising [`Error::Inconsistent`] with a formatted message.
macro_rules! inconsistent {
    ($($arg:tt)*) => {
        return Err($crate::error::Error::Inconsistent(format!($($arg)*)))
    };
}

pub(crate) use inconsistent;
