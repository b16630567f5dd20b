//! Error types for ring and socket operations.
//!
//! Every kernel failure is carried as a negated `errno`, unmodified, so a
//! caller can always get back to the platform code with a single call to
//! [`Error::raw`]. There is no retry logic and no message formatting beyond
//! `Display`; interpretation is the caller's job.

use std::{fmt, io, result};

use libc::c_int;

/// Crate-wide result alias.
pub type Result<T> = result::Result<T, Error>;

/// An error from a ring or socket operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// The kernel refused to create the ring (`io_uring_setup` or one of the
    /// ring mmaps failed). Recoverable by retrying with different parameters.
    /// Carries the raw negated errno.
    Setup(i32),

    /// A syscall on an already-established ring or descriptor failed
    /// (`io_uring_enter`, `io_uring_register`, `socket`, `setsockopt`,
    /// `bind`, `listen`). Carries the raw negated errno.
    Syscall(i32),

    /// The operation was attempted on a ring that has already been closed.
    /// Detected before any kernel call is made; using a closed ring is never
    /// forwarded to the kernel.
    AlreadyClosed,
}

impl Error {
    /// The negated platform error code for this error. Always negative.
    ///
    /// [`Error::AlreadyClosed`] has no kernel-reported code and maps to
    /// `-EBADF`, which is what the kernel would have said had the fd actually
    /// been handed back.
    pub fn raw(self) -> i32 {
        match self {
            Self::Setup(code) | Self::Syscall(code) => code,
            Self::AlreadyClosed => -libc::EBADF,
        }
    }

    /// Wrap the calling thread's current `errno` as a syscall failure.
    pub(crate) fn last_syscall() -> Self {
        Self::Syscall(-crate::sys::last_errno())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup(code) => {
                write!(f, "ring setup failed: {}", io::Error::from_raw_os_error(-code))
            }
            Self::Syscall(code) => {
                write!(f, "syscall failed: {}", io::Error::from_raw_os_error(-code))
            }
            Self::AlreadyClosed => write!(f, "ring has already been closed"),
        }
    }
}

impl std::error::Error for Error {}

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        io::Error::from_raw_os_error(-error.raw())
    }
}

/// Translate a C-style return value into the crate convention: negative is a
/// negated errno, everything else is the payload.
pub(crate) fn check_syscall(ret: c_int) -> Result<c_int> {
    if ret < 0 {
        Err(Error::Syscall(ret))
    } else {
        Ok(ret)
    }
}
