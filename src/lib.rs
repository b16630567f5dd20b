//! A thin, allocation-free transport over Linux `io_uring`.
//!
//! This crate owns exactly the ring plumbing: establishing and tearing down
//! a ring instance, acquiring submission slots and publishing them in
//! batches, harvesting and acknowledging completions, the generic
//! `io_uring_register` control call, and the socket bootstrap that most ring
//! consumers need before their first `accept` submission. What the entries
//! *mean* is the caller's business; submission entries are filled in by the
//! caller and completions are handed back raw, correlated only through the
//! opaque `user_data` tag.
//!
//! Errors follow the kernel's negated-`errno` convention end to end: every
//! failure carries the raw negative code, so a single sign check
//! distinguishes success from failure and nothing is lost in translation.
//! See [`Error`] for the few cases layered on top.
//!
//! # Example
//!
//! ```no_run
//! use uring_api::{Ring, SetupFlags, Sqe};
//!
//! # fn main() -> uring_api::Result<()> {
//! let mut ring = Ring::open(8, SetupFlags::empty())?;
//!
//! if let Some(sqe) = ring.next_sqe()? {
//!     *sqe = Sqe::nop(42);
//! }
//! ring.submit_and_wait(1)?;
//!
//! let mut done = [uring_api::Cqe::default(); 8];
//! let count = ring.copy_cqes(&mut done)?;
//! assert_eq!(count, 1);
//! assert_eq!(done[0].user_data, 42);
//!
//! ring.close()?;
//! # Ok(())
//! # }
//! ```

#![cfg(target_os = "linux")]

pub mod sys;

mod error;
mod instance;
mod mmap;
mod ring;
mod socket;

pub use error::{Error, Result};
pub use instance::{CqeBatch, Ring, SqeSlots, SubmitFlags};
pub use socket::{
    create_listener, create_socket, prepare_for_listen, RawAddress, SocketOptions,
};
pub use sys::{Cqe, EnterFlags, FeatureFlags, SetupFlags, Sqe};

use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// A [`Ring`] behind a mutex, for callers that submit from several threads.
///
/// The lock covers whole operations, so the single-writer discipline each
/// ring side requires is upheld by construction. Clone freely; all clones
/// refer to the same ring.
#[derive(Clone, Debug)]
pub struct SharedRing {
    inner: Arc<Mutex<Ring>>,
}

impl SharedRing {
    /// Establish a ring as [`Ring::open`] does and wrap it for sharing.
    pub fn open(entries: u32, flags: SetupFlags) -> Result<Self> {
        Ok(Self::from(Ring::open(entries, flags)?))
    }

    /// Lock the ring for a sequence of operations. Keep the guard short;
    /// every other clone blocks while it is held.
    pub fn lock(&self) -> MutexGuard<'_, Ring> {
        self.inner.lock()
    }
}

impl From<Ring> for SharedRing {
    fn from(ring: Ring) -> Self {
        SharedRing {
            inner: Arc::new(Mutex::new(ring)),
        }
    }
}
