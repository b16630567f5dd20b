//! Ring lifecycle plus every per-ring operation: slot acquisition, batch
//! submission, completion harvesting and the generic register control call.
//!
//! A [`Ring`] tracks an explicit `{Open, Closed}` lifecycle state that is
//! checked before every operation; a closed ring fails fast with
//! [`Error::AlreadyClosed`] instead of handing a dead fd to the kernel.

use std::mem;

use libc::{c_int, c_void};

use crate::error::{check_syscall, Error, Result};
use crate::mmap::Mmap;
use crate::ring::{CompletionRing, SubmissionRing};
use crate::sys::{
    self, Cqe, EnterFlags, FeatureFlags, IoUringParams, SetupFlags, Sqe, IORING_OFF_CQ_RING,
    IORING_OFF_SQES, IORING_OFF_SQ_RING,
};

bitflags::bitflags! {
    /// Flags controlling what [`Ring::direct_submit`] does after copying a
    /// caller-prepared batch into ring slots.
    pub struct SubmitFlags: u32 {
        /// Perform the submission syscall immediately after the copy.
        const IMMEDIATE = 1 << 0;
        /// Together with [`IMMEDIATE`](Self::IMMEDIATE): block until every
        /// copied entry has completed.
        const WAIT = 1 << 1;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum LifecycleState {
    Open,
    Closed,
}

/// A live io_uring instance: the kernel object, its shared memory mappings
/// and both cursor engines.
///
/// One ring is meant to be driven by a single-threaded reactor loop; nothing
/// in here spawns threads or synchronizes internally. The submission side and
/// the completion side may each be driven by one thread, but each side alone
/// is single-writer; use [`crate::SharedRing`] for anything beyond that.
///
/// The mapped ring memory is exclusively owned by this value. It is unmapped
/// by [`close`](Self::close) (or drop), which must happen only after every
/// in-flight operation has completed or been abandoned.
pub struct Ring {
    fd: c_int,
    state: LifecycleState,
    sq: SubmissionRing,
    cq: CompletionRing,
    setup_flags: SetupFlags,
    features: FeatureFlags,

    // keep-alive for the raw pointers inside `sq`/`cq`; unmapped on close.
    sq_map: Option<Mmap>,
    cq_map: Option<Mmap>,
    sqe_map: Option<Mmap>,
}

impl Ring {
    /// Establish a ring with room for at least `entries` submission slots
    /// (the kernel rounds up to a power of two) and map its shared memory.
    ///
    /// `flags` selects kernel polling behaviors at creation;
    /// [`SetupFlags::SQPOLL`] in particular spawns a kernel-side polling
    /// thread and pins the ring pages.
    ///
    /// Fails with [`Error::Setup`] carrying the raw negated code when the
    /// kernel cannot allocate the ring; nothing is leaked on the error path.
    pub fn open(entries: u32, flags: SetupFlags) -> Result<Ring> {
        let mut params = IoUringParams {
            flags: flags.bits(),
            ..IoUringParams::default()
        };

        let fd = sys::io_uring_setup(entries, &mut params);
        if fd < 0 {
            return Err(Error::Setup(fd));
        }

        match Self::map_rings(fd, &params, flags) {
            Ok(ring) => {
                log::debug!(
                    "opened io_uring fd {} with {} sq / {} cq entries (features {:#x})",
                    fd,
                    params.sq_entries,
                    params.cq_entries,
                    params.features,
                );
                Ok(ring)
            }
            Err(error) => {
                // undo the setup syscall; the mmaps that did succeed unmap
                // themselves on drop.
                unsafe {
                    libc::close(fd);
                }
                Err(error)
            }
        }
    }

    fn map_rings(fd: c_int, params: &IoUringParams, flags: SetupFlags) -> Result<Ring> {
        let features = FeatureFlags::from_bits_truncate(params.features);

        let sq_ring_len =
            params.sq_off.array as usize + params.sq_entries as usize * mem::size_of::<u32>();
        let cq_ring_len =
            params.cq_off.cqes as usize + params.cq_entries as usize * mem::size_of::<Cqe>();
        let sqe_len = params.sq_entries as usize * mem::size_of::<Sqe>();

        // With SINGLE_MMAP both ring headers live in one mapping at the
        // submission offset; otherwise each header gets its own mapping.
        let single = features.contains(FeatureFlags::SINGLE_MMAP);

        let sq_map = Mmap::map_ring(
            fd,
            if single { sq_ring_len.max(cq_ring_len) } else { sq_ring_len },
            IORING_OFF_SQ_RING,
        )?;
        let cq_map = if single {
            None
        } else {
            Some(Mmap::map_ring(fd, cq_ring_len, IORING_OFF_CQ_RING)?)
        };
        let sqe_map = Mmap::map_ring(fd, sqe_len, IORING_OFF_SQES)?;

        let cq_base = cq_map
            .as_ref()
            .map_or_else(|| sq_map.as_mut_ptr(), Mmap::as_mut_ptr);

        let (sq, cq) = unsafe {
            (
                SubmissionRing::new(
                    sq_map.as_mut_ptr(),
                    &params.sq_off,
                    sqe_map.as_mut_ptr() as *mut Sqe,
                ),
                CompletionRing::new(cq_base, &params.cq_off),
            )
        };

        Ok(Ring {
            fd,
            state: LifecycleState::Open,
            sq,
            cq,
            setup_flags: flags,
            features,
            sq_map: Some(sq_map),
            cq_map,
            sqe_map: Some(sqe_map),
        })
    }

    #[inline]
    fn ensure_open(&self) -> Result<()> {
        match self.state {
            LifecycleState::Open => Ok(()),
            LifecycleState::Closed => Err(Error::AlreadyClosed),
        }
    }

    /// Release the shared memory mappings and the kernel object.
    ///
    /// Not idempotent by kernel contract; this wrapper tracks the lifecycle
    /// state and a second close (like any other operation on a closed ring)
    /// fails fast with [`Error::AlreadyClosed`] without re-entering the
    /// kernel. Must only be called once all in-flight operations have
    /// completed or been abandoned; afterwards their completions are lost.
    pub fn close(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.state = LifecycleState::Closed;

        // unmap before closing the fd; the cursor engines' pointers dangle
        // from here on, which is why every operation checks the state first.
        self.sq_map = None;
        self.cq_map = None;
        self.sqe_map = None;

        unsafe {
            libc::close(self.fd);
        }
        log::debug!("closed io_uring fd {}", self.fd);
        Ok(())
    }

    /// The raw io_uring file descriptor, for callers that need to register it
    /// elsewhere (e.g. polling it for completion readiness).
    pub fn ringfd(&self) -> c_int {
        self.fd
    }

    /// The submission depth the kernel granted (requested `entries` rounded
    /// up to a power of two).
    pub fn capacity(&self) -> u32 {
        self.sq.capacity()
    }

    /// The completion ring depth (typically twice the submission depth).
    pub fn completion_capacity(&self) -> u32 {
        self.cq.capacity()
    }

    /// Feature bits the kernel reported at setup.
    pub fn features(&self) -> FeatureFlags {
        self.features
    }

    // ------------------------------------------------------------------
    // submission side
    // ------------------------------------------------------------------

    /// Free submission slots available without blocking.
    pub fn sq_space_left(&self) -> Result<u32> {
        self.ensure_open()?;
        Ok(self.sq.space_left())
    }

    /// Entries already flushed to the kernel but not yet consumed by it.
    /// Nonzero here after a submit usually means an SQPOLL ring whose kernel
    /// thread has not picked the batch up yet.
    pub fn sq_pending(&self) -> Result<u32> {
        self.ensure_open()?;
        Ok(self.sq.flushed_pending())
    }

    /// Submission entries the kernel rejected as malformed.
    pub fn sq_dropped(&self) -> Result<u32> {
        self.ensure_open()?;
        Ok(self.sq.dropped())
    }

    /// Acquire the next writable submission slot, zeroed, without ever
    /// blocking. `Ok(None)` means the submission queue is saturated right
    /// now; submit and harvest completions, then retry.
    pub fn next_sqe(&mut self) -> Result<Option<&mut Sqe>> {
        self.ensure_open()?;
        Ok(self.sq.acquire())
    }

    /// Acquire the next writable submission slot, falling back to **blocking
    /// the calling thread** when the queue is full: the pending entries are
    /// submitted and the call waits for one completion before retrying the
    /// acquisition once.
    ///
    /// This is the classic liburing convenience and it is deliberately a
    /// separate operation: a caller who only wants to enqueue must use
    /// [`next_sqe`](Self::next_sqe) instead. Even here, `Ok(None)` is still
    /// possible when the retry finds the queue full again.
    pub fn next_sqe_or_wait(&mut self) -> Result<Option<&mut Sqe>> {
        self.ensure_open()?;
        if self.sq.space_left() == 0 {
            log::debug!("submission ring full; submitting and waiting for one completion");
            self.submit_and_wait(1)?;
        }
        Ok(self.sq.acquire())
    }

    /// Acquire as many writable slots as are currently free, capped at
    /// `max`, in submission order and zeroed. Never blocks; the batch is
    /// empty when the queue is saturated.
    pub fn acquire_sqes(&mut self, max: usize) -> Result<SqeSlots<'_>> {
        self.ensure_open()?;
        let (first, second) = self.sq.acquire_many(max);
        Ok(SqeSlots { first, second })
    }

    /// Batch variant of [`next_sqe_or_wait`](Self::next_sqe_or_wait): on a
    /// saturated queue, submit, **block** for one completion, then acquire
    /// whatever is free. The returned batch may still be empty.
    pub fn acquire_sqes_or_wait(&mut self, max: usize) -> Result<SqeSlots<'_>> {
        self.ensure_open()?;
        if self.sq.space_left() == 0 {
            log::debug!("submission ring full; submitting and waiting for one completion");
            self.submit_and_wait(1)?;
        }
        let (first, second) = self.sq.acquire_many(max);
        Ok(SqeSlots { first, second })
    }

    /// Copy a caller-prepared batch of entries into free ring slots, one
    /// slot per entry, in order.
    ///
    /// Partial success is the contract: if the ring fills mid-batch the
    /// overflow entries are left untouched in `entries` and the short count
    /// is returned, with no rollback of the entries already copied.
    ///
    /// With [`SubmitFlags::IMMEDIATE`] the copied entries are submitted
    /// before returning; adding [`SubmitFlags::WAIT`] additionally blocks
    /// until all of the copied entries have completed.
    pub fn direct_submit(&mut self, entries: &[Sqe], flags: SubmitFlags) -> Result<usize> {
        self.ensure_open()?;

        let mut copied = 0;
        for entry in entries {
            match self.sq.acquire() {
                Some(slot) => {
                    *slot = *entry;
                    copied += 1;
                }
                None => break,
            }
        }

        if copied < entries.len() {
            log::debug!(
                "direct submit truncated: {} of {} entries copied",
                copied,
                entries.len(),
            );
        }

        if flags.contains(SubmitFlags::IMMEDIATE) {
            let min_complete = if flags.contains(SubmitFlags::WAIT) {
                copied as u32
            } else {
                0
            };
            self.submit_and_wait(min_complete)?;
        }

        Ok(copied)
    }

    /// Submit every acquired entry to the kernel without waiting for
    /// completions. Returns the number of entries the kernel consumed.
    pub fn submit(&mut self) -> Result<usize> {
        self.submit_and_wait(0)
    }

    /// Submit every acquired entry and block until at least `min_complete`
    /// completions are ready (`0` submits without waiting).
    ///
    /// There is no timeout parameter: the call blocks until the condition
    /// holds or a signal interrupts the syscall, and the only other way out
    /// is closing the ring from the code path that owns it. Returns the
    /// number of submission entries the kernel consumed.
    pub fn submit_and_wait(&mut self, min_complete: u32) -> Result<usize> {
        self.ensure_open()?;

        let to_submit = self.sq.flush();
        let mut enter_flags = EnterFlags::empty();

        if min_complete > 0 {
            enter_flags |= EnterFlags::GETEVENTS;
        }

        if self.setup_flags.contains(SetupFlags::SQPOLL) {
            // the kernel thread picks flushed entries up by itself; enter is
            // only needed to wake it or to wait for completions.
            if self.sq.needs_wakeup() {
                enter_flags |= EnterFlags::SQ_WAKEUP;
            } else if min_complete == 0 {
                return Ok(to_submit as usize);
            }
        }

        let ret =
            check_syscall(unsafe { sys::io_uring_enter(self.fd, to_submit, min_complete, enter_flags) })?;
        Ok(ret as usize)
    }

    /// Raw pass-through to `io_uring_enter` for callers that manage flushing
    /// themselves. Prefer [`submit_and_wait`](Self::submit_and_wait).
    pub fn enter(&mut self, to_submit: u32, min_complete: u32, flags: EnterFlags) -> Result<usize> {
        self.ensure_open()?;
        let ret =
            check_syscall(unsafe { sys::io_uring_enter(self.fd, to_submit, min_complete, flags) })?;
        Ok(ret as usize)
    }

    // ------------------------------------------------------------------
    // completion side
    // ------------------------------------------------------------------

    /// Completions currently available, without blocking or consuming.
    pub fn ready(&self) -> Result<u32> {
        self.ensure_open()?;
        Ok(self.cq.ready())
    }

    /// Completions the kernel could not post because the completion ring was
    /// full. A nonzero value here means slow acknowledgement.
    pub fn cq_overflow(&self) -> Result<u32> {
        self.ensure_open()?;
        Ok(self.cq.overflow())
    }

    /// Borrow up to `max` pending completions in completion order without
    /// acknowledging them. The entries stay in the ring and are returned
    /// again until [`advance`](Self::advance) passes them.
    ///
    /// Completion order is the order the kernel finished the operations,
    /// which is not necessarily submission order; correlate through the
    /// `user_data` tag.
    pub fn peek_cqes(&self, max: usize) -> Result<CqeBatch<'_>> {
        self.ensure_open()?;
        let (first, second) = self.cq.peek(max);
        Ok(CqeBatch { first, second })
    }

    /// Acknowledge `count` completions, in the order they were peeked,
    /// freeing their ring slots. Skipping this after processing peeked
    /// entries eventually wedges the ring full of already-seen completions.
    pub fn advance(&mut self, count: u32) -> Result<()> {
        self.ensure_open()?;
        self.cq.advance(count);
        Ok(())
    }

    /// Copy up to `dest.len()` completions into caller-owned memory and
    /// acknowledge exactly the copied count, as one step. Use this when
    /// consuming completions by value; it closes the race window between
    /// reading an entry and acknowledging it.
    pub fn copy_cqes(&mut self, dest: &mut [Cqe]) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.cq.copy_into(dest))
    }

    // ------------------------------------------------------------------
    // register control plane
    // ------------------------------------------------------------------

    /// Generic pass-through to `io_uring_register(2)`: ring-wide
    /// configuration (fixed buffers, fixed files, eventfds, probes, ...).
    ///
    /// `arg` is an opaque byte region whose layout is `opcode`-specific and
    /// is forwarded unmodified — an empty slice becomes a null argument.
    /// `nr_args` is likewise opcode-specific and not derived from the blob
    /// length. The result is translated through the negated-errno
    /// convention.
    pub fn register(&mut self, opcode: u32, arg: &[u8], nr_args: u32) -> Result<u32> {
        self.ensure_open()?;

        let ptr = if arg.is_empty() {
            std::ptr::null()
        } else {
            arg.as_ptr() as *const c_void
        };

        let ret = unsafe { sys::io_uring_register(self.fd, opcode, ptr, nr_args) };
        if ret < 0 {
            log::warn!("io_uring_register opcode {} failed with {}", opcode, ret);
            return Err(Error::Syscall(ret));
        }
        Ok(ret as u32)
    }

    /// Register fixed buffers with the ring, enabling the `*_FIXED` opcodes
    /// against them. The memory must stay valid until unregistered.
    pub fn register_buffers(&mut self, iovecs: &[libc::iovec]) -> Result<()> {
        let blob = unsafe {
            std::slice::from_raw_parts(
                iovecs.as_ptr() as *const u8,
                iovecs.len() * mem::size_of::<libc::iovec>(),
            )
        };
        self.register(sys::IORING_REGISTER_BUFFERS, blob, iovecs.len() as u32)?;
        Ok(())
    }

    /// Release all fixed buffers previously registered.
    pub fn unregister_buffers(&mut self) -> Result<()> {
        self.register(sys::IORING_UNREGISTER_BUFFERS, &[], 0)?;
        Ok(())
    }

    /// Register an eventfd that the kernel signals whenever a completion is
    /// posted.
    pub fn register_eventfd(&mut self, eventfd: c_int) -> Result<()> {
        self.register(
            sys::IORING_REGISTER_EVENTFD,
            &eventfd.to_ne_bytes(),
            1,
        )?;
        Ok(())
    }

    /// Remove a previously registered eventfd.
    pub fn unregister_eventfd(&mut self) -> Result<()> {
        self.register(sys::IORING_UNREGISTER_EVENTFD, &[], 0)?;
        Ok(())
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        if self.state == LifecycleState::Open {
            let _ = self.close();
        }
    }
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("fd", &self.fd)
            .field("state", &self.state)
            .field("capacity", &self.sq.capacity())
            .finish()
    }
}

/// An ordered batch of writable submission slots, possibly split in two
/// where the acquisition wrapped the end of the ring.
///
/// Every slot in the batch has already been acquired: fill each one and then
/// submit. Leaving a slot zeroed submits a no-op.
pub struct SqeSlots<'ring> {
    first: &'ring mut [Sqe],
    second: &'ring mut [Sqe],
}

impl<'ring> SqeSlots<'ring> {
    /// Number of slots acquired.
    pub fn len(&self) -> usize {
        self.first.len() + self.second.len()
    }

    /// Whether the acquisition came back empty (queue saturated).
    pub fn is_empty(&self) -> bool {
        self.first.is_empty() && self.second.is_empty()
    }

    /// The slots, in submission order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Sqe> {
        self.first.iter_mut().chain(self.second.iter_mut())
    }
}

/// An ordered batch of borrowed, not-yet-acknowledged completions, possibly
/// split in two where the run wrapped the end of the ring.
///
/// Acknowledge with [`Ring::advance`] after processing.
pub struct CqeBatch<'ring> {
    first: &'ring [Cqe],
    second: &'ring [Cqe],
}

impl<'ring> CqeBatch<'ring> {
    /// Number of completions peeked.
    pub fn len(&self) -> usize {
        self.first.len() + self.second.len()
    }

    /// Whether no completions were pending.
    pub fn is_empty(&self) -> bool {
        self.first.is_empty() && self.second.is_empty()
    }

    /// The completions, in the order the kernel finished them.
    pub fn iter(&self) -> impl Iterator<Item = &Cqe> {
        self.first.iter().chain(self.second.iter())
    }
}
