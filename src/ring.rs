//! The two lock-free cursor engines over kernel-shared ring memory.
//!
//! All raw offset arithmetic for both rings lives in this module and nowhere
//! else; callers only ever see index-based accessors and borrowed entries.
//!
//! Ownership of the cursors is strictly split: the caller advances the
//! submission tail and the completion head, the kernel advances the submission
//! head and the completion tail. Cursors are free-running `u32`s that only
//! move forward (indices are `cursor & ring_mask`), and no entry is revisited
//! once its owning cursor has passed it.
//!
//! Both types are `Send` but each side is single-writer. Wrap the owning
//! `Ring` in a mutex ([`crate::SharedRing`]) if it has to be driven from more
//! than one thread.

use std::slice;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::sys::{CqRingOffsets, Cqe, SqRingOffsets, Sqe, IORING_SQ_NEED_WAKEUP};

/// The caller-facing half of the submission ring.
///
/// Mirrors liburing's cached-cursor scheme: `sqe_tail` counts slots handed to
/// the caller but not yet flushed, `sqe_head` counts slots already flushed
/// into the kernel-visible index array. The kernel-shared `tail` word is only
/// written in [`flush`](Self::flush), with release ordering, after the entry
/// payloads are in place.
pub(crate) struct SubmissionRing {
    head: *const AtomicU32,
    tail: *const AtomicU32,
    flags: *const AtomicU32,
    dropped: *const AtomicU32,
    array: *mut u32,
    sqes: *mut Sqe,
    ring_mask: u32,
    ring_entries: u32,

    // local cursors; see type docs.
    sqe_head: u32,
    sqe_tail: u32,
}

unsafe impl Send for SubmissionRing {}

impl SubmissionRing {
    /// Build the engine over an established mapping.
    ///
    /// # Safety
    ///
    /// `base` must point at a live submission ring header laid out per `off`,
    /// and `sqes` at an entry array of `ring_entries` slots. Both must remain
    /// mapped for the lifetime of the engine.
    pub(crate) unsafe fn new(base: *mut u8, off: &SqRingOffsets, sqes: *mut Sqe) -> Self {
        Self {
            head: base.add(off.head as usize) as *const AtomicU32,
            tail: base.add(off.tail as usize) as *const AtomicU32,
            flags: base.add(off.flags as usize) as *const AtomicU32,
            dropped: base.add(off.dropped as usize) as *const AtomicU32,
            array: base.add(off.array as usize) as *mut u32,
            sqes,
            ring_mask: *(base.add(off.ring_mask as usize) as *const u32),
            ring_entries: *(base.add(off.ring_entries as usize) as *const u32),
            sqe_head: 0,
            sqe_tail: 0,
        }
    }

    /// The submission depth the kernel actually granted.
    #[inline]
    pub(crate) fn capacity(&self) -> u32 {
        self.ring_entries
    }

    /// The kernel's consumption cursor. Acquire pairs with the kernel's
    /// release when it retires entries.
    #[inline]
    fn kernel_head(&self) -> u32 {
        unsafe { (*self.head).load(Ordering::Acquire) }
    }

    /// Free slots available for acquisition right now.
    #[inline]
    pub(crate) fn space_left(&self) -> u32 {
        self.ring_entries - self.sqe_tail.wrapping_sub(self.kernel_head())
    }

    /// Entries the kernel can see but has not yet consumed. This is the
    /// `to_submit` argument for `io_uring_enter`.
    #[inline]
    pub(crate) fn flushed_pending(&self) -> u32 {
        unsafe { (*self.tail).load(Ordering::Relaxed) }.wrapping_sub(self.kernel_head())
    }

    /// Acquire one writable slot, zeroed, or `None` if the ring is full.
    /// Advances the local tail; the slot becomes kernel-visible at the next
    /// [`flush`](Self::flush).
    pub(crate) fn acquire(&mut self) -> Option<&mut Sqe> {
        if self.space_left() == 0 {
            return None;
        }

        let index = (self.sqe_tail & self.ring_mask) as usize;
        self.sqe_tail = self.sqe_tail.wrapping_add(1);

        let slot = unsafe { &mut *self.sqes.add(index) };
        slot.clear();
        Some(slot)
    }

    /// Acquire up to `max` writable slots, all zeroed, in submission order.
    /// Returns fewer than `max` (possibly zero) when the ring is short on
    /// space. The result is split in two because the slot run may wrap the
    /// end of the entry array.
    pub(crate) fn acquire_many(&mut self, max: usize) -> (&mut [Sqe], &mut [Sqe]) {
        let count = (self.space_left() as usize).min(max);
        let start = (self.sqe_tail & self.ring_mask) as usize;
        let until_wrap = self.ring_entries as usize - start;

        let first_len = count.min(until_wrap);
        let second_len = count - first_len;

        self.sqe_tail = self.sqe_tail.wrapping_add(count as u32);

        unsafe {
            let first = slice::from_raw_parts_mut(self.sqes.add(start), first_len);
            let second = slice::from_raw_parts_mut(self.sqes, second_len);
            for slot in first.iter_mut().chain(second.iter_mut()) {
                slot.clear();
            }
            (first, second)
        }
    }

    /// Publish every acquired-but-unflushed slot to the kernel: fill the
    /// index array, then store the shared tail with release ordering so the
    /// kernel never observes the tail before the payloads.
    ///
    /// Returns the total number of kernel-visible, unconsumed entries.
    pub(crate) fn flush(&mut self) -> u32 {
        let shared_tail = unsafe { &*self.tail };
        let mut tail = shared_tail.load(Ordering::Relaxed);

        while self.sqe_head != self.sqe_tail {
            unsafe {
                *self.array.add((tail & self.ring_mask) as usize) =
                    self.sqe_head & self.ring_mask;
            }
            tail = tail.wrapping_add(1);
            self.sqe_head = self.sqe_head.wrapping_add(1);
        }

        shared_tail.store(tail, Ordering::Release);
        tail.wrapping_sub(self.kernel_head())
    }

    /// Whether an idle SQPOLL kernel thread is asking to be woken through
    /// `io_uring_enter`.
    #[inline]
    pub(crate) fn needs_wakeup(&self) -> bool {
        unsafe { (*self.flags).load(Ordering::Relaxed) & IORING_SQ_NEED_WAKEUP != 0 }
    }

    /// Entries the kernel rejected as malformed. Forward-only.
    #[inline]
    pub(crate) fn dropped(&self) -> u32 {
        unsafe { (*self.dropped).load(Ordering::Relaxed) }
    }
}

/// The caller-facing half of the completion ring.
///
/// The kernel owns the tail, this engine owns the head. Entries between the
/// two cursors have been produced but not acknowledged;
/// [`advance`](Self::advance) releases them for reuse in the order they were
/// peeked.
pub(crate) struct CompletionRing {
    head: *const AtomicU32,
    tail: *const AtomicU32,
    overflow: *const AtomicU32,
    cqes: *const Cqe,
    ring_mask: u32,
    ring_entries: u32,
}

unsafe impl Send for CompletionRing {}

impl CompletionRing {
    /// Build the engine over an established mapping.
    ///
    /// # Safety
    ///
    /// Same contract as [`SubmissionRing::new`], for the completion layout.
    pub(crate) unsafe fn new(base: *mut u8, off: &CqRingOffsets) -> Self {
        Self {
            head: base.add(off.head as usize) as *const AtomicU32,
            tail: base.add(off.tail as usize) as *const AtomicU32,
            overflow: base.add(off.overflow as usize) as *const AtomicU32,
            cqes: base.add(off.cqes as usize) as *const Cqe,
            ring_mask: *(base.add(off.ring_mask as usize) as *const u32),
            ring_entries: *(base.add(off.ring_entries as usize) as *const u32),
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> u32 {
        self.ring_entries
    }

    #[inline]
    fn local_head(&self) -> u32 {
        unsafe { (*self.head).load(Ordering::Relaxed) }
    }

    /// Completions currently available, without consuming anything. Acquire
    /// pairs with the kernel's release store of the tail, making the entry
    /// payloads visible.
    #[inline]
    pub(crate) fn ready(&self) -> u32 {
        unsafe { (*self.tail).load(Ordering::Acquire) }.wrapping_sub(self.local_head())
    }

    /// Borrow up to `max` pending completions in completion order, without
    /// acknowledging them. Split in two because the run may wrap the end of
    /// the entry array. The same entries are returned again until
    /// [`advance`](Self::advance) passes them.
    pub(crate) fn peek(&self, max: usize) -> (&[Cqe], &[Cqe]) {
        let count = (self.ready() as usize).min(max);
        let start = (self.local_head() & self.ring_mask) as usize;
        let until_wrap = self.ring_entries as usize - start;

        let first_len = count.min(until_wrap);
        let second_len = count - first_len;

        unsafe {
            (
                slice::from_raw_parts(self.cqes.add(start), first_len),
                slice::from_raw_parts(self.cqes, second_len),
            )
        }
    }

    /// Acknowledge `count` completions starting at the current head, freeing
    /// their slots for the kernel. Release ordering: the kernel must not
    /// reuse a slot while the caller may still be reading it.
    ///
    /// # Panics
    ///
    /// Panics when `count` exceeds [`ready`](Self::ready); acknowledging
    /// entries that were never produced would corrupt the ring.
    pub(crate) fn advance(&mut self, count: u32) {
        assert!(
            count <= self.ready(),
            "advancing the completion head past the kernel tail"
        );
        unsafe {
            let head = &*self.head;
            head.store(self.local_head().wrapping_add(count), Ordering::Release);
        }
    }

    /// Copy up to `dest.len()` completions into caller-owned memory and
    /// acknowledge exactly the copied count in one step. Equivalent to
    /// [`peek`](Self::peek) followed by [`advance`](Self::advance), minus the
    /// window in which an entry has been read but not yet acknowledged.
    pub(crate) fn copy_into(&mut self, dest: &mut [Cqe]) -> usize {
        let copied = {
            let (first, second) = self.peek(dest.len());
            dest[..first.len()].copy_from_slice(first);
            dest[first.len()..first.len() + second.len()].copy_from_slice(second);
            first.len() + second.len()
        };
        self.advance(copied as u32);
        copied
    }

    /// Completions the kernel could not post because the ring was full.
    #[inline]
    pub(crate) fn overflow(&self) -> u32 {
        unsafe { (*self.overflow).load(Ordering::Relaxed) }
    }
}
