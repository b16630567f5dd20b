//! The raw `io_uring` kernel ABI: setup parameters, ring offset tables, the
//! submission and completion entry layouts, and thin wrappers around the three
//! `io_uring` syscalls.
//!
//! Everything in here mirrors `include/uapi/linux/io_uring.h` bit for bit. The
//! wrappers follow the negated-`errno` convention used throughout this crate:
//! a negative return value is `-errno`, anything else is the syscall's own
//! non-negative payload.

use std::mem;

use libc::{c_int, c_long, c_uint, c_void};

/// mmap offset selecting the submission ring header (and, with
/// `FeatureFlags::SINGLE_MMAP`, the completion ring as well).
pub const IORING_OFF_SQ_RING: i64 = 0;
/// mmap offset selecting the completion ring header.
pub const IORING_OFF_CQ_RING: i64 = 0x800_0000;
/// mmap offset selecting the submission entry array.
pub const IORING_OFF_SQES: i64 = 0x1000_0000;

/// Set in the submission ring's `flags` word by an idle SQPOLL kernel thread,
/// asking the caller to issue `io_uring_enter` with `EnterFlags::SQ_WAKEUP`.
pub const IORING_SQ_NEED_WAKEUP: u32 = 1 << 0;

/// The no-op opcode. Carries no operation semantics beyond echoing its user
/// tag, which makes it the canonical transport self-test operation.
pub const IORING_OP_NOP: u8 = 0;

/// `io_uring_register` opcode: register fixed buffers.
pub const IORING_REGISTER_BUFFERS: u32 = 0;
/// `io_uring_register` opcode: unregister all fixed buffers.
pub const IORING_UNREGISTER_BUFFERS: u32 = 1;
/// `io_uring_register` opcode: register fixed files.
pub const IORING_REGISTER_FILES: u32 = 2;
/// `io_uring_register` opcode: unregister all fixed files.
pub const IORING_UNREGISTER_FILES: u32 = 3;
/// `io_uring_register` opcode: register a completion eventfd.
pub const IORING_REGISTER_EVENTFD: u32 = 4;
/// `io_uring_register` opcode: unregister the completion eventfd.
pub const IORING_UNREGISTER_EVENTFD: u32 = 5;

bitflags::bitflags! {
    /// Flags accepted by [`io_uring_setup`], selecting kernel polling and
    /// sizing behaviors at ring creation.
    pub struct SetupFlags: u32 {
        /// Perform busy-wait I/O polling instead of interrupt driven I/O.
        const IOPOLL = 1 << 0;
        /// Spawn a kernel thread that polls the submission ring, removing the
        /// need for `io_uring_enter` on the submission path.
        const SQPOLL = 1 << 1;
        /// Pin the SQPOLL thread to the CPU in `io_uring_params::sq_thread_cpu`.
        const SQ_AFF = 1 << 2;
        /// Honor `io_uring_params::cq_entries` instead of defaulting the
        /// completion ring to twice the submission depth.
        const CQSIZE = 1 << 3;
        /// Clamp out-of-range entry counts instead of failing with `EINVAL`.
        const CLAMP = 1 << 4;
        /// Share the async backend of the ring fd in `io_uring_params::wq_fd`.
        const ATTACH_WQ = 1 << 5;
    }
}

bitflags::bitflags! {
    /// Flags for [`io_uring_enter`].
    pub struct EnterFlags: u32 {
        /// Wait until at least `min_complete` completions are ready.
        const GETEVENTS = 1 << 0;
        /// Wake up an idle SQPOLL kernel thread.
        const SQ_WAKEUP = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Feature bits reported back by the kernel in `io_uring_params::features`.
    pub struct FeatureFlags: u32 {
        /// Both ring headers can be mapped with a single mmap at
        /// [`IORING_OFF_SQ_RING`].
        const SINGLE_MMAP = 1 << 0;
        /// Completions are never dropped on CQ overflow.
        const NODROP = 1 << 1;
        /// Submitted entries are stable; the kernel copies them at submit time.
        const SUBMIT_STABLE = 1 << 2;
    }
}

/// Submission ring offset table, filled in by [`io_uring_setup`]. Each field
/// is a byte offset into the `IORING_OFF_SQ_RING` mapping.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct SqRingOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub flags: u32,
    pub dropped: u32,
    pub array: u32,
    pub resv1: u32,
    pub resv2: u64,
}

/// Completion ring offset table, filled in by [`io_uring_setup`].
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct CqRingOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub overflow: u32,
    pub cqes: u32,
    pub flags: u32,
    pub resv1: u32,
    pub resv2: u64,
}

/// The `io_uring_params` structure exchanged with [`io_uring_setup`]: the
/// caller fills in the flags, the kernel fills in the entry counts, feature
/// bits and both offset tables.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct IoUringParams {
    pub sq_entries: u32,
    pub cq_entries: u32,
    pub flags: u32,
    pub sq_thread_cpu: u32,
    pub sq_thread_idle: u32,
    pub features: u32,
    pub wq_fd: u32,
    pub resv: [u32; 3],
    pub sq_off: SqRingOffsets,
    pub cq_off: CqRingOffsets,
}

/// A submission queue entry: the fixed-size record a caller fills in before
/// submitting. Only `opcode`, `fd`, the pointer/length/offset trio, `flags`
/// and the opaque `user_data` tag are meaningful to this crate; the rest is
/// opcode-specific and passed through untouched.
///
/// The `user_data` tag is echoed verbatim in the matching [`Cqe`] and is the
/// only correlation mechanism between submissions and completions. It must be
/// unique per in-flight operation; this crate does not validate uniqueness.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub struct Sqe {
    pub opcode: u8,
    pub flags: u8,
    pub ioprio: u16,
    pub fd: i32,
    /// File offset or second address, depending on the opcode.
    pub off: u64,
    /// Buffer address, depending on the opcode.
    pub addr: u64,
    /// Buffer length or iovec count, depending on the opcode.
    pub len: u32,
    /// Opcode-specific flags (`rw_flags`, `accept_flags`, ...).
    pub op_flags: u32,
    /// Opaque tag, echoed unchanged in the completion.
    pub user_data: u64,
    pub buf_index: u16,
    pub personality: u16,
    pub splice_fd_in: i32,
    pub __pad2: [u64; 2],
}

impl Sqe {
    /// Reset every field to zero. Freshly acquired slots are already cleared;
    /// this exists for caller-owned batches fed to `direct_submit`.
    #[inline]
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// A no-op entry carrying `user_data`, completing immediately with result
    /// zero. Used for transport self-tests and ring flushing.
    #[inline]
    pub fn nop(user_data: u64) -> Self {
        Self {
            opcode: IORING_OP_NOP,
            user_data,
            ..Self::default()
        }
    }
}

/// A completion queue entry produced by the kernel.
///
/// `res` follows the errno convention: negative is `-errno`, non-negative is
/// the operation-specific success payload (bytes transferred, a new
/// descriptor, ...). A single sign check distinguishes the two.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub struct Cqe {
    /// The tag from the corresponding submission, unchanged.
    pub user_data: u64,
    /// Signed result code.
    pub res: i32,
    /// Completion flags.
    pub flags: u32,
}

impl Cqe {
    /// Whether the operation failed (`res` is a negated errno).
    #[inline]
    pub fn is_err(&self) -> bool {
        self.res < 0
    }
}

// The kernel layouts are load-bearing; catch drift at compile time.
const _: [(); 64] = [(); mem::size_of::<Sqe>()];
const _: [(); 16] = [(); mem::size_of::<Cqe>()];
const _: [(); 120] = [(); mem::size_of::<IoUringParams>()];

/// `io_uring_setup(2)`: create the ring and return its fd, or `-errno`.
pub fn io_uring_setup(entries: u32, params: &mut IoUringParams) -> c_int {
    unsafe {
        negated(libc::syscall(
            libc::SYS_io_uring_setup,
            entries as c_uint,
            params as *mut IoUringParams,
        ))
    }
}

/// `io_uring_enter(2)`: submit and/or wait. Returns the number of entries
/// consumed by the kernel, or `-errno`.
///
/// # Safety
///
/// `fd` must refer to a live io_uring instance whose submission entries are
/// fully written; the kernel reads ring memory during the call.
pub unsafe fn io_uring_enter(
    fd: c_int,
    to_submit: u32,
    min_complete: u32,
    flags: EnterFlags,
) -> c_int {
    negated(libc::syscall(
        libc::SYS_io_uring_enter,
        fd,
        to_submit as c_uint,
        min_complete as c_uint,
        flags.bits() as c_uint,
        std::ptr::null::<c_void>(),
        0 as libc::size_t,
    ))
}

/// `io_uring_register(2)`: the generic ring-configuration control call. The
/// argument region is opcode-specific and forwarded unmodified.
///
/// # Safety
///
/// `arg` must be valid for reads of whatever layout `opcode` implies (or
/// null), for the duration of the call; the kernel does not retain it.
pub unsafe fn io_uring_register(
    fd: c_int,
    opcode: u32,
    arg: *const c_void,
    nr_args: u32,
) -> c_int {
    negated(libc::syscall(
        libc::SYS_io_uring_register,
        fd,
        opcode as c_uint,
        arg,
        nr_args as c_uint,
    ))
}

/// Collapse a raw syscall return into the negated-errno convention.
fn negated(ret: c_long) -> c_int {
    if ret < 0 {
        // raw syscall(2) via libc reports failure through errno, not the
        // return value.
        -last_errno()
    } else {
        ret as c_int
    }
}

/// The calling thread's current `errno`, as a positive code.
pub(crate) fn last_errno() -> c_int {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}
