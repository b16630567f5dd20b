//! Owned mappings of the kernel-shared ring memory.
//!
//! A [`Mmap`] exclusively owns one mapped region of the io_uring fd. The
//! mapping is released on drop; the `Ring` type guarantees that no cursor
//! engine outlives its mapping by refusing every operation after close.

use std::ptr;

use libc::{c_int, c_void};

use crate::error::{Error, Result};

/// One `MAP_SHARED` mapping of the ring fd, unmapped on drop.
///
/// The pointer must never be duplicated outside the owning `Ring`; ring
/// memory is single-owner by contract.
#[derive(Debug)]
pub(crate) struct Mmap {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

impl Mmap {
    /// Map `len` bytes of the ring fd at one of the `IORING_OFF_*` offsets.
    ///
    /// `MAP_POPULATE` pre-faults the pages; the rings are touched on every
    /// operation, so there is no point paying the fault lazily.
    pub(crate) fn map_ring(fd: c_int, len: usize, offset: i64) -> Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd,
                offset,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(Error::Setup(-crate::sys::last_errno()));
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            len,
        })
    }

    #[inline]
    pub(crate) fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::munmap(self.ptr as *mut c_void, self.len);
        }
    }
}
