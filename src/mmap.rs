//! RAII wrapper around the three `mmap` regions an io_uring instance hands
//! back: SQ ring, CQ ring, and the SQE array.
//!
//! Grounded on the vendored `io-uring` crate's `util::Mmap` (see
//! `other_examples/74a09527_...-src-lib.rs.rs`): a thin pointer+len pair that
//! `munmap`s on drop, with an `offset` helper for computing field addresses
//! from the kernel-reported `sq_off`/`cq_off` byte offsets.

use std::ptr::NonNull;

use crate::abi::AbiError;

pub struct Mmap {
    ptr: NonNull<libc::c_void>,
    len: usize,
}

// The mapping is shared (MAP_SHARED | MAP_POPULATE) with the kernel; once
// created it is only ever read through volatile/atomic accesses, so it is
// fine to move the handle across threads.
unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

impl Mmap {
    /// Maps `len` bytes of `fd` at `offset`, the pattern every ring region
    /// (`IORING_OFF_SQ_RING`, `IORING_OFF_CQ_RING`, `IORING_OFF_SQES`) uses.
    pub fn new(fd: i32, offset: libc::off_t, len: usize) -> Result<Self, AbiError> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd,
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(AbiError::Mmap {
                len,
                offset: offset as i64,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(Mmap {
            // SAFETY: mmap only returns null on MAP_FAILED, handled above.
            ptr: unsafe { NonNull::new_unchecked(ptr) },
            len,
        })
    }

    /// Computes the address of a field at `byte_offset` within this mapping.
    ///
    /// # Safety
    /// `byte_offset` must fall within the mapped region and the caller must
    /// uphold whatever alignment the field type requires.
    pub unsafe fn offset(&self, byte_offset: u32) -> *mut u8 {
        unsafe { self.ptr.as_ptr().cast::<u8>().add(byte_offset as usize) }
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr(), self.len);
        }
    }
}
