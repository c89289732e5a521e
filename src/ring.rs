//! Owns the io_uring instance fd and its three mmap regions, and hands out
//! the [`SubmissionQueue`]/[`CompletionQueue`] views over them.
//!
//! Grounded on the vendored `io-uring` crate's top-level `IoUring::with_params`
//! (`other_examples/74a09527_...-src-lib.rs.rs`): call `io_uring_setup`, size
//! each mmap from the kernel-filled `sq_off`/`cq_off` offsets, prefer the
//! single combined SQ+CQ mapping when `IORING_FEAT_SINGLE_MMAP` is set.

use std::os::unix::io::RawFd;

use crate::abi::{self, Cqe, IoUringParams, Sqe};
use crate::cqueue::CompletionQueue;
use crate::error::RingError;
use crate::mmap::Mmap;
use crate::squeue::SubmissionQueue;

pub struct Ring {
    fd: RawFd,
    params: IoUringParams,
    // Kept alive only for Drop; SQ/CQ hold raw pointers derived from these.
    _sq_mmap: Mmap,
    _cq_mmap: Mmap,
    _sqes_mmap: Mmap,
    pub sq: SubmissionQueue,
    pub cq: CompletionQueue,
}

impl Ring {
    /// Sets up a new io_uring instance with `entries` submission slots (the
    /// kernel rounds this up to the next power of two) and maps its rings.
    pub fn new(entries: u32) -> Result<Self, RingError> {
        let mut params = IoUringParams::default();
        let fd = abi::io_uring_setup(entries, &mut params)?;

        let single_mmap = params.features & abi::IORING_FEAT_SINGLE_MMAP != 0;

        let sq_ring_len = params.sq_off.array as usize
            + params.sq_entries as usize * std::mem::size_of::<u32>();
        let cq_ring_len = params.cq_off.cqes as usize
            + params.cq_entries as usize * std::mem::size_of::<Cqe>();
        let sqes_len = params.sq_entries as usize * std::mem::size_of::<Sqe>();

        let sq_mmap = Mmap::new(fd, abi::IORING_OFF_SQ_RING, sq_ring_len)?;
        let cq_mmap = if single_mmap {
            // The kernel maps SQ and CQ rings into the same region; reuse the
            // same mapping for both without mapping it twice.
            Mmap::new(fd, abi::IORING_OFF_SQ_RING, sq_ring_len.max(cq_ring_len))?
        } else {
            Mmap::new(fd, abi::IORING_OFF_CQ_RING, cq_ring_len)?
        };
        let sqes_mmap = Mmap::new(fd, abi::IORING_OFF_SQES, sqes_len)?;

        let sq = unsafe { SubmissionQueue::new(&sq_mmap, &sqes_mmap, &params) };
        let cq = unsafe { CompletionQueue::new(&cq_mmap, &params) };

        Ok(Ring {
            fd,
            params,
            _sq_mmap: sq_mmap,
            _cq_mmap: cq_mmap,
            _sqes_mmap: sqes_mmap,
            sq,
            cq,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn params(&self) -> &IoUringParams {
        &self.params
    }

    /// Submits queued SQEs without blocking.
    pub fn submit(&mut self) -> Result<u32, RingError> {
        self.sq.submit(self.fd)
    }

    /// Submits queued SQEs and blocks until at least `min_complete`
    /// completions are ready.
    pub fn submit_and_wait(&mut self, min_complete: u32) -> Result<u32, RingError> {
        self.sq.submit_and_wait(self.fd, min_complete)
    }

    /// `io_uring_register(IORING_REGISTER_BUFFERS, ...)`.
    pub fn register_buffers(&self, iovecs: &[libc::iovec]) -> Result<(), RingError> {
        unsafe {
            abi::io_uring_register(
                self.fd,
                abi::IORING_REGISTER_BUFFERS,
                iovecs.as_ptr() as *const libc::c_void,
                iovecs.len() as libc::c_uint,
            )?;
        }
        Ok(())
    }

    /// `io_uring_register(IORING_UNREGISTER_BUFFERS, ...)`.
    pub fn unregister_buffers(&self) -> Result<(), RingError> {
        unsafe {
            abi::io_uring_register(
                self.fd,
                abi::IORING_UNREGISTER_BUFFERS,
                std::ptr::null(),
                0,
            )?;
        }
        Ok(())
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
