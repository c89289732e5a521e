//! Optional registered-buffer ("fixed buffer") bookkeeping.
//!
//! Re-registering buffers with the kernel (`IORING_REGISTER_BUFFERS`) is
//! only safe once no READ_FIXED/WRITE_FIXED/ACCEPT/CONNECT/WRITEV operation
//! referencing the old registration is still in flight; POLL and TIMEOUT are
//! exempt since they never touch registered memory. This tracks that
//! in-flight count and the pause-then-register protocol the spec names.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::userdata::Op;

#[derive(Default)]
pub struct FixedBufferTracker {
    in_flight: AtomicU64,
    reconcile_requested: bool,
    /// Whether the pause protocol (cancel eventfd read, remove timeout) has
    /// already been submitted for the current reconcile request, so it
    /// isn't resubmitted every busy-phase iteration while in-flight drains.
    pause_submitted: bool,
}

impl FixedBufferTracker {
    pub fn new() -> Self {
        FixedBufferTracker::default()
    }

    /// True while a reconcile is requested and its pause protocol has
    /// already been submitted — long-running SQEs stay cancelled/un-rearmed
    /// until the reconcile completes.
    pub fn is_paused(&self) -> bool {
        self.reconcile_requested && self.pause_submitted
    }

    /// Returns `true` exactly once per reconcile request, the moment the
    /// pause protocol needs submitting.
    pub fn take_pause_needed(&mut self) -> bool {
        if self.reconcile_requested && !self.pause_submitted {
            self.pause_submitted = true;
            true
        } else {
            false
        }
    }

    /// Whether `op` counts toward the in-flight total that must drain to
    /// zero before a buffer re-registration can proceed.
    pub fn counts_toward_inflight(op: Op) -> bool {
        matches!(op, Op::Read | Op::Write | Op::Accept | Op::Connect)
    }

    pub fn on_submit(&self, op: Op) {
        if Self::counts_toward_inflight(op) {
            self.in_flight.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn on_complete(&self, op: Op) {
        if Self::counts_toward_inflight(op) {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn request_reconcile(&mut self) {
        self.reconcile_requested = true;
    }

    /// Called once per loop iteration; returns `true` exactly when a
    /// reconcile was requested and it is now safe to perform it (no fixed
    /// buffer I/O remains in flight). Clears the request either way so a
    /// caller doesn't need to track whether it consumed it.
    pub fn try_take_reconcile(&mut self) -> bool {
        if !self.reconcile_requested {
            return false;
        }
        if self.in_flight() == 0 {
            self.reconcile_requested = false;
            self.pause_submitted = false;
            true
        } else {
            false
        }
    }
}

/// A flat pool of heap-backed buffers registered with the kernel via
/// `IORING_REGISTER_BUFFERS`. Each buffer becomes one `iovec` entry; index
/// into the pool is the registered-buffer index fixed-buffer ops address.
pub struct FixedBufferPool {
    buffers: Vec<Vec<u8>>,
}

impl FixedBufferPool {
    pub fn new(buf_sizes: &[usize]) -> Self {
        FixedBufferPool {
            buffers: buf_sizes.iter().map(|&len| vec![0u8; len]).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Builds the `iovec` array to hand to `Ring::register_buffers`. The
    /// pool must outlive the registration — the kernel keeps these pointers.
    pub fn iovecs(&mut self) -> Vec<libc::iovec> {
        self.buffers
            .iter_mut()
            .map(|buf| libc::iovec {
                iov_base: buf.as_mut_ptr() as *mut libc::c_void,
                iov_len: buf.len(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_and_timeout_do_not_count_toward_inflight() {
        assert!(!FixedBufferTracker::counts_toward_inflight(Op::PollAdd));
        assert!(!FixedBufferTracker::counts_toward_inflight(Op::Timeout));
    }

    #[test]
    fn reconcile_waits_until_inflight_drains_to_zero() {
        let mut tracker = FixedBufferTracker::new();
        tracker.on_submit(Op::Read);
        tracker.request_reconcile();
        assert!(!tracker.try_take_reconcile());
        tracker.on_complete(Op::Read);
        assert!(tracker.try_take_reconcile());
    }

    #[test]
    fn reconcile_request_is_consumed_exactly_once() {
        let mut tracker = FixedBufferTracker::new();
        tracker.request_reconcile();
        assert!(tracker.try_take_reconcile());
        assert!(!tracker.try_take_reconcile());
    }

    #[test]
    fn pause_is_requested_exactly_once_per_reconcile() {
        let mut tracker = FixedBufferTracker::new();
        tracker.on_submit(Op::Read);
        tracker.request_reconcile();
        assert!(tracker.take_pause_needed());
        assert!(!tracker.take_pause_needed());
        assert!(tracker.is_paused());
        tracker.on_complete(Op::Read);
        assert!(tracker.try_take_reconcile());
        assert!(!tracker.is_paused());
    }

    #[test]
    fn buffer_pool_builds_one_iovec_per_buffer() {
        let mut pool = FixedBufferPool::new(&[64, 128]);
        assert_eq!(pool.len(), 2);
        let iovecs = pool.iovecs();
        assert_eq!(iovecs.len(), 2);
        assert_eq!(iovecs[0].iov_len, 64);
        assert_eq!(iovecs[1].iov_len, 128);
    }
}
