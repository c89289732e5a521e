//! Cross-thread wake-up: lets producer threads interrupt a blocked
//! `submit_and_wait` so the event loop notices newly queued tasks or an
//! updated deadline without polling.
//!
//! Grounded on the teacher's `response_queue.rs` eventfd `signal()` helper
//! and `GssMahadevan-gvthread`'s `eventfd_notifier.rs` (`EFD_NONBLOCK`,
//! writing `1u64`, treating `EAGAIN` on write as already-pending rather than
//! an error).

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Sentinel meaning "no deadline currently requested".
pub const NONE: u64 = u64::MAX;
/// Sentinel meaning "wake immediately, a task is pending right now".
pub const AWAKE: u64 = 0;

/// Shared wake-up state a producer thread can poke without taking a lock.
pub struct WakeupState {
    eventfd: RawFd,
    next_wakeup_nanos: AtomicU64,
    pending_wakeup: AtomicBool,
}

impl WakeupState {
    pub fn new(eventfd: RawFd) -> Self {
        WakeupState {
            eventfd,
            next_wakeup_nanos: AtomicU64::new(NONE),
            pending_wakeup: AtomicBool::new(false),
        }
    }

    pub fn eventfd(&self) -> RawFd {
        self.eventfd
    }

    /// Records that the loop should wake immediately and, if it is not
    /// already marked pending, writes to the eventfd to break it out of a
    /// blocked `submit_and_wait`.
    pub fn request_wakeup(&self) {
        self.next_wakeup_nanos.store(AWAKE, Ordering::Release);
        if !self.pending_wakeup.swap(true, Ordering::AcqRel) {
            self.notify();
        }
    }

    /// Requests a deadline-based wake-up at `nanos` (monotonic clock), only
    /// notifying immediately if the new deadline is sooner than whatever was
    /// previously armed.
    pub fn request_wakeup_at(&self, nanos: u64) {
        let mut prev = self.next_wakeup_nanos.load(Ordering::Acquire);
        loop {
            if prev != NONE && prev <= nanos {
                return;
            }
            match self.next_wakeup_nanos.compare_exchange_weak(
                prev,
                nanos,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
        if !self.pending_wakeup.swap(true, Ordering::AcqRel) {
            self.notify();
        }
    }

    fn notify(&self) {
        let one: u64 = 1;
        loop {
            let ret =
                unsafe { libc::write(self.eventfd, &one as *const u64 as *const libc::c_void, 8) };
            if ret >= 0 {
                return;
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return, // already has a pending wake-up queued
                Some(libc::EINTR) => continue,
                _ => return,
            }
        }
    }

    /// Called by the event loop after the reserved eventfd READ completes.
    /// Clears the pending flag and returns the deadline that was requested
    /// (if any), so the loop can re-arm its TIMEOUT accordingly.
    pub fn take_wakeup(&self) -> Option<u64> {
        self.pending_wakeup.store(false, Ordering::Release);
        match self.next_wakeup_nanos.swap(NONE, Ordering::AcqRel) {
            NONE => None,
            nanos => Some(nanos),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_eventfd() -> RawFd {
        unsafe { libc::eventfd(0, libc::EFD_NONBLOCK) }
    }

    #[test]
    fn request_wakeup_sets_awake_sentinel() {
        let state = WakeupState::new(dummy_eventfd());
        state.request_wakeup();
        assert_eq!(state.next_wakeup_nanos.load(Ordering::Acquire), AWAKE);
        unsafe { libc::close(state.eventfd) };
    }

    #[test]
    fn later_deadline_does_not_override_sooner_one() {
        let state = WakeupState::new(dummy_eventfd());
        state.request_wakeup_at(1_000);
        state.request_wakeup_at(5_000);
        assert_eq!(state.next_wakeup_nanos.load(Ordering::Acquire), 1_000);
        unsafe { libc::close(state.eventfd) };
    }

    #[test]
    fn sooner_deadline_overrides_later_one() {
        let state = WakeupState::new(dummy_eventfd());
        state.request_wakeup_at(5_000);
        state.request_wakeup_at(1_000);
        assert_eq!(state.next_wakeup_nanos.load(Ordering::Acquire), 1_000);
        unsafe { libc::close(state.eventfd) };
    }

    #[test]
    fn take_wakeup_clears_pending_and_returns_deadline() {
        let state = WakeupState::new(dummy_eventfd());
        state.request_wakeup_at(42);
        assert_eq!(state.take_wakeup(), Some(42));
        assert!(!state.pending_wakeup.load(Ordering::Acquire));
        assert_eq!(state.take_wakeup(), None);
        unsafe { libc::close(state.eventfd) };
    }
}
