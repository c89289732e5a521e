//! Submission queue: the user-space producer side of the SQ ring.
//!
//! Grounded on `other_examples/dcf203c3_kata-containers-...-squeue.rs.rs`
//! (raw pointer fields into the mmap'd ring, `sync()` doing a Release-store
//! of `tail` and an Acquire-load of `head`) and the teacher's `io_thread.rs`
//! `IoUring::push`, which retries a submit when the ring reports full rather
//! than treating that as fatal.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::abi::{self, Cqe, IoUringParams, KernelTimespec, Sqe};
use crate::error::RingError;
use crate::userdata::{self, Op};

/// The submission queue, backed by three raw pointers into the SQ-ring mmap
/// plus the SQE array mmap. Only the event-loop thread ever touches this —
/// it is the single producer the kernel's ring protocol assumes.
pub struct SubmissionQueue {
    head: *const AtomicU32,
    tail: *const AtomicU32,
    ring_mask: u32,
    ring_entries: u32,
    flags: *const AtomicU32,
    dropped: *const AtomicU32,
    array: *mut u32,
    sqes: *mut Sqe,

    /// Local, uncommitted tail: entries queued since the last `sync`.
    local_tail: u32,
    /// Count of SQEs queued but not yet handed to the kernel via `enter`.
    pending: u32,
    /// fd reserved for the wake-up eventfd READ, kept permanently armed —
    /// the reserved-slot variant from the Open Question resolution.
    reserved_for_eventfd: u32,
}

// SAFETY: all pointers reference kernel-shared memory that outlives the
// `Ring` this queue is embedded in; access is single-threaded by contract
// (only the event-loop thread calls these methods).
unsafe impl Send for SubmissionQueue {}

impl SubmissionQueue {
    /// # Safety
    /// `sq_mmap`/`sqes_mmap` must be mmap'd regions matching `params`'s
    /// `sq_off` offsets and must outlive this queue.
    pub(crate) unsafe fn new(
        sq_mmap: &crate::mmap::Mmap,
        sqes_mmap: &crate::mmap::Mmap,
        params: &IoUringParams,
    ) -> Self {
        unsafe {
            let off = &params.sq_off;
            SubmissionQueue {
                head: sq_mmap.offset(off.head) as *const AtomicU32,
                tail: sq_mmap.offset(off.tail) as *const AtomicU32,
                ring_mask: *(sq_mmap.offset(off.ring_mask) as *const u32),
                ring_entries: *(sq_mmap.offset(off.ring_entries) as *const u32),
                flags: sq_mmap.offset(off.flags) as *const AtomicU32,
                dropped: sq_mmap.offset(off.dropped) as *const AtomicU32,
                array: sq_mmap.offset(off.array) as *mut u32,
                sqes: sqes_mmap.offset(0) as *mut Sqe,
                local_tail: (*(sq_mmap.offset(off.tail) as *const AtomicU32))
                    .load(Ordering::Acquire),
                pending: 0,
                reserved_for_eventfd: 0,
            }
        }
    }

    pub fn capacity(&self) -> u32 {
        self.ring_entries
    }

    pub fn dropped(&self) -> u32 {
        unsafe { (*self.dropped).load(Ordering::Acquire) }
    }

    /// Number of free slots, accounting for the one permanently reserved for
    /// the wake-up eventfd READ.
    fn free_slots(&self) -> u32 {
        let head = unsafe { (*self.head).load(Ordering::Acquire) };
        let in_flight = self.local_tail.wrapping_sub(head);
        self.ring_entries
            .saturating_sub(in_flight)
            .saturating_sub(self.reserved_for_eventfd)
    }

    fn push_raw(&mut self, sqe: Sqe) -> Result<(), RingError> {
        if self.free_slots() == 0 {
            return Err(RingError::SubmitQueueFull);
        }
        let index = self.local_tail & self.ring_mask;
        unsafe {
            *self.sqes.add(index as usize) = sqe;
            *self.array.add(index as usize) = index;
        }
        self.local_tail = self.local_tail.wrapping_add(1);
        self.pending += 1;
        Ok(())
    }

    pub fn add_accept(&mut self, listen_fd: RawFd) -> Result<(), RingError> {
        let mut sqe = Sqe::default();
        sqe.opcode = Op::Accept.raw_opcode(false);
        sqe.fd = listen_fd;
        sqe.user_data = userdata::encode(listen_fd, Op::Accept, 0);
        self.push_raw(sqe)
    }

    pub fn add_connect(
        &mut self,
        fd: RawFd,
        addr: *const libc::sockaddr,
        addr_len: libc::socklen_t,
    ) -> Result<(), RingError> {
        let mut sqe = Sqe::default();
        sqe.opcode = Op::Connect.raw_opcode(false);
        sqe.fd = fd;
        sqe.addr = addr as u64;
        sqe.off = addr_len as u64;
        sqe.user_data = userdata::encode(fd, Op::Connect, 0);
        self.push_raw(sqe)
    }

    /// `pos` is the file offset to read at (`IORING_OP_READ`'s `off` field);
    /// pass 0 for fds where position is meaningless, such as sockets.
    pub fn add_read(&mut self, fd: RawFd, buf: *mut u8, len: u32, pos: u64) -> Result<(), RingError> {
        let mut sqe = Sqe::default();
        sqe.opcode = Op::Read.raw_opcode(false);
        sqe.fd = fd;
        sqe.addr = buf as u64;
        sqe.len = len;
        sqe.off = pos;
        sqe.user_data = userdata::encode(fd, Op::Read, 0);
        self.push_raw(sqe)
    }

    /// `pos` is the file offset to write at; pass 0 for sockets.
    pub fn add_write(&mut self, fd: RawFd, buf: *const u8, len: u32, pos: u64) -> Result<(), RingError> {
        let mut sqe = Sqe::default();
        sqe.opcode = Op::Write.raw_opcode(false);
        sqe.fd = fd;
        sqe.addr = buf as u64;
        sqe.len = len;
        sqe.off = pos;
        sqe.user_data = userdata::encode(fd, Op::Write, 0);
        self.push_raw(sqe)
    }

    pub fn add_writev(
        &mut self,
        fd: RawFd,
        iovecs: *const libc::iovec,
        count: u32,
    ) -> Result<(), RingError> {
        let mut sqe = Sqe::default();
        sqe.opcode = abi::opcode::WRITEV;
        sqe.fd = fd;
        sqe.addr = iovecs as u64;
        sqe.len = count;
        sqe.user_data = userdata::encode(fd, Op::Write, 0);
        self.push_raw(sqe)
    }

    pub fn add_close(&mut self, fd: RawFd) -> Result<(), RingError> {
        let mut sqe = Sqe::default();
        sqe.opcode = Op::Close.raw_opcode(false);
        sqe.fd = fd;
        sqe.user_data = userdata::encode(fd, Op::Close, 0);
        self.push_raw(sqe)
    }

    pub fn add_poll(&mut self, fd: RawFd, mask: u16) -> Result<(), RingError> {
        let mut sqe = Sqe::default();
        sqe.opcode = Op::PollAdd.raw_opcode(false);
        sqe.fd = fd;
        sqe.op_flags = mask as u32;
        sqe.user_data = userdata::encode(fd, Op::PollAdd, mask);
        self.push_raw(sqe)
    }

    pub fn add_poll_remove(&mut self, fd: RawFd, target_user_data: u64) -> Result<(), RingError> {
        let mut sqe = Sqe::default();
        sqe.opcode = Op::PollRemove.raw_opcode(false);
        sqe.fd = fd;
        sqe.addr = target_user_data;
        sqe.user_data = userdata::encode(fd, Op::PollRemove, 0);
        self.push_raw(sqe)
    }

    pub fn add_read_cancel(&mut self, fd: RawFd, target_user_data: u64) -> Result<(), RingError> {
        let mut sqe = Sqe::default();
        sqe.opcode = Op::AsyncCancel.raw_opcode(false);
        sqe.fd = fd;
        sqe.addr = target_user_data;
        sqe.user_data = userdata::encode(fd, Op::AsyncCancel, 0);
        self.push_raw(sqe)
    }

    /// Arms a single TIMEOUT SQE for `nanos` from now. Callers must first
    /// issue `add_timeout_remove` for any previously armed timeout — at most
    /// one TIMEOUT may be in flight, per the ring invariant.
    pub fn add_timeout(
        &mut self,
        timespec: &KernelTimespec,
        user_data_mask: u16,
    ) -> Result<(), RingError> {
        let mut sqe = Sqe::default();
        sqe.opcode = Op::Timeout.raw_opcode(false);
        sqe.fd = -1;
        sqe.addr = timespec as *const KernelTimespec as u64;
        sqe.len = 1;
        sqe.user_data = userdata::encode(-1, Op::Timeout, user_data_mask);
        self.push_raw(sqe)
    }

    pub fn add_timeout_remove(&mut self, target_user_data: u64) -> Result<(), RingError> {
        let mut sqe = Sqe::default();
        sqe.opcode = Op::TimeoutRemove.raw_opcode(false);
        sqe.fd = -1;
        sqe.addr = target_user_data;
        sqe.user_data = userdata::encode(-1, Op::TimeoutRemove, 0);
        self.push_raw(sqe)
    }

    /// Reserves exactly one slot permanently for the eventfd wake-up READ and
    /// submits the SQE that claims it. Must be called once, before the loop
    /// starts accepting other work.
    pub fn arm_eventfd_read(&mut self, eventfd: RawFd, buf: *mut u8) -> Result<(), RingError> {
        self.reserved_for_eventfd = 0;
        let mut sqe = Sqe::default();
        sqe.opcode = Op::EventfdRead.raw_opcode(false);
        sqe.fd = eventfd;
        sqe.addr = buf as u64;
        sqe.len = 8;
        sqe.user_data = userdata::encode(eventfd, Op::EventfdRead, 0);
        self.push_raw(sqe)?;
        self.reserved_for_eventfd = 1;
        Ok(())
    }

    fn sync(&mut self) {
        unsafe {
            (*self.tail).store(self.local_tail, Ordering::Release);
        }
    }

    /// Commits queued SQEs to the kernel via `io_uring_enter`, without
    /// blocking for completions. Returns the number of entries the kernel
    /// accepted; a value short of what was pending is a partial submit.
    pub fn submit(&mut self, ring_fd: RawFd) -> Result<u32, RingError> {
        self.enter(ring_fd, 0, 0)
    }

    /// Commits queued SQEs and blocks until at least `min_complete`
    /// completions are available (0 means "don't block waiting on CQ").
    pub fn submit_and_wait(
        &mut self,
        ring_fd: RawFd,
        min_complete: u32,
    ) -> Result<u32, RingError> {
        self.enter(ring_fd, min_complete, abi::IORING_ENTER_GETEVENTS)
    }

    fn enter(&mut self, ring_fd: RawFd, min_complete: u32, flags: u32) -> Result<u32, RingError> {
        let to_submit = self.pending;
        self.sync();
        let submitted = unsafe { abi::io_uring_enter(ring_fd, to_submit, min_complete, flags)? };
        let submitted = submitted as u32;
        if submitted < to_submit {
            // Kernel accepted fewer SQEs than queued; roll local_tail back so
            // the unsubmitted tail end is retried on the next submit.
            let short = to_submit - submitted;
            self.local_tail = self.local_tail.wrapping_sub(short);
            self.pending = short;
            self.sync();
            return Err(RingError::PartialSubmit {
                queued: to_submit as usize,
                accepted: submitted as usize,
            });
        }
        self.pending = 0;
        Ok(submitted)
    }
}

/// Marker type kept for documentation purposes; CQEs are consumed directly
/// as `abi::Cqe` by `cqueue::CompletionQueue`.
pub type RawCqe = Cqe;

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_queue(entries: u32) -> (Vec<u32>, Vec<u32>, Vec<Sqe>, SubmissionQueue) {
        // Exercises free_slots()/push_raw() bookkeeping against plain heap
        // buffers instead of a real mmap'd ring, the way the vendored
        // squeue.rs tests its ring-math independent of a live kernel fd.
        let head = Box::leak(Box::new(AtomicU32::new(0)));
        let tail = Box::leak(Box::new(AtomicU32::new(0)));
        let flags = Box::leak(Box::new(AtomicU32::new(0)));
        let dropped = Box::leak(Box::new(AtomicU32::new(0)));
        let mut array = vec![0u32; entries as usize];
        let mut sqes = vec![Sqe::default(); entries as usize];
        let sq = SubmissionQueue {
            head: head as *const AtomicU32,
            tail: tail as *const AtomicU32,
            ring_mask: entries - 1,
            ring_entries: entries,
            flags: flags as *const AtomicU32,
            dropped: dropped as *const AtomicU32,
            array: array.as_mut_ptr(),
            sqes: sqes.as_mut_ptr(),
            local_tail: 0,
            pending: 0,
            reserved_for_eventfd: 0,
        };
        (array, vec![], sqes, sq)
    }

    #[test]
    fn push_fails_once_ring_entries_exhausted() {
        let (_array, _unused, _sqes, mut sq) = make_test_queue(2);
        sq.add_read(3, std::ptr::null_mut(), 0, 0).unwrap();
        sq.add_read(3, std::ptr::null_mut(), 0, 0).unwrap();
        let err = sq.add_read(3, std::ptr::null_mut(), 0, 0).unwrap_err();
        assert!(matches!(err, RingError::SubmitQueueFull));
    }

    #[test]
    fn eventfd_reservation_shrinks_usable_capacity() {
        let (_array, _unused, _sqes, mut sq) = make_test_queue(2);
        let mut buf = [0u8; 8];
        sq.arm_eventfd_read(9, buf.as_mut_ptr()).unwrap();
        sq.add_read(3, std::ptr::null_mut(), 0, 0).unwrap();
        let err = sq.add_read(3, std::ptr::null_mut(), 0, 0).unwrap_err();
        assert!(matches!(err, RingError::SubmitQueueFull));
    }

    #[test]
    fn user_data_round_trips_through_pushed_sqe() {
        let (_array, _unused, sqes, mut sq) = make_test_queue(4);
        sq.add_accept(7).unwrap();
        let decoded = userdata::decode(sqes[0].user_data).unwrap();
        assert_eq!(decoded, (7, Op::Accept, 0));
    }
}
