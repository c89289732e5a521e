//! The single-threaded cooperative driver tying every other module
//! together: busy phase (drain CQ, run tasks) → shutdown check → fixed-buffer
//! reconciliation → arm deadline → block → after-wake.
//!
//! Grounded on the teacher's `io_thread::IoThread::run` loop shape (submit
//! initial accept + eventfd read, then `wait` / `drain_cqes` / dispatch by
//! decoded op in a `loop`), generalized to the full op set and state machine
//! this crate's spec calls for.

use std::collections::HashSet;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::abi::{self, KernelTimespec};
use crate::channel::{Channel, EchoChannel};
use crate::config;
use crate::error::{AbiError, LoopError, RingError};
use crate::fixed_buf::{FixedBufferPool, FixedBufferTracker};
use crate::registry::ChannelRegistry;
use crate::ring::Ring;
use crate::tasks::{TaskQueue, TaskSender};
use crate::userdata::{self, Op};
use crate::wakeup::WakeupState;

const EVENTFD_OP_FD_MASK: u16 = 0;

pub struct EventLoop {
    ring: Ring,
    registry: ChannelRegistry,
    tasks: TaskQueue,
    wakeup: Arc<WakeupState>,
    fixed_buf: FixedBufferTracker,
    eventfd: RawFd,
    eventfd_buf: Box<[u8; 8]>,
    /// `user_data` of the currently armed TIMEOUT, if any — at most one may
    /// be in flight, enforced via the TIMEOUT_REMOVE-then-TIMEOUT pattern.
    armed_timeout: Option<u64>,
    /// The relative deadline, in nanoseconds, the armed TIMEOUT above was
    /// last issued for. Re-arming only happens when a freshly computed
    /// deadline differs from this value (`prev_deadline` in the state
    /// machine's terms).
    armed_deadline_nanos: Option<u64>,
    armed_timespec: Box<KernelTimespec>,
    shutdown_requested: Arc<AtomicBool>,
    read_buf_size: usize,
    /// Listening sockets, tracked outside the channel registry since they
    /// never go through read/write completion and are torn down as a unit
    /// the moment shutdown begins (stop accepting new connections).
    listener_fds: Vec<RawFd>,
    listeners_closed: bool,
    /// Fds with a CLOSE already submitted, so a channel that stays
    /// `!is_active()` across several busy-phase iterations while its CLOSE
    /// completion is still in flight doesn't get CLOSE submitted again.
    closing_fds: HashSet<RawFd>,
    fixed_buffer_pool: Option<FixedBufferPool>,
    pending_buffer_sizes: Option<Vec<usize>>,
}

/// A cloneable handle that lets any thread (or a task running on the loop
/// itself) ask the loop to shut down once it next drains.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    wakeup: Arc<WakeupState>,
}

impl ShutdownHandle {
    pub fn request(&self) {
        self.flag.store(true, Ordering::Release);
        self.wakeup.request_wakeup();
    }
}

impl EventLoop {
    pub fn new(ring_entries: u32, read_buf_size: usize) -> Result<Self, LoopError> {
        let ring = Ring::new(ring_entries).map_err(LoopError::SubmitFailed)?;
        let eventfd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK) };
        if eventfd < 0 {
            return Err(LoopError::SubmitFailed(RingError::Abi(
                crate::error::AbiError::Syscall {
                    call: "eventfd",
                    source: std::io::Error::last_os_error(),
                },
            )));
        }
        let wakeup = Arc::new(WakeupState::new(eventfd));
        let tasks = TaskQueue::new(Arc::clone(&wakeup));

        Ok(EventLoop {
            ring,
            registry: ChannelRegistry::new(),
            tasks,
            wakeup,
            fixed_buf: FixedBufferTracker::new(),
            eventfd,
            eventfd_buf: Box::new([0u8; 8]),
            armed_timeout: None,
            armed_deadline_nanos: None,
            armed_timespec: Box::new(KernelTimespec::default()),
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            read_buf_size,
            listener_fds: Vec::new(),
            listeners_closed: false,
            closing_fds: HashSet::new(),
            fixed_buffer_pool: None,
            pending_buffer_sizes: None,
        })
    }

    pub fn task_sender(&self) -> TaskSender {
        self.tasks.sender()
    }

    /// Returns a handle any thread can use to request shutdown, without
    /// needing a `&mut EventLoop` (which only the loop's own thread holds
    /// once `run` starts).
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown_requested),
            wakeup: Arc::clone(&self.wakeup),
        }
    }

    pub fn request_shutdown(&mut self) {
        self.shutdown_requested.store(true, Ordering::Release);
        self.wakeup.request_wakeup();
    }

    /// Asks the loop to pause long-running I/O, drain in-flight fixed-buffer
    /// ops, and swap in a freshly sized registered-buffer pool once it's
    /// safe. The swap happens over one or more future busy-phase iterations,
    /// not synchronously with this call.
    pub fn request_buffer_reconcile(&mut self, buf_sizes: Vec<usize>) {
        self.pending_buffer_sizes = Some(buf_sizes);
        self.fixed_buf.request_reconcile();
    }

    /// Registers a listening socket and submits its first ACCEPT.
    pub fn add_listener(&mut self, listen_fd: RawFd) -> Result<(), LoopError> {
        self.listener_fds.push(listen_fd);
        self.submit_accept(listen_fd)
    }

    fn submit_accept(&mut self, listen_fd: RawFd) -> Result<(), LoopError> {
        self.ring
            .sq
            .add_accept(listen_fd)
            .map_err(LoopError::SubmitFailed)?;
        self.fixed_buf.on_submit(Op::Accept);
        Ok(())
    }

    /// Arms the permanent eventfd READ SQE. Must be called exactly once,
    /// before the first call to [`EventLoop::run`].
    fn arm_eventfd(&mut self) -> Result<(), LoopError> {
        let buf_ptr = self.eventfd_buf.as_mut_ptr();
        self.ring
            .sq
            .arm_eventfd_read(self.eventfd, buf_ptr)
            .map_err(LoopError::SubmitFailed)
    }

    pub fn run(&mut self) -> Result<(), LoopError> {
        self.arm_eventfd()?;
        self.ring.submit().map_err(LoopError::SubmitFailed)?;

        loop {
            self.busy_phase()?;

            if self.confirm_shutdown() {
                debug!("event loop shutting down: no active channels and no pending tasks");
                return Ok(());
            }

            if self.fixed_buf.take_pause_needed() {
                self.pause_for_reconcile()?;
            }
            if self.fixed_buf.try_take_reconcile() {
                self.reconcile_buffers()?;
            }

            let wait_deadline = self.arm_deadline();

            // A deadline is always armed (falling back to `config::MAX_BLOCK`
            // when nothing else is pending), so `submit_and_wait` must block
            // for at least one completion — the TIMEOUT itself if nothing
            // else arrives first. `min_complete = 0` would return instantly
            // and turn this into a busy spin.
            let min_complete = if wait_deadline.is_some() { 1 } else { 0 };
            crate::metrics::inc_submits();
            match self.ring.submit_and_wait(min_complete) {
                Ok(_) => {}
                Err(RingError::PartialSubmit { queued, accepted }) => {
                    crate::metrics::inc_partial_submits();
                    warn!(queued, accepted, "partial submit, retrying remainder next iteration");
                }
                Err(RingError::SubmitQueueFull) => {
                    crate::metrics::inc_submit_queue_full();
                    warn!("submission queue full, backing off");
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(other) => return Err(LoopError::SubmitFailed(other)),
            }
        }
    }

    /// Drains every currently-visible completion and runs pending tasks,
    /// catching panics from either so one bad task never kills the loop.
    fn busy_phase(&mut self) -> Result<(), LoopError> {
        if self.shutdown_requested.load(Ordering::Acquire) && !self.listeners_closed {
            self.listeners_closed = true;
            let fds = std::mem::take(&mut self.listener_fds);
            for fd in fds {
                if self.closing_fds.insert(fd) {
                    if let Err(err) = self.ring.sq.add_close(fd) {
                        warn!(fd, %err, "failed to submit close for listener during shutdown");
                    }
                }
            }
        }

        let registry = &mut self.registry;
        let fixed_buf = &self.fixed_buf;
        let closing_fds = &mut self.closing_fds;
        let sq = &mut self.ring.sq;
        let armed_timeout = &mut self.armed_timeout;
        let armed_deadline_nanos = &mut self.armed_deadline_nanos;
        let mut pending_accepts = Vec::new();
        let mut pending_rearm_eventfd = false;

        let drained = self.ring.cq.process(|cqe| {
            let Some((fd, op, mask)) = userdata::decode(cqe.user_data) else {
                warn!(user_data = cqe.user_data, "completion with unrecognized user_data, dropping");
                return;
            };
            fixed_buf.on_complete(op);
            match op {
                Op::EventfdRead => {
                    // The deadline/AWAKE value itself is consumed once, later,
                    // by `arm_deadline` — here we only note that the
                    // permanently-reserved read slot needs re-arming, unless
                    // it was cancelled on purpose to pause for a buffer
                    // reconcile (re-armed once that finishes instead).
                    if fixed_buf.is_paused() {
                        trace!("eventfd read cancelled for buffer reconcile, deferring re-arm");
                    } else {
                        pending_rearm_eventfd = true;
                    }
                }
                Op::Accept => {
                    if cqe.res >= 0 {
                        crate::metrics::inc_accepts();
                        pending_accepts.push((fd, Some(cqe.res)));
                    } else {
                        warn!(listen_fd = fd, res = cqe.res, "accept failed");
                        pending_accepts.push((fd, None));
                    }
                }
                Op::Read => {
                    if let Some(channel) = registry.get_mut(fd) {
                        channel.read_complete(cqe.res);
                        if let Some((ptr, len)) = channel.next_write() {
                            match sq.add_write(fd, ptr, len, 0) {
                                Ok(()) => fixed_buf.on_submit(Op::Write),
                                Err(err) => warn!(fd, %err, "failed to submit echo write"),
                            }
                        }
                    }
                }
                Op::Write => {
                    if let Some(channel) = registry.get_mut(fd) {
                        channel.write_complete(cqe.res);
                        if let Some((ptr, len)) = channel.next_read() {
                            match sq.add_read(fd, ptr, len, 0) {
                                Ok(()) => fixed_buf.on_submit(Op::Read),
                                Err(err) => warn!(fd, %err, "failed to re-arm echo read"),
                            }
                        }
                    }
                }
                Op::Connect => {
                    if let Some(channel) = registry.get_mut(fd) {
                        channel.connect_complete(cqe.res);
                    }
                }
                Op::PollAdd => {
                    if cqe.res == -libc::ECANCELED {
                        // Raced with a POLL_REMOVE (e.g. buffer-reconcile
                        // pause, or an explicit cancel) rather than the
                        // condition firing — re-arm if the channel is still
                        // around to care.
                        if let Some(channel) = registry.get_mut(fd) {
                            if channel.is_active() {
                                if let Err(err) = sq.add_poll(fd, mask) {
                                    warn!(fd, %err, "failed to re-arm poll after cancellation");
                                }
                            }
                        }
                    } else if let Some(channel) = registry.get_mut(fd) {
                        if mask as u32 & abi::poll_mask::POLLRDHUP != 0 {
                            channel.poll_rd_hup();
                        } else if mask as u32 & abi::poll_mask::POLLOUT != 0 {
                            channel.poll_out();
                        } else {
                            channel.poll_in();
                        }
                    }
                }
                Op::PollRemove | Op::AsyncCancel => {
                    trace!(fd, res = cqe.res, "poll/cancel removal acknowledged");
                }
                Op::Close => {
                    closing_fds.remove(&fd);
                    registry.remove_if_current(fd, fd);
                }
                Op::Timeout => {
                    // -ETIME is the expected "deadline reached" result, and
                    // it's the only case that actually retires the armed
                    // TIMEOUT: -ECANCELED/-ENOENT/-ENXIO mean it was replaced
                    // or raced with a remove, and the replacement is already
                    // tracked in `armed_timeout`.
                    crate::metrics::inc_timeouts_fired();
                    if cqe.res == -libc::ETIME {
                        *armed_timeout = None;
                        *armed_deadline_nanos = None;
                    }
                    trace!(res = cqe.res, "timeout fired");
                }
                Op::TimeoutRemove => {
                    trace!(res = cqe.res, "timeout remove acknowledged");
                }
            }
        });
        crate::metrics::inc_completions(drained as u64);

        let shutting_down = self.shutdown_requested.load(Ordering::Acquire);
        for (listen_fd, conn_fd) in pending_accepts {
            match conn_fd {
                // Once shutdown has begun the listener itself is already
                // being torn down, so a connection that slipped in under the
                // wire gets closed immediately instead of registered.
                Some(conn_fd) if shutting_down => {
                    if self.closing_fds.insert(conn_fd) {
                        if let Err(err) = self.ring.sq.add_close(conn_fd) {
                            warn!(fd = conn_fd, %err, "failed to submit close for late accept during shutdown");
                        }
                    }
                }
                Some(conn_fd) => self.spawn_accepted(listen_fd, conn_fd)?,
                None if shutting_down => {}
                None => self.submit_accept(listen_fd)?,
            }
        }

        self.close_inactive_channels()?;

        let ran = self.tasks.run_pending();
        if ran > 0 {
            trace!(ran, "ran pending tasks");
        }

        if pending_rearm_eventfd {
            self.arm_eventfd()?;
        }

        Ok(())
    }

    /// Submits CLOSE for every registered channel that has gone inactive
    /// (EOF, error, or a drained close request) and isn't already waiting on
    /// one. The channel itself is only removed from the registry once the
    /// CLOSE completion arrives, via `remove_if_current`.
    fn close_inactive_channels(&mut self) -> Result<(), LoopError> {
        let closing_fds = &self.closing_fds;
        let mut to_close = Vec::new();
        self.registry.for_each_mut(|fd, channel| {
            channel.process_delayed_close();
            if !channel.is_active() && !closing_fds.contains(&fd) {
                to_close.push(fd);
            }
        });
        for fd in to_close {
            self.closing_fds.insert(fd);
            self.ring.sq.add_close(fd).map_err(LoopError::SubmitFailed)?;
        }
        Ok(())
    }

    /// Registers a freshly accepted connection's channel and submits its
    /// initial read, then re-arms the listener's next accept.
    pub fn spawn_accepted(&mut self, listen_fd: RawFd, conn_fd: RawFd) -> Result<(), LoopError> {
        let mut channel = EchoChannel::new(conn_fd, self.read_buf_size);
        let next_read = channel.next_read();
        self.registry.insert(conn_fd, Box::new(channel));

        if let Some((ptr, len)) = next_read {
            self.ring
                .sq
                .add_read(conn_fd, ptr, len, 0)
                .map_err(LoopError::SubmitFailed)?;
            self.fixed_buf.on_submit(Op::Read);
        }

        self.submit_accept(listen_fd)
    }

    /// True once shutdown has been requested and no channel or pending task
    /// remains — only then does [`EventLoop::run`] return.
    fn confirm_shutdown(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
            && self.listeners_closed
            && self.listener_fds.is_empty()
            && self.registry.is_empty()
            && self.closing_fds.is_empty()
            && self.tasks.is_empty()
    }

    /// Re-arms the single permitted TIMEOUT SQE to the nearer of any pending
    /// wake-up deadline and `config::MAX_BLOCK`, via TIMEOUT_REMOVE-then-
    /// TIMEOUT so at most one is ever in flight — but only when the deadline
    /// actually changed, per the remove-then-add protocol being reserved for
    /// genuine deadline moves rather than churned every iteration. Returns
    /// `Some` when a finite deadline is armed (so `run` knows to demand
    /// `min_complete=1` rather than returning from `submit_and_wait` instantly).
    fn arm_deadline(&mut self) -> Option<Instant> {
        let requested = self.wakeup.take_wakeup();
        if requested.is_some() {
            crate::metrics::inc_wakeups();
        }
        // Falling back to `MAX_BLOCK_NANOS` when nothing asked for a sooner
        // wake-up keeps `submit_and_wait` bounded even with no channels and
        // no task queue activity, so shutdown/health checks stay live.
        let nanos = match requested {
            Some(crate::wakeup::AWAKE) => 0,
            Some(nanos) => nanos.min(config::MAX_BLOCK_NANOS),
            None => config::MAX_BLOCK_NANOS,
        };

        if self.armed_deadline_nanos == Some(nanos) && self.armed_timeout.is_some() {
            return Some(Instant::now() + Duration::from_nanos(nanos));
        }

        if let Some(prev) = self.armed_timeout.take() {
            let _ = self.ring.sq.add_timeout_remove(prev);
        }
        self.armed_deadline_nanos = None;

        *self.armed_timespec = KernelTimespec::from_nanos(nanos);
        match self
            .ring
            .sq
            .add_timeout(&self.armed_timespec, EVENTFD_OP_FD_MASK)
        {
            Ok(()) => {
                self.armed_timeout = Some(userdata::encode(-1, Op::Timeout, EVENTFD_OP_FD_MASK));
                self.armed_deadline_nanos = Some(nanos);
                Some(Instant::now() + Duration::from_nanos(nanos))
            }
            Err(_) => None,
        }
    }

    /// Cancels every long-running SQE that would otherwise keep referencing
    /// memory across a buffer re-registration: a speculative POLL_REMOVE per
    /// channel (harmless -ENOENT if nothing was armed), the eventfd READ, and
    /// the armed TIMEOUT. Once their completions drain `fixed_buf`'s in-flight
    /// count to zero, `reconcile_buffers` performs the actual swap.
    fn pause_for_reconcile(&mut self) -> Result<(), LoopError> {
        debug!("buffer reconcile requested, pausing long-running I/O");

        let mut pollable_fds = Vec::new();
        self.registry.for_each_mut(|fd, channel| {
            if channel.supports(Op::PollAdd) {
                pollable_fds.push(fd);
            }
        });
        for fd in pollable_fds {
            let target = userdata::encode(fd, Op::PollAdd, 0);
            if let Err(err) = self.ring.sq.add_poll_remove(fd, target) {
                warn!(fd, %err, "failed to submit poll remove for buffer reconcile");
            }
        }

        let eventfd_user_data = userdata::encode(self.eventfd, Op::EventfdRead, 0);
        if let Err(err) = self.ring.sq.add_read_cancel(self.eventfd, eventfd_user_data) {
            warn!(%err, "failed to cancel eventfd read for buffer reconcile");
        }

        if let Some(prev) = self.armed_timeout.take() {
            let _ = self.ring.sq.add_timeout_remove(prev);
        }
        self.armed_deadline_nanos = None;

        self.ring.submit().map_err(LoopError::SubmitFailed)?;
        Ok(())
    }

    /// Performs the actual `UNREGISTER_BUFFERS`/`REGISTER_BUFFERS` swap, only
    /// reachable once `fixed_buf` reports no fixed-buffer-relevant op is in
    /// flight, then re-arms the eventfd READ that `pause_for_reconcile`
    /// cancelled.
    fn reconcile_buffers(&mut self) -> Result<(), LoopError> {
        match self.ring.unregister_buffers() {
            Ok(()) => {}
            // No buffers were registered yet — not an error.
            Err(RingError::Abi(AbiError::Syscall { source, .. }))
                if source.raw_os_error() == Some(libc::ENXIO) => {}
            Err(other) => return Err(LoopError::SubmitFailed(other)),
        }

        match self.pending_buffer_sizes.take() {
            Some(buf_sizes) => {
                let mut pool = FixedBufferPool::new(&buf_sizes);
                let iovecs = pool.iovecs();
                self.ring
                    .register_buffers(&iovecs)
                    .map_err(LoopError::SubmitFailed)?;
                debug!(buffers = pool.len(), "registered buffers reconciled");
                self.fixed_buffer_pool = Some(pool);
            }
            None => {
                debug!("buffer reconcile ready with no pool requested, leaving buffers unregistered");
                self.fixed_buffer_pool = None;
            }
        }

        self.arm_eventfd()
    }
}
