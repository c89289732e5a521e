//! Channel capability trait and two minimal concrete channels used by the
//! demo binary and integration tests.
//!
//! Per the design notes, channels are modeled as a capability set the loop
//! queries, not as a base class the loop inherits behavior from — the same
//! shape the teacher's `Connection` struct takes (a plain data holder the
//! `io_thread` free functions act on), generalized into a trait object so
//! the registry can hold heterogeneous channel kinds.

use std::os::unix::io::RawFd;

use tracing::trace;

use crate::userdata::Op;

/// Behavior the event loop can invoke on a registered fd once a matching
/// completion arrives. Channels that don't support a given operation (e.g. a
/// listening socket never reads) simply leave that method a no-op.
pub trait Channel: Send {
    fn fd(&self) -> RawFd;

    /// Whether this channel is still considered live. Used by the registry's
    /// fd-reuse reconciliation and by the loop's delayed-close handling.
    fn is_active(&self) -> bool;

    fn read_complete(&mut self, res: i32);
    fn write_complete(&mut self, res: i32);
    fn connect_complete(&mut self, res: i32);
    fn poll_in(&mut self);
    fn poll_out(&mut self);
    fn poll_rd_hup(&mut self);

    /// Invoked once per busy-phase iteration for channels that asked to be
    /// closed but had in-flight I/O at the time.
    fn process_delayed_close(&mut self) {}

    /// Called right after `read_complete`; if the channel has data it wants
    /// written back out, returns the buffer to submit a WRITE against and
    /// marks itself write-in-flight. Channels that never originate writes
    /// from reads (e.g. a plain listener) leave this as the default no-op.
    fn next_write(&mut self) -> Option<(*const u8, u32)> {
        None
    }

    /// Called right after `write_complete`; if the channel wants its next
    /// READ re-armed, returns the buffer to read into and marks itself
    /// read-in-flight.
    fn next_read(&mut self) -> Option<(*mut u8, u32)> {
        None
    }

    fn supports(&self, op: Op) -> bool;
}

/// A connected TCP socket that echoes back whatever it reads, the smallest
/// channel that exercises accept → read → write → read → ... → close.
pub struct EchoChannel {
    fd: RawFd,
    buf: Vec<u8>,
    buf_len: usize,
    /// Set once a read delivers data and cleared once the matching write is
    /// submitted — the handoff between `next_write` and the next `read_complete`.
    write_ready: bool,
    active: bool,
    close_requested: bool,
    read_inflight: bool,
    write_inflight: bool,
}

impl EchoChannel {
    pub fn new(fd: RawFd, read_buf_size: usize) -> Self {
        EchoChannel {
            fd,
            buf: vec![0u8; read_buf_size],
            buf_len: 0,
            write_ready: false,
            active: true,
            close_requested: false,
            read_inflight: false,
            write_inflight: false,
        }
    }

    pub fn request_close(&mut self) {
        self.close_requested = true;
        if !self.has_inflight_io() && !self.write_ready {
            self.active = false;
        }
    }

    pub fn has_inflight_io(&self) -> bool {
        self.read_inflight || self.write_inflight
    }
}

impl Channel for EchoChannel {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn read_complete(&mut self, res: i32) {
        self.read_inflight = false;
        if res <= 0 {
            trace!(fd = self.fd, res, "echo channel read eof or error");
            self.active = false;
            return;
        }
        self.buf_len = res as usize;
        self.write_ready = true;
    }

    fn write_complete(&mut self, res: i32) {
        self.write_inflight = false;
        if res < 0 {
            trace!(fd = self.fd, res, "echo channel write error");
            self.active = false;
        }
    }

    fn connect_complete(&mut self, _res: i32) {}
    fn poll_in(&mut self) {}
    fn poll_out(&mut self) {}

    fn poll_rd_hup(&mut self) {
        self.close_requested = true;
        if !self.has_inflight_io() && !self.write_ready {
            self.active = false;
        }
    }

    fn process_delayed_close(&mut self) {
        if self.close_requested && !self.has_inflight_io() && !self.write_ready {
            self.active = false;
        }
    }

    fn next_write(&mut self) -> Option<(*const u8, u32)> {
        if self.write_ready && !self.write_inflight && self.buf_len > 0 {
            self.write_ready = false;
            self.write_inflight = true;
            Some((self.buf.as_ptr(), self.buf_len as u32))
        } else {
            None
        }
    }

    fn next_read(&mut self) -> Option<(*mut u8, u32)> {
        if !self.read_inflight && !self.close_requested && self.active {
            self.read_inflight = true;
            Some((self.buf.as_mut_ptr(), self.buf.len() as u32))
        } else {
            None
        }
    }

    fn supports(&self, op: Op) -> bool {
        matches!(op, Op::Read | Op::Write | Op::Close | Op::PollAdd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_complete_with_zero_marks_channel_inactive() {
        let mut ch = EchoChannel::new(9, 64);
        assert!(ch.next_read().is_some());
        ch.read_complete(0);
        assert!(!ch.is_active());
    }

    #[test]
    fn successful_read_is_echoed_back_then_rearms_the_read() {
        let mut ch = EchoChannel::new(9, 64);
        assert!(ch.next_read().is_some());
        ch.read_complete(4);
        let (_ptr, len) = ch.next_write().expect("data read should be queued for write");
        assert_eq!(len, 4);
        assert!(ch.next_write().is_none(), "write already taken, not duplicated");
        ch.write_complete(4);
        assert!(ch.next_read().is_some(), "next read should be armed after the echo write");
    }

    #[test]
    fn close_request_waits_for_inflight_io_to_drain() {
        let mut ch = EchoChannel::new(9, 64);
        ch.next_read();
        ch.read_complete(4);
        ch.next_write();
        ch.request_close();
        assert!(ch.is_active(), "still has in-flight I/O");
        ch.write_complete(4);
        ch.process_delayed_close();
        assert!(!ch.is_active());
    }

    #[test]
    fn close_request_with_no_inflight_io_closes_immediately() {
        let mut ch = EchoChannel::new(9, 64);
        ch.request_close();
        assert!(!ch.is_active());
    }

    #[test]
    fn echo_channel_supports_read_write_close_and_poll_only() {
        let ch = EchoChannel::new(3, 64);
        assert!(ch.supports(Op::Read));
        assert!(ch.supports(Op::Write));
        assert!(!ch.supports(Op::Connect));
    }
}
