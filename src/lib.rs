//! An io_uring-backed single-threaded event loop: submission/completion
//! rings built directly on the raw kernel ABI, a lock-free cross-thread task
//! queue, an eventfd wake-up protocol, and a small channel registry on top.
//!
//! `event_loop` is the only module the demo binary drives directly; the rest
//! are exposed so integration tests can exercise the ring math and ABI
//! plumbing without needing a live io_uring-capable kernel for every case.

pub mod abi;
pub mod channel;
pub mod config;
pub mod cqueue;
pub mod error;
pub mod event_loop;
pub mod fixed_buf;
pub mod metrics;
pub mod mmap;
pub mod registry;
pub mod ring;
pub mod squeue;
pub mod tasks;
pub mod userdata;
pub mod wakeup;

/// Best-effort runtime probe for whether this kernel supports io_uring at
/// all, so integration tests can skip cleanly on a sandboxed/older kernel
/// instead of failing the whole suite.
pub fn io_uring_available() -> bool {
    let mut params = abi::IoUringParams::default();
    match abi::io_uring_setup(2, &mut params) {
        Ok(fd) => {
            unsafe { libc::close(fd) };
            true
        }
        Err(_) => false,
    }
}
