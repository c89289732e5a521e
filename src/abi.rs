//! Raw Linux io_uring kernel ABI: syscall wrappers and wire-exact struct layouts.
//!
//! Nothing in this module is safe to call without upholding the kernel's own
//! invariants (valid fds, correctly sized/aligned mmap regions, single-writer
//! discipline on the rings). Higher layers (`ring`, `squeue`, `cqueue`) are
//! where those invariants get enforced.

use std::io;

use crate::error::AbiError;

// Syscall numbers are not exposed by libc for io_uring; mirrored here the way
// `io-uring-sys` and the vendored `io-uring` crate do, per the published
// x86_64 Linux syscall table.
#[cfg(target_arch = "x86_64")]
mod syscall_no {
    pub const SETUP: libc::c_long = 425;
    pub const ENTER: libc::c_long = 426;
    pub const REGISTER: libc::c_long = 427;
}
#[cfg(target_arch = "aarch64")]
mod syscall_no {
    pub const SETUP: libc::c_long = 425;
    pub const ENTER: libc::c_long = 426;
    pub const REGISTER: libc::c_long = 427;
}

/// mmap offsets for the three regions the kernel hands back from `io_uring_setup`.
pub const IORING_OFF_SQ_RING: libc::off_t = 0;
pub const IORING_OFF_CQ_RING: libc::off_t = 0x8000000;
pub const IORING_OFF_SQES: libc::off_t = 0x1000_0000;

pub const IORING_SETUP_SQPOLL: u32 = 1 << 1;
pub const IORING_SETUP_CQSIZE: u32 = 1 << 3;
pub const IORING_FEAT_SINGLE_MMAP: u32 = 1 << 0;
pub const IORING_FEAT_NODROP: u32 = 1 << 1;

pub const IORING_ENTER_GETEVENTS: u32 = 1 << 0;

pub const IORING_REGISTER_BUFFERS: libc::c_uint = 0;
pub const IORING_UNREGISTER_BUFFERS: libc::c_uint = 1;

/// Offsets of the shared head/tail/flags/array fields within the SQ ring mmap.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SqRingOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub flags: u32,
    pub dropped: u32,
    pub array: u32,
    pub resv1: u32,
    pub resv2: u64,
}

/// Offsets of the shared head/tail/overflow/cqes fields within the CQ ring mmap.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct CqRingOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub overflow: u32,
    pub cqes: u32,
    pub flags: u32,
    pub resv1: u32,
    pub resv2: u64,
}

/// `struct io_uring_params`, filled in by the kernel on `io_uring_setup`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct IoUringParams {
    pub sq_entries: u32,
    pub cq_entries: u32,
    pub flags: u32,
    pub sq_thread_cpu: u32,
    pub sq_thread_idle: u32,
    pub features: u32,
    pub wq_fd: u32,
    pub resv: [u32; 3],
    pub sq_off: SqRingOffsets,
    pub cq_off: CqRingOffsets,
}

const _: () = assert!(std::mem::size_of::<IoUringParams>() == 120);
const _: () = assert!(std::mem::size_of::<SqRingOffsets>() == 40);
const _: () = assert!(std::mem::size_of::<CqRingOffsets>() == 40);

/// A submission queue entry, bit-exact with `struct io_uring_sqe` (64 bytes).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Sqe {
    pub opcode: u8,
    pub flags: u8,
    pub ioprio: u16,
    pub fd: i32,
    pub off: u64,
    pub addr: u64,
    pub len: u32,
    pub op_flags: u32,
    pub user_data: u64,
    pub buf_index_or_group: u16,
    pub personality: u16,
    pub splice_fd_in_or_file_index: i32,
    pub pad: [u64; 2],
}

const _: () = assert!(std::mem::size_of::<Sqe>() == 64);

impl Default for Sqe {
    fn default() -> Self {
        // SAFETY: all-zero is a valid bit pattern for every field above (plain
        // integers, no niches, no padding that must be anything but zero).
        unsafe { std::mem::zeroed() }
    }
}

/// A completion queue entry, bit-exact with `struct io_uring_cqe` (16 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Cqe {
    pub user_data: u64,
    pub res: i32,
    pub flags: u32,
}

const _: () = assert!(std::mem::size_of::<Cqe>() == 16);

/// `struct __kernel_timespec`, the only timespec layout the io_uring TIMEOUT
/// opcode accepts (distinct from libc's `timespec`, which is 32-bit `tv_sec`
/// on some ABIs).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct KernelTimespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

impl KernelTimespec {
    pub fn from_nanos(nanos: u64) -> Self {
        // Open Question resolution: the modulo form, never the lossy
        // division-by-1e9 form that drifts as nanos grows.
        KernelTimespec {
            tv_sec: (nanos / 1_000_000_000) as i64,
            tv_nsec: (nanos % 1_000_000_000) as i64,
        }
    }
}

/// Submission-queue entry opcodes, values taken verbatim from the kernel UAPI
/// header `include/uapi/linux/io_uring.h`.
pub mod opcode {
    pub const NOP: u8 = 0;
    pub const READV: u8 = 1;
    pub const WRITEV: u8 = 2;
    pub const POLL_ADD: u8 = 6;
    pub const POLL_REMOVE: u8 = 7;
    pub const TIMEOUT: u8 = 11;
    pub const TIMEOUT_REMOVE: u8 = 12;
    pub const ACCEPT: u8 = 13;
    pub const ASYNC_CANCEL: u8 = 14;
    pub const CONNECT: u8 = 16;
    pub const CLOSE: u8 = 19;
    pub const READ: u8 = 22;
    pub const WRITE: u8 = 23;
    pub const READ_FIXED: u8 = 4;
    pub const WRITE_FIXED: u8 = 5;
}

bitflags::bitflags! {
    /// `poll(2)`-style event bits accepted by POLL_ADD's `op_flags` field,
    /// values taken verbatim from the kernel UAPI header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollMask: u16 {
        const POLLIN = 0x0001;
        const POLLOUT = 0x0004;
        const POLLERR = 0x0008;
        const POLLHUP = 0x0010;
        const POLLRDHUP = 0x2000;
    }
}

/// Kept for call sites that want the bare constants rather than the
/// [`PollMask`] bitflags type.
pub mod poll_mask {
    pub const POLLIN: u32 = super::PollMask::POLLIN.bits() as u32;
    pub const POLLOUT: u32 = super::PollMask::POLLOUT.bits() as u32;
    pub const POLLERR: u32 = super::PollMask::POLLERR.bits() as u32;
    pub const POLLHUP: u32 = super::PollMask::POLLHUP.bits() as u32;
    pub const POLLRDHUP: u32 = super::PollMask::POLLRDHUP.bits() as u32;
}

/// `io_uring_setup(2)`.
pub fn io_uring_setup(entries: u32, params: &mut IoUringParams) -> Result<i32, AbiError> {
    let ret = unsafe {
        libc::syscall(
            syscall_no::SETUP,
            entries as libc::c_long,
            params as *mut IoUringParams as libc::c_long,
        )
    };
    if ret < 0 {
        return Err(AbiError::Syscall {
            call: "io_uring_setup",
            source: io::Error::last_os_error(),
        });
    }
    Ok(ret as i32)
}

/// `io_uring_enter(2)`.
///
/// # Safety
/// `fd` must be a live io_uring instance fd, and the submission/completion
/// rings backing it must currently reflect `to_submit` queued entries.
pub unsafe fn io_uring_enter(
    fd: i32,
    to_submit: u32,
    min_complete: u32,
    flags: u32,
) -> Result<i32, AbiError> {
    let ret = unsafe {
        libc::syscall(
            syscall_no::ENTER,
            fd as libc::c_long,
            to_submit as libc::c_long,
            min_complete as libc::c_long,
            flags as libc::c_long,
            std::ptr::null::<u8>() as libc::c_long,
            0 as libc::c_long,
        )
    };
    if ret < 0 {
        return Err(AbiError::Syscall {
            call: "io_uring_enter",
            source: io::Error::last_os_error(),
        });
    }
    Ok(ret as i32)
}

/// `io_uring_register(2)`.
///
/// # Safety
/// `arg` must point to a valid argument block of `nr_args` matching
/// `opcode`'s expected layout for the lifetime of the call.
pub unsafe fn io_uring_register(
    fd: i32,
    opcode: libc::c_uint,
    arg: *const libc::c_void,
    nr_args: libc::c_uint,
) -> Result<i32, AbiError> {
    let ret = unsafe {
        libc::syscall(
            syscall_no::REGISTER,
            fd as libc::c_long,
            opcode as libc::c_long,
            arg as libc::c_long,
            nr_args as libc::c_long,
        )
    };
    if ret < 0 {
        return Err(AbiError::Syscall {
            call: "io_uring_register",
            source: io::Error::last_os_error(),
        });
    }
    Ok(ret as i32)
}
