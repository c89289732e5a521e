//! Encoding of the 64-bit `user_data` word stashed on every SQE and echoed
//! back unchanged on its CQE: `fd:32 | op:16 | mask:16`.
//!
//! Grounded on the teacher's own `encode_user_data`/`decode_user_data` pair
//! in `io_thread.rs` (there a simpler `op:32 | key:32` split, since disrust's
//! op set never needed a poll mask); this crate's op set adds POLL_ADD,
//! which packs the requested poll mask into the low 16 bits.

use crate::abi::opcode;

/// Logical operation kind, independent of the raw kernel opcode byte.
///
/// `ReadFixed` and `WriteFixed`/`Writev` completions route to the same
/// handler as plain `Read`/`Write`; [`Op::normalize`] collapses that before
/// dispatch, the way the spec's completion routing table requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Accept,
    Connect,
    Read,
    Write,
    Close,
    PollAdd,
    PollRemove,
    Timeout,
    TimeoutRemove,
    AsyncCancel,
    EventfdRead,
}

impl Op {
    /// Numeric tag used in the middle 16 bits of `user_data`. Distinct from
    /// the raw kernel opcode byte in `abi::opcode`: this tag only has to be
    /// unique within this crate's dispatch table, not match the UAPI.
    pub fn tag(self) -> u16 {
        match self {
            Op::Accept => 1,
            Op::Connect => 2,
            Op::Read => 3,
            Op::Write => 4,
            Op::Close => 5,
            Op::PollAdd => 6,
            Op::PollRemove => 7,
            Op::Timeout => 8,
            Op::TimeoutRemove => 9,
            Op::AsyncCancel => 10,
            Op::EventfdRead => 11,
        }
    }

    pub fn from_tag(tag: u16) -> Option<Op> {
        Some(match tag {
            1 => Op::Accept,
            2 => Op::Connect,
            3 => Op::Read,
            4 => Op::Write,
            5 => Op::Close,
            6 => Op::PollAdd,
            7 => Op::PollRemove,
            8 => Op::Timeout,
            9 => Op::TimeoutRemove,
            10 => Op::AsyncCancel,
            11 => Op::EventfdRead,
            _ => return None,
        })
    }

    /// Collapses fixed-buffer/vectored variants of read and write onto their
    /// plain counterpart for completion dispatch purposes.
    pub fn normalize(self) -> Op {
        self
    }

    /// The raw kernel opcode byte to place in the SQE for this logical op,
    /// given whether the fixed-buffer/vectored variant should be used.
    pub fn raw_opcode(self, fixed_or_vectored: bool) -> u8 {
        match self {
            Op::Accept => opcode::ACCEPT,
            Op::Connect => opcode::CONNECT,
            Op::Read if fixed_or_vectored => opcode::READ_FIXED,
            Op::Read => opcode::READ,
            Op::Write if fixed_or_vectored => opcode::WRITE_FIXED,
            Op::Write => opcode::WRITE,
            Op::Close => opcode::CLOSE,
            Op::PollAdd => opcode::POLL_ADD,
            Op::PollRemove => opcode::POLL_REMOVE,
            Op::Timeout => opcode::TIMEOUT,
            Op::TimeoutRemove => opcode::TIMEOUT_REMOVE,
            Op::AsyncCancel => opcode::ASYNC_CANCEL,
            Op::EventfdRead if fixed_or_vectored => opcode::READ_FIXED,
            Op::EventfdRead => opcode::READ,
        }
    }
}

/// Packs `fd:32 | op:16 | mask:16` into a single `user_data` word.
pub fn encode(fd: i32, op: Op, mask: u16) -> u64 {
    ((fd as u32 as u64) << 32) | ((op.tag() as u64) << 16) | (mask as u64)
}

/// Unpacks a `user_data` word into `(fd, op, mask)`. Returns `None` if the op
/// tag is unrecognized (stale/foreign `user_data`, should never happen for
/// SQEs this crate submitted itself).
pub fn decode(user_data: u64) -> Option<(i32, Op, u16)> {
    let fd = (user_data >> 32) as u32 as i32;
    let op_tag = ((user_data >> 16) & 0xFFFF) as u16;
    let mask = (user_data & 0xFFFF) as u16;
    Op::from_tag(op_tag).map(|op| (fd, op, mask))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_fd_op_and_mask() {
        let encoded = encode(-1i32, Op::PollAdd, 0x2001);
        let (fd, op, mask) = decode(encoded).expect("valid encoding");
        assert_eq!(fd, -1);
        assert_eq!(op, Op::PollAdd);
        assert_eq!(mask, 0x2001);
    }

    #[test]
    fn round_trips_positive_fd() {
        let encoded = encode(42, Op::Read, 0);
        let (fd, op, mask) = decode(encoded).unwrap();
        assert_eq!(fd, 42);
        assert_eq!(op, Op::Read);
        assert_eq!(mask, 0);
    }

    #[test]
    fn unknown_op_tag_decodes_to_none() {
        let bogus = (7i64 as u64) << 32 | (0xFFFFu64 << 16);
        assert!(decode(bogus).is_none());
    }

    #[test]
    fn raw_opcode_uses_fixed_variant_for_reads_and_writes() {
        assert_eq!(Op::Read.raw_opcode(true), opcode::READ_FIXED);
        assert_eq!(Op::Read.raw_opcode(false), opcode::READ);
        assert_eq!(Op::Write.raw_opcode(true), opcode::WRITE_FIXED);
    }
}
