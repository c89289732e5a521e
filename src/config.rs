//! Event-loop sizing and operational configuration.
//!
//! Same shape as the teacher's own `config.rs`: plain `pub const` sizing
//! knobs plus `const _: () = assert!(...)` compile-time invariants, just
//! retargeted at ring/timer/task tunables instead of disruptor sizing.

/// Default submission/completion ring size (entries), rounded up to the next
/// power of two by the kernel if it isn't already one.
pub const DEFAULT_RING_ENTRIES: u32 = 256;

/// Per-connection read buffer size (bytes).
pub const READ_BUF_SIZE: usize = 65536;

/// Upper bound on how long a single `submit_and_wait` may block even with no
/// deadline armed, so a loop with no channels and no pending shutdown still
/// wakes up periodically to re-check `confirm_shutdown`.
pub const MAX_BLOCK_NANOS: u64 = 5_000_000_000;

/// Cooldown applied after a `LoopException` before the busy phase resumes.
pub const LOOP_EXCEPTION_COOLDOWN_MS: u64 = 1_000;

const _: () = assert!(
    DEFAULT_RING_ENTRIES.is_power_of_two(),
    "ring entries should be a power of two to avoid kernel-side rounding surprises"
);
const _: () = assert!(
    MAX_BLOCK_NANOS > 0,
    "a zero max block would spin the loop with no deadline"
);
