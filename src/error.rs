//! Error types for every component boundary in the event loop.
//!
//! Mirrors the teacher's small hand-rolled error enums (`buffer_pool::AllocError`)
//! in shape, but derives `Display`/`Error` via `thiserror` instead of writing
//! `impl fmt::Display` by hand.

use thiserror::Error;

/// Errors from the raw kernel ABI layer (`abi`, `mmap`).
#[derive(Debug, Error)]
pub enum AbiError {
    #[error("{call} failed: {source}")]
    Syscall {
        call: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("mmap of {len} bytes at offset {offset:#x} failed: {source}")]
    Mmap {
        len: usize,
        offset: i64,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced while pushing to or draining a ring.
#[derive(Debug, Error)]
pub enum RingError {
    #[error("submission queue is full")]
    SubmitQueueFull,
    #[error("submit() returned fewer entries accepted ({accepted}) than queued ({queued})")]
    PartialSubmit { queued: usize, accepted: usize },
    #[error(transparent)]
    Abi(#[from] AbiError),
}

/// Errors the event loop classifies per its retry/cooldown policy.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("submit failed: {0}")]
    SubmitFailed(#[source] RingError),
    #[error("completion reported error: op={op:?} res={res}")]
    CompletionError { op: &'static str, res: i32 },
    #[error("task panicked during busy phase: {0}")]
    LoopException(String),
}
