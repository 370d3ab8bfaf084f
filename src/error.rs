//! JIT-internal error taxonomy.
//!
//! Every fallible step of the recording/optimisation/allocation/assembly
//! pipeline returns `Result<_, JitError>`. None of these ever escape the
//! public entry points in [`crate::jit`] as a program-visible error: the
//! pipeline driver observes them, logs them, and converts them into an
//! abort-and-blacklist decision. See `SPEC_FULL.md` section 7.

use crate::value::ValueType;

/// Something went wrong while recording, optimising, allocating, or
/// assembling a trace. Always handled locally; never surfaced to the
/// script being interpreted.
#[derive(Debug, thiserror::Error)]
pub enum JitError {
    #[error("unsupported opcode 0x{0:02x} encountered while recording")]
    UnsupportedOpcode(u8),

    #[error("type mismatch during recording: expected {expected:?}, got {actual:?}")]
    TypeMismatch {
        expected: ValueType,
        actual: ValueType,
    },

    #[error("IR buffer exceeded configured length limit")]
    IrOverflow,

    #[error("snapshot vector exceeded configured length limit")]
    SnapOverflow,

    #[error("register allocation failed: {0}")]
    AllocatorFailure(String),

    #[error("optimisation pass failed: {0}")]
    OptimiserFailure(String),

    #[error("x86-64 encoding error: {0}")]
    EncodingError(String),

    #[error("mprotect failed while finalising trace: {0}")]
    MProtectFailure(#[source] std::io::Error),

    #[error("recording aborted: back-branch target 0x{0:04x} is not the trace entry")]
    BadBackBranch(usize),
}

/// Convenience alias used throughout the pipeline.
pub type JitResult<T> = Result<T, JitError>;
