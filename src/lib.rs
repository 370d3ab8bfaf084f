//! A trace-based JIT compiler for a small bytecode VM.
//!
//! [`jit`] is the system this crate specifies: hot-loop detection, trace
//! recording into an SSA IR, loop peeling, linear-scan register
//! allocation, and x86-64 machine-code emission, behind the [`jit::Jit`]
//! facade. [`vm`] is the minimal harness interpreter that drives it
//! end-to-end (`SPEC_FULL.md` section 10.5) — not part of this crate's
//! own specified surface, but needed for this repository to build and
//! run without an external host VM.

pub mod bytecode;
pub mod config;
pub mod error;
pub mod jit;
pub mod value;
pub mod vm;

pub use config::JitConfig;
pub use error::{JitError, JitResult};
pub use jit::Jit;
pub use value::{Value, ValueType};
pub use vm::{InterpretError, Interpreter};
