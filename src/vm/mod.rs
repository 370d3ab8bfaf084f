//! The minimal harness interpreter (`SPEC_FULL.md` section 10.5).
//!
//! Not a general-purpose implementation of the source language — no
//! classes, closures, or GC. Just enough of a fetch-decode-execute loop
//! over [`crate::bytecode::CodeObject`] to drive the JIT with a real
//! bytecode stream and a real stack, with the two hook points
//! (`Jit::handle_basic_block_head` at every back-edge, `Jit::enter_trace`
//! when one is installed) that make this a tracing-JIT host rather than
//! a plain bytecode VM.

pub mod frame;
pub mod interpreter;

pub use frame::{StackFrame, ValueStack};
pub use interpreter::{InterpretError, Interpreter};
