//! Bytecode representation shared by the interpreter and the JIT recorder.

pub mod code_object;
pub mod opcode;

pub use code_object::{CodeObject, Ip};
pub use opcode::Opcode;
