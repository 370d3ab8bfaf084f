//! `Trace`: the ownership root for one recorded loop.
//!
//! Grounded in `SPEC_FULL.md` section 3 and the original source's
//! `Trace` struct (referenced throughout `CodeProfiler.cpp`/
//! `RegisterAllocator.cpp`). All IR refs, snapshot indices, and
//! allocation-map entries are indices into vectors owned here — the
//! "index-based handles into arrays owned by the Trace" design note in
//! section 9. Nothing outside a `Trace` holds a raw pointer into its
//! buffers after assembly.

use std::rc::Rc;

use crate::bytecode::{CodeObject, Ip};
use crate::jit::assembler::wrapper::AssemblyWrapper;
use crate::jit::ir::IrBuffer;
use crate::jit::regalloc::Allocation;
use crate::jit::snapshot::Snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceState {
    Recording,
    IrComplete,
    Compiled,
    Failed,
    Blacklisted,
}

pub struct Trace {
    /// Bytecode IP this trace was recorded from; also its TraceCache key.
    pub init_ip: Ip,
    pub code: Rc<CodeObject>,
    /// Base index into the interpreter's value stack at recording start.
    pub stack_base: usize,
    pub ir: IrBuffer,
    pub snapshots: Vec<Snapshot>,
    /// `None` until the register allocator runs; one entry per IR ref.
    pub allocation_map: Vec<Option<Allocation>>,
    pub state: TraceState,
    /// Finalised machine code, present only once `state == Compiled`.
    pub native: Option<AssemblyWrapper>,
    /// Byte offset of each snapshot's exit stub within `native`, filled in
    /// by the assembler during emission.
    pub exit_stub_offsets: Vec<usize>,
}

impl Trace {
    pub fn new(init_ip: Ip, code: Rc<CodeObject>, stack_base: usize) -> Self {
        Trace {
            init_ip,
            code,
            stack_base,
            ir: IrBuffer::new(),
            snapshots: Vec::new(),
            allocation_map: Vec::new(),
            state: TraceState::Recording,
            native: None,
            exit_stub_offsets: Vec::new(),
        }
    }

    pub fn is_compiled(&self) -> bool {
        self.state == TraceState::Compiled
    }

    /// Entry point of the native code, valid once `state == Compiled`.
    pub fn entry_ptr(&self) -> *const u8 {
        self.native
            .as_ref()
            .expect("entry_ptr called before trace was compiled")
            .start()
    }
}

impl std::fmt::Display for Trace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "trace @ {:#06x} ({} instrs, {} snapshots, state={:?})",
            self.init_ip,
            self.ir.len(),
            self.snapshots.len(),
            self.state
        )?;
        write!(f, "{}", self.ir)
    }
}
