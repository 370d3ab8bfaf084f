//! The trace dispatcher: the only place native code is actually entered.
//!
//! Grounded in `SPEC_FULL.md` section 4.6 ("Trace dispatcher and
//! deoptimisation"). The emitted entry point has signature
//! `extern "C" fn(stack_base: *mut Value) -> u64`, returning the exit
//! number of the snapshot the trace left through — see
//! `crate::jit::assembler::emit` for why this stands in for a separate
//! native-to-native tail call to an exit handler.

use log::{debug, trace as log_trace, warn};

use crate::bytecode::Ip;
use crate::jit::trace::Trace;
use crate::value::Value;
use crate::vm::frame::ValueStack;

type TraceEntry = extern "C" fn(*mut Value) -> u64;

pub struct Dispatcher;

/// Result of one call into native code.
#[derive(Debug, Clone, Copy)]
pub struct ExitOutcome {
    pub exit_number: usize,
    pub next_ip: Ip,
}

impl Dispatcher {
    /// Transfer control to `trace`'s native code. The trace's own exit
    /// stub has already flushed any stack-resident values the snapshot
    /// requires before returning, so the interpreter's stack is
    /// consistent the moment this call returns (`SPEC_FULL.md` section 9,
    /// "Interpreter stack").
    pub fn enter_trace(trace: &mut Trace, stack: &mut ValueStack) -> ExitOutcome {
        debug_assert!(trace.is_compiled(), "enter_trace called on an uncompiled trace");

        log_trace!("entering trace @ {:#06x}", trace.init_ip);

        // SAFETY: `trace.entry_ptr()` is locked read-execute memory
        // produced by `assembler::emit::assemble`, matching the
        // `TraceEntry` signature exactly; `stack.base_ptr()` is valid for
        // the lifetime of this call since `stack` outlives it.
        let entry: TraceEntry = unsafe { std::mem::transmute(trace.entry_ptr()) };
        let exit_number = entry(stack.base_ptr_mut()) as usize;

        let snapshot = trace
            .snapshots
            .get_mut(exit_number)
            .expect("native code returned an exit number outside this trace's snapshot table");
        snapshot.fail_count += 1;

        if snapshot.fail_count == 1 {
            debug!(
                "trace @ {:#06x} first exit through snapshot {exit_number}, resuming at {:#06x}",
                trace.init_ip, snapshot.next_ip
            );
        } else if snapshot.fail_count.is_power_of_two() {
            warn!(
                "trace @ {:#06x} snapshot {exit_number} has failed {} times",
                trace.init_ip, snapshot.fail_count
            );
        }

        ExitOutcome {
            exit_number,
            next_ip: snapshot.next_ip,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::CodeObject;
    use crate::config::JitConfig;
    use crate::jit::assembler::emit::{allocatable_registers, assemble};
    use crate::jit::ir::{IrOp, Operand};
    use crate::jit::regalloc::RegisterAllocator;
    use crate::jit::snapshot::Snapshot;
    use crate::value::ValueType;
    use std::rc::Rc;

    #[test]
    fn round_trips_a_compiled_add_and_deopt() {
        let cfg = JitConfig::default();
        let mut trace = Trace::new(0, Rc::new(CodeObject::new("t")), 0);

        let a = trace.ir.emit(IrOp::Load, ValueType::Float, [Operand::StackRef(0), Operand::Unused]);
        let b = trace.ir.emit(IrOp::Literal, ValueType::Float, [Operand::LiteralFloat(1.0), Operand::Unused]);
        let sum = trace.ir.emit(IrOp::Add, ValueType::Float, [Operand::IrRef(a), Operand::IrRef(b)]);
        trace.ir.emit(IrOp::Store, ValueType::Float, [Operand::StackRef(0), Operand::IrRef(sum)]);
        trace.ir.emit(IrOp::Return, ValueType::Nil, [Operand::Unused, Operand::Unused]);
        trace.snapshots.push(Snapshot::new(4, 0x20, Vec::new()));

        let (gprs, xmms) = allocatable_registers(&cfg);
        RegisterAllocator::new(&gprs, &xmms).allocate(&mut trace).unwrap();
        assemble(&mut trace, &cfg).unwrap();

        let mut stack = ValueStack::new();
        stack.push(Value::float(41.0));

        let outcome = Dispatcher::enter_trace(&mut trace, &mut stack);
        assert_eq!(outcome.exit_number, 0);
        assert_eq!(outcome.next_ip, 0x20);
        assert_eq!(stack.slot(0).as_float(), Some(42.0));
    }
}
