//! The recorder: mirrors one interpreted execution path into a trace's
//! SSA IR.
//!
//! Grounded in `examples/original_source/src/jit/CodeProfiler.cpp`'s
//! `record_instruction`, generalised from its opcode switch to this
//! crate's closed bytecode set (`SPEC_FULL.md` section 6). The recorder
//! never itself executes bytecode — it runs alongside the real
//! interpreter, reading concrete values only to decide which type to
//! speculate on a fresh `LOAD` and which way a `CONDITIONAL_JUMP`
//! actually went, and mirrors every other opcode's effect purely in
//! terms of its shadow stack and the IR it emits.
//!
//! Every newly-cached local is guarded once with `CHECK_TYPE`
//! (`SPEC_FULL.md` section 8: a trace only ever replays a single
//! concrete type per value); the guard's snapshot resumes interpretation
//! at the very instruction that triggered the read, so a type change is
//! never even partially replayed by native code.

use crate::bytecode::{CodeObject, Ip, Opcode};
use crate::config::JitConfig;
use crate::error::{JitError, JitResult};
use crate::jit::ir::{IrOp, Operand};
use crate::jit::shadow_stack::{ShadowStack, Tag};
use crate::jit::snapshot::Snapshot;
use crate::jit::trace::Trace;
use crate::value::ValueType;
use crate::vm::frame::ValueStack;

/// What a single `record_one` call accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Recording should continue at this bytecode IP.
    Continue(Ip),
    /// The back-edge closed the loop this trace started at: the IR is
    /// complete and ready for the optimiser.
    LoopClosed,
}

/// Per-trace recording state: the shadow stack mirroring the
/// interpreter's value stack for the slots this trace touches.
pub struct Recorder {
    shadow: ShadowStack,
}

impl Recorder {
    /// `stack_len` is the interpreter stack's height when recording
    /// starts; the shadow stack mirrors every absolute slot from 0 up to
    /// that height (`SPEC_FULL.md` section 9: this minimal harness never
    /// recurses, so locals are always absolute stack indices, not
    /// frame-relative ones).
    pub fn new(stack_len: usize) -> Self {
        let mut shadow = ShadowStack::new();
        shadow.resize(stack_len);
        Recorder { shadow }
    }

    /// Record the effect of the bytecode instruction at `ip`. `stack` is
    /// read immutably only for speculative type/branch decisions —
    /// running the instruction for real is the interpreter's job, driven
    /// from the same loop.
    pub fn record_one(
        &mut self,
        trace: &mut Trace,
        cfg: &JitConfig,
        code: &CodeObject,
        stack: &ValueStack,
        ip: Ip,
    ) -> JitResult<RecordOutcome> {
        let opcode = code
            .opcode_at(ip)
            .expect("record_one called at an invalid instruction pointer");

        if !opcode.is_recorder_supported() {
            return Err(JitError::UnsupportedOpcode(opcode.to_u8()));
        }

        match opcode {
            Opcode::Add | Opcode::Subtract | Opcode::Multiply | Opcode::Divide => {
                self.record_arithmetic(trace, cfg, opcode)?;
                Ok(RecordOutcome::Continue(code.ip_after(ip)))
            }

            Opcode::Less | Opcode::Equal => {
                self.record_compare(trace, cfg, opcode)?;
                Ok(RecordOutcome::Continue(code.ip_after(ip)))
            }

            Opcode::GetLocal => {
                let idx = code.byte_at(ip + 1) as usize;
                let load_ref = self.ensure_loaded(trace, cfg, stack, idx, ip)?;
                self.shadow.push(load_ref, Tag::CACHED);
                Ok(RecordOutcome::Continue(code.ip_after(ip)))
            }

            Opcode::SetLocal => {
                let idx = code.byte_at(ip + 1) as usize;
                let value_ref = self.shadow.pop();
                let ty = trace.ir.type_of(value_ref);
                self.emit(trace, cfg, IrOp::Store, ty, [Operand::StackRef(idx), Operand::IrRef(value_ref)])?;
                self.shadow.set(idx, value_ref, Tag::CACHED | Tag::WRITTEN);
                Ok(RecordOutcome::Continue(code.ip_after(ip)))
            }

            Opcode::LoadConstant => {
                let const_idx = code.byte_at(ip + 1) as usize;
                let constant = &code.constants[const_idx];
                let operand = match constant.tag() {
                    ValueType::Float => Operand::LiteralFloat(constant.as_float().unwrap()),
                    ValueType::Bool => Operand::LiteralBool(constant.as_bool().unwrap()),
                    ValueType::Nil => Operand::LiteralNil,
                    ValueType::Object | ValueType::Unknown => {
                        return Err(JitError::UnsupportedOpcode(opcode.to_u8()));
                    }
                };
                let lit_ref = self.emit(trace, cfg, IrOp::Literal, constant.tag(), [operand, Operand::Unused])?;
                self.shadow.push(lit_ref, Tag::CACHED);
                Ok(RecordOutcome::Continue(code.ip_after(ip)))
            }

            Opcode::Pop => {
                self.shadow.pop();
                Ok(RecordOutcome::Continue(code.ip_after(ip)))
            }

            Opcode::ConditionalJump => {
                let offset = code.u16_at(ip + 1) as usize;
                let fallthrough_ip = code.ip_after(ip);
                let jump_ip = fallthrough_ip + offset;

                let condition_ref = self.shadow.top();
                let taken = stack.peek(0).is_truthy();

                let (guard_op, exit_ip, next_ip) = if taken {
                    (IrOp::CheckTrue, jump_ip, fallthrough_ip)
                } else {
                    (IrOp::CheckFalse, fallthrough_ip, jump_ip)
                };
                let guard_ref = self.emit(
                    trace,
                    cfg,
                    guard_op,
                    ValueType::Unknown,
                    [Operand::IrRef(condition_ref), Operand::Unused],
                )?;
                self.push_snapshot(trace, cfg, guard_ref, exit_ip)?;
                Ok(RecordOutcome::Continue(next_ip))
            }

            Opcode::Jump => {
                // Unconditionally taken every time it is recorded: no
                // guard, no IR, just follow the same control edge the
                // interpreter does.
                let offset = code.u16_at(ip + 1) as usize;
                Ok(RecordOutcome::Continue(code.ip_after(ip) + offset))
            }

            Opcode::Loop => {
                let offset = code.u16_at(ip + 1) as usize;
                let target_ip = code
                    .ip_after(ip)
                    .checked_sub(offset)
                    .ok_or(JitError::BadBackBranch(ip))?;

                if target_ip != trace.init_ip {
                    return Err(JitError::BadBackBranch(target_ip));
                }

                self.emit(trace, cfg, IrOp::Loop, ValueType::Unknown, [Operand::JumpOffset(0), Operand::Unused])?;
                self.patch_snaps(trace, target_ip);
                Ok(RecordOutcome::LoopClosed)
            }

            _ => unreachable!("is_recorder_supported() admits only the opcodes matched above"),
        }
    }

    fn record_arithmetic(&mut self, trace: &mut Trace, cfg: &JitConfig, opcode: Opcode) -> JitResult<()> {
        let b = self.shadow.pop();
        let a = self.shadow.pop();
        self.check_float(trace, a)?;
        self.check_float(trace, b)?;
        let op = match opcode {
            Opcode::Add => IrOp::Add,
            Opcode::Subtract => IrOp::Subtract,
            Opcode::Multiply => IrOp::Multiply,
            Opcode::Divide => IrOp::Divide,
            _ => unreachable!(),
        };
        let result = self.emit(trace, cfg, op, ValueType::Float, [Operand::IrRef(a), Operand::IrRef(b)])?;
        self.shadow.push(result, Tag::CACHED);
        Ok(())
    }

    fn record_compare(&mut self, trace: &mut Trace, cfg: &JitConfig, opcode: Opcode) -> JitResult<()> {
        let b = self.shadow.pop();
        let a = self.shadow.pop();
        self.check_float(trace, a)?;
        self.check_float(trace, b)?;
        let op = if opcode == Opcode::Less { IrOp::Less } else { IrOp::Equal };
        let result = self.emit(trace, cfg, op, ValueType::Bool, [Operand::IrRef(a), Operand::IrRef(b)])?;
        self.shadow.push(result, Tag::CACHED);
        Ok(())
    }

    fn check_float(&self, trace: &Trace, ir_ref: usize) -> JitResult<()> {
        let actual = trace.ir.type_of(ir_ref);
        if actual != ValueType::Float {
            return Err(JitError::TypeMismatch { expected: ValueType::Float, actual });
        }
        Ok(())
    }

    /// Load absolute slot `idx` into an IR ref, emitting a `LOAD` plus a
    /// one-time `CHECK_TYPE` guard the first time this trace reads it.
    fn ensure_loaded(&mut self, trace: &mut Trace, cfg: &JitConfig, stack: &ValueStack, idx: usize, ip: Ip) -> JitResult<usize> {
        if self.shadow.has_tag(idx, Tag::CACHED) {
            return Ok(self.shadow.get(idx));
        }
        let ty = stack.slot(idx).tag();
        let load_ref = self.emit(trace, cfg, IrOp::Load, ty, [Operand::StackRef(idx), Operand::Unused])?;
        self.shadow.set(idx, load_ref, Tag::CACHED);

        let guard_ref = self.emit(
            trace,
            cfg,
            IrOp::CheckType,
            ValueType::Unknown,
            [Operand::StackRef(idx), Operand::LiteralFloat(ty as u8 as f64)],
        )?;
        self.push_snapshot(trace, cfg, guard_ref, ip)?;
        Ok(load_ref)
    }

    fn push_snapshot(&mut self, trace: &mut Trace, cfg: &JitConfig, ir_ref: usize, next_ip: Ip) -> JitResult<()> {
        if trace.snapshots.len() >= cfg.max_snapshots {
            return Err(JitError::SnapOverflow);
        }
        trace.snapshots.push(Snapshot::new(ir_ref, next_ip, self.shadow.compress()));
        Ok(())
    }

    /// Snapshots created before the back-edge's target was known (the
    /// type guards on the loop's first iteration) are patched to resume
    /// at the loop's re-entry point, now that `LOOP` has been recorded
    /// (`SPEC_FULL.md` section 11, "patch_snaps").
    fn patch_snaps(&self, trace: &mut Trace, target_ip: Ip) {
        for snapshot in &mut trace.snapshots {
            if snapshot.is_pending() {
                snapshot.next_ip = target_ip;
            }
        }
    }

    fn emit(&mut self, trace: &mut Trace, cfg: &JitConfig, op: IrOp, ty: ValueType, operands: [Operand; 2]) -> JitResult<usize> {
        if trace.ir.len() >= cfg.max_ir_len {
            return Err(JitError::IrOverflow);
        }
        Ok(trace.ir.emit(op, ty, operands))
    }
}
