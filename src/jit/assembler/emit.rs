//! The emission pass: walks a trace's allocated IR and produces machine
//! code into an [`AssemblyWrapper`], per `SPEC_FULL.md` section 4.5.
//!
//! Grounded in `examples/original_source/src/jit/AssemblerX86.hpp`'s
//! `assemble()` entry point, generalised from its template-per-backend
//! shape to a single function over this crate's closed [`IrOp`] set.
//!
//! Calling convention for the emitted function:
//! `extern "C" fn(stack_base: *mut Value) -> u64` (`rdi` = stack base,
//! SysV AMD64). The prologue moves it into the reserved cursor GPR for
//! the trace's lifetime; the other two reserved registers (`scratch.gpr`,
//! `scratch.xmm`) are spill round-trip registers for integer/boolean and
//! floating-point operands respectively. The return value in `rax` is
//! the exit number of the snapshot the trace left through.
//!
//! An exit stub first flushes every stack slot the snapshot marks as
//! cached-but-not-written (see [`crate::jit::shadow_stack::Tag`]) back to
//! the interpreter's value stack — tag byte and payload both, since a
//! value computed entirely inside the trace may never have had a valid
//! tag in that slot — *then* restores `rsp`/`rbp` and returns the exit
//! number. `SPEC_FULL.md` section 4.6 describes this as the native code
//! "tail-calling the exit handler"; this implementation inlines that
//! handler's only real job (locating `next_ip` from the exit number) into
//! [`crate::jit::dispatcher::Dispatcher::enter_trace`] on the Rust side
//! instead of jumping into a second raw function pointer, since the two
//! are equivalent here (there is no side-trace chaining to a third
//! native target in this implementation's Non-goals scope) and avoiding
//! the jump removes an entire class of ABI mismatches this project has
//! no toolchain available to catch.

use crate::config::JitConfig;
use crate::error::{JitError, JitResult};
use crate::jit::assembler::wrapper::AssemblyWrapper;
use crate::jit::assembler::x86_64::{Condition, Gpr, X86Encoder, Xmm};
use crate::jit::ir::{IrOp, Operand};
use crate::jit::regalloc::Allocation;
use crate::jit::shadow_stack::Tag;
use crate::jit::trace::{Trace, TraceState};
use crate::value::ValueType;

const VALUE_SIZE: i32 = 16;
const TAG_OFFSET: i32 = 0;
const PAYLOAD_OFFSET: i32 = crate::value::Value::PAYLOAD_OFFSET as i32;

#[derive(Clone, Copy)]
enum JumpTarget {
    Ir(usize),
    Snapshot(usize),
}

struct Emitter<'a> {
    buf: AssemblyWrapper,
    cfg: &'a JitConfig,
    base_reg: Gpr,
    scratch_xmm: Xmm,
    scratch_gpr2: Gpr,
    ir_offset: Vec<Option<usize>>,
    pending: Vec<(usize, JumpTarget)>,
    snapshot_stub_offset: Vec<usize>,
}

fn gpr_pool(cfg: &JitConfig) -> Vec<u8> {
    (0u8..16)
        .filter(|r| {
            *r != cfg.scratch.gpr as u8
                && *r != cfg.scratch.cursor as u8
                && *r != Gpr::RSP.0
                && *r != Gpr::RBP.0
        })
        .collect()
}

fn xmm_pool(cfg: &JitConfig) -> Vec<u8> {
    (0u8..16).filter(|r| *r != cfg.scratch.xmm as u8).collect()
}

/// Register pools available to [`crate::jit::regalloc::RegisterAllocator`]
/// after excluding this module's three reserved scratch registers.
pub fn allocatable_registers(cfg: &JitConfig) -> (Vec<u8>, Vec<u8>) {
    (gpr_pool(cfg), xmm_pool(cfg))
}

/// Assemble `trace`'s IR (already peeled, optimised, and register-
/// allocated) into native code, locking the buffer and installing it.
pub fn assemble(trace: &mut Trace, cfg: &JitConfig) -> JitResult<()> {
    if trace.allocation_map.len() != trace.ir.len() {
        return Err(JitError::EncodingError(
            "assemble called before register allocation".into(),
        ));
    }

    let mut emitter = Emitter {
        buf: AssemblyWrapper::with_default_reserve()?,
        cfg,
        base_reg: Gpr(cfg.scratch.cursor as u8),
        scratch_xmm: Xmm(cfg.scratch.xmm as u8),
        scratch_gpr2: Gpr(cfg.scratch.gpr as u8),
        ir_offset: vec![None; trace.ir.len()],
        pending: Vec::new(),
        snapshot_stub_offset: vec![0; trace.snapshots.len()],
    };

    emitter.prologue()?;

    for ir_ref in 0..trace.ir.len() {
        emitter.ir_offset[ir_ref] = Some(emitter.buf.size());
        emitter.emit_instr(trace, ir_ref)?;
    }

    for snapshot_index in 0..trace.snapshots.len() {
        emitter.snapshot_stub_offset[snapshot_index] = emitter.buf.size();
        emitter.emit_exit_stub(trace, snapshot_index)?;
    }

    emitter.resolve_pending(trace)?;

    trace.exit_stub_offsets = emitter.snapshot_stub_offset.clone();
    emitter.buf.lock()?;
    trace.native = Some(emitter.buf);
    trace.state = TraceState::Compiled;
    Ok(())
}

impl<'a> Emitter<'a> {
    /// `extern "C" fn(stack_base: *mut Value) -> u64` — `rdi` holds
    /// `stack_base`, moved into the reserved cursor register for the rest
    /// of the trace's lifetime.
    fn prologue(&mut self) -> JitResult<()> {
        X86Encoder::push(&mut self.buf, Gpr::RBP)?;
        X86Encoder::mov_reg_reg(&mut self.buf, Gpr::RBP, Gpr::RSP)?;
        X86Encoder::mov_reg_reg(&mut self.buf, self.base_reg, Gpr::RDI)?;
        Ok(())
    }

    fn stack_slot_disp(slot: usize, field_offset: i32) -> i32 {
        slot as i32 * VALUE_SIZE + field_offset
    }

    fn spill_disp(slot: usize) -> i32 {
        -((slot as i32 + 1) * 8)
    }

    fn load_float(&mut self, trace: &Trace, operand: Operand) -> JitResult<Xmm> {
        match operand {
            Operand::IrRef(r) => match trace.allocation_map[r] {
                Some(Allocation::Xmm(x)) => Ok(Xmm(x)),
                Some(Allocation::Spill(s)) => {
                    X86Encoder::movsd_reg_mem(&mut self.buf, self.scratch_xmm, Gpr::RBP, Self::spill_disp(s))?;
                    Ok(self.scratch_xmm)
                }
                _ => Err(JitError::EncodingError(format!("ir ref {r} has no float allocation"))),
            },
            Operand::LiteralFloat(v) => {
                X86Encoder::mov_reg_imm64(&mut self.buf, self.scratch_gpr2, v.to_bits())?;
                X86Encoder::movq_xmm_gpr(&mut self.buf, self.scratch_xmm, self.scratch_gpr2)?;
                Ok(self.scratch_xmm)
            }
            other => Err(JitError::EncodingError(format!("{other} is not a float operand"))),
        }
    }

    fn load_gpr(&mut self, trace: &Trace, operand: Operand) -> JitResult<Gpr> {
        match operand {
            Operand::IrRef(r) => match trace.allocation_map[r] {
                Some(Allocation::Gpr(g)) => Ok(Gpr(g)),
                Some(Allocation::Spill(s)) => {
                    X86Encoder::mov_reg_mem(&mut self.buf, self.scratch_gpr2, Gpr::RBP, Self::spill_disp(s))?;
                    Ok(self.scratch_gpr2)
                }
                _ => Err(JitError::EncodingError(format!("ir ref {r} has no gpr allocation"))),
            },
            Operand::LiteralBool(b) => {
                X86Encoder::mov_reg_imm64(&mut self.buf, self.scratch_gpr2, b as u64)?;
                Ok(self.scratch_gpr2)
            }
            Operand::LiteralNil => {
                X86Encoder::mov_reg_imm64(&mut self.buf, self.scratch_gpr2, 0)?;
                Ok(self.scratch_gpr2)
            }
            other => Err(JitError::EncodingError(format!("{other} is not a gpr operand"))),
        }
    }

    fn store_float_result(&mut self, ir_ref: usize, alloc: Option<Allocation>, value: Xmm) -> JitResult<()> {
        match alloc {
            Some(Allocation::Xmm(x)) if x == value.0 => Ok(()),
            Some(Allocation::Xmm(x)) => X86Encoder::movsd_reg_reg(&mut self.buf, Xmm(x), value),
            Some(Allocation::Spill(s)) => X86Encoder::movsd_mem_reg(&mut self.buf, Gpr::RBP, Self::spill_disp(s), value),
            _ => Err(JitError::EncodingError(format!("ir ref {ir_ref} result has no allocation"))),
        }
    }

    fn store_gpr_result(&mut self, ir_ref: usize, alloc: Option<Allocation>, value: Gpr) -> JitResult<()> {
        match alloc {
            Some(Allocation::Gpr(g)) if g == value.0 => Ok(()),
            Some(Allocation::Gpr(g)) => X86Encoder::mov_reg_reg(&mut self.buf, Gpr(g), value),
            Some(Allocation::Spill(s)) => X86Encoder::mov_mem_reg(&mut self.buf, Gpr::RBP, Self::spill_disp(s), value),
            _ => Err(JitError::EncodingError(format!("ir ref {ir_ref} result has no allocation"))),
        }
    }

    fn emit_instr(&mut self, trace: &Trace, ir_ref: usize) -> JitResult<()> {
        let instr = trace.ir.get(ir_ref).clone();
        let alloc = trace.allocation_map[ir_ref];

        match instr.op {
            IrOp::Literal => match instr.operand(0) {
                Operand::LiteralFloat(_) => {
                    let v = self.load_float(trace, instr.operand(0))?;
                    self.store_float_result(ir_ref, alloc, v)
                }
                Operand::LiteralBool(_) | Operand::LiteralNil => {
                    let v = self.load_gpr(trace, instr.operand(0))?;
                    self.store_gpr_result(ir_ref, alloc, v)
                }
                _ => Err(JitError::EncodingError("LITERAL with non-literal operand".into())),
            },

            IrOp::Add | IrOp::Subtract | IrOp::Multiply | IrOp::Divide => {
                let a = self.load_float(trace, instr.operand(0))?;
                let b = self.load_float(trace, instr.operand(1))?;
                let dst = match alloc {
                    Some(Allocation::Xmm(x)) => Xmm(x),
                    _ => self.scratch_xmm,
                };
                if dst.0 != a.0 {
                    X86Encoder::movsd_reg_reg(&mut self.buf, dst, a)?;
                }
                match instr.op {
                    IrOp::Add => X86Encoder::addsd(&mut self.buf, dst, b)?,
                    IrOp::Subtract => X86Encoder::subsd(&mut self.buf, dst, b)?,
                    IrOp::Multiply => X86Encoder::mulsd(&mut self.buf, dst, b)?,
                    IrOp::Divide => X86Encoder::divsd(&mut self.buf, dst, b)?,
                    _ => unreachable!(),
                }
                self.store_float_result(ir_ref, alloc, dst)
            }

            IrOp::Less | IrOp::Equal => {
                let a = self.load_float(trace, instr.operand(0))?;
                let b = self.load_float(trace, instr.operand(1))?;
                X86Encoder::ucomisd(&mut self.buf, a, b)?;
                let cond = if instr.op == IrOp::Less { Condition::BELOW } else { Condition::EQUAL };
                let dst = self.load_gpr_dst(alloc)?;
                X86Encoder::setcc_zx(&mut self.buf, dst, cond)?;
                self.store_gpr_result(ir_ref, alloc, dst)
            }

            IrOp::Load => {
                let slot = instr.operand(0).as_stack_ref().ok_or_else(|| {
                    JitError::EncodingError("LOAD operand 0 must be a stack ref".into())
                })?;
                match trace.ir.type_of(ir_ref) {
                    ty if ty.is_numeric() => {
                        let dst = match alloc {
                            Some(Allocation::Xmm(x)) => Xmm(x),
                            _ => self.scratch_xmm,
                        };
                        X86Encoder::movsd_reg_mem(&mut self.buf, dst, self.base_reg, Self::stack_slot_disp(slot, PAYLOAD_OFFSET))?;
                        self.store_float_result(ir_ref, alloc, dst)
                    }
                    _ => {
                        let dst = self.load_gpr_dst(alloc)?;
                        X86Encoder::mov_reg_mem(&mut self.buf, dst, self.base_reg, Self::stack_slot_disp(slot, PAYLOAD_OFFSET))?;
                        self.store_gpr_result(ir_ref, alloc, dst)
                    }
                }
            }

            IrOp::Store => {
                let slot = instr.operand(0).as_stack_ref().ok_or_else(|| {
                    JitError::EncodingError("STORE operand 0 must be a stack ref".into())
                })?;
                let src_ref = instr.operand(1).as_ir_ref().ok_or_else(|| {
                    JitError::EncodingError("STORE operand 1 must be an ir ref".into())
                })?;
                if trace.ir.type_of(src_ref).is_numeric() {
                    let v = self.load_float(trace, Operand::IrRef(src_ref))?;
                    X86Encoder::movsd_mem_reg(&mut self.buf, self.base_reg, Self::stack_slot_disp(slot, PAYLOAD_OFFSET), v)
                } else {
                    let v = self.load_gpr(trace, Operand::IrRef(src_ref))?;
                    X86Encoder::mov_mem_reg(&mut self.buf, self.base_reg, Self::stack_slot_disp(slot, PAYLOAD_OFFSET), v)
                }
            }

            IrOp::Move => {
                let src_ref = instr.operand(0).as_ir_ref().ok_or_else(|| {
                    JitError::EncodingError("MOVE operand 0 must be an ir ref".into())
                })?;
                if trace.ir.type_of(src_ref).is_numeric() {
                    let v = self.load_float(trace, Operand::IrRef(src_ref))?;
                    self.store_float_result(ir_ref, alloc, v)
                } else {
                    let v = self.load_gpr(trace, Operand::IrRef(src_ref))?;
                    self.store_gpr_result(ir_ref, alloc, v)
                }
            }

            // Pure control/bookkeeping markers: no code of their own.
            IrOp::LoopStart | IrOp::Noop => Ok(()),

            // Reached once, by falling through from the peeled prefix:
            // materialise the entry value into the PHI's own location.
            // The back-edge value is copied in separately, by `IrOp::Loop`
            // below, right before it jumps back here.
            IrOp::Phi => {
                let entry = instr.operand(0);
                if trace.ir.type_of(ir_ref).is_numeric() {
                    let v = self.load_float(trace, entry)?;
                    self.store_float_result(ir_ref, alloc, v)
                } else {
                    let v = self.load_gpr(trace, entry)?;
                    self.store_gpr_result(ir_ref, alloc, v)
                }
            }

            IrOp::Loop => {
                let target = match instr.operand(0) {
                    Operand::JumpOffset(t) => t,
                    _ => return Err(JitError::EncodingError("LOOP missing jump target".into())),
                };

                // Resolve every PHI the target LOOP_START feeds before
                // taking the back-edge: each PHI's second operand is the
                // value this iteration computed, copied into the PHI's
                // allocation so the next pass through LOOP_START sees it
                // (SPEC_FULL.md section 4.3's loop-carried PHI contract).
                for phi_ref in Self::phis_fed_by(trace, target) {
                    let phi = trace.ir.get(phi_ref).clone();
                    let incoming = phi.operand(1);
                    let phi_alloc = trace.allocation_map[phi_ref];
                    if trace.ir.type_of(phi_ref).is_numeric() {
                        let v = self.load_float(trace, incoming)?;
                        self.store_float_result(phi_ref, phi_alloc, v)?;
                    } else {
                        let v = self.load_gpr(trace, incoming)?;
                        self.store_gpr_result(phi_ref, phi_alloc, v)?;
                    }
                }

                match self.ir_offset[target] {
                    Some(target_pos) => {
                        let disp_pos = X86Encoder::jmp_rel32_placeholder(&mut self.buf)?;
                        X86Encoder::patch_rel32(&mut self.buf, disp_pos, target_pos)
                    }
                    None => {
                        let disp_pos = X86Encoder::jmp_rel32_placeholder(&mut self.buf)?;
                        self.pending.push((disp_pos, JumpTarget::Ir(target)));
                        Ok(())
                    }
                }
            }

            IrOp::Jump => {
                let target = match instr.operand(0) {
                    Operand::JumpOffset(t) => t,
                    _ => return Err(JitError::EncodingError("JUMP missing jump target".into())),
                };
                let disp_pos = X86Encoder::jmp_rel32_placeholder(&mut self.buf)?;
                self.pending.push((disp_pos, JumpTarget::Ir(target)));
                Ok(())
            }

            IrOp::CheckType => {
                let slot = instr.operand(0).as_stack_ref().ok_or_else(|| {
                    JitError::EncodingError("CHECK_TYPE operand 0 must be a stack ref".into())
                })?;
                let expected = match instr.operand(1) {
                    Operand::LiteralFloat(tag) => tag as u8,
                    _ => ValueType::Unknown as u8,
                };
                let exit_number = self.guard_exit_number(trace, ir_ref)?;
                X86Encoder::mov_reg_mem(&mut self.buf, self.scratch_gpr2, self.base_reg, Self::stack_slot_disp(slot, TAG_OFFSET))?;
                // compare the low byte against `expected`; the tag occupies
                // byte 0 of the 8-byte word we just loaded.
                self.cmp_gpr_imm8(self.scratch_gpr2, expected)?;
                self.guard_jump_if_not(Condition::EQUAL, exit_number)
            }

            IrOp::CheckTrue | IrOp::CheckFalse => {
                let operand_ref = instr.operand(0).as_ir_ref().ok_or_else(|| {
                    JitError::EncodingError("guard operand 0 must be an ir ref".into())
                })?;
                let g = self.load_gpr(trace, Operand::IrRef(operand_ref))?;
                self.cmp_gpr_imm8(g, 1)?;
                let exit_number = self.guard_exit_number(trace, ir_ref)?;
                let cond = if instr.op == IrOp::CheckTrue { Condition::EQUAL } else { Condition::NOT_EQUAL };
                self.guard_jump_if_not(cond, exit_number)
            }

            IrOp::Return => {
                let exit_number = self.guard_exit_number(trace, ir_ref)?;
                let disp_pos = X86Encoder::jmp_rel32_placeholder(&mut self.buf)?;
                self.pending.push((disp_pos, JumpTarget::Snapshot(exit_number)));
                Ok(())
            }
        }
    }

    /// The back-edge's jump target is the duplicated body's first
    /// instruction, immediately preceded by the contiguous run of `PHI`s
    /// it feeds (`optimizer::peel_and_unroll` emits `LOOP_START`, then
    /// one `PHI` per carried slot, then the duplicated body, in that
    /// order) — walk backward from `target` collecting them.
    fn phis_fed_by(trace: &Trace, target: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut i = target;
        while i > 0 {
            i -= 1;
            if trace.ir.get(i).op == IrOp::Phi {
                out.push(i);
            } else {
                break;
            }
        }
        out.reverse();
        out
    }

    fn load_gpr_dst(&self, alloc: Option<Allocation>) -> JitResult<Gpr> {
        match alloc {
            Some(Allocation::Gpr(g)) => Ok(Gpr(g)),
            _ => Ok(self.scratch_gpr2),
        }
    }

    /// `cmp reg, imm8` (`83 /7`).
    fn cmp_gpr_imm8(&mut self, reg: Gpr, imm: u8) -> JitResult<()> {
        self.buf.add_byte(0x48 | ((reg.0 >= 8) as u8))?; // REX.W(.B)
        self.buf.add_byte(0x83)?;
        self.buf.add_byte(0xf8 | (reg.0 & 0b111))?;
        self.buf.add_byte(imm)
    }

    fn guard_exit_number(&self, trace: &Trace, ir_ref: usize) -> JitResult<usize> {
        trace
            .snapshots
            .iter()
            .position(|s| s.ir_ref == ir_ref)
            .ok_or_else(|| JitError::EncodingError(format!("guard at ir {ir_ref} has no snapshot")))
    }

    /// Branch to the exit stub for `exit_number` unless `cond` holds.
    fn guard_jump_if_not(&mut self, cond: Condition, exit_number: usize) -> JitResult<()> {
        let inverted = Condition(cond.0 ^ 1); // SDM: tttn's low bit inverts the condition
        let disp_pos = X86Encoder::jcc_rel32_placeholder(&mut self.buf, inverted)?;
        self.pending.push((disp_pos, JumpTarget::Snapshot(exit_number)));
        Ok(())
    }

    /// Flush every not-yet-written slot the snapshot names, then return
    /// `exit_number` to the caller (see the module doc comment for why
    /// this stands in for a separate native exit-handler tail call).
    fn emit_exit_stub(&mut self, trace: &Trace, exit_number: usize) -> JitResult<()> {
        let snapshot = &trace.snapshots[exit_number];
        for (slot, shadow) in snapshot.stack_ir_map.clone() {
            if shadow.tags.contains(Tag::WRITTEN) {
                continue;
            }
            let ir_ref = shadow.ir_ref;
            let ty = trace.ir.type_of(ir_ref);
            if ty.is_numeric() {
                let v = self.load_float(trace, Operand::IrRef(ir_ref))?;
                X86Encoder::movsd_mem_reg(&mut self.buf, self.base_reg, Self::stack_slot_disp(slot, PAYLOAD_OFFSET), v)?;
            } else {
                let v = self.load_gpr(trace, Operand::IrRef(ir_ref))?;
                X86Encoder::mov_mem_reg(&mut self.buf, self.base_reg, Self::stack_slot_disp(slot, PAYLOAD_OFFSET), v)?;
            }
            self.write_tag_byte(slot, ty as u8)?;
        }

        X86Encoder::mov_reg_reg(&mut self.buf, Gpr::RSP, Gpr::RBP)?;
        X86Encoder::pop(&mut self.buf, Gpr::RBP)?;
        X86Encoder::mov_reg_imm64(&mut self.buf, Gpr::RAX, exit_number as u64)?;
        X86Encoder::ret(&mut self.buf)
    }

    /// `mov byte [base_reg + disp], imm8` — sets a slot's tag after the
    /// exit stub has already written its payload.
    fn write_tag_byte(&mut self, slot: usize, tag: u8) -> JitResult<()> {
        let disp = Self::stack_slot_disp(slot, TAG_OFFSET);
        X86Encoder::mov_mem_imm8(&mut self.buf, self.base_reg, disp, tag)
    }

    fn resolve_pending(&mut self, _trace: &Trace) -> JitResult<()> {
        let pending = std::mem::take(&mut self.pending);
        for (disp_pos, target) in pending {
            let target_pos = match target {
                JumpTarget::Ir(ir_ref) => self.ir_offset[ir_ref].ok_or_else(|| {
                    JitError::EncodingError(format!("jump target ir {ir_ref} was never emitted"))
                })?,
                JumpTarget::Snapshot(index) => *self
                    .snapshot_stub_offset
                    .get(index)
                    .ok_or_else(|| JitError::EncodingError(format!("unknown exit number {index}")))?,
            };
            X86Encoder::patch_rel32(&mut self.buf, disp_pos, target_pos)?;
        }
        Ok(())
    }
}
