//! The optimiser: loop peeling/unrolling and dead-move elimination.
//!
//! Grounded in `examples/original_source/src/jit/Optimiser.cpp` and
//! `SPEC_FULL.md` section 4.3. Runs once, after recording completes and
//! before register allocation, on a trace whose IR ends in a single
//! `LOOP` back-edge.
//!
//! Peeling turns
//!   `[ body ] LOOP->0`
//! into
//!   `[ body ] LOOP_START PHI* [ body' ] LOOP->LOOP_START`
//! where `body'` is a copy of `body` with every loop-carried value
//! resolved through a `PHI` at `LOOP_START` instead of a fresh `LOAD`,
//! and instructions whose inputs never depend on a loop-carried value
//! (true loop invariants) are left out of `body'` entirely — consumers
//! inside the copy keep referencing the single instance in the peeled
//! prefix, per the "kept only in the peeled prefix" contract.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{JitError, JitResult};
use crate::jit::ir::{IrOp, Operand};
use crate::jit::shadow_stack::Tag;
use crate::jit::snapshot::Snapshot;
use crate::jit::trace::Trace;

/// Run every optimisation pass on a fully-recorded trace.
pub fn optimise(trace: &mut Trace) -> JitResult<()> {
    eliminate_dead_moves(trace);
    peel_and_unroll(trace)?;
    Ok(())
}

/// A `MOVE` immediately followed by another `MOVE` of the same source is
/// redundant: nothing downstream can observe the first one's result
/// before the second supersedes it, since both represent the same
/// shadow-stack slot being re-cached in sequence. Rewrite the first to
/// `NOOP` (`examples/original_source/src/jit/Optimiser.cpp`: "a MOVE
/// immediately followed by another MOVE to the same destination has the
/// first rewritten to NOOP").
fn eliminate_dead_moves(trace: &mut Trace) {
    if trace.ir.len() < 2 {
        return;
    }
    for i in 0..trace.ir.len() - 1 {
        let cur = *trace.ir.get(i);
        let next = *trace.ir.get(i + 1);
        if cur.op == IrOp::Move && next.op == IrOp::Move && cur.operand(0) == next.operand(0) {
            trace.ir.set_op(i, IrOp::Noop);
        }
    }
}

fn remap(op: Operand, map: &FxHashMap<usize, usize>) -> Operand {
    match op {
        Operand::IrRef(r) => Operand::IrRef(*map.get(&r).unwrap_or(&r)),
        Operand::JumpOffset(r) => Operand::JumpOffset(*map.get(&r).unwrap_or(&r)),
        other => other,
    }
}

fn peel_and_unroll(trace: &mut Trace) -> JitResult<()> {
    let Some(loop_idx) = trace.ir.iter().position(|(_, i)| i.op == IrOp::Loop) else {
        return Err(JitError::OptimiserFailure(
            "optimise called on an IR with no LOOP".into(),
        ));
    };

    // Slots read by LOAD and later written by STORE within the body are
    // loop-carried: the value flowing into the next iteration comes from
    // the STORE's source, not from re-reading the interpreter stack.
    let mut carried: FxHashMap<usize, (usize, usize)> = FxHashMap::default();
    for (i, instr) in trace.ir.iter().take(loop_idx) {
        if instr.op == IrOp::Load {
            if let Some(slot) = instr.operand(0).as_stack_ref() {
                carried.entry(slot).or_insert((i, usize::MAX));
            }
        }
    }
    for (_, instr) in trace.ir.iter().take(loop_idx) {
        if instr.op == IrOp::Store {
            if let Some(slot) = instr.operand(0).as_stack_ref() {
                if let (Some(entry), Some(src)) =
                    (carried.get_mut(&slot), instr.operand(1).as_ir_ref())
                {
                    entry.1 = src;
                }
            }
        }
    }
    carried.retain(|_, (_, store_src)| *store_src != usize::MAX);

    let carried_loads: FxHashSet<usize> = carried.values().map(|(load_ref, _)| *load_ref).collect();

    // Transitive closure: anything whose operands touch a carried load,
    // directly or through another dependent instruction, is itself
    // loop-carried-dependent and must be duplicated rather than shared.
    let mut dependent = vec![false; loop_idx];
    for &r in &carried_loads {
        dependent[r] = true;
    }
    for i in 0..loop_idx {
        if dependent[i] {
            continue;
        }
        if trace
            .ir
            .get(i)
            .ir_ref_operands()
            .any(|r| r < loop_idx && dependent[r])
        {
            dependent[i] = true;
        }
    }

    let loop_start_ref = trace.ir.emit(IrOp::LoopStart, crate::value::ValueType::Unknown, [Operand::Unused, Operand::Unused]);

    let mut old_to_new: FxHashMap<usize, usize> = FxHashMap::default();
    let mut slot_phi: FxHashMap<usize, usize> = FxHashMap::default();
    for (&slot, &(load_ref, _)) in &carried {
        let ty = trace.ir.type_of(load_ref);
        let phi_ref = trace.ir.emit(IrOp::Phi, ty, [Operand::IrRef(load_ref), Operand::Unused]);
        slot_phi.insert(slot, phi_ref);
        old_to_new.insert(load_ref, phi_ref);
    }

    let mut body_start_ref = None;
    for i in 0..loop_idx {
        if carried_loads.contains(&i) || !dependent[i] {
            // Either represented by its PHI already, or a true invariant
            // left in place in the peeled prefix.
            continue;
        }
        let instr = *trace.ir.get(i);
        let operands = [remap(instr.operand(0), &old_to_new), remap(instr.operand(1), &old_to_new)];
        let new_ref = trace.ir.emit(instr.op, instr.ty, operands);
        body_start_ref.get_or_insert(new_ref);
        old_to_new.insert(i, new_ref);
    }

    for (&slot, &(_, store_src)) in &carried {
        let phi_ref = slot_phi[&slot];
        let incoming_next = *old_to_new.get(&store_src).unwrap_or(&store_src);
        trace.ir.set_operand(phi_ref, 1, Operand::IrRef(incoming_next));
    }

    duplicate_guard_snapshots(trace, loop_idx, &old_to_new);

    // The back-edge targets the duplicated body's first instruction, not
    // LOOP_START/PHI: PHI's own position only runs the entry-value copy
    // once, on the initial fall-through from the peeled prefix. Landing
    // the jump there too would re-run that copy every iteration and
    // clobber the value `IrOp::Loop`'s emission just wrote into the PHI's
    // register for the next pass (see `assembler::emit`'s `IrOp::Phi` and
    // `IrOp::Loop` cases).
    let back_edge_target = body_start_ref.unwrap_or(loop_start_ref);
    trace
        .ir
        .emit(IrOp::Loop, crate::value::ValueType::Unknown, [Operand::JumpOffset(back_edge_target), Operand::Unused]);

    // The original trailing LOOP now falls through into LOOP_START
    // instead of repeating the peeled prefix; neutralise it in place so
    // the assembler's linear walk doesn't emit a stray backward jump.
    trace.ir.set_op(loop_idx, IrOp::Noop);

    Ok(())
}

/// Guards duplicated into the unrolled body get a new IR ref and so need
/// their own snapshot: clone the original, point it at the duplicate's
/// ref, and remap every IR ref its stack map names through the same
/// rewrite table used for the instruction copy.
fn duplicate_guard_snapshots(trace: &mut Trace, loop_idx: usize, old_to_new: &FxHashMap<usize, usize>) {
    let originals: Vec<Snapshot> = trace
        .snapshots
        .iter()
        .filter(|s| s.ir_ref < loop_idx)
        .cloned()
        .collect();

    for original in originals {
        let Some(&new_ir_ref) = old_to_new.get(&original.ir_ref) else {
            continue;
        };
        let stack_ir_map = original
            .stack_ir_map
            .iter()
            .map(|(slot, shadow)| {
                let mapped_ref = *old_to_new.get(&shadow.ir_ref).unwrap_or(&shadow.ir_ref);
                (*slot, crate::jit::shadow_stack::ShadowSlot { ir_ref: mapped_ref, tags: shadow.tags })
            })
            .collect::<Vec<_>>();
        let mut duplicate = Snapshot::new(new_ir_ref, original.next_ip, stack_ir_map);
        duplicate.fail_count = 0;
        trace.snapshots.push(duplicate);
    }
}
