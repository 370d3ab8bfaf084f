//! Snapshots: immutable guard-failure / side-exit records.
//!
//! Grounded in `examples/original_source/src/jit/Snapshot.hpp`.
//! `SPEC_FULL.md` section 3: "Immutable record: (ir_ref_at_which_it_applies,
//! bytecode IP to resume at, compressed map of interpreter stack slots →
//! IR references producing their current values, with per-slot tags
//! CACHED/WRITTEN)."

use crate::bytecode::Ip;
use crate::jit::shadow_stack::ShadowSlot;

/// Sentinel used while recording: `next_ip` for a snapshot created at the
/// loop back-edge is not known until the back-edge target is known. The
/// original source used "end of bytecode" as the same sentinel
/// (`CodeProfiler::patch_snaps`); this implementation names it explicitly.
pub const PENDING_IP: Ip = Ip::MAX;

#[derive(Debug, Clone)]
pub struct Snapshot {
    /// IR position this snapshot applies to (the guard, or the LOOP
    /// instruction for a back-edge snapshot).
    pub ir_ref: usize,
    /// Bytecode IP the interpreter resumes at if this guard fails.
    pub next_ip: Ip,
    /// Compressed stack-slot -> (IR ref, tags) mapping.
    pub stack_ir_map: Vec<(usize, ShadowSlot)>,
    /// Guard-failure counter (SPEC_FULL.md section 11: carried forward as
    /// instrumentation for a future side-trace implementation; this
    /// implementation does not itself act on the count).
    pub fail_count: u32,
}

impl Snapshot {
    pub fn new(ir_ref: usize, next_ip: Ip, stack_ir_map: Vec<(usize, ShadowSlot)>) -> Self {
        Snapshot {
            ir_ref,
            next_ip,
            stack_ir_map,
            fail_count: 0,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.next_ip == PENDING_IP
    }
}

impl std::fmt::Display for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "snap(ir={}, next_ip={:#06x}, map=[", self.ir_ref, self.next_ip)?;
        for (i, (slot, shadow)) in self.stack_ir_map.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{slot}->%{}", shadow.ir_ref)?;
        }
        write!(f, "])")
    }
}
