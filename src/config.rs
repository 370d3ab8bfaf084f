//! Tunable thresholds for the JIT pipeline.
//!
//! Grounded in the host project's `jit::engine::JitConfig` /
//! `jit::profiling::policy::CompilationPolicy` pattern: a plain struct of
//! `Copy` fields with a `Default` impl, no feature flags, no tiering.

/// Fixed register budget reserved for the assembler's own bookkeeping.
/// Not configurable: it is a property of the x86-64 System V ABI choices
/// this assembler makes, not a policy knob.
#[derive(Debug, Clone, Copy)]
pub struct ScratchRegisters {
    /// General-purpose scratch register, clobbered freely by guard checks.
    pub gpr: u8,
    /// XMM scratch register, clobbered freely by float guard checks.
    pub xmm: u8,
    /// General-purpose register used as a stack-size/spill cursor.
    pub cursor: u8,
}

impl Default for ScratchRegisters {
    fn default() -> Self {
        // r11 (caller-saved, never used for argument passing), xmm15, r10.
        ScratchRegisters {
            gpr: 11,
            xmm: 15,
            cursor: 10,
        }
    }
}

/// Policy knobs for the hot-loop detector, recorder limits, and blacklist.
#[derive(Debug, Clone, Copy)]
pub struct JitConfig {
    /// Back-branch count at which recording starts. SPEC default: 50.
    pub hot_threshold: u32,
    /// Number of aborted recording attempts at an IP before it is
    /// permanently blacklisted. SPEC default: 3.
    pub blacklist_threshold: u32,
    /// Maximum number of IR instructions in a single trace before
    /// recording aborts with `IrOverflow`.
    pub max_ir_len: usize,
    /// Maximum number of snapshots in a single trace before recording
    /// aborts with `SnapOverflow`.
    pub max_snapshots: usize,
    /// Maximum number of distinct constants a trace may reference.
    pub max_constants: usize,
    pub scratch: ScratchRegisters,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            hot_threshold: 50,
            blacklist_threshold: 3,
            max_ir_len: 4096,
            max_snapshots: 512,
            max_constants: 256,
            scratch: ScratchRegisters::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = JitConfig::default();
        assert_eq!(cfg.hot_threshold, 50);
        assert_eq!(cfg.blacklist_threshold, 3);
    }
}
