//! The trace-based JIT: hot-loop detection, recording, optimisation,
//! register allocation, machine-code emission, and dispatch, composed
//! behind one facade (`SPEC_FULL.md` section 6, "external interface").
//!
//! [`Jit`] is the only type the interpreter (`crate::vm`) talks to. It
//! owns the [`TraceCache`] and, while recording, the in-progress
//! [`Trace`]/[`Recorder`] pair; nothing here is ever a `static` (see
//! `trace_cache`'s module docs).

pub mod assembler;
pub mod dispatcher;
pub mod ir;
pub mod optimizer;
pub mod recorder;
pub mod regalloc;
pub mod shadow_stack;
pub mod snapshot;
pub mod trace;
pub mod trace_cache;

use std::rc::Rc;

use log::{info, warn};

use crate::bytecode::{CodeObject, Ip};
use crate::config::JitConfig;
use crate::jit::assembler::emit::{allocatable_registers, assemble};
use crate::jit::dispatcher::{Dispatcher, ExitOutcome};
use crate::jit::recorder::{RecordOutcome, Recorder};
use crate::jit::regalloc::RegisterAllocator;
use crate::jit::trace::{Trace, TraceState};
use crate::jit::trace_cache::TraceCache;
use crate::vm::frame::ValueStack;

/// What the interpreter should do after reaching a loop head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopHeadAction {
    /// No compiled trace is available; keep interpreting.
    Interpret,
    /// A compiled trace is installed at this IP; enter it instead.
    Enter,
}

pub struct Jit {
    cfg: JitConfig,
    cache: TraceCache,
    recording: Option<(Trace, Recorder)>,
}

impl Jit {
    pub fn new(cfg: JitConfig) -> Self {
        Jit {
            cfg,
            cache: TraceCache::new(),
            recording: None,
        }
    }

    pub fn config(&self) -> &JitConfig {
        &self.cfg
    }

    /// Called whenever the interpreter reaches a loop head (a `LOOP`
    /// target). Mirrors `CodeProfiler::handle_basic_block_head`: checks
    /// for an installed trace first, then advances the back-edge
    /// counter and starts recording once it crosses `hot_threshold`.
    pub fn handle_basic_block_head(&mut self, code: &Rc<CodeObject>, ip: Ip, stack_len: usize) -> LoopHeadAction {
        if self.cache.lookup(ip).is_some() {
            return LoopHeadAction::Enter;
        }
        if self.recording.is_some() || self.cache.is_blacklisted(ip) {
            return LoopHeadAction::Interpret;
        }
        let count = self.cache.record_back_edge(ip);
        if count >= self.cfg.hot_threshold {
            self.cache.clear_count(ip);
            info!("hot loop detected @ {ip:#06x}, starting trace recording");
            self.recording = Some((Trace::new(ip, Rc::clone(code), 0), Recorder::new(stack_len)));
        }
        LoopHeadAction::Interpret
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    /// Mirror the instruction at `ip` into the in-progress trace, if any.
    /// A no-op if nothing is currently recording.
    pub fn record_instruction(&mut self, code: &CodeObject, stack: &ValueStack, ip: Ip) {
        let Some((mut trace, mut recorder)) = self.recording.take() else {
            return;
        };

        match recorder.record_one(&mut trace, &self.cfg, code, stack, ip) {
            Ok(RecordOutcome::Continue(_)) => {
                self.recording = Some((trace, recorder));
            }
            Ok(RecordOutcome::LoopClosed) => self.finish_trace(trace),
            Err(err) => {
                warn!("aborting trace recording @ {:#06x}: {err}", trace.init_ip);
                if self.cache.record_abort(trace.init_ip, self.cfg.blacklist_threshold) {
                    warn!("blacklisting {:#06x} after repeated aborts", trace.init_ip);
                }
            }
        }
    }

    /// Optimise, allocate, and assemble a completed trace, installing it
    /// on success. A failure at any stage aborts the trace exactly like
    /// a recording-time error would.
    fn finish_trace(&mut self, mut trace: Trace) {
        trace.state = TraceState::IrComplete;
        let init_ip = trace.init_ip;

        let result = (|| {
            crate::jit::optimizer::optimise(&mut trace)?;
            let (gprs, xmms) = allocatable_registers(&self.cfg);
            RegisterAllocator::new(&gprs, &xmms).allocate(&mut trace)?;
            assemble(&mut trace, &self.cfg)
        })();

        match result {
            Ok(()) => {
                info!(
                    "compiled trace @ {init_ip:#06x} ({} instrs, {} snapshots)",
                    trace.ir.len(),
                    trace.snapshots.len()
                );
                self.cache.install(trace);
            }
            Err(err) => {
                warn!("failed to compile trace @ {init_ip:#06x}: {err}");
                if self.cache.record_abort(init_ip, self.cfg.blacklist_threshold) {
                    warn!("blacklisting {init_ip:#06x} after repeated aborts");
                }
            }
        }
    }

    /// Enter the compiled trace at `ip`, if one exists.
    pub fn enter_trace(&mut self, ip: Ip, stack: &mut ValueStack) -> Option<ExitOutcome> {
        let trace = self.cache.lookup_mut(ip)?;
        Some(Dispatcher::enter_trace(trace, stack))
    }

    pub fn installed_len(&self) -> usize {
        self.cache.installed_len()
    }

    pub fn blacklisted_len(&self) -> usize {
        self.cache.blacklisted_len()
    }
}
