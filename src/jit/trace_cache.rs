//! `TraceCache`: installed traces, back-edge counters, and the blacklist.
//!
//! Grounded in `examples/original_source/src/jit/TraceCache.hpp` and
//! `CodeProfiler::handle_basic_block_head`/`start_recording`.
//! `SPEC_FULL.md` section 9 calls out that this cache is process-wide but
//! single-threaded and must be passed explicitly rather than through
//! globals — it is owned by [`crate::jit::Jit`] and threaded through every
//! call, never a `static`.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::bytecode::Ip;
use crate::jit::trace::Trace;

#[derive(Default)]
pub struct TraceCache {
    installed: FxHashMap<Ip, Trace>,
    back_edge_counts: FxHashMap<Ip, u32>,
    abort_attempts: FxHashMap<Ip, u32>,
    blacklisted: FxHashSet<Ip>,
}

impl TraceCache {
    pub fn new() -> Self {
        TraceCache::default()
    }

    pub fn lookup(&self, ip: Ip) -> Option<&Trace> {
        self.installed.get(&ip).filter(|t| t.is_compiled())
    }

    /// Mutable lookup, used by the dispatcher to enter a compiled trace
    /// (it bumps the failing snapshot's `fail_count` on return).
    pub fn lookup_mut(&mut self, ip: Ip) -> Option<&mut Trace> {
        self.installed.get_mut(&ip).filter(|t| t.is_compiled())
    }

    pub fn install(&mut self, trace: Trace) {
        self.installed.insert(trace.init_ip, trace);
    }

    pub fn is_blacklisted(&self, ip: Ip) -> bool {
        self.blacklisted.contains(&ip)
    }

    /// Count a back-branch to `ip`, returning the new count. Called once
    /// per back-edge from [`crate::jit::profiler`].
    pub fn record_back_edge(&mut self, ip: Ip) -> u32 {
        let counter = self.back_edge_counts.entry(ip).or_insert(0);
        *counter += 1;
        *counter
    }

    /// An IP is about to start recording: its count no longer matters
    /// (mirrors the source's `block_counts_.erase(ip)` in
    /// `start_recording`).
    pub fn clear_count(&mut self, ip: Ip) {
        self.back_edge_counts.remove(&ip);
    }

    /// Record one aborted recording attempt at `ip`. Returns `true` if
    /// this attempt pushed `ip` over `blacklist_threshold` and it is now
    /// permanently blacklisted (`SPEC_FULL.md` section 8, property 6).
    pub fn record_abort(&mut self, ip: Ip, blacklist_threshold: u32) -> bool {
        let attempts = self.abort_attempts.entry(ip).or_insert(0);
        *attempts += 1;
        if *attempts >= blacklist_threshold {
            self.blacklisted.insert(ip);
            true
        } else {
            false
        }
    }

    pub fn installed_len(&self) -> usize {
        self.installed.len()
    }

    pub fn blacklisted_len(&self) -> usize {
        self.blacklisted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blacklist_is_stable_after_threshold_aborts() {
        let mut cache = TraceCache::new();
        assert!(!cache.record_abort(0x10, 3));
        assert!(!cache.record_abort(0x10, 3));
        assert!(cache.record_abort(0x10, 3));
        assert!(cache.is_blacklisted(0x10));

        // Further aborts are idempotent: still blacklisted.
        cache.record_abort(0x10, 3);
        assert!(cache.is_blacklisted(0x10));
    }

    #[test]
    fn back_edge_counts_increment_independently_per_ip() {
        let mut cache = TraceCache::new();
        assert_eq!(cache.record_back_edge(1), 1);
        assert_eq!(cache.record_back_edge(1), 2);
        assert_eq!(cache.record_back_edge(2), 1);
    }
}
