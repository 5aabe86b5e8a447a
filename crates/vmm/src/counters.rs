//! Increment-only observability counters.
//!
//! Counters are best-effort instrumentation, not correctness state: updates
//! are relaxed and reads may be torn across counters. They exist so the
//! kernel's diagnostics surface can report how often the expensive
//! TLB-maintenance paths run.

use core::sync::atomic::{AtomicU64, Ordering};

/// A named, monotonically increasing counter.
pub struct Counter {
    name: &'static str,
    value: AtomicU64,
}

impl Counter {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicU64::new(0),
        }
    }

    /// Adds one to the counter.
    #[inline]
    pub fn inc(&self) {
        self.add(1);
    }

    /// Adds `n` to the counter.
    #[inline]
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Returns the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Returns the counter's name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Consistency-manager flushes performed (including empty ones).
pub static CM_FLUSH: Counter = Counter::new("vmm.consistency_manager.flush");

/// Flushes that collapsed into a whole-address-space invalidation.
pub static CM_FLUSH_ALL: Counter = Counter::new("vmm.consistency_manager.flush_all");

/// Pending entries that were replaced by whole-address-space invalidations.
pub static CM_FLUSH_ALL_REPLACING: Counter =
    Counter::new("vmm.consistency_manager.flush_all_replacing");

/// Individual TLB-entry invalidations issued.
pub static CM_SINGLE_TLB_INVALIDATES: Counter =
    Counter::new("vmm.consistency_manager.single_tlb_invalidate");

/// Protect calls that made a range executable.
pub static PROTECT_MAKE_EXECUTE_CALLS: Counter =
    Counter::new("vmm.protect.make_execute_calls");

/// Pages icache-synced by protect calls that made a range executable.
pub static PROTECT_MAKE_EXECUTE_PAGES: Counter =
    Counter::new("vmm.protect.make_execute_pages");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_up() {
        static TEST_COUNTER: Counter = Counter::new("vmm.test.counter");
        let before = TEST_COUNTER.get();
        TEST_COUNTER.inc();
        TEST_COUNTER.add(3);
        assert_eq!(TEST_COUNTER.get(), before + 4);
        assert_eq!(TEST_COUNTER.name(), "vmm.test.counter");
    }
}
