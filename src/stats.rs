//! Dispatch counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters updated by the dispatch path.
#[derive(Debug, Default)]
pub struct DispatchStats {
    dispatched: AtomicU64,
    coalesced: AtomicU64,
    redispatched: AtomicU64,
    rolled_back: AtomicU64,
    sync_fast_path: AtomicU64,
}

impl DispatchStats {
    pub(crate) fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_redispatched(&self) {
        self.redispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rolled_back(&self) {
        self.rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sync_fast_path(&self) {
        self.sync_fast_path.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            redispatched: self.redispatched.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            sync_fast_path: self.sync_fast_path.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`DispatchStats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStatsSnapshot {
    /// Requests published to a request queue (including redispatches).
    pub dispatched: u64,
    /// Requests attached to an existing task instead of being published.
    pub coalesced: u64,
    /// Fresh publishes that replaced a failed, cancelled or evicted task.
    pub redispatched: u64,
    /// Publishes that failed and were undone.
    pub rolled_back: u64,
    /// `run_sync` calls answered from the cache without waiting.
    pub sync_fast_path: u64,
}

impl DispatchStatsSnapshot {
    /// Fraction of dispatch calls that were coalesced, from 0.0 to 1.0.
    pub fn coalescing_ratio(&self) -> f64 {
        let total = self.dispatched + self.coalesced;
        if total == 0 {
            0.0
        } else {
            self.coalesced as f64 / total as f64
        }
    }

    /// Logs the counters at info level.
    pub fn log(&self) {
        tracing::info!(
            dispatched = self.dispatched,
            coalesced = self.coalesced,
            redispatched = self.redispatched,
            rolled_back = self.rolled_back,
            sync_fast_path = self.sync_fast_path,
            ratio = format!("{:.1}%", self.coalescing_ratio() * 100.0),
            "dispatch statistics"
        );
    }
}
