//! Operational counters. Incremented alongside the matching `tracing` events.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub updates_received: AtomicU64,
    pub updates_duplicate: AtomicU64,
    pub updates_stale: AtomicU64,
    pub updates_unrouted: AtomicU64,
    pub handler_failures: AtomicU64,
    pub handler_timeouts: AtomicU64,
    pub handler_defects: AtomicU64,
    pub write_conflicts: AtomicU64,
    pub conflict_exhausted: AtomicU64,
    pub actions_enqueued: AtomicU64,
    pub actions_deduplicated: AtomicU64,
    pub actions_delivered: AtomicU64,
    pub actions_failed: AtomicU64,
    pub delivery_retries: AtomicU64,
    pub rate_limited: AtomicU64,
    pub sessions_evicted: AtomicU64,
    pub source_reconnects: AtomicU64,
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub updates_received: u64,
    pub updates_duplicate: u64,
    pub updates_stale: u64,
    pub updates_unrouted: u64,
    pub handler_failures: u64,
    pub handler_timeouts: u64,
    pub handler_defects: u64,
    pub write_conflicts: u64,
    pub conflict_exhausted: u64,
    pub actions_enqueued: u64,
    pub actions_deduplicated: u64,
    pub actions_delivered: u64,
    pub actions_failed: u64,
    pub delivery_retries: u64,
    pub rate_limited: u64,
    pub sessions_evicted: u64,
    pub source_reconnects: u64,
}

impl EngineMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            updates_received: load(&self.updates_received),
            updates_duplicate: load(&self.updates_duplicate),
            updates_stale: load(&self.updates_stale),
            updates_unrouted: load(&self.updates_unrouted),
            handler_failures: load(&self.handler_failures),
            handler_timeouts: load(&self.handler_timeouts),
            handler_defects: load(&self.handler_defects),
            write_conflicts: load(&self.write_conflicts),
            conflict_exhausted: load(&self.conflict_exhausted),
            actions_enqueued: load(&self.actions_enqueued),
            actions_deduplicated: load(&self.actions_deduplicated),
            actions_delivered: load(&self.actions_delivered),
            actions_failed: load(&self.actions_failed),
            delivery_retries: load(&self.delivery_retries),
            rate_limited: load(&self.rate_limited),
            sessions_evicted: load(&self.sessions_evicted),
            source_reconnects: load(&self.source_reconnects),
        }
    }
}
