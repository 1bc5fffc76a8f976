//! Process-wide counters for the core. Cheap atomics, sampled by
//! `db info` / `doctor` and by the host's own telemetry.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct CoreMetrics {
    pub deposit_ok: AtomicU64,
    pub deposit_err: AtomicU64,
    pub withdraw_ok: AtomicU64,
    pub withdraw_err: AtomicU64,
    pub transfer_ok: AtomicU64,
    pub transfer_err: AtomicU64,
    pub idem_replays: AtomicU64,
    pub idem_mismatches: AtomicU64,
    pub events_published: AtomicU64,
    pub events_dropped: AtomicU64,
    pub requests_swept: AtomicU64,
    pub slow_queries: AtomicU64,
}

impl CoreMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            deposit_ok: self.deposit_ok.load(Ordering::Relaxed),
            deposit_err: self.deposit_err.load(Ordering::Relaxed),
            withdraw_ok: self.withdraw_ok.load(Ordering::Relaxed),
            withdraw_err: self.withdraw_err.load(Ordering::Relaxed),
            transfer_ok: self.transfer_ok.load(Ordering::Relaxed),
            transfer_err: self.transfer_err.load(Ordering::Relaxed),
            idem_replays: self.idem_replays.load(Ordering::Relaxed),
            idem_mismatches: self.idem_mismatches.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            requests_swept: self.requests_swept.load(Ordering::Relaxed),
            slow_queries: self.slow_queries.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MetricsSnapshot {
    pub deposit_ok: u64,
    pub deposit_err: u64,
    pub withdraw_ok: u64,
    pub withdraw_err: u64,
    pub transfer_ok: u64,
    pub transfer_err: u64,
    pub idem_replays: u64,
    pub idem_mismatches: u64,
    pub events_published: u64,
    pub events_dropped: u64,
    pub requests_swept: u64,
    pub slow_queries: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let m = CoreMetrics::default();
        CoreMetrics::incr(&m.deposit_ok);
        CoreMetrics::incr(&m.deposit_ok);
        CoreMetrics::add(&m.requests_swept, 200);
        let s = m.snapshot();
        assert_eq!(s.deposit_ok, 2);
        assert_eq!(s.requests_swept, 200);
        assert_eq!(s.withdraw_ok, 0);
    }
}
