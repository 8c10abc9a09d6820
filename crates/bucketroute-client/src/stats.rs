//! Routing and refresh counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the service facade and the refresh worker
#[derive(Debug, Default)]
pub struct RoutingStats {
    pub(crate) single_hop_routes: AtomicU64,
    pub(crate) fallbacks: AtomicU64,
    pub(crate) refreshes_enqueued: AtomicU64,
    pub(crate) refreshes_deduplicated: AtomicU64,
    pub(crate) refreshes_dropped: AtomicU64,
    pub(crate) fetch_successes: AtomicU64,
    pub(crate) fetch_failures: AtomicU64,
    pub(crate) stale_buckets_dropped: AtomicU64,
    pub(crate) buckets_timed_out: AtomicU64,
    pub(crate) servers_evicted: AtomicU64,
}

impl RoutingStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters
    #[must_use]
    pub fn snapshot(&self) -> RoutingStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        RoutingStatsSnapshot {
            single_hop_routes: load(&self.single_hop_routes),
            fallbacks: load(&self.fallbacks),
            refreshes_enqueued: load(&self.refreshes_enqueued),
            refreshes_deduplicated: load(&self.refreshes_deduplicated),
            refreshes_dropped: load(&self.refreshes_dropped),
            fetch_successes: load(&self.fetch_successes),
            fetch_failures: load(&self.fetch_failures),
            stale_buckets_dropped: load(&self.stale_buckets_dropped),
            buckets_timed_out: load(&self.buckets_timed_out),
            servers_evicted: load(&self.servers_evicted),
        }
    }
}

/// Plain copy of `RoutingStats`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RoutingStatsSnapshot {
    /// Routing calls answered from metadata
    pub single_hop_routes: u64,
    /// Routing calls that fell back to default routing
    pub fallbacks: u64,
    /// Regions accepted into the refresh queue
    pub refreshes_enqueued: u64,
    /// Refresh requests ignored because the region was already pending
    pub refreshes_deduplicated: u64,
    /// Refresh requests dropped because the queue was full or stopped
    pub refreshes_dropped: u64,
    /// Successful metadata fetches
    pub fetch_successes: u64,
    /// Failed metadata fetches
    pub fetch_failures: u64,
    /// Buckets skipped at publish because a newer version was installed
    pub stale_buckets_dropped: u64,
    /// Buckets newly marked timed out
    pub buckets_timed_out: u64,
    /// Servers removed from metadata after a failure
    pub servers_evicted: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = RoutingStats::default();
        RoutingStats::incr(&stats.fallbacks);
        RoutingStats::incr(&stats.fallbacks);
        RoutingStats::add(&stats.stale_buckets_dropped, 3);

        let snap = stats.snapshot();
        assert_eq!(snap.fallbacks, 2);
        assert_eq!(snap.stale_buckets_dropped, 3);
        assert_eq!(snap.fetch_successes, 0);
    }
}
