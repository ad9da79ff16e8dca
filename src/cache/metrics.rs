//! Cache Metrics Collection
//!
//! Per-tier counters owned by the coordinator. Everything is an atomic so
//! that recording never needs the memory-tier lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use super::entry::CacheTier;

/// Counters for one tier
#[derive(Debug, Default)]
pub struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    requests: AtomicU64,
    errors: AtomicU64,
    // Exponential moving average, microseconds
    latency_us: AtomicU64,
}

impl TierCounters {
    pub fn record_hit(&self, latency: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
        update_latency_ema(&self.latency_us, latency);
    }

    pub fn record_miss(&self, latency: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.misses.fetch_add(1, Ordering::Relaxed);
        update_latency_ema(&self.latency_us, latency);
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn hit_rate(&self) -> f64 {
        let requests = self.requests.load(Ordering::Relaxed);
        if requests == 0 {
            0.0
        } else {
            self.hits() as f64 / requests as f64
        }
    }

    fn snapshot(&self, tier: CacheTier) -> TierStats {
        TierStats {
            tier,
            hits: self.hits(),
            misses: self.misses(),
            evictions: self.evictions.load(Ordering::Relaxed),
            total_requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            average_latency: Duration::from_micros(self.latency_us.load(Ordering::Relaxed)),
            hit_rate: self.hit_rate(),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.evictions,
            &self.requests,
            &self.errors,
            &self.latency_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

fn update_latency_ema(target: &AtomicU64, duration: Duration) {
    let new_us = duration.as_micros() as u64;
    let alpha = 0.1; // EMA smoothing factor

    loop {
        let current = target.load(Ordering::Relaxed);
        let updated = if current == 0 {
            new_us
        } else {
            ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
        };

        if target
            .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            break;
        }
    }
}

/// Coordinator-wide metrics
#[derive(Debug, Default)]
pub struct CacheMetrics {
    memory: TierCounters,
    remote: TierCounters,
    persistent: TierCounters,

    origin_calls: AtomicU64,
    origin_failures: AtomicU64,
    write_warnings: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tier(&self, tier: CacheTier) -> &TierCounters {
        match tier {
            CacheTier::Memory => &self.memory,
            CacheTier::Remote => &self.remote,
            CacheTier::Persistent => &self.persistent,
        }
    }

    pub fn record_origin_call(&self, failed: bool) {
        self.origin_calls.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.origin_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_write_warning(&self) {
        self.write_warnings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn origin_calls(&self) -> u64 {
        self.origin_calls.load(Ordering::Relaxed)
    }

    /// Overall hit ratio: any-tier hits over all lookups that reached origin or hit
    pub fn overall_hit_ratio(&self) -> f64 {
        let hits = self.memory.hits() + self.remote.hits() + self.persistent.hits();
        let total = self.memory.requests.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Per-tier snapshot
    pub fn tier_stats(&self) -> Vec<TierStats> {
        CacheTier::all()
            .iter()
            .map(|t| self.tier(*t).snapshot(*t))
            .collect()
    }

    pub fn origin_failures(&self) -> u64 {
        self.origin_failures.load(Ordering::Relaxed)
    }

    pub fn write_warnings(&self) -> u64 {
        self.write_warnings.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.memory.reset();
        self.remote.reset();
        self.persistent.reset();
        self.origin_calls.store(0, Ordering::Relaxed);
        self.origin_failures.store(0, Ordering::Relaxed);
        self.write_warnings.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of one tier's counters
#[derive(Debug, Clone, Serialize)]
pub struct TierStats {
    pub tier: CacheTier,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub total_requests: u64,
    pub errors: u64,
    pub average_latency: Duration,
    pub hit_rate: f64,
}

/// Snapshot returned by `TieredCache::stats`
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub tiers: Vec<TierStats>,
    pub memory_entries: usize,
    pub memory_capacity: usize,
    pub memory_bytes: usize,
    pub hot_keys: usize,
    pub origin_calls: u64,
    pub origin_failures: u64,
    pub write_warnings: u64,
    pub overall_hit_ratio: f64,
    pub remote_enabled: bool,
    pub persistent_enabled: bool,
}

impl CacheStats {
    pub fn tier(&self, tier: CacheTier) -> Option<&TierStats> {
        self.tiers.iter().find(|t| t.tier == tier)
    }
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_tracking() {
        let metrics = CacheMetrics::new();
        let memory = metrics.tier(CacheTier::Memory);

        memory.record_hit(Duration::from_micros(5));
        memory.record_hit(Duration::from_micros(5));
        memory.record_miss(Duration::from_micros(5));

        assert_eq!(memory.hits(), 2);
        assert_eq!(memory.misses(), 1);
        assert!((memory.hit_rate() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_latency_ema() {
        let metrics = CacheMetrics::new();
        let remote = metrics.tier(CacheTier::Remote);

        remote.record_hit(Duration::from_micros(100));
        let stats = &metrics.tier_stats()[1];
        assert_eq!(stats.average_latency, Duration::from_micros(100));

        remote.record_hit(Duration::from_micros(200));
        let latency = metrics.tier_stats()[1].average_latency.as_micros();
        assert!(latency > 100 && latency < 200);
    }

    #[test]
    fn test_overall_hit_ratio() {
        let metrics = CacheMetrics::new();
        let zero = Duration::ZERO;

        // Four lookups: memory hit, remote hit, persistent hit, full miss
        metrics.tier(CacheTier::Memory).record_hit(zero);
        metrics.tier(CacheTier::Memory).record_miss(zero);
        metrics.tier(CacheTier::Remote).record_hit(zero);
        metrics.tier(CacheTier::Memory).record_miss(zero);
        metrics.tier(CacheTier::Remote).record_miss(zero);
        metrics.tier(CacheTier::Persistent).record_hit(zero);
        metrics.tier(CacheTier::Memory).record_miss(zero);
        metrics.tier(CacheTier::Remote).record_miss(zero);
        metrics.tier(CacheTier::Persistent).record_miss(zero);

        assert!((metrics.overall_hit_ratio() - 0.75).abs() < 0.001);
    }

    #[test]
    fn test_reset() {
        let metrics = CacheMetrics::new();
        metrics.tier(CacheTier::Memory).record_evictions(3);
        metrics.record_origin_call(true);

        metrics.reset();

        let stats = metrics.tier_stats();
        assert_eq!(stats[0].evictions, 0);
        assert_eq!(metrics.origin_calls(), 0);
        assert_eq!(metrics.origin_failures(), 0);
    }
}
