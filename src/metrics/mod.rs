//! Metrics module
//!
//! Mirrors cache statistics into a Prometheus registry for the `/metrics`
//! endpoint. Values are snapshots copied from [`CacheStats`] on each update,
//! so every series is a gauge.

use prometheus::{Encoder, GaugeVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::cache::metrics::CacheStats;
use crate::cache::persistent::QueryStats;
use crate::error::{Error, Result};

const NAMESPACE: &str = "marketcache";

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("Metrics registry error: {}", e))
}

/// Prometheus view of the tiered cache
pub struct CacheExporter {
    registry: Registry,
    hits: IntGaugeVec,
    misses: IntGaugeVec,
    evictions: IntGaugeVec,
    requests: IntGaugeVec,
    hit_ratio: GaugeVec,
    avg_latency: GaugeVec,
    memory_entries: IntGauge,
    hot_keys: IntGauge,
    slow_queries: IntGauge,
    origin_calls: IntGauge,
}

impl CacheExporter {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let tier_gauge = |name: &str, help: &str| -> Result<IntGaugeVec> {
            let gauge = IntGaugeVec::new(Opts::new(name, help).namespace(NAMESPACE), &["tier"])
                .map_err(metrics_error)?;
            registry
                .register(Box::new(gauge.clone()))
                .map_err(metrics_error)?;
            Ok(gauge)
        };
        let hits = tier_gauge("hits", "Cache hits per tier")?;
        let misses = tier_gauge("misses", "Cache misses per tier")?;
        let evictions = tier_gauge("evictions", "Entries evicted per tier")?;
        let requests = tier_gauge("requests", "Lookups served per tier")?;

        let ratio_gauge = |name: &str, help: &str| -> Result<GaugeVec> {
            let gauge = GaugeVec::new(Opts::new(name, help).namespace(NAMESPACE), &["tier"])
                .map_err(metrics_error)?;
            registry
                .register(Box::new(gauge.clone()))
                .map_err(metrics_error)?;
            Ok(gauge)
        };
        let hit_ratio = ratio_gauge("hit_ratio", "Hit ratio per tier")?;
        let avg_latency = ratio_gauge("avg_latency_seconds", "Average lookup latency per tier")?;

        let plain_gauge = |name: &str, help: &str| -> Result<IntGauge> {
            let gauge =
                IntGauge::with_opts(Opts::new(name, help).namespace(NAMESPACE)).map_err(metrics_error)?;
            registry
                .register(Box::new(gauge.clone()))
                .map_err(metrics_error)?;
            Ok(gauge)
        };
        let memory_entries = plain_gauge("memory_entries", "Entries resident in the memory tier")?;
        let hot_keys = plain_gauge("hot_keys", "Keys currently classified as hot")?;
        let slow_queries = plain_gauge("slow_queries", "Persistent queries over the slow threshold")?;
        let origin_calls = plain_gauge("origin_calls", "Origin fetches after a full miss")?;

        Ok(Self {
            registry,
            hits,
            misses,
            evictions,
            requests,
            hit_ratio,
            avg_latency,
            memory_entries,
            hot_keys,
            slow_queries,
            origin_calls,
        })
    }

    /// Copy a stats snapshot into the gauges
    pub fn update(&self, stats: &CacheStats, queries: Option<&QueryStats>) {
        for tier in &stats.tiers {
            let label = [tier.tier.label()];
            self.hits.with_label_values(&label).set(tier.hits as i64);
            self.misses.with_label_values(&label).set(tier.misses as i64);
            self.evictions
                .with_label_values(&label)
                .set(tier.evictions as i64);
            self.requests
                .with_label_values(&label)
                .set(tier.total_requests as i64);
            self.hit_ratio.with_label_values(&label).set(tier.hit_rate);
            self.avg_latency
                .with_label_values(&label)
                .set(tier.average_latency.as_secs_f64());
        }

        self.memory_entries.set(stats.memory_entries as i64);
        self.hot_keys.set(stats.hot_keys as i64);
        self.origin_calls.set(stats.origin_calls as i64);
        if let Some(queries) = queries {
            self.slow_queries.set(queries.slow_queries as i64);
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("Metrics not UTF-8: {}", e)))
    }

    pub fn content_type(&self) -> &'static str {
        prometheus::TEXT_FORMAT
    }
}

// =============================================================================
// Tests
// =============================================================================
