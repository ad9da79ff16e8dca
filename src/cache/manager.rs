//! Tiered Cache Coordinator
//!
//! Orchestrates lookups and writes across the memory tier, the optional
//! remote and persistent tiers, and a caller-supplied origin fetch.
//!
//! ```text
//! get:  memory ──miss──► remote ──miss──► persistent ──miss──► origin
//!          ▲                │                  │                  │
//!          └── write-back ◄─┴──────────────────┘                  │
//!          └──────────────── write-through (set) ◄────────────────┘
//! ```
//!
//! Tier failures never reach the caller: they are logged, counted, and
//! turned into misses (reads) or warnings (writes).

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::compression::{CompressionConfig, PayloadCodec};
use super::entry::{CacheEntry, CacheTier};
use super::hot::{AccessLog, HotKeySet};
use super::key::{CacheKey, CacheParams};
use super::metrics::{CacheMetrics, CacheStats, LatencyTracker};
use super::persistent::{PersistentAdapter, RowFilter, StoredRow};
use super::policy::EvictionPolicy;
use super::remote::{escape_glob, RemoteCache};
use super::store::{MemoryConfig, MemoryLookup, MemoryStore};
use super::DEFAULT_MEMORY_CAPACITY;
use crate::clock;
use crate::error::Error;

/// TTL used for entity types missing from the table
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

fn default_ttl_table() -> HashMap<String, u64> {
    [
        ("basic_info", 7 * 24 * 3600),
        ("realtime", 300),
        ("quote", 300),
        ("price_history", 3600),
        ("financial", 86400),
        ("capital_flow", 86400),
        ("market_scan", 300),
        ("industry_analysis", 1800),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Memory tier capacity (entries)
    pub capacity: usize,
    /// Eviction strategy and headroom
    pub eviction: EvictionPolicy,
    /// Payload compression
    pub compression: CompressionConfig,
    /// TTL for entity types missing from `ttl_secs`
    pub default_ttl_secs: u64,
    /// Per-entity-type TTL in seconds
    pub ttl_secs: HashMap<String, u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_MEMORY_CAPACITY,
            eviction: EvictionPolicy::default(),
            compression: CompressionConfig::default(),
            default_ttl_secs: DEFAULT_TTL.as_secs(),
            ttl_secs: default_ttl_table(),
        }
    }
}

impl CacheConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_eviction(mut self, eviction: EvictionPolicy) -> Self {
        self.eviction = eviction;
        self
    }

    /// Configured TTL for an entity type
    pub fn ttl_for(&self, entity_type: &str) -> Duration {
        let secs = self
            .ttl_secs
            .get(entity_type)
            .copied()
            .unwrap_or(self.default_ttl_secs);
        Duration::from_secs(secs)
    }

    pub fn memory_config(&self) -> MemoryConfig {
        MemoryConfig {
            capacity: self.capacity,
            policy: self.eviction.clone(),
        }
    }
}

/// Where a found value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitSource {
    Tier(CacheTier),
    Origin,
}

impl std::fmt::Display for HitSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HitSource::Tier(tier) => write!(f, "{}", tier),
            HitSource::Origin => f.write_str("origin"),
        }
    }
}

/// Result of a coordinator read
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Found {
        value: T,
        source: HitSource,
        latency: Duration,
    },
    /// Nothing in any tier; `cause` carries an origin failure when there was one
    NotFound { cause: Option<String> },
}

impl<T> Lookup<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found { .. })
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Lookup::Found { value, .. } => Some(value),
            Lookup::NotFound { .. } => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Lookup::Found { value, .. } => Some(value),
            Lookup::NotFound { .. } => None,
        }
    }

    pub fn source(&self) -> Option<HitSource> {
        match self {
            Lookup::Found { source, .. } => Some(*source),
            Lookup::NotFound { .. } => None,
        }
    }
}

/// A tier-level problem absorbed by a write or invalidation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierWarning {
    pub tier: CacheTier,
    pub message: String,
}

/// Result of [`TieredCache::set`]
#[derive(Debug, Clone, Default)]
pub struct SetOutcome {
    /// The memory write happened
    pub success: bool,
    pub warnings: Vec<TierWarning>,
}

impl SetOutcome {
    pub fn is_clean(&self) -> bool {
        self.success && self.warnings.is_empty()
    }
}

/// What to invalidate
#[derive(Debug, Clone)]
pub enum Invalidation {
    /// Keys containing this fragment
    Pattern(String),
    /// Every key of one entity type
    EntityType(String),
}

/// Result of [`TieredCache::invalidate`]
#[derive(Debug, Clone, Default)]
pub struct InvalidationOutcome {
    /// Authoritative count
    pub memory_removed: usize,
    /// Reported by the remote tier; `None` if disabled or failed
    pub remote_removed: Option<usize>,
    /// Reported by the persistent tier; `None` if disabled or failed
    pub persistent_removed: Option<usize>,
    pub warnings: Vec<TierWarning>,
}

/// Result of [`TieredCache::preload`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreloadReport {
    pub loaded: usize,
    /// Already cached in memory
    pub skipped: usize,
    /// Origin failed or returned nothing
    pub failed: usize,
}

/// Tiered cache coordinator
pub struct TieredCache {
    memory: MemoryStore,
    remote: Option<Arc<dyn RemoteCache>>,
    persistent: Option<Arc<PersistentAdapter>>,
    codec: PayloadCodec,
    config: CacheConfig,
    metrics: Arc<CacheMetrics>,
    access_log: Arc<AccessLog>,
    hot_keys: HotKeySet,
    closed: AtomicBool,
}

impl TieredCache {
    /// Memory-only coordinator
    pub fn new(config: CacheConfig) -> Self {
        let hot_keys = HotKeySet::new();
        Self {
            memory: MemoryStore::with_hot_keys(config.memory_config(), hot_keys.clone()),
            remote: None,
            persistent: None,
            codec: PayloadCodec::with_config(config.compression.clone()),
            config,
            metrics: Arc::new(CacheMetrics::new()),
            access_log: Arc::new(AccessLog::new()),
            hot_keys,
            closed: AtomicBool::new(false),
        }
    }

    /// Enable the remote tier
    pub fn with_remote(mut self, remote: Arc<dyn RemoteCache>) -> Self {
        info!(backend = remote.name(), "Remote tier enabled");
        self.remote = Some(remote);
        self
    }

    /// Enable the persistent tier
    pub fn with_persistent(mut self, persistent: Arc<PersistentAdapter>) -> Self {
        info!(backend = persistent.store().name(), "Persistent tier enabled");
        self.persistent = Some(persistent);
        self
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read the cache tiers without an origin fallback
    pub async fn get<T>(&self, entity_type: &str, params: &CacheParams, ttl: Duration) -> Lookup<T>
    where
        T: DeserializeOwned,
    {
        let key = CacheKey::generate(entity_type, params);
        self.lookup(&key, ttl)
            .await
            .unwrap_or(Lookup::NotFound { cause: None })
    }

    /// Read the cache tiers, then `origin` on a full miss
    ///
    /// A value returned by the origin is written through all tiers. An origin
    /// error becomes `NotFound` with the cause attached.
    pub async fn get_or_fetch<T, F, Fut>(
        &self,
        entity_type: &str,
        params: &CacheParams,
        ttl: Duration,
        origin: F,
    ) -> Lookup<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>>,
    {
        let start = Instant::now();
        let key = CacheKey::generate(entity_type, params);
        if let Some(found) = self.lookup(&key, ttl).await {
            return found;
        }

        match origin().await {
            Ok(Some(value)) => {
                self.metrics.record_origin_call(false);
                let outcome = self.write_through(&key, &value, ttl).await;
                if !outcome.success {
                    warn!(key = %key, "Origin value could not be cached");
                }
                Lookup::Found {
                    value,
                    source: HitSource::Origin,
                    latency: start.elapsed(),
                }
            }
            Ok(None) => {
                self.metrics.record_origin_call(false);
                debug!(key = %key, "Origin has no data");
                Lookup::NotFound { cause: None }
            }
            Err(e) => {
                self.metrics.record_origin_call(true);
                let failure = Error::OriginFailure {
                    key: key.to_string(),
                    reason: format!("{:#}", e),
                };
                warn!(error = %failure, "Origin fetch failed");
                Lookup::NotFound {
                    cause: Some(failure.to_string()),
                }
            }
        }
    }

    /// Read with the entity type's configured TTL
    pub async fn get_default<T>(&self, entity_type: &str, params: &CacheParams) -> Lookup<T>
    where
        T: DeserializeOwned,
    {
        self.get(entity_type, params, self.ttl_for(entity_type)).await
    }

    async fn lookup<T>(&self, key: &CacheKey, ttl: Duration) -> Option<Lookup<T>>
    where
        T: DeserializeOwned,
    {
        let start = Instant::now();
        let now = clock::now_utc();
        self.access_log.record(key.as_str(), clock::now());

        // Memory
        let tracker = LatencyTracker::start();
        let memory = self.metrics.tier(CacheTier::Memory);
        match self.memory.get(key.as_str(), ttl, now) {
            MemoryLookup::Hit(entry) => match self.decode::<T>(&entry) {
                Some(value) => {
                    memory.record_hit(tracker.elapsed());
                    return Some(Lookup::Found {
                        value,
                        source: HitSource::Tier(CacheTier::Memory),
                        latency: start.elapsed(),
                    });
                }
                // Still valid for callers reading the stored type
                None => memory.record_miss(tracker.elapsed()),
            },
            _ => memory.record_miss(tracker.elapsed()),
        }

        // Remote, then persistent
        for tier in [CacheTier::Remote, CacheTier::Persistent] {
            let Some(entry) = self.read_tier(tier, key, ttl, now).await else {
                continue;
            };
            if let Some(value) = self.decode::<T>(&entry) {
                self.write_back(&entry, ttl, now).await;
                return Some(Lookup::Found {
                    value,
                    source: HitSource::Tier(tier),
                    latency: start.elapsed(),
                });
            }
        }

        None
    }

    /// Read one slower tier; any failure is a miss
    async fn read_tier(
        &self,
        tier: CacheTier,
        key: &CacheKey,
        ttl: Duration,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Option<CacheEntry> {
        let tracker = LatencyTracker::start();
        let counters = self.metrics.tier(tier);

        let raw = match tier {
            CacheTier::Remote => {
                let remote = self.remote.as_ref()?;
                remote.get(key.as_str()).await
            }
            CacheTier::Persistent => {
                let persistent = self.persistent.as_ref()?;
                persistent
                    .get_snapshot(key.as_str())
                    .await
                    .map(|row| row.map(|r| r.payload))
            }
            CacheTier::Memory => return None,
        };

        let bytes = match raw {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                counters.record_miss(tracker.elapsed());
                return None;
            }
            Err(e) => {
                warn!(tier = %tier, key = %key, error = %e, "Tier read failed, treating as miss");
                counters.record_error();
                counters.record_miss(tracker.elapsed());
                return None;
            }
        };

        match CacheEntry::from_envelope(key.clone(), bytes, tier) {
            Ok(entry) if entry.is_fresh_for(ttl, now) => {
                counters.record_hit(tracker.elapsed());
                Some(entry)
            }
            Ok(_) => {
                counters.record_miss(tracker.elapsed());
                None
            }
            Err(e) => {
                warn!(tier = %tier, key = %key, error = %e, "Unreadable envelope, treating as miss");
                counters.record_error();
                counters.record_miss(tracker.elapsed());
                None
            }
        }
    }

    fn decode<T: DeserializeOwned>(&self, entry: &CacheEntry) -> Option<T> {
        match self.codec.decode(entry.payload()) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(tier = %entry.tier(), key = %entry.key(), error = %e, "Cached payload does not decode");
                self.metrics.tier(entry.tier()).record_error();
                None
            }
        }
    }

    /// Copy a slower-tier hit into every faster tier
    ///
    /// The copy keeps its creation time and never outlives the caller's TTL.
    async fn write_back(&self, entry: &CacheEntry, ttl: Duration, now: chrono::DateTime<chrono::Utc>) {
        let ttl = entry.ttl().min(ttl);
        let copy = CacheEntry::new(
            entry.key().clone(),
            entry.payload().clone(),
            ttl,
            CacheTier::Memory,
        )
        .with_created_at(entry.created_at());
        self.insert_memory(copy.clone());

        if entry.tier() == CacheTier::Persistent {
            if let Some(remote) = &self.remote {
                let remaining = ttl.saturating_sub(entry.age_at(now)).as_secs().max(1);
                let framed = copy.in_tier(CacheTier::Remote).to_envelope();
                if let Err(e) = remote.set_with_ttl(entry.key().as_str(), framed, remaining).await {
                    warn!(key = %entry.key(), error = %e, "Remote write-back failed");
                    self.metrics.tier(CacheTier::Remote).record_error();
                }
            }
        }
        debug!(key = %entry.key(), from = %entry.tier(), "Wrote back to faster tiers");
    }

    fn insert_memory(&self, entry: CacheEntry) {
        let evicted = self.memory.insert(entry);
        if evicted > 0 {
            self.metrics
                .tier(CacheTier::Memory)
                .record_evictions(evicted as u64);
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write a value through every enabled tier
    ///
    /// Slower-tier failures are reported as warnings; the call still succeeds
    /// once the memory write is done.
    pub async fn set<T>(
        &self,
        entity_type: &str,
        params: &CacheParams,
        value: &T,
        ttl: Duration,
    ) -> SetOutcome
    where
        T: Serialize + ?Sized,
    {
        let key = CacheKey::generate(entity_type, params);
        self.write_through(&key, value, ttl).await
    }

    /// Write with the entity type's configured TTL
    pub async fn set_default<T>(&self, entity_type: &str, params: &CacheParams, value: &T) -> SetOutcome
    where
        T: Serialize + ?Sized,
    {
        self.set(entity_type, params, value, self.ttl_for(entity_type))
            .await
    }

    async fn write_through<T>(&self, key: &CacheKey, value: &T, ttl: Duration) -> SetOutcome
    where
        T: Serialize + ?Sized,
    {
        let payload = match self.codec.encode(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(key = %key, error = %e, "Value does not serialize, nothing cached");
                return SetOutcome {
                    success: false,
                    warnings: CacheTier::all()
                        .into_iter()
                        .map(|tier| TierWarning {
                            tier,
                            message: e.to_string(),
                        })
                        .collect(),
                };
            }
        };

        let entry = CacheEntry::new(key.clone(), payload, ttl, CacheTier::Memory);
        let mut warnings = Vec::new();

        // Framed once, outside any lock
        let framed = (self.remote.is_some() || self.persistent.is_some())
            .then(|| entry.to_envelope());
        self.insert_memory(entry.clone());

        if let (Some(remote), Some(framed)) = (&self.remote, &framed) {
            if let Err(e) = remote
                .set_with_ttl(key.as_str(), framed.clone(), ttl.as_secs().max(1))
                .await
            {
                warn!(tier = "remote", key = %key, error = %e, "Write-through failed");
                self.metrics.tier(CacheTier::Remote).record_error();
                warnings.push(TierWarning {
                    tier: CacheTier::Remote,
                    message: e.to_string(),
                });
            }
        }

        if let (Some(persistent), Some(framed)) = (&self.persistent, framed) {
            let row = StoredRow::snapshot(key.as_str(), framed, ttl);
            if let Err(e) = persistent.put_snapshot(row).await {
                warn!(tier = "persistent", key = %key, error = %e, "Write-through failed");
                self.metrics.tier(CacheTier::Persistent).record_error();
                warnings.push(TierWarning {
                    tier: CacheTier::Persistent,
                    message: e.to_string(),
                });
            }
        }

        for _ in &warnings {
            self.metrics.record_write_warning();
        }
        SetOutcome {
            success: true,
            warnings,
        }
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Remove matching entries from every tier
    ///
    /// Only the memory count is authoritative; slower tiers are best effort.
    pub async fn invalidate(&self, target: Invalidation) -> InvalidationOutcome {
        let (memory_removed, globs, filter) = match &target {
            Invalidation::Pattern(fragment) => (
                self.memory.remove_where(|k| k.contains(fragment.as_str())),
                vec![format!("*{}*", escape_glob(fragment))],
                RowFilter::containing(fragment.clone()).snapshots(),
            ),
            Invalidation::EntityType(entity_type) => (
                self.memory
                    .remove_where(|k| CacheKey::is_of_type(k, entity_type)),
                vec![
                    format!("{}*", escape_glob(&CacheKey::entity_prefix(entity_type))),
                    escape_glob(entity_type),
                ],
                RowFilter::entity_type(entity_type.clone()).snapshots(),
            ),
        };

        let mut outcome = InvalidationOutcome {
            memory_removed,
            ..Default::default()
        };

        if let Some(remote) = &self.remote {
            let mut removed = Some(0);
            for glob in &globs {
                match remote.delete(glob).await {
                    Ok(n) => removed = removed.map(|total| total + n),
                    Err(e) => {
                        warn!(tier = "remote", pattern = %glob, error = %e, "Invalidation failed");
                        self.metrics.tier(CacheTier::Remote).record_error();
                        outcome.warnings.push(TierWarning {
                            tier: CacheTier::Remote,
                            message: e.to_string(),
                        });
                        removed = None;
                        break;
                    }
                }
            }
            outcome.remote_removed = removed;
        }

        if let Some(persistent) = &self.persistent {
            match persistent.delete(&filter).await {
                Ok(n) => outcome.persistent_removed = Some(n),
                Err(e) => {
                    warn!(tier = "persistent", error = %e, "Invalidation failed");
                    self.metrics.tier(CacheTier::Persistent).record_error();
                    outcome.warnings.push(TierWarning {
                        tier: CacheTier::Persistent,
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(
            invalidation = ?target,
            memory = outcome.memory_removed,
            remote = ?outcome.remote_removed,
            persistent = ?outcome.persistent_removed,
            "Cache invalidated"
        );
        outcome
    }

    // =========================================================================
    // Warm-up
    // =========================================================================

    /// Fetch and cache a list of requests through `origin`
    ///
    /// At most `concurrency` origin calls run at once. Requests already cached
    /// in memory are skipped.
    pub async fn preload<T, F, Fut>(
        &self,
        requests: Vec<(String, CacheParams)>,
        origin: F,
        concurrency: usize,
    ) -> PreloadReport
    where
        T: Serialize,
        F: Fn(String, CacheParams) -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>>,
    {
        let total = requests.len();
        let now = clock::now_utc();
        let mut report = PreloadReport::default();

        let pending: Vec<(String, CacheParams)> = requests
            .into_iter()
            .filter(|(entity_type, params)| {
                let key = CacheKey::generate(entity_type, params);
                let ttl = self.ttl_for(entity_type);
                let cached = self
                    .memory
                    .peek(key.as_str())
                    .map(|e| e.is_fresh_for(ttl, now))
                    .unwrap_or(false);
                if cached {
                    report.skipped += 1;
                }
                !cached
            })
            .collect();

        let origin = &origin;
        let results: Vec<bool> = stream::iter(pending)
            .map(|(entity_type, params)| async move {
                let key = CacheKey::generate(&entity_type, &params);
                let ttl = self.ttl_for(&entity_type);
                match origin(entity_type, params).await {
                    Ok(Some(value)) => {
                        self.metrics.record_origin_call(false);
                        self.write_through(&key, &value, ttl).await.success
                    }
                    Ok(None) => {
                        self.metrics.record_origin_call(false);
                        false
                    }
                    Err(e) => {
                        self.metrics.record_origin_call(true);
                        warn!(key = %key, error = %e, "Preload fetch failed");
                        false
                    }
                }
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        for ok in results {
            if ok {
                report.loaded += 1;
            } else {
                report.failed += 1;
            }
        }

        info!(
            total,
            loaded = report.loaded,
            skipped = report.skipped,
            failed = report.failed,
            "Preload complete"
        );
        report
    }

    // =========================================================================
    // Introspection and lifecycle
    // =========================================================================

    /// Configured TTL for an entity type
    pub fn ttl_for(&self, entity_type: &str) -> Duration {
        self.config.ttl_for(entity_type)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            tiers: self.metrics.tier_stats(),
            memory_entries: self.memory.len(),
            memory_capacity: self.memory.capacity(),
            memory_bytes: self.memory.size_bytes(),
            hot_keys: self.hot_keys.len(),
            origin_calls: self.metrics.origin_calls(),
            origin_failures: self.metrics.origin_failures(),
            write_warnings: self.metrics.write_warnings(),
            overall_hit_ratio: self.metrics.overall_hit_ratio(),
            remote_enabled: self.remote.is_some(),
            persistent_enabled: self.persistent.is_some(),
        }
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn access_log(&self) -> &Arc<AccessLog> {
        &self.access_log
    }

    pub fn hot_keys(&self) -> &HotKeySet {
        &self.hot_keys
    }

    pub fn persistent(&self) -> Option<&Arc<PersistentAdapter>> {
        self.persistent.as_ref()
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Drop in-process state and log final statistics
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let stats = self.stats();
        self.memory.clear();
        self.access_log.clear();
        self.hot_keys.replace(Default::default());
        info!(
            hit_ratio = stats.overall_hit_ratio,
            entries = stats.memory_entries,
            origin_calls = stats.origin_calls,
            "Cache closed"
        );
    }
}

// =============================================================================
// Tests
// =============================================================================
