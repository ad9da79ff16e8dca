//! Eviction Policies
//!
//! Decides which memory-tier entries leave when the tier is full. Victims are
//! chosen in batches: each pass removes the overflow plus a headroom buffer
//! sized as a fraction of capacity, so that a full tier does not run an
//! eviction pass on every insert.
//!
//! Hot keys are only chosen once every non-hot candidate is gone.

use std::cmp::Ordering;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Victim selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionStrategy {
    /// Least recently touched first
    Lru,
    /// Lowest access count first
    Lfu,
    /// Lowest recency-decay x frequency score first
    #[default]
    Adaptive,
}

impl EvictionStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            EvictionStrategy::Lru => "lru",
            EvictionStrategy::Lfu => "lfu",
            EvictionStrategy::Adaptive => "adaptive",
        }
    }
}

impl std::fmt::Display for EvictionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EvictionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Ok(EvictionStrategy::Lru),
            "lfu" => Ok(EvictionStrategy::Lfu),
            "adaptive" => Ok(EvictionStrategy::Adaptive),
            other => Err(format!("unknown eviction policy: {}", other)),
        }
    }
}

/// What the policy needs to know about a resident entry
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub key: String,
    pub access_count: u64,
    /// Seconds since last access
    pub idle_secs: f64,
    /// Monotonic touch sequence; lower = touched longer ago
    pub recency: u64,
    pub hot: bool,
}

/// Eviction policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionPolicy {
    pub strategy: EvictionStrategy,
    /// Extra entries removed per pass, as a fraction of capacity
    pub headroom_fraction: f64,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self::adaptive()
    }
}

impl EvictionPolicy {
    /// Recency x frequency policy (default)
    pub fn adaptive() -> Self {
        Self {
            strategy: EvictionStrategy::Adaptive,
            headroom_fraction: 0.10,
        }
    }

    /// Pure LRU eviction policy
    pub fn lru() -> Self {
        Self {
            strategy: EvictionStrategy::Lru,
            ..Self::adaptive()
        }
    }

    /// LFU eviction policy
    pub fn lfu() -> Self {
        Self {
            strategy: EvictionStrategy::Lfu,
            ..Self::adaptive()
        }
    }

    pub fn with_strategy(strategy: EvictionStrategy) -> Self {
        Self {
            strategy,
            ..Self::adaptive()
        }
    }

    /// Headroom for a given capacity, at least one entry
    pub fn headroom(&self, capacity: usize) -> usize {
        let fraction = self.headroom_fraction.clamp(0.0, 1.0);
        ((capacity as f64 * fraction) as usize).max(1).min(capacity.max(1))
    }

    /// Number of entries a pass must remove before inserting a new key
    ///
    /// Zero while the tier has room.
    pub fn evict_count(&self, len: usize, capacity: usize) -> usize {
        if len < capacity {
            return 0;
        }
        (len - capacity + self.headroom(capacity)).min(len)
    }

    /// Adaptive score: `(1 / (idle + 1)) * access_count`
    ///
    /// Lower = more evictable.
    pub fn calculate_score(idle_secs: f64, access_count: u64) -> f64 {
        (1.0 / (idle_secs.max(0.0) + 1.0)) * access_count as f64
    }

    /// Pick `count` victims, non-hot first
    pub fn select_victims(&self, mut candidates: Vec<EvictionCandidate>, count: usize) -> Vec<String> {
        if count == 0 || candidates.is_empty() {
            return Vec::new();
        }

        candidates.sort_by(|a, b| {
            // Non-hot entries always sort ahead of hot ones
            a.hot
                .cmp(&b.hot)
                .then_with(|| self.compare(a, b))
        });

        candidates
            .into_iter()
            .take(count)
            .map(|c| c.key)
            .collect()
    }

    /// Ordering within one hotness class, most evictable first
    fn compare(&self, a: &EvictionCandidate, b: &EvictionCandidate) -> Ordering {
        match self.strategy {
            EvictionStrategy::Lru => a.recency.cmp(&b.recency),
            EvictionStrategy::Lfu => a
                .access_count
                .cmp(&b.access_count)
                .then_with(|| a.recency.cmp(&b.recency)),
            EvictionStrategy::Adaptive => {
                let sa = Self::calculate_score(a.idle_secs, a.access_count);
                let sb = Self::calculate_score(b.idle_secs, b.access_count);
                sa.partial_cmp(&sb)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.recency.cmp(&b.recency))
            }
        }
    }
}
