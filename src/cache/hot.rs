//! Hot-key tracking
//!
//! [`AccessLog`] keeps a bounded list of recent read times per key. The
//! maintenance scheduler turns it into a [`HotKeySet`], which the memory tier
//! consults when picking eviction victims.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::time::Instant;

/// Per-key access history is capped at this many timestamps
pub const ACCESS_LOG_CAP: usize = 100;

/// When the cap is hit, history is trimmed back to this many
pub const ACCESS_LOG_TRIM_TO: usize = 50;

/// Rolling per-key access log
#[derive(Debug, Default)]
pub struct AccessLog {
    entries: DashMap<String, VecDeque<Instant>>,
}

impl AccessLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a read of `key`
    pub fn record(&self, key: &str, at: Instant) {
        let mut history = self.entries.entry(key.to_string()).or_default();
        history.push_back(at);
        if history.len() > ACCESS_LOG_CAP {
            let excess = history.len() - ACCESS_LOG_TRIM_TO;
            history.drain(..excess);
        }
    }

    /// Accesses of `key` within `window` of `now`
    pub fn count_within(&self, key: &str, now: Instant, window: Duration) -> usize {
        self.entries
            .get(key)
            .map(|h| {
                h.iter()
                    .filter(|t| now.saturating_duration_since(**t) <= window)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Keys with at least `threshold` accesses inside the window
    ///
    /// Also drops timestamps that fell out of the window and forgets keys
    /// with no remaining history.
    pub fn hot_keys(&self, now: Instant, window: Duration, threshold: usize) -> HashSet<String> {
        let mut hot = HashSet::new();
        self.entries.retain(|key, history| {
            trim_outside(history, now, window);
            if history.len() >= threshold {
                hot.insert(key.clone());
            }
            !history.is_empty()
        });
        hot
    }

    /// Drop timestamps outside the window; returns the number of keys forgotten
    pub fn prune(&self, now: Instant, window: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, history| {
            trim_outside(history, now, window);
            !history.is_empty()
        });
        before.saturating_sub(self.entries.len())
    }

    pub fn tracked_keys(&self) -> usize {
        self.entries.len()
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

fn trim_outside(history: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = history.front() {
        if now.saturating_duration_since(*front) > window {
            history.pop_front();
        } else {
            break;
        }
    }
}

/// Shared handle to the current hot-key set
///
/// Readers get a consistent snapshot; the scheduler swaps in a whole new set.
#[derive(Debug, Clone, Default)]
pub struct HotKeySet {
    inner: Arc<RwLock<Arc<HashSet<String>>>>,
}

impl HotKeySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole set at once
    pub fn replace(&self, keys: HashSet<String>) {
        *self.inner.write() = Arc::new(keys);
    }

    pub fn snapshot(&self) -> Arc<HashSet<String>> {
        self.inner.read().clone()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.read().contains(key)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
