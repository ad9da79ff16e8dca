//! Memory Tier - bounded in-process entry table
//!
//! A single `parking_lot::Mutex` guards the table, the recency index and the
//! byte counter. Reads take the lock too because every hit updates recency.
//! Nothing inside the lock encodes, compresses or awaits.
//!
//! # Design
//!
//! - `HashMap` for lookup, `BTreeMap<tick, key>` as the recency index
//! - Eviction runs only when a new key is inserted into a full table
//! - Victims come from [`EvictionPolicy`], with hot keys held back

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use super::entry::CacheEntry;
use super::hot::HotKeySet;
use super::policy::{EvictionCandidate, EvictionPolicy};
use super::DEFAULT_MEMORY_CAPACITY;

/// Memory tier configuration
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Maximum number of entries
    pub capacity: usize,
    /// Eviction policy
    pub policy: EvictionPolicy,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_MEMORY_CAPACITY,
            policy: EvictionPolicy::default(),
        }
    }
}

struct Slot {
    entry: CacheEntry,
    tick: u64,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<String, Slot>,
    recency: BTreeMap<u64, String>,
    next_tick: u64,
    size_bytes: usize,
}

impl Inner {
    fn bump(&mut self, key: &str) {
        self.next_tick += 1;
        let tick = self.next_tick;
        if let Some(slot) = self.slots.get_mut(key) {
            self.recency.remove(&slot.tick);
            slot.tick = tick;
            self.recency.insert(tick, key.to_string());
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let slot = self.slots.remove(key)?;
        self.recency.remove(&slot.tick);
        self.size_bytes = self.size_bytes.saturating_sub(slot.entry.size_bytes());
        Some(slot.entry)
    }
}

/// Outcome of a memory-tier lookup
#[derive(Debug)]
pub enum MemoryLookup {
    Hit(CacheEntry),
    /// Present but past its own TTL; removed
    Expired,
    /// Present and valid, but older than the caller accepts
    TooOld,
    Miss,
}

/// Bounded memory tier
pub struct MemoryStore {
    inner: Mutex<Inner>,
    config: MemoryConfig,
    hot_keys: HotKeySet,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_config(MemoryConfig::default())
    }

    pub fn with_config(config: MemoryConfig) -> Self {
        Self::with_hot_keys(config, HotKeySet::new())
    }

    /// Share a hot-key set with the maintenance scheduler
    pub fn with_hot_keys(config: MemoryConfig, hot_keys: HotKeySet) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            config,
            hot_keys,
        }
    }

    /// Look up `key`, accepting copies no older than `max_age`
    pub fn get(&self, key: &str, max_age: Duration, now: DateTime<Utc>) -> MemoryLookup {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let Some(slot) = inner.slots.get_mut(key) else {
            return MemoryLookup::Miss;
        };

        if slot.entry.is_expired_at(now) {
            inner.remove(key);
            return MemoryLookup::Expired;
        }
        if !slot.entry.is_fresh_for(max_age, now) {
            return MemoryLookup::TooOld;
        }

        slot.entry.record_access(now);
        let entry = slot.entry.clone();
        inner.bump(key);
        MemoryLookup::Hit(entry)
    }

    /// Peek without touching access bookkeeping
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.inner.lock().slots.get(key).map(|s| s.entry.clone())
    }

    /// Insert or replace an entry, returning how many entries were evicted
    pub fn insert(&self, entry: CacheEntry) -> usize {
        let key = entry.key().as_str().to_string();
        let now = crate::clock::now_utc();
        let mut inner = self.inner.lock();

        let mut evicted = 0;
        if !inner.slots.contains_key(&key) {
            let count = self
                .config
                .policy
                .evict_count(inner.slots.len(), self.config.capacity);
            if count > 0 {
                evicted = self.evict(&mut inner, count, now);
            }
        }

        let mut entry = entry;
        if let Some(previous) = inner.remove(&key) {
            entry.inherit_access(&previous);
        }
        inner.size_bytes += entry.size_bytes();
        inner.slots.insert(key.clone(), Slot { entry, tick: 0 });
        inner.bump(&key);

        evicted
    }

    fn evict(&self, inner: &mut Inner, count: usize, now: DateTime<Utc>) -> usize {
        let hot = self.hot_keys.snapshot();
        let candidates: Vec<EvictionCandidate> = inner
            .slots
            .iter()
            .map(|(key, slot)| EvictionCandidate {
                key: key.clone(),
                access_count: slot.entry.access_count(),
                idle_secs: slot.entry.idle_secs_at(now),
                recency: slot.tick,
                hot: hot.contains(key),
            })
            .collect();

        let victims = self.config.policy.select_victims(candidates, count);
        let mut evicted = 0;
        for key in &victims {
            if inner.remove(key).is_some() {
                evicted += 1;
            }
        }

        debug!(
            policy = %self.config.policy.strategy,
            evicted,
            remaining = inner.slots.len(),
            "Memory tier at capacity, evicted entries"
        );
        evicted
    }

    pub fn remove(&self, key: &str) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    /// Remove every entry whose key matches `pred`
    pub fn remove_where<F>(&self, pred: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let mut inner = self.inner.lock();
        let doomed: Vec<String> = inner
            .slots
            .keys()
            .filter(|k| pred(k.as_str()))
            .cloned()
            .collect();
        for key in &doomed {
            inner.remove(key);
        }
        doomed.len()
    }

    /// Drop entries past their TTL
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .slots
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        expired.len()
    }

    /// Refresh recency of a resident key without counting an access
    pub fn touch(&self, key: &str, now: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock();
        match inner.slots.get_mut(key) {
            Some(slot) => {
                slot.entry.touch(now);
                inner.bump(key);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().slots.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().slots.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total payload bytes held
    pub fn size_bytes(&self) -> usize {
        self.inner.lock().size_bytes
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn hot_keys(&self) -> &HotKeySet {
        &self.hot_keys
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.slots.clear();
        inner.recency.clear();
        inner.size_bytes = 0;
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
