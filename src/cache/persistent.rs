//! Persistent Tier - durable keyed store
//!
//! The storage engine is abstracted as a keyed row store with filter queries
//! and bulk writes ([`PersistentStore`]). Two kinds of rows live there:
//!
//! - snapshot rows (`as_of = None`): one cached value per key, with expiry
//! - history rows (`as_of = Some(date)`): one row per key and business date
//!
//! [`PersistentAdapter`] wraps a store with the batch-oriented access the
//! coordinator and the freshness code use, and keeps query statistics.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::key::CacheKey;
use crate::error::Result;

/// Queries slower than this are counted as slow
pub const DEFAULT_SLOW_QUERY_THRESHOLD: Duration = Duration::from_secs(1);

// =============================================================================
// Rows and filters
// =============================================================================

/// One row in the persistent store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub key: String,
    /// Business date for history rows, `None` for snapshot rows
    pub as_of: Option<NaiveDate>,
    pub payload: Bytes,
    pub created_at: DateTime<Utc>,
    /// `None` = never expires
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredRow {
    /// Snapshot row holding a cached value until `ttl` elapses
    pub fn snapshot(key: impl Into<String>, payload: Bytes, ttl: Duration) -> Self {
        let now = crate::clock::now_utc();
        // A TTL past the representable range never expires
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl));
        Self {
            key: key.into(),
            as_of: None,
            payload,
            created_at: now,
            expires_at,
        }
    }

    /// History row for one business date
    pub fn history(key: impl Into<String>, date: NaiveDate, payload: Bytes) -> Self {
        Self {
            key: key.into(),
            as_of: Some(date),
            payload,
            created_at: crate::clock::now_utc(),
            expires_at: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Row selection criteria; all set conditions must hold
#[derive(Debug, Clone, Default)]
pub struct RowFilter {
    /// `key IN (...)`
    pub keys: Option<Vec<String>>,
    pub key_prefix: Option<String>,
    /// Keys generated for this entity type, bare key included
    pub entity_type: Option<String>,
    pub key_contains: Option<String>,
    /// Inclusive `as_of` range; excludes snapshot rows
    pub dates: Option<(NaiveDate, NaiveDate)>,
    /// Only snapshot rows
    pub snapshots_only: bool,
    /// Rows with `expires_at <= t`
    pub expired_at: Option<DateTime<Utc>>,
}

impl RowFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(key: impl Into<String>) -> Self {
        Self::keys(vec![key.into()])
    }

    pub fn keys(keys: Vec<String>) -> Self {
        Self {
            keys: Some(keys),
            ..Default::default()
        }
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            key_prefix: Some(prefix.into()),
            ..Default::default()
        }
    }

    pub fn entity_type(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: Some(entity_type.into()),
            ..Default::default()
        }
    }

    pub fn containing(fragment: impl Into<String>) -> Self {
        Self {
            key_contains: Some(fragment.into()),
            ..Default::default()
        }
    }

    pub fn expired(now: DateTime<Utc>) -> Self {
        Self {
            expired_at: Some(now),
            ..Default::default()
        }
    }

    pub fn between(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.dates = Some((start, end));
        self
    }

    pub fn snapshots(mut self) -> Self {
        self.snapshots_only = true;
        self
    }

    pub fn matches(&self, row: &StoredRow) -> bool {
        if let Some(keys) = &self.keys {
            if !keys.iter().any(|k| k == &row.key) {
                return false;
            }
        }
        if let Some(prefix) = &self.key_prefix {
            if !row.key.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(entity_type) = &self.entity_type {
            if !CacheKey::is_of_type(&row.key, entity_type) {
                return false;
            }
        }
        if let Some(fragment) = &self.key_contains {
            if !row.key.contains(fragment.as_str()) {
                return false;
            }
        }
        if let Some((start, end)) = self.dates {
            match row.as_of {
                Some(date) if date >= start && date <= end => {}
                _ => return false,
            }
        }
        if self.snapshots_only && row.as_of.is_some() {
            return false;
        }
        if let Some(now) = self.expired_at {
            if !row.is_expired_at(now) {
                return false;
            }
        }
        true
    }
}

// =============================================================================
// Store port
// =============================================================================

/// Durable keyed store port
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn query(&self, filter: &RowFilter) -> Result<Vec<StoredRow>>;

    /// Insert or replace rows by `(key, as_of)`
    async fn bulk_upsert(&self, rows: Vec<StoredRow>) -> Result<usize>;

    async fn bulk_delete(&self, filter: &RowFilter) -> Result<usize>;

    async fn count(&self, filter: &RowFilter) -> Result<usize>;

    fn name(&self) -> &'static str;
}

/// Process-local persistent store
#[derive(Default)]
pub struct InMemoryPersistentStore {
    rows: DashMap<String, BTreeMap<Option<NaiveDate>, StoredRow>>,
}

impl InMemoryPersistentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.iter().map(|r| r.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn collect(&self, filter: &RowFilter) -> Vec<StoredRow> {
        let mut out = Vec::new();
        match &filter.keys {
            Some(keys) => {
                for key in keys {
                    if let Some(rows) = self.rows.get(key) {
                        out.extend(rows.values().filter(|r| filter.matches(r)).cloned());
                    }
                }
            }
            None => {
                for rows in self.rows.iter() {
                    out.extend(rows.values().filter(|r| filter.matches(r)).cloned());
                }
            }
        }
        out
    }
}

#[async_trait]
impl PersistentStore for InMemoryPersistentStore {
    async fn query(&self, filter: &RowFilter) -> Result<Vec<StoredRow>> {
        Ok(self.collect(filter))
    }

    async fn bulk_upsert(&self, rows: Vec<StoredRow>) -> Result<usize> {
        let count = rows.len();
        for row in rows {
            self.rows
                .entry(row.key.clone())
                .or_default()
                .insert(row.as_of, row);
        }
        Ok(count)
    }

    async fn bulk_delete(&self, filter: &RowFilter) -> Result<usize> {
        let mut deleted = 0;
        self.rows.retain(|_, rows| {
            let before = rows.len();
            rows.retain(|_, row| !filter.matches(row));
            deleted += before - rows.len();
            !rows.is_empty()
        });
        Ok(deleted)
    }

    async fn count(&self, filter: &RowFilter) -> Result<usize> {
        Ok(self.collect(filter).len())
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}

/// Store whose every call fails, for exercising degraded paths
#[cfg(test)]
pub(crate) struct UnavailableStore;

#[cfg(test)]
#[async_trait]
impl PersistentStore for UnavailableStore {
    async fn query(&self, _filter: &RowFilter) -> Result<Vec<StoredRow>> {
        Err(crate::error::Error::tier("persistent", "down"))
    }
    async fn bulk_upsert(&self, _rows: Vec<StoredRow>) -> Result<usize> {
        Err(crate::error::Error::tier("persistent", "down"))
    }
    async fn bulk_delete(&self, _filter: &RowFilter) -> Result<usize> {
        Err(crate::error::Error::tier("persistent", "down"))
    }
    async fn count(&self, _filter: &RowFilter) -> Result<usize> {
        Err(crate::error::Error::tier("persistent", "down"))
    }
    fn name(&self) -> &'static str {
        "unavailable"
    }
}

// =============================================================================
// Adapter
// =============================================================================

/// Query statistics kept by the adapter
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryStats {
    pub total_queries: u64,
    pub slow_queries: u64,
    pub failed_queries: u64,
    pub average_latency: Duration,
    pub last_slow_query: Option<String>,
}

/// Batch-oriented access to a [`PersistentStore`]
pub struct PersistentAdapter {
    store: Arc<dyn PersistentStore>,
    slow_threshold: Duration,
    total: AtomicU64,
    slow: AtomicU64,
    failed: AtomicU64,
    latency_us: AtomicU64,
    last_slow: Mutex<Option<String>>,
}

impl PersistentAdapter {
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        Self::with_slow_threshold(store, DEFAULT_SLOW_QUERY_THRESHOLD)
    }

    pub fn with_slow_threshold(store: Arc<dyn PersistentStore>, slow_threshold: Duration) -> Self {
        Self {
            store,
            slow_threshold,
            total: AtomicU64::new(0),
            slow: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            latency_us: AtomicU64::new(0),
            last_slow: Mutex::new(None),
        }
    }

    /// In-memory store, for tests and single-node runs
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryPersistentStore::new()))
    }

    pub fn store(&self) -> &Arc<dyn PersistentStore> {
        &self.store
    }

    fn record(&self, op: &str, latency: Duration, ok: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }

        let new_us = latency.as_micros() as u64;
        let current = self.latency_us.load(Ordering::Relaxed);
        let updated = if current == 0 {
            new_us
        } else {
            (0.9 * current as f64 + 0.1 * new_us as f64) as u64
        };
        self.latency_us.store(updated, Ordering::Relaxed);

        if latency > self.slow_threshold {
            self.slow.fetch_add(1, Ordering::Relaxed);
            let description = format!("{} took {:?}", op, latency);
            warn!(store = self.store.name(), op, ?latency, "Slow persistent query");
            *self.last_slow.lock() = Some(description);
        }
    }

    async fn timed<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let result = fut.await;
        self.record(op, start.elapsed(), result.is_ok());
        result
    }

    pub async fn query(&self, filter: &RowFilter) -> Result<Vec<StoredRow>> {
        self.timed("query", self.store.query(filter)).await
    }

    pub async fn count(&self, filter: &RowFilter) -> Result<usize> {
        self.timed("count", self.store.count(filter)).await
    }

    pub async fn delete(&self, filter: &RowFilter) -> Result<usize> {
        self.timed("bulk_delete", self.store.bulk_delete(filter))
            .await
    }

    /// Unexpired snapshot row for `key`
    pub async fn get_snapshot(&self, key: &str) -> Result<Option<StoredRow>> {
        let now = crate::clock::now_utc();
        let rows = self.query(&RowFilter::key(key).snapshots()).await?;
        Ok(rows.into_iter().find(|r| !r.is_expired_at(now)))
    }

    /// Write one snapshot row
    pub async fn put_snapshot(&self, row: StoredRow) -> Result<()> {
        self.timed("bulk_upsert", self.store.bulk_upsert(vec![row]))
            .await
            .map(|_| ())
    }

    /// History rows for many keys in one `IN` query, grouped and date-sorted
    ///
    /// Every requested key is present in the result, possibly with no rows.
    pub async fn batch_get(
        &self,
        keys: &[String],
        range: Option<(NaiveDate, NaiveDate)>,
    ) -> Result<HashMap<String, Vec<StoredRow>>> {
        let mut filter = RowFilter::keys(keys.to_vec());
        filter.dates = range;
        if range.is_none() {
            // History rows only
            filter.dates = Some((NaiveDate::MIN, NaiveDate::MAX));
        }

        let rows = self.query(&filter).await?;

        let mut grouped: HashMap<String, Vec<StoredRow>> =
            keys.iter().map(|k| (k.clone(), Vec::new())).collect();
        for row in rows {
            grouped.entry(row.key.clone()).or_default().push(row);
        }
        for rows in grouped.values_mut() {
            rows.sort_by_key(|r| r.as_of);
        }
        Ok(grouped)
    }

    /// Replace history rows: delete each key's covered date span, then one bulk insert
    pub async fn batch_set(&self, rows: Vec<StoredRow>) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut spans: HashMap<&str, (NaiveDate, NaiveDate)> = HashMap::new();
        for row in &rows {
            if let Some(date) = row.as_of {
                spans
                    .entry(row.key.as_str())
                    .and_modify(|(lo, hi)| {
                        *lo = (*lo).min(date);
                        *hi = (*hi).max(date);
                    })
                    .or_insert((date, date));
            }
        }

        let mut replaced = 0;
        for (key, (start, end)) in &spans {
            replaced += self
                .delete(&RowFilter::key(*key).between(*start, *end))
                .await?;
        }

        let written = self
            .timed("bulk_upsert", self.store.bulk_upsert(rows.clone()))
            .await?;
        debug!(
            keys = spans.len(),
            replaced, written, "Persistent batch write complete"
        );
        Ok(written)
    }

    /// Delete rows whose expiry has passed
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        self.delete(&RowFilter::expired(now)).await
    }

    pub fn query_stats(&self) -> QueryStats {
        QueryStats {
            total_queries: self.total.load(Ordering::Relaxed),
            slow_queries: self.slow.load(Ordering::Relaxed),
            failed_queries: self.failed.load(Ordering::Relaxed),
            average_latency: Duration::from_micros(self.latency_us.load(Ordering::Relaxed)),
            last_slow_query: self.last_slow.lock().clone(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn bar(key: &str, day: &str, close: f64) -> StoredRow {
        StoredRow::history(
            key,
            date(day),
            Bytes::from(format!("{{\"close\":{}}}", close)),
        )
    }

    /// Store whose every call sleeps first
    struct SlowStore {
        inner: InMemoryPersistentStore,
        delay: Duration,
    }

    #[async_trait]
    impl PersistentStore for SlowStore {
        async fn query(&self, filter: &RowFilter) -> Result<Vec<StoredRow>> {
            tokio::time::sleep(self.delay).await;
            self.inner.query(filter).await
        }
        async fn bulk_upsert(&self, rows: Vec<StoredRow>) -> Result<usize> {
            self.inner.bulk_upsert(rows).await
        }
        async fn bulk_delete(&self, filter: &RowFilter) -> Result<usize> {
            self.inner.bulk_delete(filter).await
        }
        async fn count(&self, filter: &RowFilter) -> Result<usize> {
            self.inner.count(filter).await
        }
        fn name(&self) -> &'static str {
            "slow"
        }
    }

    #[test]
    fn test_snapshot_with_huge_ttl_never_expires() {
        let row = StoredRow::snapshot("quote|code=1", Bytes::from_static(b"1"), Duration::MAX);
        assert!(row.expires_at.is_none());
        assert!(!row.is_expired_at(crate::clock::now_utc()));

        let row = StoredRow::snapshot("quote|code=1", Bytes::from_static(b"1"), Duration::from_secs(60));
        assert!(row.expires_at.is_some());
    }

    #[test]
    fn test_filter_matching() {
        let row = bar("price_history|code=000001", "2024-01-02", 10.0);

        assert!(RowFilter::prefix("price_history|").matches(&row));
        assert!(RowFilter::entity_type("price_history").matches(&row));
        assert!(!RowFilter::entity_type("price").matches(&row));
        assert!(RowFilter::containing("000001").matches(&row));
        assert!(!RowFilter::containing("600000").matches(&row));
        assert!(RowFilter::new()
            .between(date("2024-01-01"), date("2024-01-31"))
            .matches(&row));
        assert!(!RowFilter::new()
            .between(date("2024-02-01"), date("2024-02-29"))
            .matches(&row));
        assert!(!RowFilter::new().snapshots().matches(&row));
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let adapter = PersistentAdapter::in_memory();
        let row = StoredRow::snapshot("quote|code=1", Bytes::from_static(b"v"), Duration::from_secs(60));
        adapter.put_snapshot(row.clone()).await.unwrap();

        let found = adapter.get_snapshot("quote|code=1").await.unwrap();
        assert_eq!(found, Some(row));
        assert_eq!(adapter.get_snapshot("quote|code=2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_batch_get_groups_every_key() {
        let adapter = PersistentAdapter::in_memory();
        adapter
            .batch_set(vec![
                bar("a", "2024-01-03", 1.0),
                bar("a", "2024-01-02", 1.0),
                bar("b", "2024-01-02", 2.0),
            ])
            .await
            .unwrap();

        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let grouped = adapter.batch_get(&keys, None).await.unwrap();

        assert_eq!(grouped.len(), 3);
        assert_eq!(grouped["a"].len(), 2);
        assert_eq!(grouped["a"][0].as_of, Some(date("2024-01-02")));
        assert_eq!(grouped["b"].len(), 1);
        assert!(grouped["c"].is_empty());
        // One IN query plus the writes
        assert_eq!(adapter.query_stats().failed_queries, 0);
    }

    #[tokio::test]
    async fn test_batch_set_replaces_overlapping_span() {
        let adapter = PersistentAdapter::in_memory();
        adapter
            .batch_set(vec![
                bar("a", "2024-01-02", 1.0),
                bar("a", "2024-01-03", 1.0),
                bar("a", "2024-01-04", 1.0),
            ])
            .await
            .unwrap();

        // Span of a single day leaves the neighbours alone
        adapter
            .batch_set(vec![bar("a", "2024-01-03", 9.0)])
            .await
            .unwrap();
        adapter
            .batch_set(vec![bar("a", "2024-01-03", 9.5), bar("a", "2024-01-04", 9.5)])
            .await
            .unwrap();

        let rows = adapter
            .batch_get(&["a".to_string()], None)
            .await
            .unwrap()
            .remove("a")
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].payload, Bytes::from_static(b"{\"close\":9.5}"));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let adapter = PersistentAdapter::in_memory();
        adapter
            .put_snapshot(StoredRow::snapshot("k1", Bytes::new(), Duration::from_secs(10)))
            .await
            .unwrap();
        adapter
            .batch_set(vec![bar("k2", "2024-01-02", 1.0)])
            .await
            .unwrap();

        let later = crate::clock::now_utc() + chrono::Duration::seconds(11);
        assert_eq!(adapter.purge_expired(later).await.unwrap(), 1);
        // History rows never expire
        assert_eq!(adapter.count(&RowFilter::key("k2")).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_queries_are_counted() {
        let store = Arc::new(SlowStore {
            inner: InMemoryPersistentStore::new(),
            delay: Duration::from_millis(1500),
        });
        let adapter = PersistentAdapter::new(store);

        adapter.query(&RowFilter::key("k")).await.unwrap();
        adapter.count(&RowFilter::key("k")).await.unwrap();

        let stats = adapter.query_stats();
        assert_eq!(stats.total_queries, 2);
        assert_eq!(stats.slow_queries, 1);
        assert!(stats.last_slow_query.unwrap().starts_with("query"));
    }
}
