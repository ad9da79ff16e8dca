//! Batch Access Optimizer
//!
//! Grades many keys with one bulk persistent read per chunk instead of a
//! query per key, then sequences refresh work by urgency.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::analyzer::FreshnessAnalyzer;
use super::runner::{UnitOutcome, WorkerPool};
use super::{DataQuality, FreshnessReport};
use crate::cache::persistent::StoredRow;
use crate::clock;

// =============================================================================
// Configuration
// =============================================================================

/// Per-key cost assumptions, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CostModel {
    pub full_fetch_secs: f64,
    pub incremental_secs: f64,
    pub cache_hit_secs: f64,
    /// Added to every key regardless of bucket
    pub per_key_overhead_secs: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            full_fetch_secs: 3.0,
            incremental_secs: 1.5,
            cache_hit_secs: 0.1,
            per_key_overhead_secs: 0.0,
        }
    }
}

impl CostModel {
    pub fn estimate(&self, group: &PriorityGroup) -> ProcessingEstimate {
        let full_fetch = group.no_data.len() + group.unknown.len();
        let incremental = group.stale.len() + group.outdated.len() + group.acceptable.len();
        let cached = group.good.len();

        let secs = full_fetch as f64 * self.full_fetch_secs
            + incremental as f64 * self.incremental_secs
            + cached as f64 * self.cache_hit_secs
            + group.len() as f64 * self.per_key_overhead_secs;

        ProcessingEstimate {
            full_fetch,
            incremental,
            cached,
            estimated: Duration::from_secs_f64(secs.max(0.0)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Refresh concurrency, clamped to 3..=20
    pub workers: usize,
    /// Keys per bulk persistent read
    pub batch_size: usize,
    pub unit_timeout_secs: u64,
    pub cost: CostModel,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            workers: 20,
            batch_size: 50,
            unit_timeout_secs: 60,
            cost: CostModel::default(),
        }
    }
}

impl BatchConfig {
    pub fn pool(&self) -> WorkerPool {
        WorkerPool::new(self.workers, Duration::from_secs(self.unit_timeout_secs))
    }
}

// =============================================================================
// Results
// =============================================================================

/// Keys bucketed by quality, each bucket in request order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PriorityGroup {
    pub no_data: Vec<String>,
    /// Rows could not be read; refreshed like `no_data`
    pub unknown: Vec<String>,
    pub stale: Vec<String>,
    pub outdated: Vec<String>,
    pub acceptable: Vec<String>,
    pub good: Vec<String>,
}

impl PriorityGroup {
    fn push(&mut self, key: String, quality: DataQuality) {
        match quality {
            DataQuality::Unknown => self.unknown.push(key),
            DataQuality::None => self.no_data.push(key),
            DataQuality::Stale => self.stale.push(key),
            DataQuality::Outdated => self.outdated.push(key),
            DataQuality::Acceptable => self.acceptable.push(key),
            DataQuality::Good => self.good.push(key),
        }
    }

    pub fn len(&self) -> usize {
        self.no_data.len()
            + self.unknown.len()
            + self.stale.len()
            + self.outdated.len()
            + self.acceptable.len()
            + self.good.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys needing work, most urgent first
    pub fn by_urgency(&self) -> impl Iterator<Item = &String> {
        self.no_data
            .iter()
            .chain(&self.unknown)
            .chain(&self.stale)
            .chain(&self.outdated)
            .chain(&self.acceptable)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingEstimate {
    pub full_fetch: usize,
    pub incremental: usize,
    pub cached: usize,
    pub estimated: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub job_id: Uuid,
    pub total: usize,
    /// Units that ran, whatever their outcome
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Good keys plus keys with nothing left to fetch
    pub skipped: usize,
    pub cancelled: usize,
    pub rows_written: usize,
    pub elapsed: Duration,
    /// `(key, reason)` for each failed unit
    pub errors: Vec<(String, String)>,
}

// =============================================================================
// Optimizer
// =============================================================================

pub struct BatchAccessOptimizer {
    analyzer: Arc<FreshnessAnalyzer>,
    config: BatchConfig,
}

impl BatchAccessOptimizer {
    pub fn new(analyzer: Arc<FreshnessAnalyzer>, config: BatchConfig) -> Self {
        Self { analyzer, config }
    }

    pub fn analyzer(&self) -> &Arc<FreshnessAnalyzer> {
        &self.analyzer
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Grade every key in `[start, end]` with one bulk read per chunk
    ///
    /// Keys in a chunk whose read fails are graded `Unknown`.
    #[instrument(skip(self, keys), fields(keys = keys.len()))]
    pub async fn batch_check(
        &self,
        keys: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> HashMap<String, FreshnessReport> {
        let now = clock::now_utc();
        let persistent = self.analyzer.persistent();
        let mut reports = HashMap::with_capacity(keys.len());

        for chunk in keys.chunks(self.config.batch_size.max(1)) {
            let rows = match persistent.batch_get(chunk, Some((start, end))).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(keys = chunk.len(), error = %e, "Bulk history read failed, grading chunk as unknown");
                    for key in chunk {
                        reports.insert(key.clone(), FreshnessReport::unavailable(key.as_str()));
                    }
                    continue;
                }
            };
            for key in chunk {
                let dates: Vec<NaiveDate> = rows
                    .get(key)
                    .map(|rows| rows.iter().filter_map(|r| r.as_of).collect())
                    .unwrap_or_default();
                reports.insert(
                    key.clone(),
                    self.analyzer.assess(key, start, end, &dates, now),
                );
            }
        }

        debug!(checked = reports.len(), "Batch freshness check complete");
        reports
    }

    /// Bucket keys by quality; duplicates count once
    pub async fn priority_partition(
        &self,
        keys: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> PriorityGroup {
        let reports = self.batch_check(keys, start, end).await;
        partition(keys, &reports)
    }

    /// Serial time budget for refreshing `keys`
    pub async fn estimate_processing_time(
        &self,
        keys: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> ProcessingEstimate {
        let group = self.priority_partition(keys, start, end).await;
        self.config.cost.estimate(&group)
    }

    /// Fetch and store whatever each key is missing, most urgent first
    ///
    /// `fetcher` receives the key and the span to fetch and returns rows to
    /// store. Rows are written with delete-then-bulk-insert per unit.
    pub async fn refresh<F, Fut>(
        &self,
        keys: &[String],
        start: NaiveDate,
        end: NaiveDate,
        fetcher: F,
        cancel: &CancellationToken,
    ) -> BatchReport
    where
        F: Fn(String, NaiveDate, NaiveDate) -> Fut,
        Fut: Future<Output = anyhow::Result<Vec<StoredRow>>>,
    {
        let job_id = Uuid::new_v4();
        let started = clock::now();

        let reports = self.batch_check(keys, start, end).await;
        let group = partition(keys, &reports);
        let today = self.analyzer.calendar().today();

        let mut units = Vec::new();
        let mut skipped = group.good.len();
        for key in group.by_urgency() {
            let latest = reports.get(key).and_then(|r| r.latest_date);
            match self.analyzer.incremental_range(latest, start, end, today) {
                Some((from, to)) => units.push((key.clone(), from, to)),
                None => skipped += 1,
            }
        }

        info!(
            %job_id,
            total = group.len(),
            units = units.len(),
            skipped,
            "Starting batch refresh"
        );

        let unit_keys: Vec<String> = units.iter().map(|(k, _, _)| k.clone()).collect();
        let persistent = self.analyzer.persistent();
        let fetcher = &fetcher;
        let outcomes = self
            .config
            .pool()
            .run(units, cancel, |(key, from, to)| {
                let persistent = persistent.clone();
                let fetch = fetcher(key, from, to);
                async move {
                    let rows = fetch.await?;
                    let written = persistent.batch_set(rows).await?;
                    Ok(written)
                }
            })
            .await;

        let mut report = BatchReport {
            job_id,
            total: group.len(),
            processed: 0,
            succeeded: 0,
            failed: 0,
            skipped,
            cancelled: 0,
            rows_written: 0,
            elapsed: Duration::ZERO,
            errors: Vec::new(),
        };

        for (key, outcome) in unit_keys.into_iter().zip(outcomes) {
            match outcome {
                UnitOutcome::Done(written) => {
                    report.processed += 1;
                    report.succeeded += 1;
                    report.rows_written += written;
                }
                UnitOutcome::Failed(reason) => {
                    report.processed += 1;
                    report.failed += 1;
                    warn!(%job_id, key = %key, error = %reason, "Refresh unit failed");
                    report.errors.push((key, reason));
                }
                UnitOutcome::TimedOut => {
                    report.processed += 1;
                    report.failed += 1;
                    report.errors.push((key, "timed out".to_string()));
                }
                UnitOutcome::Cancelled => report.cancelled += 1,
            }
        }
        report.elapsed = started.elapsed();

        info!(
            %job_id,
            succeeded = report.succeeded,
            failed = report.failed,
            cancelled = report.cancelled,
            rows = report.rows_written,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Batch refresh finished"
        );
        report
    }
}

/// Bucket `keys` by their report's quality, keeping request order
pub fn partition(keys: &[String], reports: &HashMap<String, FreshnessReport>) -> PriorityGroup {
    let mut seen = HashSet::with_capacity(keys.len());
    let mut group = PriorityGroup::default();
    for key in keys {
        if !seen.insert(key.as_str()) {
            continue;
        }
        let quality = reports
            .get(key)
            .map(|r| r.quality)
            .unwrap_or(DataQuality::None);
        group.push(key.clone(), quality);
    }
    group
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::persistent::{PersistentAdapter, UnavailableStore};
    use crate::calendar::{CalendarConfig, TradingCalendar};
    use crate::freshness::FreshnessConfig;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn optimizer() -> BatchAccessOptimizer {
        optimizer_over(PersistentAdapter::in_memory())
    }

    fn optimizer_over(persistent: PersistentAdapter) -> BatchAccessOptimizer {
        let analyzer = FreshnessAnalyzer::new(
            Arc::new(TradingCalendar::new(CalendarConfig::default()).unwrap()),
            Arc::new(persistent),
            FreshnessConfig::default(),
        );
        BatchAccessOptimizer::new(
            Arc::new(analyzer),
            BatchConfig {
                batch_size: 7,
                ..Default::default()
            },
        )
    }

    fn window(opt: &BatchAccessOptimizer) -> (NaiveDate, NaiveDate) {
        let today = opt.analyzer().calendar().today();
        (today - chrono::Duration::days(120), today)
    }

    /// Store a row for every business day in the window
    async fn store_current(opt: &BatchAccessOptimizer, key: &str) {
        let (start, end) = window(opt);
        let rows = opt
            .analyzer()
            .calendar()
            .business_days_between(start, end)
            .into_iter()
            .map(|d| StoredRow::history(key, d, Bytes::from_static(b"{}")))
            .collect();
        opt.analyzer().persistent().batch_set(rows).await.unwrap();
    }

    fn report(key: &str, quality: DataQuality) -> FreshnessReport {
        FreshnessReport {
            quality,
            ..FreshnessReport::empty(key, Default::default())
        }
    }

    #[test]
    fn test_partition_keeps_order_and_dedupes() {
        let keys: Vec<String> = ["a", "b", "c", "a", "d"].iter().map(|s| s.to_string()).collect();
        let reports: HashMap<String, FreshnessReport> = [
            ("a", DataQuality::Good),
            ("b", DataQuality::Stale),
            ("c", DataQuality::Good),
        ]
        .into_iter()
        .map(|(k, q)| (k.to_string(), report(k, q)))
        .collect();

        let group = partition(&keys, &reports);
        assert_eq!(group.good, vec!["a", "c"]);
        assert_eq!(group.stale, vec!["b"]);
        // No report means no data
        assert_eq!(group.no_data, vec!["d"]);
        assert_eq!(group.len(), 4);

        let urgent: Vec<&String> = group.by_urgency().collect();
        assert_eq!(urgent, vec!["d", "b"]);
    }

    #[test]
    fn test_cost_model() {
        let group = PriorityGroup {
            no_data: vec!["a".into()],
            unknown: vec!["b".into()],
            stale: vec!["c".into()],
            outdated: vec!["d".into()],
            acceptable: vec![],
            good: vec!["e".into(), "f".into()],
        };
        let estimate = CostModel::default().estimate(&group);
        assert_eq!(estimate.full_fetch, 2);
        assert_eq!(estimate.incremental, 2);
        assert_eq!(estimate.cached, 2);
        // 2 * 3.0 + 2 * 1.5 + 2 * 0.1
        assert!((estimate.estimated.as_secs_f64() - 9.2).abs() < 1e-6);

        let with_overhead = CostModel {
            per_key_overhead_secs: 2.0,
            ..Default::default()
        }
        .estimate(&group);
        assert!((with_overhead.estimated.as_secs_f64() - 21.2).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_batch_check_chunks_all_keys() {
        let opt = optimizer();
        let (start, end) = window(&opt);
        let keys: Vec<String> = (0..20).map(|i| format!("price_history|code={:06}", i)).collect();
        for key in keys.iter().step_by(2) {
            store_current(&opt, key).await;
        }

        let reports = opt.batch_check(&keys, start, end).await;
        assert_eq!(reports.len(), 20);
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(reports[key].has_data, i % 2 == 0, "key {}", key);
        }

        let group = opt.priority_partition(&keys, start, end).await;
        assert_eq!(group.no_data.len(), 10);
        assert_eq!(group.good.len(), 10);

        let estimate = opt.estimate_processing_time(&keys, start, end).await;
        assert_eq!(estimate.full_fetch, 10);
        assert_eq!(estimate.cached, 10);
    }

    #[tokio::test]
    async fn test_unreadable_store_grades_every_key_unknown() {
        let opt = optimizer_over(PersistentAdapter::new(Arc::new(UnavailableStore)));
        let (start, end) = window(&opt);
        let keys: Vec<String> = (0..10).map(|i| format!("price_history|code={:06}", i)).collect();

        let reports = opt.batch_check(&keys, start, end).await;
        assert_eq!(reports.len(), 10);
        assert!(reports
            .values()
            .all(|r| r.quality == DataQuality::Unknown && r.needs_update));

        let group = opt.priority_partition(&keys, start, end).await;
        assert_eq!(group.unknown, keys);
        assert!(group.good.is_empty());

        let estimate = opt.estimate_processing_time(&keys, start, end).await;
        assert_eq!(estimate.full_fetch, 10);
        assert!((estimate.estimated.as_secs_f64() - 30.0).abs() < 1e-6);

        // Every unit runs and fails on the write
        let cancel = CancellationToken::new();
        let report = opt
            .refresh(
                &keys[..3],
                start,
                end,
                |key, _, to| async move {
                    Ok(vec![StoredRow::history(key, to, Bytes::from_static(b"{}"))])
                },
                &cancel,
            )
            .await;
        assert_eq!(report.processed, 3);
        assert_eq!(report.failed, 3);
        assert_eq!(report.rows_written, 0);
    }

    #[tokio::test]
    async fn test_refresh_fetches_only_what_is_missing() {
        let opt = optimizer();
        let (start, end) = window(&opt);
        store_current(&opt, "fresh").await;
        let keys = vec!["fresh".to_string(), "empty".to_string(), "broken".to_string()];

        let calls = AtomicUsize::new(0);
        let cancel = CancellationToken::new();
        let report = opt
            .refresh(
                &keys,
                start,
                end,
                |key, from, to| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if key == "broken" {
                            anyhow::bail!("origin refused");
                        }
                        assert_eq!(from, start);
                        assert_eq!(to, end);
                        Ok(vec![StoredRow::history(key, to, Bytes::from_static(b"{}"))])
                    }
                },
                &cancel,
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.total, 3);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.processed, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.rows_written, 1);
        assert_eq!(report.errors[0].0, "broken");
        assert!(report.errors[0].1.contains("origin refused"));

        let stored = opt.analyzer().latest_date("empty").await.unwrap();
        assert_eq!(stored, Some(end));
    }

    #[tokio::test]
    async fn test_refresh_after_cancel_starts_nothing() {
        let opt = optimizer();
        let (start, end) = window(&opt);
        let keys: Vec<String> = (0..5).map(|i| format!("k{}", i)).collect();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = opt
            .refresh(
                &keys,
                start,
                end,
                |_, _, _| async { Ok(Vec::new()) },
                &cancel,
            )
            .await;

        assert_eq!(report.cancelled, 5);
        assert_eq!(report.processed, 0);
    }
}
