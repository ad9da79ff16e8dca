//! Freshness Analyzer
//!
//! Grades the stored history of one key against the trading calendar and
//! works out the smallest date span that brings it up to date.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, warn};

use super::{DataQuality, FreshnessConfig, FreshnessReport};
use crate::cache::persistent::{PersistentAdapter, RowFilter};
use crate::calendar::TradingCalendar;
use crate::clock;
use crate::error::Result;

/// Grades stored history
pub struct FreshnessAnalyzer {
    calendar: Arc<TradingCalendar>,
    persistent: Arc<PersistentAdapter>,
    config: FreshnessConfig,
}

impl FreshnessAnalyzer {
    pub fn new(
        calendar: Arc<TradingCalendar>,
        persistent: Arc<PersistentAdapter>,
        config: FreshnessConfig,
    ) -> Self {
        Self {
            calendar,
            persistent,
            config,
        }
    }

    pub fn calendar(&self) -> &Arc<TradingCalendar> {
        &self.calendar
    }

    pub fn persistent(&self) -> &Arc<PersistentAdapter> {
        &self.persistent
    }

    pub fn config(&self) -> &FreshnessConfig {
        &self.config
    }

    /// Grade the rows stored for `key` inside `[start, end]`
    ///
    /// A persistent-tier failure grades the key `Unknown` and marks it for update.
    pub async fn check_completeness(
        &self,
        key: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> FreshnessReport {
        match self
            .persistent
            .query(&RowFilter::key(key).between(start, end))
            .await
        {
            Ok(rows) => {
                let dates: Vec<NaiveDate> = rows.iter().filter_map(|r| r.as_of).collect();
                self.assess(key, start, end, &dates, clock::now_utc())
            }
            Err(e) => {
                warn!(key, error = %e, "Stored history unreadable, grading as unknown");
                FreshnessReport::unavailable(key)
            }
        }
    }

    /// Grade a set of stored dates as seen at `now`
    pub fn assess(
        &self,
        key: &str,
        start: NaiveDate,
        end: NaiveDate,
        dates: &[NaiveDate],
        now: DateTime<Utc>,
    ) -> FreshnessReport {
        let today = now.with_timezone(&self.calendar.timezone()).date_naive();
        let expected: BTreeSet<NaiveDate> = self
            .calendar
            .business_days_between(start, end.min(today))
            .into_iter()
            .collect();

        let stored: BTreeSet<NaiveDate> = dates
            .iter()
            .copied()
            .filter(|d| *d >= start && *d <= end)
            .collect();
        let Some(&latest) = stored.iter().next_back() else {
            return FreshnessReport::empty(key, expected);
        };

        let reference = self.calendar.last_business_day_on_or_before(today);
        let days_behind = if latest >= reference {
            0
        } else {
            self.calendar.business_days_after(latest, reference)
        };

        let session_open = self.calendar.is_within_trading_session(now)
            || self.calendar.is_business_day(today);
        let quality = self.grade(days_behind, session_open);
        let needs_update = quality < DataQuality::Good || stored.len() < self.config.min_rows;

        debug!(
            key,
            latest = %latest,
            days_behind,
            quality = %quality,
            rows = stored.len(),
            "Assessed stored history"
        );

        FreshnessReport {
            key: key.to_string(),
            has_data: true,
            latest_date: Some(latest),
            missing_dates: expected.difference(&stored).copied().collect(),
            needs_update,
            quality,
            row_count: stored.len(),
            days_behind: Some(days_behind),
        }
    }

    /// Map business days behind to a grade
    ///
    /// One day behind is only `Acceptable` while that day can still produce
    /// a row; otherwise the previous session is settled and the series is good.
    pub fn grade(&self, days_behind: usize, session_open: bool) -> DataQuality {
        if days_behind > self.config.stale_after_days {
            DataQuality::Stale
        } else if days_behind > self.config.outdated_after_days {
            DataQuality::Outdated
        } else if days_behind >= 1 && session_open {
            DataQuality::Acceptable
        } else {
            DataQuality::Good
        }
    }

    /// Span still to fetch for `key` within `[start, end]`, or `None` if current
    pub async fn compute_incremental_range(
        &self,
        key: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Option<(NaiveDate, NaiveDate)>> {
        let latest = self.latest_date(key).await?;
        Ok(self.incremental_range(latest, start, end, self.calendar.today()))
    }

    /// Pure form of [`compute_incremental_range`](Self::compute_incremental_range)
    pub fn incremental_range(
        &self,
        latest: Option<NaiveDate>,
        start: NaiveDate,
        end: NaiveDate,
        today: NaiveDate,
    ) -> Option<(NaiveDate, NaiveDate)> {
        let end = end.min(today);
        if start > end {
            return None;
        }
        let Some(latest) = latest else {
            return Some((start, end));
        };

        let target = self.calendar.last_business_day_on_or_before(end);
        if latest >= target {
            return None;
        }

        let from = start.max(latest.succ_opt()?);
        (from <= end).then_some((from, end))
    }

    /// Most recent stored business date for `key`
    pub async fn latest_date(&self, key: &str) -> Result<Option<NaiveDate>> {
        let rows = self
            .persistent
            .query(&RowFilter::key(key).between(NaiveDate::MIN, NaiveDate::MAX))
            .await?;
        Ok(rows.iter().filter_map(|r| r.as_of).max())
    }

    /// True if a row is stored for `key` on `date`
    pub async fn has_data_for(&self, key: &str, date: NaiveDate) -> Result<bool> {
        let count = self
            .persistent
            .count(&RowFilter::key(key).between(date, date))
            .await?;
        Ok(count > 0)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::persistent::{StoredRow, UnavailableStore};
    use crate::calendar::CalendarConfig;
    use assert_matches::assert_matches;
    use bytes::Bytes;
    use chrono::TimeZone;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn analyzer() -> FreshnessAnalyzer {
        FreshnessAnalyzer::new(
            Arc::new(TradingCalendar::new(CalendarConfig::default()).unwrap()),
            Arc::new(PersistentAdapter::in_memory()),
            FreshnessConfig::default(),
        )
    }

    /// Local market time as UTC
    fn market_time(a: &FreshnessAnalyzer, y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        a.calendar()
            .timezone()
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn quality_at(a: &FreshnessAnalyzer, latest: &str, now: DateTime<Utc>) -> DataQuality {
        a.assess("k", date("2023-12-01"), date("2024-01-31"), &[date(latest)], now)
            .quality
    }

    #[test]
    fn test_grades_on_a_business_day() {
        let a = analyzer();
        // Wednesday lunch break
        let now = market_time(&a, 2024, 1, 10, 12, 0);

        assert_eq!(quality_at(&a, "2024-01-10", now), DataQuality::Good);
        assert_eq!(quality_at(&a, "2024-01-09", now), DataQuality::Acceptable);
        assert_eq!(quality_at(&a, "2024-01-08", now), DataQuality::Outdated);
        assert_eq!(quality_at(&a, "2024-01-03", now), DataQuality::Outdated);
        assert_eq!(quality_at(&a, "2024-01-02", now), DataQuality::Stale);
    }

    #[test]
    fn test_one_day_behind_on_weekend_is_good() {
        let a = analyzer();
        let saturday = market_time(&a, 2024, 1, 13, 10, 0);

        assert_eq!(quality_at(&a, "2024-01-11", saturday), DataQuality::Good);
        assert_eq!(quality_at(&a, "2024-01-10", saturday), DataQuality::Outdated);
    }

    #[test]
    fn test_missing_dates_and_row_threshold() {
        let a = analyzer();
        let now = market_time(&a, 2024, 1, 10, 16, 0);
        let stored = [date("2024-01-02"), date("2024-01-03"), date("2024-01-10")];

        let report = a.assess("k", date("2024-01-01"), date("2024-01-31"), &stored, now);
        assert!(report.has_data);
        assert_eq!(report.latest_date, Some(date("2024-01-10")));
        assert_eq!(report.quality, DataQuality::Good);
        // Future dates are not missing yet
        let missing: Vec<_> = report.missing_dates.iter().copied().collect();
        assert_eq!(
            missing,
            vec![date("2024-01-04"), date("2024-01-05"), date("2024-01-08"), date("2024-01-09")]
        );
        // Good but too short for downstream consumers
        assert!(report.needs_update);
    }

    #[test]
    fn test_long_current_series_needs_nothing() {
        let a = analyzer();
        let now = market_time(&a, 2024, 1, 10, 16, 0);
        let stored = a
            .calendar()
            .business_days_between(date("2023-09-01"), date("2024-01-10"));
        assert!(stored.len() >= 60);

        let report = a.assess("k", date("2023-09-01"), date("2024-01-10"), &stored, now);
        assert_eq!(report.quality, DataQuality::Good);
        assert!(!report.needs_update);
        assert!(report.missing_dates.is_empty());
    }

    #[tokio::test]
    async fn test_no_rows_is_none_quality() {
        let a = analyzer();
        let report = a
            .check_completeness("price_history|code=000001", date("2024-01-01"), date("2024-01-31"))
            .await;

        assert!(!report.has_data);
        assert_eq!(report.quality, DataQuality::None);
        assert!(report.needs_update);
        assert_eq!(report.missing_dates.len(), 22);
    }

    #[tokio::test]
    async fn test_unreadable_store_grades_unknown() {
        let a = FreshnessAnalyzer::new(
            Arc::new(TradingCalendar::new(CalendarConfig::default()).unwrap()),
            Arc::new(PersistentAdapter::new(Arc::new(UnavailableStore))),
            FreshnessConfig::default(),
        );
        let report = a
            .check_completeness("price_history|code=000001", date("2024-01-01"), date("2024-01-31"))
            .await;

        assert_eq!(report.quality, DataQuality::Unknown);
        assert!(report.needs_update);
        assert!(!report.has_data);
        assert_eq!(report.latest_date, None);

        // Direct history reads still report the failure
        assert!(a.latest_date("price_history|code=000001").await.is_err());
    }

    #[test]
    fn test_incremental_range() {
        let a = analyzer();
        let today = date("2024-01-10");

        // No data: whole window, clamped to today
        assert_eq!(
            a.incremental_range(None, date("2024-01-01"), date("2024-01-31"), today),
            Some((date("2024-01-01"), today))
        );
        // Covered through the last business day
        assert_eq!(
            a.incremental_range(Some(today), date("2024-01-01"), date("2024-01-31"), today),
            None
        );
        // Delta only
        assert_eq!(
            a.incremental_range(Some(date("2024-01-05")), date("2024-01-01"), date("2024-01-31"), today),
            Some((date("2024-01-06"), today))
        );
        // Requested end on a Sunday already covered by Friday's row
        assert_eq!(
            a.incremental_range(Some(date("2024-01-05")), date("2024-01-01"), date("2024-01-07"), today),
            None
        );
        // Inverted window
        assert_eq!(
            a.incremental_range(None, date("2024-01-20"), date("2024-01-31"), today),
            None
        );
    }

    #[tokio::test]
    async fn test_history_helpers() {
        let a = analyzer();
        a.persistent()
            .batch_set(vec![
                StoredRow::history("k", date("2024-01-02"), Bytes::from_static(b"{}")),
                StoredRow::history("k", date("2024-01-05"), Bytes::from_static(b"{}")),
            ])
            .await
            .unwrap();

        assert_eq!(a.latest_date("k").await.unwrap(), Some(date("2024-01-05")));
        assert_eq!(a.latest_date("other").await.unwrap(), None);
        assert!(a.has_data_for("k", date("2024-01-02")).await.unwrap());
        assert!(!a.has_data_for("k", date("2024-01-03")).await.unwrap());

        let first = a
            .compute_incremental_range("k", date("2024-01-01"), date("2024-01-31"))
            .await
            .unwrap();
        let second = a
            .compute_incremental_range("k", date("2024-01-01"), date("2024-01-31"))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_matches!(first, Some((from, _)) if from == date("2024-01-06"));
    }
}
