//! Property-Based Tests for Freshness Tracking
//!
//! # Test Properties
//!
//! 1. **Incremental idempotence**: storing the returned span leaves nothing to fetch
//! 2. **Span bounds**: a returned span starts after the latest row and stays in range
//! 3. **Quality monotonicity**: a later latest date never grades worse

#![cfg(test)]

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use proptest::prelude::*;

use super::analyzer::FreshnessAnalyzer;
use super::FreshnessConfig;
use crate::cache::persistent::PersistentAdapter;
use crate::calendar::{CalendarConfig, TradingCalendar};

// =============================================================================
// Property Strategies
// =============================================================================

fn analyzer() -> FreshnessAnalyzer {
    FreshnessAnalyzer::new(
        Arc::new(TradingCalendar::new(CalendarConfig::default()).unwrap()),
        Arc::new(PersistentAdapter::in_memory()),
        FreshnessConfig::default(),
    )
}

fn base() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
}

/// Day offset into 2024
fn day_strategy() -> impl Strategy<Value = NaiveDate> {
    (0i64..366).prop_map(|d| base() + Duration::days(d))
}

fn noon_utc(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(4, 0, 0).unwrap())
}

// =============================================================================
// Incremental Range Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Property: once the returned span is stored, there is nothing left to fetch
    #[test]
    fn prop_incremental_range_idempotent(
        latest in prop::option::of(day_strategy()),
        start in day_strategy(),
        len in 0i64..90,
        today in day_strategy(),
    ) {
        let a = analyzer();
        let end = start + Duration::days(len);

        let first = a.incremental_range(latest, start, end, today);
        prop_assert_eq!(first, a.incremental_range(latest, start, end, today));

        if let Some((_, to)) = first {
            let after = a.incremental_range(Some(to), start, end, today);
            prop_assert_eq!(after, None);
        }
    }

    /// Property: spans start after the latest row and stay within the clamped window
    #[test]
    fn prop_incremental_range_bounded(
        latest in prop::option::of(day_strategy()),
        start in day_strategy(),
        len in 0i64..90,
        today in day_strategy(),
    ) {
        let a = analyzer();
        let end = start + Duration::days(len);

        if let Some((from, to)) = a.incremental_range(latest, start, end, today) {
            prop_assert!(from <= to);
            prop_assert!(from >= start);
            prop_assert!(to <= end.min(today));
            if let Some(latest) = latest {
                prop_assert!(from > latest);
            }
        }
    }
}

// =============================================================================
// Quality Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Property: moving the latest row later never lowers the grade
    #[test]
    fn prop_quality_monotonic(
        d1 in day_strategy(),
        gap in 0i64..30,
        ahead in 0i64..20,
    ) {
        let a = analyzer();
        let d2 = d1 + Duration::days(gap);
        let now = noon_utc(d2 + Duration::days(ahead));
        let start = base() - Duration::days(10);
        let end = d2 + Duration::days(ahead);

        let q1 = a.assess("k", start, end, &[d1], now).quality;
        let q2 = a.assess("k", start, end, &[d2], now).quality;
        prop_assert!(q1 <= q2, "{} graded {} but later {} graded {}", d1, q1, d2, q2);
    }
}
