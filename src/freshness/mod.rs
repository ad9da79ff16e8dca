//! Freshness Management
//!
//! Staleness of stored price history is measured in business days, not wall
//! clock time: a series last updated on Friday is current all weekend.
//!
//! - [`FreshnessAnalyzer`] grades one key's stored history
//! - [`BatchAccessOptimizer`] grades many keys with bulk reads, buckets them
//!   by urgency and drives incremental refresh runs
//! - [`WorkerPool`] bounds refresh concurrency and honours cancellation

pub mod analyzer;
pub mod batch;
pub mod runner;

#[cfg(test)]
mod proptest;

use std::collections::BTreeSet;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub use analyzer::FreshnessAnalyzer;
pub use batch::{
    BatchAccessOptimizer, BatchConfig, BatchReport, CostModel, PriorityGroup, ProcessingEstimate,
};
pub use runner::{UnitOutcome, WorkerPool};

/// Quality grade of a stored series, worst first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataQuality {
    /// Stored rows could not be read
    Unknown,
    /// No rows at all
    None,
    /// More than `stale_after_days` business days behind
    Stale,
    /// Two or more business days behind
    Outdated,
    /// One business day behind while that day is still open
    Acceptable,
    /// Current
    Good,
}

impl DataQuality {
    pub fn label(&self) -> &'static str {
        match self {
            DataQuality::Unknown => "unknown",
            DataQuality::None => "none",
            DataQuality::Stale => "stale",
            DataQuality::Outdated => "outdated",
            DataQuality::Acceptable => "acceptable",
            DataQuality::Good => "good",
        }
    }
}

impl fmt::Display for DataQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Grading thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FreshnessConfig {
    /// Series with fewer rows always need an update
    pub min_rows: usize,
    /// Business days behind beyond which a series is stale
    pub stale_after_days: usize,
    /// Business days behind beyond which a series is outdated
    pub outdated_after_days: usize,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            min_rows: 60,
            stale_after_days: 5,
            outdated_after_days: 1,
        }
    }
}

/// Completeness of one key's stored history over a date range
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FreshnessReport {
    pub key: String,
    pub has_data: bool,
    pub latest_date: Option<NaiveDate>,
    /// Expected business days in range with no stored row
    pub missing_dates: BTreeSet<NaiveDate>,
    pub needs_update: bool,
    pub quality: DataQuality,
    pub row_count: usize,
    /// Business days between the latest row and the reference business day
    pub days_behind: Option<usize>,
}

impl FreshnessReport {
    /// Report for a key with no rows in range
    pub fn empty(key: impl Into<String>, missing_dates: BTreeSet<NaiveDate>) -> Self {
        Self {
            key: key.into(),
            has_data: false,
            latest_date: None,
            missing_dates,
            needs_update: true,
            quality: DataQuality::None,
            row_count: 0,
            days_behind: None,
        }
    }

    /// Report for a key whose rows could not be read; always needs an update
    pub fn unavailable(key: impl Into<String>) -> Self {
        Self {
            quality: DataQuality::Unknown,
            ..Self::empty(key, BTreeSet::new())
        }
    }
}
