//! Trading Calendar
//!
//! Decides which dates the market is open, independent of wall-clock
//! weekends. Three layers, checked in order:
//!
//! 1. weekends and fixed annual holidays are always closed
//! 2. known special closures (multi-day festivals) are closed
//! 3. a fresh official business-date set for the year, when one is cached,
//!    decides the remaining weekdays
//!
//! Without a fresh official set every remaining weekday is a business day.

pub mod source;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::clock;
use crate::error::{Error, Result};

pub use source::{CalendarSource, HttpCalendarConfig, HttpCalendarSource, StaticCalendarSource};

/// Month/day pairs closed every year
const FIXED_HOLIDAYS: [(u32, u32); 5] = [(1, 1), (5, 1), (10, 1), (10, 2), (10, 3)];

/// Known multi-day closures outside the fixed table
const SPECIAL_HOLIDAYS: [&str; 16] = [
    // Spring Festival
    "2024-02-09",
    "2024-02-10",
    "2024-02-11",
    "2024-02-12",
    "2024-02-13",
    "2024-02-14",
    "2024-02-15",
    "2024-02-16",
    "2024-02-17",
    // Qingming
    "2024-04-04",
    "2024-04-05",
    "2024-04-06",
    // Dragon Boat
    "2024-06-10",
    // Mid-Autumn
    "2024-09-15",
    "2024-09-16",
    "2024-09-17",
];

/// One intraday trading window, inclusive at both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionWindow {
    pub open: NaiveTime,
    pub close: NaiveTime,
}

impl SessionWindow {
    pub fn new(open: NaiveTime, close: NaiveTime) -> Self {
        Self { open, close }
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        time >= self.open && time <= self.close
    }
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or_default()
}

/// Calendar configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarConfig {
    /// IANA time zone of the market
    pub timezone: String,
    /// Morning and afternoon sessions
    pub sessions: Vec<SessionWindow>,
    /// How long a fetched official calendar stays fresh, in seconds
    pub refresh_ttl_secs: u64,
    /// Maximum days searched by last/next business day lookups
    pub search_limit_days: u32,
    /// Extra closures on top of the built-in table (`YYYY-MM-DD`)
    pub extra_holidays: Vec<NaiveDate>,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            timezone: "Asia/Shanghai".to_string(),
            sessions: vec![
                SessionWindow::new(hm(9, 30), hm(11, 30)),
                SessionWindow::new(hm(13, 0), hm(15, 0)),
            ],
            refresh_ttl_secs: 24 * 3600,
            search_limit_days: 30,
            extra_holidays: Vec::new(),
        }
    }
}

struct OfficialYear {
    dates: HashSet<NaiveDate>,
    fetched_at: Instant,
}

/// Trading calendar oracle
pub struct TradingCalendar {
    config: CalendarConfig,
    tz: Tz,
    special: HashSet<NaiveDate>,
    official: RwLock<HashMap<i32, OfficialYear>>,
    source: Option<Arc<dyn CalendarSource>>,
}

impl TradingCalendar {
    /// Calendar with fixed rules only
    pub fn new(config: CalendarConfig) -> Result<Self> {
        let tz: Tz = config
            .timezone
            .parse()
            .map_err(|e| Error::Config(format!("invalid timezone {:?}: {}", config.timezone, e)))?;

        let mut special: HashSet<NaiveDate> = SPECIAL_HOLIDAYS
            .iter()
            .filter_map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
            .collect();
        special.extend(config.extra_holidays.iter().copied());

        Ok(Self {
            config,
            tz,
            special,
            official: RwLock::new(HashMap::new()),
            source: None,
        })
    }

    /// Attach an official calendar source
    pub fn with_source(mut self, source: Arc<dyn CalendarSource>) -> Self {
        info!(source = source.name(), "Official calendar source attached");
        self.source = Some(source);
        self
    }

    pub fn config(&self) -> &CalendarConfig {
        &self.config
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Current date in the market's time zone
    pub fn today(&self) -> NaiveDate {
        clock::now_utc().with_timezone(&self.tz).date_naive()
    }

    // =========================================================================
    // Official calendar cache
    // =========================================================================

    /// Fetch and cache the official calendar for `year`
    pub async fn refresh_year(&self, year: i32) -> Result<usize> {
        let source = self.source.as_ref().ok_or_else(|| Error::CalendarSourceUnavailable {
            year,
            reason: "no source configured".to_string(),
        })?;

        let dates = source.fetch_official_calendar(year).await?;
        let count = dates.len();
        self.install_official(year, dates);
        info!(year, business_days = count, "Official calendar refreshed");
        Ok(count)
    }

    /// Refresh every year in `years` whose cached set is missing or stale
    ///
    /// Failures are logged; the calendar keeps using its fixed rules.
    pub async fn ensure_fresh(&self, years: impl IntoIterator<Item = i32>) {
        if self.source.is_none() {
            return;
        }
        for year in years {
            if self.has_fresh_official(year) {
                continue;
            }
            if let Err(e) = self.refresh_year(year).await {
                warn!(year, error = %e, "Official calendar unavailable, using fixed rules");
            }
        }
    }

    /// Install an official business-date set directly
    pub fn install_official(&self, year: i32, dates: HashSet<NaiveDate>) {
        self.official.write().insert(
            year,
            OfficialYear {
                dates,
                fetched_at: clock::now(),
            },
        );
    }

    pub fn has_fresh_official(&self, year: i32) -> bool {
        self.official
            .read()
            .get(&year)
            .map(|y| self.is_fresh(y))
            .unwrap_or(false)
    }

    fn is_fresh(&self, year: &OfficialYear) -> bool {
        clock::now().saturating_duration_since(year.fetched_at)
            <= Duration::from_secs(self.config.refresh_ttl_secs)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn is_business_day(&self, date: NaiveDate) -> bool {
        if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        if FIXED_HOLIDAYS.contains(&(date.month(), date.day())) {
            return false;
        }
        if self.special.contains(&date) {
            return false;
        }

        let official = self.official.read();
        match official.get(&date.year()) {
            Some(year) if self.is_fresh(year) => year.dates.contains(&date),
            _ => true,
        }
    }

    /// Latest business day strictly before `date`
    pub fn last_business_day_before(&self, date: NaiveDate) -> NaiveDate {
        self.search(date, -1)
    }

    /// `date` itself if it is a business day, else the one before it
    pub fn last_business_day_on_or_before(&self, date: NaiveDate) -> NaiveDate {
        if self.is_business_day(date) {
            date
        } else {
            self.last_business_day_before(date)
        }
    }

    /// Earliest business day strictly after `date`
    pub fn next_business_day_after(&self, date: NaiveDate) -> NaiveDate {
        self.search(date, 1)
    }

    fn search(&self, from: NaiveDate, step: i64) -> NaiveDate {
        let step = chrono::Duration::days(step);
        let mut candidate = from + step;
        for _ in 0..self.config.search_limit_days {
            if self.is_business_day(candidate) {
                return candidate;
            }
            candidate += step;
        }
        warn!(
            from = %from,
            limit = self.config.search_limit_days,
            returned = %candidate,
            "No business day found within search limit"
        );
        candidate
    }

    /// Business days in `[start, end]`, ascending
    pub fn business_days_between(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        if start > end {
            return Vec::new();
        }
        start
            .iter_days()
            .take_while(|d| *d <= end)
            .filter(|d| self.is_business_day(*d))
            .collect()
    }

    /// Business days strictly after `from` up to and including `to`
    pub fn business_days_after(&self, from: NaiveDate, to: NaiveDate) -> usize {
        match from.succ_opt() {
            Some(next) => self.business_days_between(next, to).len(),
            None => 0,
        }
    }

    /// True during a trading session on a business day
    pub fn is_within_trading_session(&self, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&self.tz);
        if !self.is_business_day(local.date_naive()) {
            return false;
        }
        let time = local.time();
        let open = self.config.sessions.iter().any(|s| s.contains(time));
        debug!(local = %local, open, "Session check");
        open
    }

    /// Session check at the current time
    pub fn is_trading_now(&self) -> bool {
        self.is_within_trading_session(clock::now_utc())
    }
}

// =============================================================================
// Tests
// =============================================================================
