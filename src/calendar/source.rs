//! Official calendar sources
//!
//! A source returns the set of business dates for one year. The calendar
//! uses it to override its fixed rules; a failing source is never fatal.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::error::{Error, Result};

/// Source of official business dates
#[async_trait]
pub trait CalendarSource: Send + Sync {
    /// Every business date of `year`
    async fn fetch_official_calendar(&self, year: i32) -> Result<HashSet<NaiveDate>>;

    fn name(&self) -> &'static str;
}

/// HTTP source settings
#[derive(Debug, Clone, Deserialize)]
pub struct HttpCalendarConfig {
    /// Base URL; the year is appended as a path segment
    pub base_url: String,
    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    10
}

/// Fetches `GET {base_url}/{year}`, expecting a JSON array of `YYYY-MM-DD`
pub struct HttpCalendarSource {
    config: HttpCalendarConfig,
    client: Client,
}

impl HttpCalendarSource {
    pub fn new(config: HttpCalendarConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    fn url(&self, year: i32) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), year)
    }
}

#[async_trait]
impl CalendarSource for HttpCalendarSource {
    #[instrument(skip(self))]
    async fn fetch_official_calendar(&self, year: i32) -> Result<HashSet<NaiveDate>> {
        let unavailable = |reason: String| Error::CalendarSourceUnavailable { year, reason };

        let response = self
            .client
            .get(self.url(year))
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(unavailable(format!("HTTP {}", response.status())));
        }

        let raw: Vec<String> = response
            .json()
            .await
            .map_err(|e| unavailable(format!("invalid body: {}", e)))?;

        let dates = parse_dates(year, &raw)?;
        debug!(year, days = dates.len(), "Fetched official calendar");
        Ok(dates)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Parse `YYYY-MM-DD` strings, keeping only dates inside `year`
fn parse_dates(year: i32, raw: &[String]) -> Result<HashSet<NaiveDate>> {
    use chrono::Datelike;

    let mut dates = HashSet::with_capacity(raw.len());
    for text in raw {
        let date = NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d").map_err(|e| {
            Error::CalendarSourceUnavailable {
                year,
                reason: format!("bad date {:?}: {}", text, e),
            }
        })?;
        if date.year() == year {
            dates.insert(date);
        }
    }
    if dates.is_empty() {
        return Err(Error::CalendarSourceUnavailable {
            year,
            reason: "no business dates returned".to_string(),
        });
    }
    Ok(dates)
}

/// Fixed in-process source, for tests and offline deployments
#[derive(Debug, Default, Clone)]
pub struct StaticCalendarSource {
    years: HashMap<i32, HashSet<NaiveDate>>,
}

impl StaticCalendarSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_year(mut self, year: i32, dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.years.insert(year, dates.into_iter().collect());
        self
    }
}

#[async_trait]
impl CalendarSource for StaticCalendarSource {
    async fn fetch_official_calendar(&self, year: i32) -> Result<HashSet<NaiveDate>> {
        self.years
            .get(&year)
            .cloned()
            .ok_or_else(|| Error::CalendarSourceUnavailable {
                year,
                reason: "year not loaded".to_string(),
            })
    }

    fn name(&self) -> &'static str {
        "static"
    }
}
