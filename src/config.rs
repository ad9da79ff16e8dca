//! Daemon configuration
//!
//! One YAML document covers every component. Every section and field is
//! optional; anything missing takes its default. Durations are in seconds.
//!
//! ```yaml
//! cache:
//!   capacity: 20000
//!   eviction:
//!     strategy: lfu
//! redis:
//!   url: redis://cache.internal:6379/0
//! calendar_source:
//!   base_url: https://calendar.internal/sse
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::cache::{CacheConfig, MaintenanceConfig, RedisConfig};
use crate::calendar::{CalendarConfig, HttpCalendarConfig};
use crate::error::{Error, Result};
use crate::freshness::{BatchConfig, FreshnessConfig};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub cache: CacheConfig,
    pub maintenance: MaintenanceConfig,
    pub freshness: FreshnessConfig,
    pub batch: BatchConfig,
    pub calendar: CalendarConfig,
    /// Remote tier; absent means memory and persistent tiers only
    pub redis: Option<RedisConfig>,
    /// Official calendar source; absent means fixed rules only
    pub calendar_source: Option<HttpCalendarConfig>,
    pub metrics_addr: String,
    pub health_addr: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            maintenance: MaintenanceConfig::default(),
            freshness: FreshnessConfig::default(),
            batch: BatchConfig::default(),
            calendar: CalendarConfig::default(),
            redis: None,
            calendar_source: None,
            metrics_addr: "0.0.0.0:8080".to_string(),
            health_addr: "0.0.0.0:8081".to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache.capacity == 0 {
            return Err(Error::Config("cache.capacity must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.cache.eviction.headroom_fraction) {
            return Err(Error::Config(
                "cache.eviction.headroom_fraction must be within 0..=1".to_string(),
            ));
        }
        if self.maintenance.expiry_interval_secs == 0 || self.maintenance.analysis_interval_secs == 0 {
            return Err(Error::Config(
                "maintenance intervals must be positive".to_string(),
            ));
        }
        if self.batch.batch_size == 0 {
            return Err(Error::Config("batch.batch_size must be positive".to_string()));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EvictionStrategy;
    use assert_matches::assert_matches;
    use std::time::Duration;

    #[test]
    fn test_empty_document_is_default() {
        let config = AppConfig::from_yaml("").unwrap();
        assert_eq!(config.cache.capacity, crate::cache::DEFAULT_MEMORY_CAPACITY);
        assert!(config.redis.is_none());
        assert_eq!(config.metrics_addr, "0.0.0.0:8080");
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let config = AppConfig::from_yaml(
            r#"
cache:
  capacity: 500
  eviction:
    strategy: lfu
  ttl_secs:
    quote: 30
redis:
  url: redis://cache.internal:6379/1
calendar:
  timezone: Asia/Shanghai
batch:
  workers: 5
"#,
        )
        .unwrap();

        assert_eq!(config.cache.capacity, 500);
        assert_eq!(config.cache.eviction.strategy, EvictionStrategy::Lfu);
        assert!((config.cache.eviction.headroom_fraction - 0.10).abs() < f64::EPSILON);
        assert_eq!(config.cache.ttl_for("quote"), Duration::from_secs(30));
        // A supplied table replaces the default one
        assert_eq!(config.cache.ttl_for("basic_info"), Duration::from_secs(3600));

        let redis = config.redis.unwrap();
        assert_eq!(redis.url, "redis://cache.internal:6379/1");
        assert_eq!(redis.scan_count, 500);
        assert_eq!(config.batch.workers, 5);
        assert_eq!(config.batch.batch_size, 50);
        assert_eq!(config.freshness.min_rows, 60);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = AppConfig::from_yaml("cache:\n  capacity: 0\n").unwrap_err();
        assert_matches!(err, Error::Config(_));

        let err = AppConfig::from_yaml("cache: [1, 2]\n").unwrap_err();
        assert_matches!(err, Error::Yaml(_));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = AppConfig::from_file("/nonexistent/marketcache.yaml").unwrap_err();
        assert_matches!(err, Error::Io(_));
    }
}
