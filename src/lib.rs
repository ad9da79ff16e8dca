//! MarketCache - Tiered Market-Data Cache
//!
//! A read-through cache for market data that checks a process-local memory
//! tier, a shared remote tier and a persistent store before calling the
//! origin, writing every origin result back through all tiers. Freshness of
//! stored price history is judged in trading days using a market calendar.
//!
//! # Architecture
//!
//! ```text
//!              ┌──────────────────────────────────────────┐
//!   get/set ──▶│             TieredCache                   │
//!              │  Memory ──▶ Remote ──▶ Persistent ──▶ origin
//!              └──────────────┬───────────────────────────┘
//!                             │ hot keys, expiry sweeps
//!                      MaintenanceScheduler
//!
//!   TradingCalendar ──▶ FreshnessAnalyzer ──▶ BatchAccessOptimizer
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Tier coordinator, memory store, remote and persistent tiers
//! - [`calendar`] - Business days and trading sessions
//! - [`clock`] - Monotonic and wall clock shared by all components
//! - [`config`] - YAML configuration for the daemon
//! - [`error`] - Error types
//! - [`freshness`] - Completeness grading and batch refresh
//! - [`metrics`] - Prometheus exposition

pub mod cache;
pub mod calendar;
pub mod clock;
pub mod config;
pub mod error;
pub mod freshness;
pub mod metrics;

// Re-export commonly used types
pub use cache::{
    CacheConfig, CacheKey, CacheParams, CacheStats, CacheTier, HitSource, Invalidation, Lookup,
    MaintenanceScheduler, PersistentAdapter, TieredCache,
};
pub use calendar::TradingCalendar;
pub use config::AppConfig;
pub use error::{Error, Result};
pub use freshness::{BatchAccessOptimizer, DataQuality, FreshnessAnalyzer, FreshnessReport};
pub use metrics::CacheExporter;

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
