//! Maintenance Scheduler
//!
//! One background task with two tickers:
//!
//! - expiry sweep (default every 60s): drop memory entries past their TTL
//! - analysis (default every hour): recompute the hot-key set from the
//!   access log, touch resident hot keys, purge expired persistent rows
//!
//! A failing or panicking tick is logged and the loop keeps going.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use super::manager::TieredCache;
use crate::clock;
use crate::error::Result;

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Seconds between expiry sweeps
    pub expiry_interval_secs: u64,
    /// Seconds between hot-key analysis runs
    pub analysis_interval_secs: u64,
    /// Accesses inside the window that make a key hot
    pub hot_threshold: usize,
    /// Rolling access window in seconds
    pub hot_window_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            expiry_interval_secs: 60,
            analysis_interval_secs: 3600,
            hot_threshold: 10,
            hot_window_secs: 3600,
        }
    }
}

impl MaintenanceConfig {
    pub fn expiry_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_interval_secs.max(1))
    }

    pub fn analysis_interval(&self) -> Duration {
        Duration::from_secs(self.analysis_interval_secs.max(1))
    }

    pub fn hot_window(&self) -> Duration {
        Duration::from_secs(self.hot_window_secs)
    }
}

/// Outcome of one analysis run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalysisReport {
    pub hot_keys: usize,
    /// Hot keys resident in memory whose recency was refreshed
    pub touched: usize,
    pub purged_rows: usize,
}

/// Counters for tests and diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub expiry_runs: u64,
    pub analysis_runs: u64,
    pub failed_ticks: u64,
}

/// Periodic maintenance over a [`TieredCache`]
pub struct MaintenanceScheduler {
    cache: Arc<TieredCache>,
    config: MaintenanceConfig,
    running: Mutex<Option<CancellationToken>>,
    expiry_runs: AtomicU64,
    analysis_runs: AtomicU64,
    failed_ticks: AtomicU64,
}

impl MaintenanceScheduler {
    pub fn new(cache: Arc<TieredCache>, config: MaintenanceConfig) -> Self {
        Self {
            cache,
            config,
            running: Mutex::new(None),
            expiry_runs: AtomicU64::new(0),
            analysis_runs: AtomicU64::new(0),
            failed_ticks: AtomicU64::new(0),
        }
    }

    /// Spawn the loop; it ends when `token` or [`stop`](Self::stop) cancels it
    ///
    /// Starting an already running scheduler stops the previous loop first.
    pub fn start(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let child = token.child_token();
        if let Some(previous) = self.running.lock().replace(child.clone()) {
            previous.cancel();
        }

        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run(child).await })
    }

    /// Cancel the loop; safe to call repeatedly
    pub fn stop(&self) {
        if let Some(token) = self.running.lock().take() {
            token.cancel();
            info!("Maintenance scheduler stopping");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map(|t| !t.is_cancelled())
            .unwrap_or(false)
    }

    #[instrument(skip_all)]
    async fn run(&self, token: CancellationToken) {
        info!(config = ?self.config, "Starting maintenance scheduler");

        let now = tokio::time::Instant::now();
        let mut expiry = interval_at(now + self.config.expiry_interval(), self.config.expiry_interval());
        let mut analysis = interval_at(
            now + self.config.analysis_interval(),
            self.config.analysis_interval(),
        );
        expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        analysis.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Maintenance scheduler stopped");
                    break;
                }
                _ = expiry.tick() => {
                    self.guarded("expiry", async {
                        self.run_expiry_sweep().map(|_| ())
                    })
                    .await;
                }
                _ = analysis.tick() => {
                    self.guarded("analysis", async {
                        self.run_analysis().await.map(|_| ())
                    })
                    .await;
                }
            }
        }
    }

    /// Run one tick, absorbing errors and panics
    async fn guarded<F>(&self, tick: &'static str, fut: F)
    where
        F: Future<Output = Result<()>>,
    {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.failed_ticks.fetch_add(1, Ordering::Relaxed);
                error!(tick, error = %e, "Maintenance tick failed");
            }
            Err(panic) => {
                self.failed_ticks.fetch_add(1, Ordering::Relaxed);
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(tick, panic = %message, "Maintenance tick panicked");
            }
        }
    }

    /// Drop expired memory entries and access history older than the hot window
    pub fn run_expiry_sweep(&self) -> Result<usize> {
        self.expiry_runs.fetch_add(1, Ordering::Relaxed);
        let removed = self.cache.memory().purge_expired(clock::now_utc());
        let forgotten = self
            .cache
            .access_log()
            .prune(clock::now(), self.config.hot_window());
        if removed > 0 || forgotten > 0 {
            debug!(removed, forgotten, "Expiry sweep removed entries");
        }
        Ok(removed)
    }

    /// Recompute hot keys, refresh their residency, purge persistent rows
    ///
    /// The hot-key set is replaced even when the persistent purge fails.
    pub async fn run_analysis(&self) -> Result<AnalysisReport> {
        self.analysis_runs.fetch_add(1, Ordering::Relaxed);

        let hot = self.cache.access_log().hot_keys(
            clock::now(),
            self.config.hot_window(),
            self.config.hot_threshold,
        );
        let now = clock::now_utc();
        let touched = hot
            .iter()
            .filter(|key| self.cache.memory().touch(key, now))
            .count();

        let mut report = AnalysisReport {
            hot_keys: hot.len(),
            touched,
            purged_rows: 0,
        };
        self.cache.hot_keys().replace(hot);

        info!(
            hot_keys = report.hot_keys,
            touched = report.touched,
            "Hot-key analysis complete"
        );

        if let Some(persistent) = self.cache.persistent() {
            report.purged_rows = persistent.purge_expired(now).await?;
            if report.purged_rows > 0 {
                debug!(purged = report.purged_rows, "Purged expired persistent rows");
            }
        }

        Ok(report)
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            expiry_runs: self.expiry_runs.load(Ordering::Relaxed),
            analysis_runs: self.analysis_runs.load(Ordering::Relaxed),
            failed_ticks: self.failed_ticks.load(Ordering::Relaxed),
        }
    }
}

impl Drop for MaintenanceScheduler {
    fn drop(&mut self) {
        if let Some(token) = self.running.get_mut().take() {
            token.cancel();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
