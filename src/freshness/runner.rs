//! Bounded worker pool for refresh units
//!
//! Units run at most `workers` at a time. Cancellation is checked before each
//! unit starts; a unit already in flight runs until it finishes or times out.

use std::future::Future;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lower bound on pool size
pub const MIN_WORKERS: usize = 3;

/// Upper bound on pool size
pub const MAX_WORKERS: usize = 20;

/// Result of one unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome<T> {
    Done(T),
    Failed(String),
    TimedOut,
    /// Never started because cancellation was observed first
    Cancelled,
}

impl<T> UnitOutcome<T> {
    pub fn is_done(&self) -> bool {
        matches!(self, UnitOutcome::Done(_))
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
    workers: usize,
    unit_timeout: Duration,
}

impl WorkerPool {
    /// `workers` is clamped into `MIN_WORKERS..=MAX_WORKERS`
    pub fn new(workers: usize, unit_timeout: Duration) -> Self {
        Self {
            workers: workers.clamp(MIN_WORKERS, MAX_WORKERS),
            unit_timeout,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn unit_timeout(&self) -> Duration {
        self.unit_timeout
    }

    /// Run `work` over every unit; outcomes come back in input order
    pub async fn run<I, T, F, Fut>(
        &self,
        units: Vec<I>,
        cancel: &CancellationToken,
        work: F,
    ) -> Vec<UnitOutcome<T>>
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let total = units.len();
        let timeout = self.unit_timeout;
        let work = &work;

        let mut outcomes: Vec<Option<UnitOutcome<T>>> = (0..total).map(|_| None).collect();
        let mut pending = stream::iter(units.into_iter().enumerate())
            .map(|(idx, unit)| async move {
                if cancel.is_cancelled() {
                    return (idx, UnitOutcome::Cancelled);
                }
                let outcome = match tokio::time::timeout(timeout, work(unit)).await {
                    Ok(Ok(value)) => UnitOutcome::Done(value),
                    Ok(Err(e)) => UnitOutcome::Failed(format!("{:#}", e)),
                    Err(_) => {
                        warn!(unit = idx, timeout_secs = timeout.as_secs(), "Unit timed out");
                        UnitOutcome::TimedOut
                    }
                };
                (idx, outcome)
            })
            .buffer_unordered(self.workers);

        while let Some((idx, outcome)) = pending.next().await {
            outcomes[idx] = Some(outcome);
        }

        debug!(total, workers = self.workers, "Worker pool drained");
        outcomes
            .into_iter()
            .map(|o| o.unwrap_or(UnitOutcome::Cancelled))
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
