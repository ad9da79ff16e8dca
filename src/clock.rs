//! Process clock
//!
//! Monotonic time comes from `tokio::time::Instant` so that expiry, hot-key
//! windows and scheduler ticks follow tokio's paused clock under test. Wall
//! clock time is anchored to the same source once per process.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use tokio::time::Instant;

static ANCHOR: Lazy<(Instant, DateTime<Utc>)> = Lazy::new(|| (Instant::now(), Utc::now()));

/// Current monotonic instant
pub fn now() -> Instant {
    Instant::now()
}

/// Current UTC time, advancing with the monotonic clock
pub fn now_utc() -> DateTime<Utc> {
    let (base_instant, base_utc) = *ANCHOR;
    let now = Instant::now();
    // Paused runtimes may sit behind the anchor; keep the mapping linear
    if now >= base_instant {
        base_utc + to_chrono(now - base_instant)
    } else {
        base_utc - to_chrono(base_instant - now)
    }
}

fn to_chrono(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_now_utc_follows_paused_clock() {
        let before = now_utc();
        tokio::time::advance(Duration::from_secs(3600)).await;
        let after = now_utc();
        assert!(after - before >= chrono::Duration::seconds(3600));
    }
}
