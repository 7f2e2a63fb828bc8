use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;

/// Outcome of a rate-limit check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
}

/// Sliding-window limiter keyed by client identity.
///
/// Every check records an attempt, so a client that keeps hammering past
/// the limit keeps the window full and stays throttled.
pub struct RateLimiter {
    events: DashMap<String, Vec<i64>>,
    max_events: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_events: u32, window: Duration) -> Self {
        Self {
            events: DashMap::new(),
            max_events,
            window,
        }
    }

    /// Record an attempt for `key` and report whether it is allowed.
    pub fn check(&self, key: &str) -> RateDecision {
        self.check_at(key, Utc::now().timestamp_millis())
    }

    /// The entry guard holds the key's shard for the whole
    /// purge-count-record sequence, so two concurrent checks can never
    /// both claim the last remaining slot.
    fn check_at(&self, key: &str, now_ms: i64) -> RateDecision {
        let mut stamps = self.events.entry(key.to_string()).or_default();
        let cutoff = now_ms - self.window.as_millis() as i64;
        stamps.retain(|&t| t > cutoff);

        let prior = stamps.len() as u32;
        stamps.push(now_ms);

        RateDecision {
            allowed: prior < self.max_events,
            remaining: self.max_events.saturating_sub(stamps.len() as u32),
        }
    }

    /// Drop keys with no attempt inside the current window. Purging is
    /// otherwise lazy, so idle keys linger until this runs.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now().timestamp_millis())
    }

    fn sweep_at(&self, now_ms: i64) -> usize {
        let cutoff = now_ms - self.window.as_millis() as i64;
        let before = self.events.len();
        self.events
            .retain(|_, stamps| stamps.last().is_some_and(|&t| t > cutoff));
        before - self.events.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.events.len()
    }
}

/// Start a background task that periodically sweeps idle limiter keys.
pub fn start_sweep_task(
    limiter: Arc<RateLimiter>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let swept = limiter.sweep();
            if swept > 0 {
                tracing::debug!(swept = swept, "Rate limiter sweep");
            }
        }
    })
}
