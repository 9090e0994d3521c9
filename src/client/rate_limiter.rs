//! Sliding-window throttle for outbound calls.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::model::RateLimitConfig;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Per-client throttle enforcing a per-minute and a per-hour cap.
///
/// Every permitted call is timestamped. Before a new call, timestamps that
/// left the hour window are dropped; if either window is full the caller
/// sleeps until its oldest timestamp exits that window. Time comes from
/// `tokio::time`, so tests drive it with a paused clock.
#[derive(Debug)]
pub struct RateLimiter {
    per_minute: Option<usize>,
    per_hour: Option<usize>,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(per_minute: Option<u32>, per_hour: Option<u32>) -> Self {
        Self {
            per_minute: per_minute.filter(|n| *n > 0).map(|n| n as usize),
            per_hour: per_hour.filter(|n| *n > 0).map(|n| n as usize),
            calls: Mutex::new(VecDeque::new()),
        }
    }

    pub fn from_config(config: Option<&RateLimitConfig>) -> Self {
        match config {
            Some(c) => Self::new(c.requests_per_minute, c.requests_per_hour),
            None => Self::unlimited(),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None, None)
    }

    /// Suspends until a call is permitted, then records it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut calls = self.calls.lock().await;
                let now = Instant::now();
                while calls.front().is_some_and(|t| now.duration_since(*t) >= HOUR) {
                    calls.pop_front();
                }

                match self.required_wait(&calls, now) {
                    None => {
                        calls.push_back(now);
                        return;
                    }
                    Some(wait) => wait,
                }
            };

            debug!(wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting");
            sleep(wait).await;
        }
    }

    /// Longest wait imposed by any full window, or `None` when both have room.
    fn required_wait(&self, calls: &VecDeque<Instant>, now: Instant) -> Option<Duration> {
        let minute_wait = self
            .per_minute
            .and_then(|cap| window_wait(calls, now, MINUTE, cap));
        let hour_wait = self.per_hour.and_then(|cap| window_wait(calls, now, HOUR, cap));
        minute_wait.into_iter().chain(hour_wait).max()
    }

    /// Calls recorded within the last minute.
    pub async fn recent_calls(&self) -> usize {
        let calls = self.calls.lock().await;
        let now = Instant::now();
        calls.iter().filter(|t| now.duration_since(**t) < MINUTE).count()
    }
}

fn window_wait(
    calls: &VecDeque<Instant>,
    now: Instant,
    window: Duration,
    cap: usize,
) -> Option<Duration> {
    let in_window: Vec<&Instant> = calls
        .iter()
        .filter(|t| now.duration_since(**t) < window)
        .collect();
    if in_window.len() < cap {
        return None;
    }
    // The call that must expire to free a slot
    let oldest = in_window[in_window.len() - cap];
    Some((*oldest + window).saturating_duration_since(now))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_third_call_waits_for_window() {
        let limiter = RateLimiter::new(Some(2), None);
        let start = Instant::now();

        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(1));

        limiter.acquire().await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(60), "waited {:?}", waited);
        assert!(waited < Duration::from_secs(61), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_never_waits() {
        let limiter = RateLimiter::unlimited();
        let start = Instant::now();
        for _ in 0..100 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hourly_cap_is_enforced() {
        let limiter = RateLimiter::new(Some(10), Some(3));
        let start = Instant::now();

        for _ in 0..3 {
            limiter.acquire().await;
        }
        limiter.acquire().await;

        let waited = start.elapsed();
        assert!(waited >= HOUR, "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let limiter = RateLimiter::new(Some(2), None);
        let start = Instant::now();

        limiter.acquire().await;
        tokio::time::advance(Duration::from_secs(30)).await;
        limiter.acquire().await;
        assert_eq!(limiter.recent_calls().await, 2);

        // First slot frees at t=60, not t=90
        limiter.acquire().await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(60) && waited < Duration::from_secs(61));
    }
}
