//! Outbound send rate limiting for the flurry proxy.
//!
//! A single [`RateLimit`] instance is shared by every live session and
//! consulted from the forwarding path: `is_limited` gates sends, `update`
//! records bytes actually handed to a transport, and `when` reports how
//! long to defer the next flush once the limit has been reached.
//!
//! Two behaviours sit behind the one API:
//!
//! * [`RateLimit::Unlimited`]: never limited, `when` is always zero.
//! * [`RateLimit::Bucket`]: a sliding-window token bucket, where the sum of
//!   bytes recorded over the last `window` seconds may not reach the
//!   bucket capacity.
//!
//! The bucket keeps its own history under a mutex so the one instance can
//! be shared by reference across concurrently running session tasks.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

/// Lowest accepted configured rate, in bytes per second (10 KiB/s).
///
/// A volunteer capping their proxy below this would be slower than useful
/// for clients, so the configuration is rejected outright.
pub const MIN_RATE: u64 = 10 * 1024;

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("configured rate {rate} B/s is below the {MIN_RATE} B/s floor")]
    BelowFloor { rate: u64 },
}

/// Shared outbound rate limiter.
pub enum RateLimit {
    /// No limit configured; every query answers "go ahead".
    Unlimited,
    /// Token-bucket limiting over a sliding time window.
    Bucket(Mutex<TokenBucket>),
}

impl RateLimit {
    /// A limiter that never limits.
    pub fn unlimited() -> Self {
        RateLimit::Unlimited
    }

    /// Build a bucket limiter from a configured bytes-per-second rate.
    ///
    /// The bucket capacity is `rate × window`. Rates below [`MIN_RATE`]
    /// are rejected.
    pub fn per_second(rate: u64, window: Duration) -> Result<Self, RateLimitError> {
        if rate < MIN_RATE {
            return Err(RateLimitError::BelowFloor { rate });
        }
        let capacity = (rate as f64 * window.as_secs_f64()) as u64;
        Ok(Self::from_bucket(TokenBucket::new(capacity, window)))
    }

    /// Wrap an existing bucket. Bypasses the [`MIN_RATE`] floor, which
    /// only applies to operator-supplied configuration.
    pub fn from_bucket(bucket: TokenBucket) -> Self {
        RateLimit::Bucket(Mutex::new(bucket))
    }

    /// True when no further bytes should be sent right now.
    pub fn is_limited(&self) -> bool {
        match self {
            RateLimit::Unlimited => false,
            RateLimit::Bucket(bucket) => lock(bucket).is_limited(Instant::now()),
        }
    }

    /// Record `bytes` as sent at the current instant.
    pub fn update(&self, bytes: u64) {
        match self {
            RateLimit::Unlimited => {}
            RateLimit::Bucket(bucket) => lock(bucket).update(Instant::now(), bytes),
        }
    }

    /// How long until enough history has aged out of the window for one
    /// more send. Zero when sending is already allowed.
    pub fn when(&self) -> Duration {
        match self {
            RateLimit::Unlimited => Duration::ZERO,
            RateLimit::Bucket(bucket) => lock(bucket).when(Instant::now()),
        }
    }
}

impl std::fmt::Debug for RateLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateLimit::Unlimited => f.write_str("RateLimit::Unlimited"),
            RateLimit::Bucket(bucket) => {
                let b = lock(bucket);
                f.debug_struct("RateLimit::Bucket")
                    .field("capacity", &b.capacity)
                    .field("window", &b.window)
                    .finish()
            }
        }
    }
}

/// A poisoned limiter mutex means a panic mid-bookkeeping; the history is
/// still structurally valid, so recover the guard rather than propagate.
fn lock(bucket: &Mutex<TokenBucket>) -> std::sync::MutexGuard<'_, TokenBucket> {
    bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Sliding-window token bucket.
///
/// The effective rate is `sum(bytes recorded in the last window) / window`;
/// the bucket is "full" once that sum reaches `capacity`.
pub struct TokenBucket {
    capacity: u64,
    window: Duration,
    /// Send events inside the window, oldest first.
    history: VecDeque<(Instant, u64)>,
    /// Sum of the byte counts in `history`.
    total: u64,
}

impl TokenBucket {
    pub fn new(capacity: u64, window: Duration) -> Self {
        Self {
            capacity,
            window,
            history: VecDeque::new(),
            total: 0,
        }
    }

    fn is_limited(&mut self, now: Instant) -> bool {
        self.prune(now);
        self.total >= self.capacity
    }

    fn update(&mut self, now: Instant, bytes: u64) {
        self.prune(now);
        self.history.push_back((now, bytes));
        self.total += bytes;
    }

    fn when(&mut self, now: Instant) -> Duration {
        self.prune(now);
        if self.total < self.capacity {
            return Duration::ZERO;
        }
        // Walk the history oldest-first until enough bytes would have aged
        // out for the remaining sum to drop under capacity; the answer is
        // the instant that last event leaves the window.
        let mut remaining = self.total;
        let mut exit_at = now;
        for (stamp, bytes) in &self.history {
            exit_at = *stamp + self.window;
            remaining -= bytes;
            if remaining < self.capacity {
                break;
            }
        }
        exit_at.saturating_duration_since(now)
    }

    /// Drop history that has aged out of the window.
    fn prune(&mut self, now: Instant) {
        while let Some((stamp, bytes)) = self.history.front() {
            if now.duration_since(*stamp) < self.window {
                break;
            }
            self.total -= bytes;
            self.history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    const WINDOW: Duration = Duration::from_secs(1);

    #[test]
    fn unlimited_never_limits() {
        let limit = RateLimit::unlimited();
        limit.update(u64::MAX);
        assert!(!limit.is_limited());
        assert_eq!(limit.when(), Duration::ZERO);
    }

    #[test]
    fn rejects_rate_below_floor() {
        let err = RateLimit::per_second(MIN_RATE - 1, WINDOW).unwrap_err();
        assert!(matches!(err, RateLimitError::BelowFloor { rate } if rate == MIN_RATE - 1));
    }

    #[test]
    fn accepts_rate_at_floor() {
        assert!(RateLimit::per_second(MIN_RATE, WINDOW).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn limits_once_capacity_reached() {
        let limit = RateLimit::from_bucket(TokenBucket::new(1000, WINDOW));
        assert!(!limit.is_limited());

        limit.update(800);
        assert!(!limit.is_limited());

        limit.update(800);
        assert!(limit.is_limited());
    }

    #[tokio::test(start_paused = true)]
    async fn when_reports_time_until_history_ages_out() {
        let limit = RateLimit::from_bucket(TokenBucket::new(1000, WINDOW));
        limit.update(1200);
        advance(Duration::from_millis(400)).await;

        assert!(limit.is_limited());
        // The single 1200-byte event exits the window 1s after it was
        // recorded, i.e. 600ms from "now".
        assert_eq!(limit.when(), Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides() {
        let limit = RateLimit::from_bucket(TokenBucket::new(1000, WINDOW));
        limit.update(1000);
        assert!(limit.is_limited());

        advance(Duration::from_millis(1001)).await;
        assert!(!limit.is_limited());
        assert_eq!(limit.when(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn when_ages_out_only_as_much_as_needed() {
        let limit = RateLimit::from_bucket(TokenBucket::new(1000, WINDOW));
        limit.update(600);
        advance(Duration::from_millis(300)).await;
        limit.update(600);

        // Dropping the first event (at t=0, exits at t=1000ms) leaves 600
        // in the window, under capacity; "now" is t=300ms.
        assert!(limit.is_limited());
        assert_eq!(limit.when(), Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn rolling_window_caps_cumulative_bytes() {
        let limit = RateLimit::from_bucket(TokenBucket::new(1000, WINDOW));
        let mut sent_in_window: Vec<(Instant, u64)> = Vec::new();

        // Simulate a pump that always defers by `when()` before retrying.
        for _ in 0..20 {
            if limit.is_limited() {
                advance(limit.when()).await;
            }
            limit.update(400);
            sent_in_window.push((Instant::now(), 400));
        }

        // Over any 1s span, at most capacity + one chunk was recorded.
        for (start, _) in &sent_in_window {
            let sum: u64 = sent_in_window
                .iter()
                .filter(|(at, _)| *at >= *start && *at < *start + WINDOW)
                .map(|(_, bytes)| bytes)
                .sum();
            assert!(sum <= 1000 + 400, "window starting {start:?} carried {sum}");
        }
    }
}
