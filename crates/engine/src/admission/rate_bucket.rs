//! Token bucket counter
//!
//! Tokens accumulate at `refill_rate` per second up to `capacity` and each
//! admission consumes one. Refill is lazy: it is computed from the time
//! elapsed since the previous refill whenever the bucket is consulted, never
//! by a background timer.

use std::time::Duration;

use tokio::time::Instant;

/// Tolerance for floating point drift when deciding a whole token is present
const TOKEN_EPSILON: f64 = 1e-9;

/// Shortest suspension handed back to callers, so a near-full token never
/// produces a zero-length sleep.
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Token bucket state
#[derive(Debug, Clone)]
pub struct RateBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl RateBucket {
    /// Create a full bucket
    pub fn new(capacity: u32, refill_rate_per_second: f64, now: Instant) -> Self {
        let capacity = f64::from(capacity);
        Self { capacity, refill_rate: refill_rate_per_second, tokens: capacity, last_refill: now }
    }

    /// Add the tokens earned since the last refill
    pub fn refill(&mut self, now: Instant) {
        self.tokens = self.available_at(now);
        self.last_refill = now;
    }

    /// Tokens that would be present at `now`, without mutating the bucket
    pub fn available_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.refill_rate).min(self.capacity)
    }

    /// Refill, then consume one token if present
    pub fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.has_token() {
            self.tokens = (self.tokens - 1.0).max(0.0);
            true
        } else {
            false
        }
    }

    /// Whether at least one whole token is present
    pub fn has_token(&self) -> bool {
        self.tokens >= 1.0 - TOKEN_EPSILON
    }

    /// Time until one whole token will be present, as of the last refill
    pub fn time_until_token(&self) -> Duration {
        if self.has_token() {
            return Duration::ZERO;
        }
        let secs = (1.0 - self.tokens) / self.refill_rate;
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX).max(MIN_WAIT)
    }

    /// Tokens present as of the last refill
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }
}
