//! Token bucket used for per-key rate limiting.
//!
//! Tokens refill linearly at `rate_per_minute / 60` per second between
//! calls; the count is fractional to avoid rounding drift. The bucket never
//! blocks — callers that are refused get the exact wait until the next
//! whole token and either retry or requeue.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Token refill rate per second (`rate_per_minute / 60`).
    fill_rate: f64,
    /// Maximum bucket capacity (burst allowance).
    capacity: f64,
    /// Current token count. Fractional to avoid drift.
    tokens: f64,
    /// Timestamp of the last refill.
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_minute: u32, burst: u32) -> Self {
        let capacity = burst.max(1) as f64;
        Self {
            fill_rate: rate_per_minute as f64 / 60.0,
            capacity,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    /// Attempt to consume `n` tokens.
    ///
    /// Returns `Ok(())` when the tokens were deducted, or
    /// `Err(retry_after)` with the wait until `n` tokens will be available.
    pub fn try_acquire(&mut self, n: u32) -> Result<(), Duration> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let refilled = (self.tokens + elapsed * self.fill_rate).min(self.capacity);
        let needed = n as f64;

        if refilled < needed {
            let deficit = needed - refilled;
            // fill_rate of 0 means the bucket never refills; report an hour.
            let wait = if self.fill_rate > 0.0 {
                deficit / self.fill_rate
            } else {
                3600.0
            };
            return Err(Duration::from_secs_f64(wait));
        }

        self.last_refill = now;
        self.tokens = refilled - needed;
        Ok(())
    }

    /// Whether at least one token is currently available, without consuming.
    pub fn has_capacity(&self) -> bool {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        (self.tokens + elapsed * self.fill_rate).min(self.capacity) >= 1.0
    }
}
