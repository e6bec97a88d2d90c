//! Pool-wide rate-limit coordinator.
//!
//! Watches upstream 429s across every key. A burst of them (the per-key
//! cooldowns notwithstanding) means the whole account is saturated, so the
//! pool enters a global cooldown: the scheduler rejects all selections with
//! a `retry_after` until it clears. Repeated storms escalate the cooldown
//! exponentially toward `cap`; quiet time decays the escalation linearly
//! over `decay`. The advertised `retry_after` carries jitter so a herd of
//! waiting clients does not come back in lockstep.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

#[derive(Debug, Clone)]
pub struct PoolCooldownConfig {
    /// Cooldown applied on the first storm.
    pub base: Duration,
    /// Ceiling for escalated cooldowns.
    pub cap: Duration,
    /// Quiet time over which storm escalation decays back to zero.
    pub decay: Duration,
    /// Maximum jitter added to the advertised retry-after.
    pub retry_jitter: Duration,
    /// Sliding window within which 429s are counted as one storm.
    pub window: Duration,
    /// Number of 429s inside the window that triggers the cooldown.
    pub burst_threshold: u32,
}

impl Default for PoolCooldownConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(2_000),
            cap: Duration::from_millis(60_000),
            decay: Duration::from_millis(30_000),
            retry_jitter: Duration::from_millis(500),
            window: Duration::from_millis(1_000),
            burst_threshold: 3,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    /// Recent 429 instants, pruned to the sliding window.
    events: VecDeque<Instant>,
    cooling_until: Option<Instant>,
    /// Storm escalation level — doubles the cooldown per consecutive storm.
    level: u32,
    last_storm: Option<Instant>,
}

/// Shared coordinator, one per key pool.
#[derive(Debug)]
pub struct PoolCooldown {
    config: PoolCooldownConfig,
    inner: Mutex<Inner>,
}

impl PoolCooldown {
    pub fn new(config: PoolCooldownConfig) -> Self {
        Self { config, inner: Mutex::new(Inner::default()) }
    }

    /// Record an upstream 429 from any key.
    ///
    /// Returns the cooldown duration when this event tipped the pool into
    /// (or extended) a cooldown.
    pub fn record_rate_limited(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("cooldown lock poisoned");

        inner.events.push_back(now);
        while let Some(front) = inner.events.front() {
            if now.duration_since(*front) > self.config.window {
                inner.events.pop_front();
            } else {
                break;
            }
        }

        if (inner.events.len() as u32) < self.config.burst_threshold {
            return None;
        }
        inner.events.clear();

        // Escalation decays linearly with quiet time since the last storm.
        if let Some(last) = inner.last_storm {
            let quiet = now.duration_since(last);
            if quiet >= self.config.decay {
                inner.level = 0;
            } else if inner.level > 0 && !self.config.decay.is_zero() {
                let ratio = quiet.as_secs_f64() / self.config.decay.as_secs_f64();
                inner.level -= (inner.level as f64 * ratio).round() as u32;
            }
        }
        inner.level = inner.level.saturating_add(1);
        inner.last_storm = Some(now);

        let exp = inner.level.saturating_sub(1).min(10);
        let duration = self
            .config
            .base
            .saturating_mul(1u32 << exp)
            .min(self.config.cap)
            .max(self.config.base);
        inner.cooling_until = Some(now + duration);
        tracing::warn!(
            level = inner.level,
            cooldown_ms = duration.as_millis() as u64,
            "pool-wide cooldown entered after 429 storm"
        );
        Some(duration)
    }

    /// Remaining cooldown with jitter, or `None` when the pool is open.
    pub fn check(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("cooldown lock poisoned");
        match inner.cooling_until {
            Some(until) if until > now => {
                let remaining = until - now;
                let jitter_ms = self.config.retry_jitter.as_millis() as u64;
                let jitter = if jitter_ms == 0 {
                    Duration::ZERO
                } else {
                    Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
                };
                Some(remaining + jitter)
            }
            Some(_) => {
                inner.cooling_until = None;
                None
            }
            None => None,
        }
    }

    /// Whether the pool is currently cooling. Cheaper than [`check`] when
    /// the caller does not need the wait estimate.
    pub fn is_cooling(&self) -> bool {
        let inner = self.inner.lock().expect("cooldown lock poisoned");
        inner.cooling_until.is_some_and(|until| until > Instant::now())
    }
}
