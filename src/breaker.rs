//! Per-key circuit breaker.
//!
//! Two independent trip conditions open the circuit:
//!
//! - **Consecutive failures**: `failure_threshold` upstream failures in a
//!   row (a success zeroes the run).
//! - **Slow latency**: once warmed up (`min_samples` buffered), a rolling
//!   P95 at or above `slow_latency_ms` for `slow_sample_run` consecutive
//!   samples.
//!
//! An open circuit rejects attempts until its cooldown elapses, then lets a
//! single probe through (`half_open`). A successful probe closes the
//! circuit and resets the cooldown; a failed probe reopens it with the
//! cooldown doubled, capped at `max_cooldown`.
//!
//! All methods take `&mut self` — the owning key wraps the breaker in its
//! health mutex, and no method suspends.

use std::time::{Duration, Instant};

use crate::error::ErrorKind;
use crate::ring::SampleRing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected until the cooldown elapses.
    Open,
    /// One probe call is allowed through to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        })
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub max_cooldown: Duration,
    pub slow_latency_ms: u64,
    pub slow_sample_run: u32,
    pub min_samples: usize,
    /// Latency ring capacity.
    pub sample_capacity: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
            slow_latency_ms: 30_000,
            slow_sample_run: 8,
            min_samples: 20,
            sample_capacity: 128,
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    latency: SampleRing,
    /// Consecutive samples whose rolling P95 met the slow threshold.
    slow_run: u32,
    opened_at: Option<Instant>,
    /// Current cooldown — doubles on failed probes, capped.
    cooldown: Duration,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let cooldown = config.cooldown;
        let latency = SampleRing::new(config.sample_capacity);
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            latency,
            slow_run: 0,
            opened_at: None,
            cooldown,
            probe_in_flight: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Rolling median latency, used by the scheduler's scoring tuple.
    pub fn latency_p50(&self) -> Option<u64> {
        self.latency.p50()
    }

    /// Whether a call may be attempted right now.
    ///
    /// For an open circuit whose cooldown has elapsed this atomically moves
    /// to `half_open` and reserves the single probe slot for the caller;
    /// every other caller is rejected until the probe resolves.
    pub fn try_acquire(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|at| at.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if elapsed {
                    self.state = CircuitState::HalfOpen;
                    self.probe_in_flight = true;
                    tracing::debug!(cooldown_ms = self.cooldown.as_millis() as u64, "circuit half-open, probe reserved");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    false
                } else {
                    self.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Release a reserved probe without an outcome (caller bailed before the
    /// upstream call, e.g. request cancelled). State is unchanged.
    pub fn release_probe(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.probe_in_flight = false;
        }
    }

    pub fn record_success(&mut self, latency: Duration) {
        self.consecutive_failures = 0;

        if self.state == CircuitState::HalfOpen {
            // Probe succeeded — full recovery.
            self.state = CircuitState::Closed;
            self.probe_in_flight = false;
            self.opened_at = None;
            self.cooldown = self.config.cooldown;
            self.slow_run = 0;
            tracing::info!("circuit closed after successful probe");
        }

        self.latency.push(latency.as_millis() as u64);
        self.check_slow_latency();
    }

    pub fn record_failure(&mut self, kind: ErrorKind) {
        if !kind.counts_against_circuit() {
            return;
        }

        if self.state == CircuitState::HalfOpen {
            // Probe failed — reopen with doubled cooldown.
            self.probe_in_flight = false;
            self.cooldown = (self.cooldown * 2).min(self.config.max_cooldown);
            self.open();
            tracing::warn!(
                cooldown_ms = self.cooldown.as_millis() as u64,
                "probe failed, circuit reopened"
            );
            return;
        }

        self.consecutive_failures += 1;
        if self.state == CircuitState::Closed
            && self.consecutive_failures >= self.config.failure_threshold
        {
            self.cooldown = self.config.cooldown;
            self.open();
            tracing::warn!(
                failures = self.consecutive_failures,
                "circuit opened on consecutive failures"
            );
        }
    }

    /// Operator override, also used by tests.
    pub fn force_state(&mut self, state: CircuitState) {
        self.state = state;
        self.probe_in_flight = false;
        match state {
            CircuitState::Open => self.opened_at = Some(Instant::now()),
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                self.opened_at = None;
                self.cooldown = self.config.cooldown;
            }
            CircuitState::HalfOpen => {}
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.slow_run = 0;
    }

    fn check_slow_latency(&mut self) {
        if self.state != CircuitState::Closed || self.latency.len() < self.config.min_samples {
            return;
        }
        let slow = self
            .latency
            .p95()
            .map(|p95| p95 >= self.config.slow_latency_ms)
            .unwrap_or(false);
        if slow {
            self.slow_run += 1;
            if self.slow_run >= self.config.slow_sample_run {
                self.cooldown = self.config.cooldown;
                self.open();
                tracing::warn!(
                    p95_ms = self.latency.p95().unwrap_or(0),
                    "circuit opened on sustained slow latency"
                );
            }
        } else {
            self.slow_run = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_millis(20),
            max_cooldown: Duration::from_millis(100),
            slow_latency_ms: 1_000,
            slow_sample_run: 3,
            min_samples: 4,
            sample_capacity: 16,
        }
    }

    fn trip(breaker: &mut CircuitBreaker) {
        for _ in 0..3 {
            breaker.record_failure(ErrorKind::ServerError);
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    // -----------------------------------------------------------------------
    // Consecutive-failure trip
    // -----------------------------------------------------------------------

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let mut breaker = CircuitBreaker::new(fast_config());
        breaker.record_failure(ErrorKind::ServerError);
        breaker.record_failure(ErrorKind::Timeout);
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure(ErrorKind::SocketHangup);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.try_acquire(), "open circuit rejects before cooldown");
    }

    #[test]
    fn success_resets_the_failure_run() {
        let mut breaker = CircuitBreaker::new(fast_config());
        breaker.record_failure(ErrorKind::ServerError);
        breaker.record_failure(ErrorKind::ServerError);
        breaker.record_success(Duration::from_millis(10));
        breaker.record_failure(ErrorKind::ServerError);
        breaker.record_failure(ErrorKind::ServerError);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn local_error_kinds_never_trip_the_circuit() {
        let mut breaker = CircuitBreaker::new(fast_config());
        for _ in 0..10 {
            breaker.record_failure(ErrorKind::QueueTimeout);
            breaker.record_failure(ErrorKind::BadRequest);
            breaker.record_failure(ErrorKind::RateLimited);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    // -----------------------------------------------------------------------
    // Half-open probe
    // -----------------------------------------------------------------------

    #[test]
    fn cooldown_elapse_grants_exactly_one_probe() {
        let mut breaker = CircuitBreaker::new(fast_config());
        trip(&mut breaker);

        std::thread::sleep(Duration::from_millis(25));
        assert!(breaker.try_acquire(), "first caller gets the probe");
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.try_acquire(), "second caller must wait for the probe");
    }

    #[test]
    fn successful_probe_closes_and_resets_cooldown() {
        let mut breaker = CircuitBreaker::new(fast_config());
        trip(&mut breaker);
        std::thread::sleep(Duration::from_millis(25));
        assert!(breaker.try_acquire());

        breaker.record_success(Duration::from_millis(5));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire());
    }

    #[test]
    fn failed_probe_reopens_with_doubled_cooldown_capped() {
        let mut breaker = CircuitBreaker::new(fast_config());
        trip(&mut breaker);

        // Fail probes repeatedly; cooldown doubles 20 → 40 → 80 → 100 (cap).
        for expected_ms in [40u64, 80, 100, 100] {
            std::thread::sleep(breaker.cooldown + Duration::from_millis(5));
            assert!(breaker.try_acquire(), "probe after cooldown");
            breaker.record_failure(ErrorKind::ServerError);
            assert_eq!(breaker.state(), CircuitState::Open);
            assert_eq!(breaker.cooldown.as_millis() as u64, expected_ms);
        }
    }

    #[test]
    fn released_probe_can_be_reacquired() {
        let mut breaker = CircuitBreaker::new(fast_config());
        trip(&mut breaker);
        std::thread::sleep(Duration::from_millis(25));
        assert!(breaker.try_acquire());

        breaker.release_probe();
        assert!(breaker.try_acquire(), "released probe slot is available again");
    }

    // -----------------------------------------------------------------------
    // Slow-latency trip
    // -----------------------------------------------------------------------

    #[test]
    fn sustained_slow_p95_opens_the_circuit() {
        let mut breaker = CircuitBreaker::new(fast_config());
        // Warm up past min_samples with slow samples; p95 stays >= 1000ms.
        for _ in 0..4 {
            breaker.record_success(Duration::from_millis(2_000));
        }
        assert_eq!(breaker.state(), CircuitState::Closed, "run not yet long enough");
        for _ in 0..2 {
            breaker.record_success(Duration::from_millis(2_000));
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn fast_sample_breaks_the_slow_run() {
        // Tiny ring so fast samples can actually pull the p95 down.
        let mut breaker = CircuitBreaker::new(BreakerConfig {
            min_samples: 2,
            slow_sample_run: 4,
            sample_capacity: 2,
            ..fast_config()
        });
        breaker.record_success(Duration::from_millis(2_000));
        breaker.record_success(Duration::from_millis(2_000));
        breaker.record_success(Duration::from_millis(2_000));
        // Two fast samples fill the 2-slot ring; p95 drops below threshold.
        breaker.record_success(Duration::from_millis(1));
        breaker.record_success(Duration::from_millis(1));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    // -----------------------------------------------------------------------
    // force_state
    // -----------------------------------------------------------------------

    #[test]
    fn force_state_overrides_transitions() {
        let mut breaker = CircuitBreaker::new(fast_config());
        breaker.force_state(CircuitState::Open);
        assert!(!breaker.try_acquire());
        breaker.force_state(CircuitState::Closed);
        assert!(breaker.try_acquire());
    }
}
