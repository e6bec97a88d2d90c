//! Key pool and scheduler.
//!
//! Each upstream credential is an [`ApiKey`] with its own concurrency
//! gauge, token bucket, circuit breaker, latency ring, and 429 cooldown.
//! [`KeyPool::acquire`] picks a key for one attempt: filter out keys that
//! cannot serve (open circuit, empty bucket, cooling, provider mismatch),
//! then score the rest by `(overloaded, in_flight, latency p50)` with a
//! round-robin cursor breaking ties. Keys whose cumulative selection count
//! exceeds 1.5x the pool median are deprioritized until parity returns.
//!
//! A successful acquire returns a [`KeyLease`]. The lease must be resolved
//! with exactly one of `complete_success` / `complete_failure` /
//! `complete_neutral`; dropping an unresolved lease releases the slot
//! without touching the breaker, so no exit path can leak concurrency.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use crate::bucket::TokenBucket;
use crate::cooldown::PoolCooldown;
use crate::error::ErrorKind;

/// Why the scheduler picked a particular key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionReason {
    LeastLoaded,
    HalfOpenProbe,
    RoundRobin,
    ProviderMatch,
    QueueDrained,
}

/// Scheduler-level acquisition failures.
#[derive(Debug)]
pub enum AcquireError {
    /// Every key is busy, cooling, or open. Retryable after a short wait.
    PoolExhausted,
    /// Pool-wide cooldown is active.
    PoolCooldown(Duration),
    /// No key is configured for the requested provider.
    NoKeysForProvider,
}

impl AcquireError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PoolExhausted => ErrorKind::PoolExhausted,
            Self::PoolCooldown(_) => ErrorKind::PoolCooldown,
            Self::NoKeysForProvider => ErrorKind::ProviderNoKeysConfigured,
        }
    }
}

struct KeyHealth {
    breaker: CircuitBreaker,
    bucket: TokenBucket,
    /// Set after an upstream 429 on this key.
    cooldown_until: Option<Instant>,
    last_used: Option<Instant>,
}

/// One upstream credential and all of its runtime state.
pub struct ApiKey {
    index: usize,
    /// Short stable hash of the credential — the only identifier that ever
    /// reaches logs or traces.
    fingerprint: String,
    credential: String,
    provider: Option<String>,
    in_flight: AtomicU32,
    selections: AtomicU64,
    health: Mutex<KeyHealth>,
}

impl ApiKey {
    fn new(
        index: usize,
        credential: String,
        provider: Option<String>,
        breaker: BreakerConfig,
        rate_per_minute: u32,
        burst: u32,
    ) -> Self {
        Self {
            index,
            fingerprint: fingerprint(&credential),
            credential,
            provider,
            in_flight: AtomicU32::new(0),
            selections: AtomicU64::new(0),
            health: Mutex::new(KeyHealth {
                breaker: CircuitBreaker::new(breaker),
                bucket: TokenBucket::new(rate_per_minute, burst),
                cooldown_until: None,
                last_used: None,
            }),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn credential(&self) -> &str {
        &self.credential
    }

    pub fn provider(&self) -> Option<&str> {
        self.provider.as_deref()
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.health.lock().expect("key lock poisoned").breaker.state()
    }

    fn matches_provider(&self, provider: Option<&str>) -> bool {
        match (provider, self.provider.as_deref()) {
            // Untagged keys serve any provider; untagged requests take any key.
            (None, _) | (_, None) => true,
            (Some(want), Some(have)) => want == have,
        }
    }
}

/// Short stable hash of a credential for log-safe identification.
fn fingerprint(credential: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    credential.hash(&mut hasher);
    format!("{:016x}", hasher.finish())[..12].to_string()
}

/// Point-in-time view of one key, for the observability surface.
#[derive(Debug, Clone, Serialize)]
pub struct KeySnapshot {
    pub index: usize,
    pub fingerprint: String,
    pub provider: Option<String>,
    pub circuit: String,
    pub in_flight: u32,
    pub selections: u64,
    pub latency_p50_ms: Option<u64>,
    pub cooling: bool,
}

#[derive(Debug, Clone)]
pub struct KeyPoolConfig {
    pub max_concurrency_per_key: u32,
    pub rate_limit_per_minute: u32,
    pub rate_limit_burst: u32,
    pub breaker: BreakerConfig,
    /// Per-key cooldown applied after an upstream 429 on that key.
    pub rate_limit_cooldown: Duration,
}

impl Default for KeyPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency_per_key: 8,
            rate_limit_per_minute: 60,
            rate_limit_burst: 30,
            breaker: BreakerConfig::default(),
            rate_limit_cooldown: Duration::from_secs(5),
        }
    }
}

/// The pool: keys in insertion order plus the pool-wide 429 coordinator.
pub struct KeyPool {
    keys: Vec<Arc<ApiKey>>,
    config: KeyPoolConfig,
    pub cooldown: Arc<PoolCooldown>,
    rr_cursor: AtomicUsize,
}

impl KeyPool {
    pub fn new(
        credentials: Vec<(String, Option<String>)>,
        config: KeyPoolConfig,
        cooldown: Arc<PoolCooldown>,
    ) -> Self {
        let keys = credentials
            .into_iter()
            .enumerate()
            .map(|(index, (credential, provider))| {
                Arc::new(ApiKey::new(
                    index,
                    credential,
                    provider,
                    config.breaker.clone(),
                    config.rate_limit_per_minute,
                    config.rate_limit_burst,
                ))
            })
            .collect();
        Self { keys, config, cooldown, rr_cursor: AtomicUsize::new(0) }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[Arc<ApiKey>] {
        &self.keys
    }

    /// Pick a key for one attempt.
    ///
    /// `from_queue` marks acquisitions made right after a queue wait so the
    /// selection reason reflects it.
    pub fn acquire(
        &self,
        provider: Option<&str>,
        from_queue: bool,
    ) -> Result<(KeyLease, SelectionReason), AcquireError> {
        if let Some(retry_after) = self.cooldown.check() {
            return Err(AcquireError::PoolCooldown(retry_after));
        }

        let eligible: Vec<&Arc<ApiKey>> = self
            .keys
            .iter()
            .filter(|k| k.matches_provider(provider))
            .collect();
        if eligible.is_empty() {
            return Err(AcquireError::NoKeysForProvider);
        }

        // Snapshot phase: split into closed candidates (scored) and
        // probe candidates (open-past-cooldown or half-open). The breaker
        // is only mutated for the key actually selected.
        let now = Instant::now();
        let mut closed: Vec<(&Arc<ApiKey>, u32, u64)> = Vec::new();
        let mut probes: Vec<&Arc<ApiKey>> = Vec::new();

        for &key in &eligible {
            let in_flight = key.in_flight.load(Ordering::Relaxed);
            let health = key.health.lock().expect("key lock poisoned");
            if health.cooldown_until.is_some_and(|until| until > now) {
                continue;
            }
            match health.breaker.state() {
                CircuitState::Closed => {
                    if in_flight < self.config.max_concurrency_per_key && health.bucket.has_capacity()
                    {
                        let p50 = health.breaker.latency_p50().unwrap_or(0);
                        closed.push((key, in_flight, p50));
                    }
                }
                CircuitState::Open | CircuitState::HalfOpen => probes.push(key),
            }
        }

        if let Some((lease, tie_broken)) = self.acquire_closed(closed) {
            let reason = if from_queue {
                SelectionReason::QueueDrained
            } else if provider.is_some() {
                SelectionReason::ProviderMatch
            } else if tie_broken {
                SelectionReason::RoundRobin
            } else {
                SelectionReason::LeastLoaded
            };
            return Ok((lease, reason));
        }

        // No closed key available — offer the probe slot of a recovering key.
        for key in probes {
            let mut health = key.health.lock().expect("key lock poisoned");
            if health.breaker.try_acquire() {
                if health.bucket.try_acquire(1).is_err() {
                    health.breaker.release_probe();
                    continue;
                }
                health.last_used = Some(Instant::now());
                drop(health);
                key.selections.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = key.fingerprint(), "half-open probe dispatched");
                return Ok((KeyLease::probe(key, self), SelectionReason::HalfOpenProbe));
            }
        }

        Err(AcquireError::PoolExhausted)
    }

    /// Score and claim the best closed key. Returns the lease and whether
    /// the round-robin cursor decided among tied candidates.
    fn acquire_closed(
        &self,
        mut candidates: Vec<(&Arc<ApiKey>, u32, u64)>,
    ) -> Option<(KeyLease, bool)> {
        if candidates.is_empty() {
            return None;
        }

        // Fairness: keys far above the median selection count go last.
        let median = {
            let mut counts: Vec<u64> = candidates
                .iter()
                .map(|(k, _, _)| k.selections.load(Ordering::Relaxed))
                .collect();
            counts.sort_unstable();
            counts[counts.len() / 2]
        };
        let ceiling = (median as f64 * 1.5) as u64;

        candidates.sort_by_key(|(key, in_flight, p50)| {
            let overloaded = median > 0 && key.selections.load(Ordering::Relaxed) > ceiling;
            (overloaded, *in_flight, *p50)
        });

        let best_score = {
            let (key, in_flight, p50) = &candidates[0];
            let overloaded = median > 0 && key.selections.load(Ordering::Relaxed) > ceiling;
            (overloaded, *in_flight, *p50)
        };
        let tied = candidates
            .iter()
            .take_while(|(key, in_flight, p50)| {
                let overloaded = median > 0 && key.selections.load(Ordering::Relaxed) > ceiling;
                (overloaded, *in_flight, *p50) == best_score
            })
            .count();
        let tie_broken = tied > 1;
        let start = if tie_broken {
            self.rr_cursor.fetch_add(1, Ordering::Relaxed) % tied
        } else {
            0
        };

        // Claim phase: the snapshot may be stale, so re-verify under the
        // key lock and fall through to the next candidate on a miss.
        for offset in 0..candidates.len() {
            let pos = if offset < tied { (start + offset) % tied } else { offset };
            let (key, _, _) = candidates[pos];

            let mut health = key.health.lock().expect("key lock poisoned");
            if health.breaker.state() != CircuitState::Closed {
                continue;
            }
            if health.cooldown_until.is_some_and(|until| until > Instant::now()) {
                continue;
            }
            let prev = key.in_flight.fetch_add(1, Ordering::AcqRel);
            if prev >= self.config.max_concurrency_per_key {
                key.in_flight.fetch_sub(1, Ordering::AcqRel);
                continue;
            }
            if health.bucket.try_acquire(1).is_err() {
                key.in_flight.fetch_sub(1, Ordering::AcqRel);
                continue;
            }
            health.last_used = Some(Instant::now());
            drop(health);
            key.selections.fetch_add(1, Ordering::Relaxed);
            return Some((KeyLease::counted(key, self), tie_broken));
        }
        None
    }

    /// Per-key snapshots for the observability surface.
    pub fn snapshot(&self) -> Vec<KeySnapshot> {
        let now = Instant::now();
        self.keys
            .iter()
            .map(|key| {
                let health = key.health.lock().expect("key lock poisoned");
                KeySnapshot {
                    index: key.index,
                    fingerprint: key.fingerprint.clone(),
                    provider: key.provider.clone(),
                    circuit: health.breaker.state().to_string(),
                    in_flight: key.in_flight(),
                    selections: key.selections.load(Ordering::Relaxed),
                    latency_p50_ms: health.breaker.latency_p50(),
                    cooling: health.cooldown_until.is_some_and(|until| until > now),
                }
            })
            .collect()
    }

    fn rate_limit_cooldown(&self) -> Duration {
        self.config.rate_limit_cooldown
    }
}

/// RAII lease over one key attempt.
///
/// Exactly one completion method should be called; `Drop` covers every
/// abandoned path by releasing the slot with no health record.
pub struct KeyLease {
    key: Arc<ApiKey>,
    pool_cooldown: Arc<PoolCooldown>,
    rate_limit_cooldown: Duration,
    probe: bool,
    started: Instant,
    resolved: AtomicBool,
}

impl KeyLease {
    fn counted(key: &Arc<ApiKey>, pool: &KeyPool) -> Self {
        Self {
            key: Arc::clone(key),
            pool_cooldown: Arc::clone(&pool.cooldown),
            rate_limit_cooldown: pool.rate_limit_cooldown(),
            probe: false,
            started: Instant::now(),
            resolved: AtomicBool::new(false),
        }
    }

    fn probe(key: &Arc<ApiKey>, pool: &KeyPool) -> Self {
        Self {
            key: Arc::clone(key),
            pool_cooldown: Arc::clone(&pool.cooldown),
            rate_limit_cooldown: pool.rate_limit_cooldown(),
            probe: true,
            started: Instant::now(),
            resolved: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &ApiKey {
        &self.key
    }

    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Upstream 2xx: record latency, close the probe if any.
    pub fn complete_success(self, latency: Duration) {
        self.resolve(|health| health.breaker.record_success(latency));
    }

    /// Upstream or transport failure.
    ///
    /// 429s start the key's cooldown and feed the pool-wide coordinator;
    /// upstream-failure kinds advance the breaker.
    pub fn complete_failure(self, kind: ErrorKind) {
        if kind == ErrorKind::RateLimited {
            let cooldown = self.rate_limit_cooldown;
            self.pool_cooldown.record_rate_limited();
            self.resolve(|health| {
                health.cooldown_until = Some(Instant::now() + cooldown);
                // A rate limit is not a key failure; clear the probe only.
                health.breaker.release_probe();
            });
        } else {
            self.resolve(|health| health.breaker.record_failure(kind));
        }
    }

    /// Upstream 4xx (not 429): the key worked, the request was bad.
    pub fn complete_neutral(self) {
        self.resolve(|health| health.breaker.release_probe());
    }

    fn resolve(self, update: impl FnOnce(&mut KeyHealth)) {
        self.resolved.store(true, Ordering::Release);
        if !self.probe {
            self.key.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
        let mut health = self.key.health.lock().expect("key lock poisoned");
        update(&mut health);
        // self drops here; Drop sees resolved == true and does nothing.
    }
}

impl Drop for KeyLease {
    fn drop(&mut self) {
        if self.resolved.load(Ordering::Acquire) {
            return;
        }
        if self.probe {
            if let Ok(mut health) = self.key.health.lock() {
                health.breaker.release_probe();
            }
        } else {
            self.key.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cooldown::PoolCooldownConfig;

    fn pool_with(n: usize, config: KeyPoolConfig) -> KeyPool {
        let creds = (0..n).map(|i| (format!("sk-test-{i}"), None)).collect();
        KeyPool::new(creds, config, Arc::new(PoolCooldown::new(PoolCooldownConfig::default())))
    }

    fn pool(n: usize) -> KeyPool {
        pool_with(n, KeyPoolConfig::default())
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    #[test]
    fn acquire_prefers_least_loaded_key() {
        let pool = pool(2);
        let (first, _) = pool.acquire(None, false).unwrap();
        // first key now has 1 in flight; next acquire should take the other.
        let (second, reason) = pool.acquire(None, false).unwrap();
        assert_ne!(first.key().index(), second.key().index());
        assert!(matches!(reason, SelectionReason::LeastLoaded | SelectionReason::RoundRobin));
    }

    #[test]
    fn in_flight_returns_to_zero_after_completion() {
        let pool = pool(1);
        let (lease, _) = pool.acquire(None, false).unwrap();
        assert_eq!(pool.keys()[0].in_flight(), 1);
        lease.complete_success(Duration::from_millis(12));
        assert_eq!(pool.keys()[0].in_flight(), 0);
    }

    #[test]
    fn dropped_lease_releases_in_flight() {
        let pool = pool(1);
        let (lease, _) = pool.acquire(None, false).unwrap();
        drop(lease);
        assert_eq!(pool.keys()[0].in_flight(), 0);
    }

    #[test]
    fn concurrency_cap_exhausts_the_pool() {
        let pool = pool_with(1, KeyPoolConfig { max_concurrency_per_key: 2, ..Default::default() });
        let (_a, _) = pool.acquire(None, false).unwrap();
        let (_b, _) = pool.acquire(None, false).unwrap();
        match pool.acquire(None, false) {
            Err(AcquireError::PoolExhausted) => {}
            other => panic!("expected pool_exhausted, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn provider_tag_filters_keys() {
        let cooldown = Arc::new(PoolCooldown::new(PoolCooldownConfig::default()));
        let pool = KeyPool::new(
            vec![
                ("sk-a".into(), Some("anthropic".into())),
                ("sk-o".into(), Some("openai".into())),
            ],
            KeyPoolConfig::default(),
            cooldown,
        );
        let (lease, reason) = pool.acquire(Some("openai"), false).unwrap();
        assert_eq!(lease.key().provider(), Some("openai"));
        assert_eq!(reason, SelectionReason::ProviderMatch);

        match pool.acquire(Some("mistral"), false) {
            Err(AcquireError::NoKeysForProvider) => {}
            other => panic!("expected no_keys, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn untagged_keys_serve_any_provider() {
        let pool = pool(1);
        assert!(pool.acquire(Some("anthropic"), false).is_ok());
    }

    // -----------------------------------------------------------------------
    // Circuit interaction
    // -----------------------------------------------------------------------

    #[test]
    fn open_circuit_key_is_never_selected() {
        let config = KeyPoolConfig {
            breaker: BreakerConfig {
                failure_threshold: 1,
                cooldown: Duration::from_secs(60),
                ..BreakerConfig::default()
            },
            ..Default::default()
        };
        let pool = pool_with(2, config);

        // Trip key 0.
        let (lease, _) = pool.acquire(None, false).unwrap();
        let tripped = lease.key().index();
        lease.complete_failure(ErrorKind::ServerError);

        for _ in 0..4 {
            let (lease, _) = pool.acquire(None, false).unwrap();
            assert_ne!(lease.key().index(), tripped, "open key must be skipped");
            lease.complete_success(Duration::from_millis(5));
        }
    }

    #[test]
    fn half_open_key_grants_a_single_probe() {
        let config = KeyPoolConfig {
            breaker: BreakerConfig {
                failure_threshold: 1,
                cooldown: Duration::from_millis(10),
                ..BreakerConfig::default()
            },
            ..Default::default()
        };
        let pool = pool_with(1, config);

        let (lease, _) = pool.acquire(None, false).unwrap();
        lease.complete_failure(ErrorKind::ServerError);
        std::thread::sleep(Duration::from_millis(15));

        let (probe, reason) = pool.acquire(None, false).unwrap();
        assert!(probe.is_probe());
        assert_eq!(reason, SelectionReason::HalfOpenProbe);
        // Second caller cannot get a probe while one is out.
        assert!(matches!(pool.acquire(None, false), Err(AcquireError::PoolExhausted)));

        probe.complete_success(Duration::from_millis(5));
        assert_eq!(pool.keys()[0].circuit_state(), CircuitState::Closed);
    }

    // -----------------------------------------------------------------------
    // 429 handling
    // -----------------------------------------------------------------------

    #[test]
    fn rate_limited_key_cools_down() {
        let config = KeyPoolConfig {
            rate_limit_cooldown: Duration::from_millis(30),
            ..Default::default()
        };
        let pool = pool_with(1, config);

        let (lease, _) = pool.acquire(None, false).unwrap();
        lease.complete_failure(ErrorKind::RateLimited);
        assert!(matches!(pool.acquire(None, false), Err(AcquireError::PoolExhausted)));

        std::thread::sleep(Duration::from_millis(35));
        assert!(pool.acquire(None, false).is_ok(), "cooldown expired");
    }

    #[test]
    fn rate_limit_does_not_trip_the_breaker() {
        let config = KeyPoolConfig {
            breaker: BreakerConfig { failure_threshold: 2, ..BreakerConfig::default() },
            rate_limit_cooldown: Duration::from_millis(1),
            ..Default::default()
        };
        // High burst threshold keeps the pool-wide coordinator out of the way.
        let pool = KeyPool::new(
            vec![("sk-test-0".into(), None)],
            config,
            Arc::new(PoolCooldown::new(PoolCooldownConfig {
                burst_threshold: 100,
                ..PoolCooldownConfig::default()
            })),
        );
        for _ in 0..5 {
            std::thread::sleep(Duration::from_millis(2));
            let (lease, _) = pool.acquire(None, false).unwrap();
            lease.complete_failure(ErrorKind::RateLimited);
        }
        assert_eq!(pool.keys()[0].circuit_state(), CircuitState::Closed);
    }

    #[test]
    fn pool_cooldown_blocks_all_acquisition() {
        let cooldown = Arc::new(PoolCooldown::new(PoolCooldownConfig {
            base: Duration::from_millis(100),
            burst_threshold: 1,
            ..PoolCooldownConfig::default()
        }));
        let pool = KeyPool::new(
            vec![("sk-a".into(), None), ("sk-b".into(), None)],
            KeyPoolConfig::default(),
            Arc::clone(&cooldown),
        );

        cooldown.record_rate_limited();
        match pool.acquire(None, false) {
            Err(AcquireError::PoolCooldown(wait)) => assert!(wait > Duration::ZERO),
            other => panic!("expected pool_cooldown, got {:?}", other.map(|_| ())),
        }
    }

    // -----------------------------------------------------------------------
    // Fairness & snapshots
    // -----------------------------------------------------------------------

    #[test]
    fn selection_counters_stay_roughly_even() {
        let pool = pool(3);
        for _ in 0..60 {
            let (lease, _) = pool.acquire(None, false).unwrap();
            lease.complete_success(Duration::from_millis(1));
        }
        let counts: Vec<u64> =
            pool.keys().iter().map(|k| k.selections.load(Ordering::Relaxed)).collect();
        let max = *counts.iter().max().unwrap();
        let min = *counts.iter().min().unwrap();
        assert!(max - min <= 30, "selection spread too wide: {counts:?}");
    }

    #[test]
    fn snapshot_reflects_key_state() {
        let pool = pool(2);
        let (lease, _) = pool.acquire(None, false).unwrap();
        let snapshots = pool.snapshot();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots.iter().map(|s| s.in_flight).sum::<u32>(), 1);
        assert!(snapshots.iter().all(|s| s.circuit == "closed"));
        assert!(!snapshots[0].fingerprint.is_empty());
        lease.complete_success(Duration::from_millis(1));
    }

    #[test]
    fn fingerprint_is_stable_and_redacted() {
        assert_eq!(fingerprint("sk-secret"), fingerprint("sk-secret"));
        assert_ne!(fingerprint("sk-secret"), fingerprint("sk-other"));
        assert!(!fingerprint("sk-secret").contains("secret"));
        assert_eq!(fingerprint("sk-secret").len(), 12);
    }
}
