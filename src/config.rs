//! Configuration types for keymux.
//!
//! Config is loaded once at startup from a JSON file and validated before
//! the server opens any ports. Invalid configs are rejected with a clear
//! error rather than silently falling back to defaults. Unknown top-level
//! fields are logged as warnings but never rejected, so configs written for
//! newer versions keep working.
//!
//! Knob names are camelCase on disk. Any persisted rewrite goes through
//! [`Config::save_atomic`] (write-to-temp plus rename) so a crash can never
//! leave a half-written file.
//!
//! # Example
//! ```json
//! {
//!   "port": 8080,
//!   "targetHost": "https://api.anthropic.com",
//!   "apiKeys": ["sk-ant-xxx", { "key": "sk-ant-yyy", "provider": "anthropic" }],
//!   "modelRouting": {
//!     "enabled": true,
//!     "tiers": [
//!       { "name": "light", "strategy": "throughput",
//!         "models": [{ "name": "claude-haiku-4-5", "maxConcurrency": 8 }] }
//!     ],
//!     "rules": [
//!       { "match": { "hasTools": true }, "tier": "heavy" },
//!       { "match": {}, "tier": "light" }
//!     ]
//!   }
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::breaker::BreakerConfig;
use crate::cooldown::PoolCooldownConfig;
use crate::keypool::KeyPoolConfig;

/// One pool credential, optionally tagged with the provider it belongs to.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ApiKeyEntry {
    /// Bare credential string — serves any provider.
    Plain(String),
    /// Credential with a provider tag.
    Tagged {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
    },
}

impl ApiKeyEntry {
    pub fn credential(&self) -> &str {
        match self {
            Self::Plain(key) => key,
            Self::Tagged { key, .. } => key,
        }
    }

    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::Plain(_) => None,
            Self::Tagged { provider, .. } => provider.as_deref(),
        }
    }
}

/// Top-level proxy configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Listen port (default: 8080).
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Listen address (default: 0.0.0.0).
    #[serde(default = "defaults::host")]
    pub host: String,

    /// Upstream origin, scheme included, no trailing slash.
    #[serde(default = "defaults::target_host")]
    pub target_host: String,

    /// Prefix prepended to every forwarded path (default: empty).
    #[serde(default)]
    pub target_base_path: String,

    /// Pool credentials.
    #[serde(default)]
    pub api_keys: Vec<ApiKeyEntry>,

    /// Maximum buffered request body in bytes (default: 1 MiB).
    /// Larger bodies are rejected with 413 before any key is touched.
    #[serde(default = "defaults::max_body_size")]
    pub max_body_size: usize,

    /// Overall per-request deadline in milliseconds (default: 120 000).
    #[serde(default = "defaults::request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Keep-alive idle timeout for upstream connections (default: 60 000).
    #[serde(default = "defaults::keep_alive_timeout_ms")]
    pub keep_alive_timeout_ms: u64,

    /// Drain budget on graceful shutdown (default: 30 000).
    #[serde(default = "defaults::shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Per-key concurrent-request cap (default: 8).
    #[serde(default = "defaults::max_concurrency_per_key")]
    pub max_concurrency_per_key: u32,

    /// Proxy-wide concurrent-request cap before queueing (default: 64).
    #[serde(default = "defaults::max_in_flight")]
    pub max_in_flight: usize,

    /// Backpressure queue capacity (default: 100).
    #[serde(default = "defaults::queue_max_size")]
    pub queue_max_size: usize,

    /// How long a request may wait in the queue, ms (default: 10 000).
    #[serde(default = "defaults::queue_timeout_ms")]
    pub queue_timeout_ms: u64,

    /// Additional attempts after the first failure (default: 2).
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// Per-key token bucket: sustained requests per minute (default: 60).
    #[serde(default = "defaults::rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,

    /// Per-key token bucket burst capacity (default: 30).
    #[serde(default = "defaults::rate_limit_burst")]
    pub rate_limit_burst: u32,

    /// Trace ring capacity (default: 1000).
    #[serde(default = "defaults::trace_capacity")]
    pub trace_capacity: usize,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerKnobs,

    #[serde(default)]
    pub pool_cooldown: PoolCooldownKnobs,

    #[serde(default)]
    pub adaptive_concurrency: AdaptiveKnobs,

    #[serde(default)]
    pub adaptive_timeout: AdaptiveTimeoutKnobs,

    #[serde(default)]
    pub model_routing: RoutingConfig,

    /// Fields this version does not understand. Warned about, kept on save.
    #[serde(flatten)]
    pub unknown: HashMap<String, serde_json::Value>,
}

impl Default for Config {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config object always parses")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerKnobs {
    #[serde(default = "defaults::failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "defaults::breaker_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "defaults::breaker_max_cooldown_ms")]
    pub max_cooldown_ms: u64,
    #[serde(default = "defaults::slow_latency_ms")]
    pub slow_latency_ms: u64,
    #[serde(default = "defaults::slow_sample_run")]
    pub slow_sample_run: u32,
    #[serde(default = "defaults::min_samples")]
    pub min_samples: usize,
}

impl Default for CircuitBreakerKnobs {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolCooldownKnobs {
    #[serde(default = "defaults::pool_base_ms")]
    pub base_ms: u64,
    #[serde(default = "defaults::pool_cap_ms")]
    pub cap_ms: u64,
    #[serde(default = "defaults::pool_decay_ms")]
    pub decay_ms: u64,
    #[serde(default = "defaults::retry_jitter_ms")]
    pub retry_jitter_ms: u64,
    /// Sliding window within which 429s count toward one storm.
    #[serde(default = "defaults::sleep_threshold_ms")]
    pub sleep_threshold_ms: u64,
}

impl Default for PoolCooldownKnobs {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdaptiveMode {
    /// Log proposed cap changes without applying them.
    #[default]
    ObserveOnly,
    /// Apply cap changes.
    Enforce,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveKnobs {
    #[serde(default = "defaults::enabled_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: AdaptiveMode,
    #[serde(default = "defaults::min_concurrency")]
    pub min_concurrency: u32,
    #[serde(default = "defaults::hard_max")]
    pub hard_max: u32,
    #[serde(default = "defaults::multiplicative_decrease")]
    pub multiplicative_decrease: f64,
    #[serde(default = "defaults::additive_increase")]
    pub additive_increase: u32,
    #[serde(default = "defaults::sample_window_ms")]
    pub sample_window_ms: u64,
}

impl Default for AdaptiveKnobs {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

/// Per-attempt upstream timeout, growing with the attempt index.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveTimeoutKnobs {
    #[serde(default = "defaults::initial_timeout_ms")]
    pub initial_ms: u64,
    #[serde(default = "defaults::timeout_multiplier")]
    pub multiplier: f64,
    #[serde(default = "defaults::max_timeout_ms")]
    pub max_ms: u64,
}

impl Default for AdaptiveTimeoutKnobs {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

// ---------------------------------------------------------------------------
// Model routing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TierName {
    Light,
    Medium,
    Heavy,
}

impl TierName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Medium => "medium",
            Self::Heavy => "heavy",
        }
    }

    /// Downgrade ladder: heavy → medium → light.
    pub fn downgrade(self) -> Option<Self> {
        match self {
            Self::Heavy => Some(Self::Medium),
            Self::Medium => Some(Self::Light),
            Self::Light => None,
        }
    }
}

impl std::fmt::Display for TierName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TierStrategy {
    /// Least relative load first.
    #[default]
    Throughput,
    /// Round-robin over available models.
    Balanced,
    /// Strict priority order.
    Quality,
    /// Same pick as `throughput`, with pool-utilization events recorded.
    Pool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientModelPolicy {
    /// Tier selection always applies.
    #[default]
    AlwaysRoute,
    /// Tier selection applies only when a non-catch-all rule matched.
    RuleMatchOnly,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelEntry {
    pub name: String,
    /// Static per-account concurrency cap for this model.
    #[serde(default = "defaults::model_max_concurrency")]
    pub max_concurrency: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierConfig {
    pub name: TierName,
    #[serde(default)]
    pub strategy: TierStrategy,
    #[serde(default)]
    pub client_model_policy: ClientModelPolicy,
    pub models: Vec<ModelEntry>,
}

/// Matcher half of a routing rule. All set fields must match.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleMatch {
    /// Model glob; a trailing `*` matches any suffix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_tools: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_vision: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens_gte: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_count_gte: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_length_gte: Option<usize>,
}

impl RuleMatch {
    /// A rule with no constraints matches everything.
    pub fn is_catch_all(&self) -> bool {
        self.model.is_none()
            && self.has_tools.is_none()
            && self.has_vision.is_none()
            && self.max_tokens_gte.is_none()
            && self.message_count_gte.is_none()
            && self.system_length_gte.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    #[serde(rename = "match")]
    pub matcher: RuleMatch,
    pub tier: TierName,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplexityUpgrade {
    #[serde(default)]
    pub enabled: bool,
    /// Model families the upgrade may apply to; empty means all.
    #[serde(default)]
    pub allowed_families: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens_gte: Option<u64>,
    #[serde(default)]
    pub has_tools: bool,
    #[serde(default)]
    pub has_vision: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_count_gte: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_length_gte: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverKnobs {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "defaults::max_model_switches")]
    pub max_model_switches_per_request: u32,
    /// Tier downgrade is suppressed for this long after startup.
    #[serde(default = "defaults::cold_start_ms")]
    pub cold_start_ms: u64,
}

impl Default for FailoverKnobs {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCooldownKnobs {
    #[serde(default = "defaults::model_cooldown_base_ms")]
    pub base_ms: u64,
    #[serde(default = "defaults::model_cooldown_cap_ms")]
    pub cap_ms: u64,
    #[serde(default = "defaults::model_cooldown_decay_ms")]
    pub decay_ms: u64,
}

impl Default for ModelCooldownKnobs {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Config-schema version; gates the normalizer.
    #[serde(default = "defaults::routing_version")]
    pub version: u32,
    #[serde(default)]
    pub tiers: Vec<TierConfig>,
    #[serde(default)]
    pub rules: Vec<RoutingRule>,
    #[serde(default)]
    pub complexity_upgrade: ComplexityUpgrade,
    #[serde(default)]
    pub failover: FailoverKnobs,
    #[serde(default)]
    pub cooldown: ModelCooldownKnobs,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

impl RoutingConfig {
    /// Normalize into canonical form. Idempotent:
    /// `normalize(normalize(c)) == normalize(c)`.
    ///
    /// - model names trimmed, duplicates within a tier dropped (first wins)
    /// - per-model caps clamped to at least 1
    /// - rules after the first catch-all dropped (unreachable)
    ///
    /// Only schema version 1 is understood; newer versions pass through
    /// untouched with a warning.
    pub fn normalize(&self) -> Self {
        if self.version != 1 {
            tracing::warn!(version = self.version, "unknown routing config version, skipping normalization");
            return self.clone();
        }
        let mut out = self.clone();
        for tier in &mut out.tiers {
            let mut seen = std::collections::HashSet::new();
            tier.models = tier
                .models
                .iter()
                .map(|m| ModelEntry {
                    name: m.name.trim().to_string(),
                    max_concurrency: m.max_concurrency.max(1),
                })
                .filter(|m| !m.name.is_empty() && seen.insert(m.name.clone()))
                .collect();
        }
        if let Some(catch_all) = out.rules.iter().position(|r| r.matcher.is_catch_all()) {
            out.rules.truncate(catch_all + 1);
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Load / validate / save
// ---------------------------------------------------------------------------

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let mut config: Self =
            serde_json::from_str(&content).context("parsing config JSON")?;
        config.warn_unknown_fields();
        config.model_routing = config.model_routing.normalize();
        config.validate()?;
        Ok(config)
    }

    fn warn_unknown_fields(&self) {
        for field in self.unknown.keys() {
            tracing::warn!(field, "unknown config field ignored");
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.target_host.is_empty(), "targetHost must not be empty");
        anyhow::ensure!(self.max_body_size > 0, "maxBodySize must be positive");
        anyhow::ensure!(self.max_in_flight > 0, "maxInFlight must be positive");
        anyhow::ensure!(
            self.adaptive_concurrency.multiplicative_decrease > 0.0
                && self.adaptive_concurrency.multiplicative_decrease < 1.0,
            "adaptiveConcurrency.multiplicativeDecrease must be in (0, 1)"
        );
        anyhow::ensure!(
            self.adaptive_concurrency.min_concurrency >= 1,
            "adaptiveConcurrency.minConcurrency must be at least 1"
        );

        if self.model_routing.enabled {
            anyhow::ensure!(
                !self.model_routing.tiers.is_empty(),
                "modelRouting.enabled requires at least one tier"
            );
            let mut names = std::collections::HashSet::new();
            for tier in &self.model_routing.tiers {
                anyhow::ensure!(
                    names.insert(tier.name),
                    "duplicate tier `{}` in modelRouting.tiers",
                    tier.name
                );
                anyhow::ensure!(
                    !tier.models.is_empty(),
                    "tier `{}` has no models",
                    tier.name
                );
            }
            for rule in &self.model_routing.rules {
                anyhow::ensure!(
                    names.contains(&rule.tier),
                    "rule references tier `{}` which has no tier config",
                    rule.tier
                );
            }
            anyhow::ensure!(
                self.model_routing.rules.iter().any(|r| r.matcher.is_catch_all()),
                "modelRouting.rules requires a catch-all rule (empty match)"
            );
        }

        Ok(())
    }

    /// Persist atomically: write a sibling temp file, then rename over the
    /// target. Readers never observe a torn file.
    pub fn save_atomic(&self, path: &Path) -> anyhow::Result<()> {
        let serialized = serde_json::to_string_pretty(self).context("serializing config")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serialized)
            .with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("renaming {} -> {}", tmp.display(), path.display()))?;
        Ok(())
    }

    // -- typed views over the millisecond knobs --

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.circuit_breaker.failure_threshold,
            cooldown: Duration::from_millis(self.circuit_breaker.cooldown_ms),
            max_cooldown: Duration::from_millis(self.circuit_breaker.max_cooldown_ms),
            slow_latency_ms: self.circuit_breaker.slow_latency_ms,
            slow_sample_run: self.circuit_breaker.slow_sample_run,
            min_samples: self.circuit_breaker.min_samples,
            sample_capacity: 128,
        }
    }

    pub fn pool_cooldown_config(&self) -> PoolCooldownConfig {
        PoolCooldownConfig {
            base: Duration::from_millis(self.pool_cooldown.base_ms),
            cap: Duration::from_millis(self.pool_cooldown.cap_ms),
            decay: Duration::from_millis(self.pool_cooldown.decay_ms),
            retry_jitter: Duration::from_millis(self.pool_cooldown.retry_jitter_ms),
            window: Duration::from_millis(self.pool_cooldown.sleep_threshold_ms),
            burst_threshold: defaults::POOL_BURST_THRESHOLD,
        }
    }

    pub fn keypool_config(&self) -> KeyPoolConfig {
        KeyPoolConfig {
            max_concurrency_per_key: self.max_concurrency_per_key,
            rate_limit_per_minute: self.rate_limit_per_minute,
            rate_limit_burst: self.rate_limit_burst,
            breaker: self.breaker_config(),
            rate_limit_cooldown: Duration::from_millis(self.pool_cooldown.base_ms),
        }
    }
}

mod defaults {
    pub const POOL_BURST_THRESHOLD: u32 = 3;

    pub fn port() -> u16 { 8080 }
    pub fn host() -> String { "0.0.0.0".into() }
    pub fn target_host() -> String { "https://api.anthropic.com".into() }
    pub fn max_body_size() -> usize { 1024 * 1024 }
    pub fn request_timeout_ms() -> u64 { 120_000 }
    pub fn keep_alive_timeout_ms() -> u64 { 60_000 }
    pub fn shutdown_timeout_ms() -> u64 { 30_000 }
    pub fn max_concurrency_per_key() -> u32 { 8 }
    pub fn max_in_flight() -> usize { 64 }
    pub fn queue_max_size() -> usize { 100 }
    pub fn queue_timeout_ms() -> u64 { 10_000 }
    pub fn max_retries() -> u32 { 2 }
    pub fn rate_limit_per_minute() -> u32 { 60 }
    pub fn rate_limit_burst() -> u32 { 30 }
    pub fn trace_capacity() -> usize { 1_000 }
    pub fn failure_threshold() -> u32 { 5 }
    pub fn breaker_cooldown_ms() -> u64 { 30_000 }
    pub fn breaker_max_cooldown_ms() -> u64 { 300_000 }
    pub fn slow_latency_ms() -> u64 { 30_000 }
    pub fn slow_sample_run() -> u32 { 8 }
    pub fn min_samples() -> usize { 20 }
    pub fn pool_base_ms() -> u64 { 2_000 }
    pub fn pool_cap_ms() -> u64 { 60_000 }
    pub fn pool_decay_ms() -> u64 { 30_000 }
    pub fn retry_jitter_ms() -> u64 { 500 }
    pub fn sleep_threshold_ms() -> u64 { 1_000 }
    pub fn enabled_true() -> bool { true }
    pub fn min_concurrency() -> u32 { 1 }
    pub fn hard_max() -> u32 { 32 }
    pub fn multiplicative_decrease() -> f64 { 0.7 }
    pub fn additive_increase() -> u32 { 1 }
    pub fn sample_window_ms() -> u64 { 5_000 }
    pub fn initial_timeout_ms() -> u64 { 30_000 }
    pub fn timeout_multiplier() -> f64 { 2.0 }
    pub fn max_timeout_ms() -> u64 { 120_000 }
    pub fn model_max_concurrency() -> u32 { 4 }
    pub fn max_model_switches() -> u32 { 1 }
    pub fn cold_start_ms() -> u64 { 60_000 }
    pub fn model_cooldown_base_ms() -> u64 { 1_000 }
    pub fn model_cooldown_cap_ms() -> u64 { 30_000 }
    pub fn model_cooldown_decay_ms() -> u64 { 10_000 }
    pub fn routing_version() -> u32 { 1 }
}
