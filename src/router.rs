//! Model routing — classify each request into a tier, then pick a model.
//!
//! The pipeline per request:
//!
//! 1. **Feature extraction** from the parsed JSON body (model, max_tokens,
//!    tools, vision, message count, system length).
//! 2. **Classification**: walk the configured rules in order; the first
//!    rule whose set fields all match wins. A catch-all rule is mandatory,
//!    so classification always lands on a tier.
//! 3. **Complexity upgrade** (optional): requests over the configured
//!    thresholds are bumped to `heavy`, with the reason recorded.
//! 4. **Model selection** within the tier by the tier's strategy, skipping
//!    models that are cooling down or at capacity.
//! 5. **Reservation**: the winning model's in-flight counter is taken
//!    atomically with the selection and released through [`ModelLease`].
//!
//! When a tier is saturated the router downgrades heavy → medium → light,
//! provided failover is enabled and the cold-start window has passed.
//!
//! Per-model 429s apply an exponential cooldown with decay; a burst of
//! 429s additionally halves the model's usable capacity until the burst
//! window clears.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::config::{
    ClientModelPolicy, ModelCooldownKnobs, RoutingConfig, RuleMatch, TierName, TierStrategy,
};

/// 429s within [`BURST_WINDOW`] that activate burst dampening.
const BURST_429_COUNT: usize = 5;
const BURST_WINDOW: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Feature extraction
// ---------------------------------------------------------------------------

/// Routing-relevant shape of a request body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestFeatures {
    pub model: Option<String>,
    pub max_tokens: Option<u64>,
    pub has_tools: bool,
    pub has_vision: bool,
    pub message_count: usize,
    pub system_length: usize,
}

impl RequestFeatures {
    /// Pull features out of a chat-completion style body.
    ///
    /// Understands both the Anthropic shape (top-level `system`, image
    /// content blocks) and the OpenAI shape (`system` role messages,
    /// `image_url` blocks).
    pub fn extract(body: &Value) -> Self {
        let model = body.get("model").and_then(Value::as_str).map(str::to_owned);
        let max_tokens = body.get("max_tokens").and_then(Value::as_u64);
        let has_tools = body
            .get("tools")
            .and_then(Value::as_array)
            .is_some_and(|tools| !tools.is_empty());

        let messages = body.get("messages").and_then(Value::as_array);
        let message_count = messages.map(Vec::len).unwrap_or(0);

        let mut system_length = body
            .get("system")
            .and_then(Value::as_str)
            .map(str::len)
            .unwrap_or(0);
        let mut has_vision = false;

        if let Some(messages) = messages {
            for message in messages {
                if message.get("role").and_then(Value::as_str) == Some("system") {
                    if let Some(content) = message.get("content").and_then(Value::as_str) {
                        system_length += content.len();
                    }
                }
                if let Some(blocks) = message.get("content").and_then(Value::as_array) {
                    for block in blocks {
                        match block.get("type").and_then(Value::as_str) {
                            Some("image") | Some("image_url") => has_vision = true,
                            _ => {}
                        }
                    }
                }
            }
        }

        Self { model, max_tokens, has_tools, has_vision, message_count, system_length }
    }
}

/// `claude-opus-4-1` → `claude-opus`. Family is the first two dash
/// segments; single-segment names are their own family.
pub fn model_family(model: &str) -> String {
    let mut parts = model.splitn(3, '-');
    match (parts.next(), parts.next()) {
        (Some(a), Some(b)) => format!("{a}-{b}"),
        (Some(a), None) => a.to_string(),
        _ => model.to_string(),
    }
}

fn glob_matches(pattern: &str, value: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => pattern == value,
    }
}

impl RuleMatch {
    /// All set fields must hold; unset fields match anything.
    pub fn matches(&self, features: &RequestFeatures) -> bool {
        if let Some(pattern) = &self.model {
            match &features.model {
                Some(model) if glob_matches(pattern, model) => {}
                _ => return false,
            }
        }
        if let Some(want) = self.has_tools {
            if features.has_tools != want {
                return false;
            }
        }
        if let Some(want) = self.has_vision {
            if features.has_vision != want {
                return false;
            }
        }
        if let Some(min) = self.max_tokens_gte {
            if features.max_tokens.unwrap_or(0) < min {
                return false;
            }
        }
        if let Some(min) = self.message_count_gte {
            if features.message_count < min {
                return false;
            }
        }
        if let Some(min) = self.system_length_gte {
            if features.system_length < min {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Model state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ModelHealth {
    cooldown_until: Option<Instant>,
    consec_429: u32,
    last_429: Option<Instant>,
    /// Recent 429 instants inside the burst window.
    burst: std::collections::VecDeque<Instant>,
    burst_dampened_until: Option<Instant>,
    /// Counters since the last AIMD tick.
    window_429: u32,
    window_success: u32,
}

/// Runtime state for one routable model.
pub struct ModelState {
    name: String,
    tier: TierName,
    /// Static per-account cap from the catalog.
    max_concurrency: u32,
    in_flight: AtomicU32,
    /// AIMD-managed cap, `<= max(hard caps)`. Selection uses this.
    effective_max: AtomicU32,
    health: Mutex<ModelHealth>,
}

impl ModelState {
    fn new(name: String, tier: TierName, max_concurrency: u32) -> Self {
        Self {
            name,
            tier,
            max_concurrency,
            in_flight: AtomicU32::new(0),
            effective_max: AtomicU32::new(max_concurrency),
            health: Mutex::new(ModelHealth::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tier(&self) -> TierName {
        self.tier
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn max_concurrency(&self) -> u32 {
        self.max_concurrency
    }

    pub fn effective_max(&self) -> u32 {
        self.effective_max.load(Ordering::Relaxed)
    }

    /// AIMD hook. Clamped to at least 1.
    pub fn set_effective_max(&self, value: u32) {
        self.effective_max.store(value.max(1), Ordering::Relaxed);
    }

    /// Usable cap right now — halved while burst-dampened.
    pub fn capacity(&self) -> u32 {
        let base = self.effective_max();
        let dampened = self
            .health
            .lock()
            .expect("model lock poisoned")
            .burst_dampened_until
            .is_some_and(|until| until > Instant::now());
        if dampened {
            (base / 2).max(1)
        } else {
            base
        }
    }

    pub fn cooling(&self) -> bool {
        self.health
            .lock()
            .expect("model lock poisoned")
            .cooldown_until
            .is_some_and(|until| until > Instant::now())
    }

    fn available(&self) -> bool {
        !self.cooling() && self.in_flight() < self.capacity()
    }

    /// Load ratio used by the `throughput`/`pool` strategies.
    fn utilization(&self) -> f64 {
        self.in_flight() as f64 / self.capacity().max(1) as f64
    }

    /// Atomically claim one slot. Rolls back on a lost race.
    fn try_reserve(&self) -> bool {
        if self.cooling() {
            return false;
        }
        let cap = self.capacity();
        let prev = self.in_flight.fetch_add(1, Ordering::AcqRel);
        if prev >= cap {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn record_success(&self) {
        let mut health = self.health.lock().expect("model lock poisoned");
        health.window_success += 1;
    }

    /// Apply the 429 cooldown ladder: `min(base * 2^consec, cap)`, where
    /// `consec` halves for every full `decay` elapsed without a 429.
    pub fn record_rate_limited(&self, knobs: &ModelCooldownKnobs) {
        let now = Instant::now();
        let mut health = self.health.lock().expect("model lock poisoned");

        if let Some(last) = health.last_429 {
            let decay = Duration::from_millis(knobs.decay_ms.max(1));
            let mut quiet = now.duration_since(last);
            while quiet >= decay && health.consec_429 > 0 {
                health.consec_429 /= 2;
                quiet -= decay;
            }
        }
        health.consec_429 = health.consec_429.saturating_add(1);
        health.last_429 = Some(now);
        health.window_429 += 1;

        let exp = (health.consec_429 - 1).min(10);
        let cooldown = Duration::from_millis(knobs.base_ms)
            .saturating_mul(1u32 << exp)
            .min(Duration::from_millis(knobs.cap_ms));
        health.cooldown_until = Some(now + cooldown);

        // Burst dampening: too many 429s in a short window halves capacity.
        health.burst.push_back(now);
        while let Some(front) = health.burst.front() {
            if now.duration_since(*front) > BURST_WINDOW {
                health.burst.pop_front();
            } else {
                break;
            }
        }
        if health.burst.len() >= BURST_429_COUNT {
            health.burst_dampened_until = Some(now + BURST_WINDOW);
            tracing::warn!(model = %self.name, "burst dampening active");
        }

        tracing::info!(
            model = %self.name,
            consec = health.consec_429,
            cooldown_ms = cooldown.as_millis() as u64,
            "model cooling after 429"
        );
    }

    /// Drain the per-window counters for the AIMD tick.
    pub fn take_window_counts(&self) -> (u32, u32) {
        let mut health = self.health.lock().expect("model lock poisoned");
        let counts = (health.window_429, health.window_success);
        health.window_429 = 0;
        health.window_success = 0;
        counts
    }
}

/// RAII slot reservation on one model. Dropping releases the slot.
pub struct ModelLease {
    state: Arc<ModelState>,
}

impl ModelLease {
    pub fn model(&self) -> &Arc<ModelState> {
        &self.state
    }

    pub fn model_name(&self) -> &str {
        self.state.name()
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        self.state.release();
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Why a request was upgraded to the heavy tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeReason {
    HasTools,
    HasVision,
    MaxTokens,
    MessageCount,
    SystemLength,
}

impl UpgradeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HasTools => "has_tools",
            Self::HasVision => "has_vision",
            Self::MaxTokens => "max_tokens",
            Self::MessageCount => "message_count",
            Self::SystemLength => "system_length",
        }
    }
}

/// A routed selection: the reserved model plus decision metadata.
pub struct RouteDecision {
    pub lease: ModelLease,
    pub tier: TierName,
    pub strategy: TierStrategy,
    pub upgraded: Option<UpgradeReason>,
    /// Set when the original tier was saturated and a lower one served.
    pub downgraded: bool,
}

/// Router verdict for one request.
pub enum RouteOutcome {
    Routed(RouteDecision),
    /// Routing does not apply (policy opt-out or no parseable body);
    /// forward the request untouched.
    Passthrough,
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// Every candidate model in the tier (and any downgrade tier) is at
    /// capacity or cooling.
    #[error("tier {0} saturated")]
    TierSaturated(TierName),
}

struct TierRuntime {
    strategy: TierStrategy,
    policy: ClientModelPolicy,
    models: Vec<Arc<ModelState>>,
    rr: AtomicUsize,
}

/// Tier classifier and model picker. One per process.
pub struct ModelRouter {
    config: RoutingConfig,
    tiers: HashMap<TierName, TierRuntime>,
    /// All models, catalog order, for AIMD sweeps and listings.
    models: Vec<Arc<ModelState>>,
    started_at: Instant,
}

impl ModelRouter {
    pub fn new(config: RoutingConfig) -> Self {
        let config = config.normalize();
        let mut tiers = HashMap::new();
        let mut models = Vec::new();

        for tier in &config.tiers {
            let states: Vec<Arc<ModelState>> = tier
                .models
                .iter()
                .map(|m| Arc::new(ModelState::new(m.name.clone(), tier.name, m.max_concurrency)))
                .collect();
            models.extend(states.iter().cloned());
            tiers.insert(
                tier.name,
                TierRuntime {
                    strategy: tier.strategy,
                    policy: tier.client_model_policy,
                    models: states,
                    rr: AtomicUsize::new(0),
                },
            );
        }

        Self { config, tiers, models, started_at: Instant::now() }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn models(&self) -> &[Arc<ModelState>] {
        &self.models
    }

    pub fn cooldown_knobs(&self) -> &ModelCooldownKnobs {
        &self.config.cooldown
    }

    pub fn failover_enabled(&self) -> bool {
        self.config.failover.enabled
    }

    pub fn max_model_switches(&self) -> u32 {
        self.config.failover.max_model_switches_per_request
    }

    /// Classify and reserve. `excluded` lists models already tried in this
    /// request (retry-time reselection).
    pub fn route(
        &self,
        features: &RequestFeatures,
        excluded: &[String],
    ) -> Result<RouteOutcome, RouteError> {
        if !self.config.enabled {
            return Ok(RouteOutcome::Passthrough);
        }

        let (mut tier, via_catch_all) = match self.classify(features) {
            Some(hit) => hit,
            None => return Ok(RouteOutcome::Passthrough),
        };

        // Client-model policy: rule-match-only tiers only take requests
        // that matched a real (non-catch-all) rule.
        if via_catch_all {
            let policy = self.tiers.get(&tier).map(|t| t.policy).unwrap_or_default();
            if policy == ClientModelPolicy::RuleMatchOnly {
                return Ok(RouteOutcome::Passthrough);
            }
        }

        let upgraded = self.complexity_upgrade(features, tier);
        if upgraded.is_some() {
            tier = TierName::Heavy;
        }

        match self.reserve_in_tier(tier, excluded) {
            Some(lease) => Ok(RouteOutcome::Routed(RouteDecision {
                lease,
                tier,
                strategy: self.tier_strategy(tier),
                upgraded,
                downgraded: false,
            })),
            None => self.downgrade(tier, upgraded, excluded),
        }
    }

    fn tier_strategy(&self, tier: TierName) -> TierStrategy {
        self.tiers.get(&tier).map(|t| t.strategy).unwrap_or_default()
    }

    fn classify(&self, features: &RequestFeatures) -> Option<(TierName, bool)> {
        for rule in &self.config.rules {
            if rule.matcher.matches(features) {
                return Some((rule.tier, rule.matcher.is_catch_all()));
            }
        }
        None
    }

    fn complexity_upgrade(
        &self,
        features: &RequestFeatures,
        tier: TierName,
    ) -> Option<UpgradeReason> {
        let upgrade = &self.config.complexity_upgrade;
        if !upgrade.enabled || tier == TierName::Heavy {
            return None;
        }
        if !upgrade.allowed_families.is_empty() {
            let family = features.model.as_deref().map(model_family)?;
            if !upgrade.allowed_families.contains(&family) {
                return None;
            }
        }

        if upgrade.has_tools && features.has_tools {
            return Some(UpgradeReason::HasTools);
        }
        if upgrade.has_vision && features.has_vision {
            return Some(UpgradeReason::HasVision);
        }
        if let Some(min) = upgrade.max_tokens_gte {
            if features.max_tokens.unwrap_or(0) >= min {
                return Some(UpgradeReason::MaxTokens);
            }
        }
        if let Some(min) = upgrade.message_count_gte {
            if features.message_count >= min {
                return Some(UpgradeReason::MessageCount);
            }
        }
        if let Some(min) = upgrade.system_length_gte {
            if features.system_length >= min {
                return Some(UpgradeReason::SystemLength);
            }
        }
        None
    }

    /// Walk the downgrade ladder below `tier`.
    fn downgrade(
        &self,
        tier: TierName,
        upgraded: Option<UpgradeReason>,
        excluded: &[String],
    ) -> Result<RouteOutcome, RouteError> {
        let cold_start = Duration::from_millis(self.config.failover.cold_start_ms);
        if !self.config.failover.enabled || self.started_at.elapsed() < cold_start {
            return Err(RouteError::TierSaturated(tier));
        }

        let mut current = tier;
        while let Some(lower) = current.downgrade() {
            current = lower;
            if let Some(lease) = self.reserve_in_tier(lower, excluded) {
                tracing::info!(from = %tier, to = %lower, "tier failover");
                return Ok(RouteOutcome::Routed(RouteDecision {
                    lease,
                    tier: lower,
                    strategy: self.tier_strategy(lower),
                    upgraded,
                    downgraded: true,
                }));
            }
        }
        Err(RouteError::TierSaturated(tier))
    }

    fn reserve_in_tier(&self, tier: TierName, excluded: &[String]) -> Option<ModelLease> {
        let runtime = self.tiers.get(&tier)?;
        let eligible = |m: &Arc<ModelState>| {
            !excluded.iter().any(|name| name == m.name()) && m.available()
        };

        let pick = match runtime.strategy {
            TierStrategy::Throughput | TierStrategy::Pool => {
                let best = runtime
                    .models
                    .iter()
                    .filter(|m| eligible(m))
                    .min_by(|a, b| {
                        a.utilization()
                            .partial_cmp(&b.utilization())
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .cloned();
                if runtime.strategy == TierStrategy::Pool {
                    if let Some(model) = &best {
                        tracing::debug!(
                            tier = %tier,
                            model = %model.name(),
                            utilization = model.utilization(),
                            "pool pick"
                        );
                    }
                }
                best
            }
            TierStrategy::Balanced => {
                let len = runtime.models.len();
                if len == 0 {
                    None
                } else {
                    let start = runtime.rr.fetch_add(1, Ordering::Relaxed) % len;
                    (0..len)
                        .map(|offset| &runtime.models[(start + offset) % len])
                        .find(|m| eligible(m))
                        .cloned()
                }
            }
            TierStrategy::Quality => runtime.models.iter().find(|m| eligible(m)).cloned(),
        };

        // Reservation can race with another request; fall through to any
        // remaining eligible model on a miss.
        if let Some(model) = pick {
            if model.try_reserve() {
                return Some(ModelLease { state: model });
            }
        }
        runtime
            .models
            .iter()
            .filter(|m| eligible(m))
            .find(|m| m.try_reserve())
            .map(|model| ModelLease { state: Arc::clone(model) })
    }
}
