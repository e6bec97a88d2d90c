//! AIMD adaptive concurrency control.
//!
//! A periodic tick sweeps every routable model and adjusts its effective
//! concurrency cap from the 429/success counts observed since the last
//! tick:
//!
//! - any 429s → multiplicative decrease (`cap * multiplicative_decrease`,
//!   floored at `min_concurrency`),
//! - a clean window with traffic → additive increase (`cap +
//!   additive_increase`, ceilinged at the smaller of the model's static
//!   cap and `hard_max`),
//! - an idle window → no change.
//!
//! `observe_only` mode logs the proposal without applying it, so operators
//! can watch the controller before trusting it.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{AdaptiveKnobs, AdaptiveMode};
use crate::router::{ModelRouter, ModelState};

pub struct AdaptiveController {
    router: Arc<ModelRouter>,
    knobs: AdaptiveKnobs,
}

impl AdaptiveController {
    pub fn new(router: Arc<ModelRouter>, knobs: AdaptiveKnobs) -> Self {
        Self { router, knobs }
    }

    /// Run one adjustment sweep over all models.
    pub fn adjust_once(&self) {
        for model in self.router.models() {
            self.adjust_model(model);
        }
    }

    fn adjust_model(&self, model: &Arc<ModelState>) {
        let (rate_limited, succeeded) = model.take_window_counts();
        let current = model.effective_max();
        let ceiling = model.max_concurrency().min(self.knobs.hard_max);

        let proposed = if rate_limited > 0 {
            let decreased =
                (current as f64 * self.knobs.multiplicative_decrease).floor() as u32;
            decreased.max(self.knobs.min_concurrency)
        } else if succeeded > 0 {
            current
                .saturating_add(self.knobs.additive_increase)
                .min(ceiling)
        } else {
            return; // idle window, nothing observed
        };

        if proposed == current {
            return;
        }

        match self.knobs.mode {
            AdaptiveMode::ObserveOnly => {
                tracing::info!(
                    model = model.name(),
                    current,
                    proposed,
                    rate_limited,
                    succeeded,
                    "adaptive concurrency proposal (observe only)"
                );
            }
            AdaptiveMode::Enforce => {
                model.set_effective_max(proposed);
                tracing::info!(
                    model = model.name(),
                    from = current,
                    to = proposed,
                    rate_limited,
                    succeeded,
                    "adaptive concurrency cap adjusted"
                );
            }
        }
    }

    /// Spawn the periodic tick. Returns the task handle so shutdown can
    /// abort it.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        let period = Duration::from_millis(self.knobs.sample_window_ms.max(100));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                interval.tick().await;
                self.adjust_once();
            }
        })
    }
}
