//! Backend scoring and selection.
//!
//! Each candidate starts from a capability-adjusted base, is blended
//! according to the caller's priority, then penalized for latency-budget
//! violations and poor reliability and boosted for fresh, well-sampled
//! telemetry. The maximum wins under a deterministic tie-break.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use super::backend::{BackendDescriptor, CapabilityTier};
use super::{Priority, RouterConfig};
use crate::error::RouterError;
use crate::limiter::epoch_ms;
use crate::telemetry::{
    BackendTelemetry, DecisionAlternative, DecisionRecord, TelemetryStore,
};

/// Telemetry newer than this window qualifies for the recency boost.
const RECENCY_WINDOW_MS: u64 = 24 * 60 * 60 * 1000;

/// Minimum observed calls before the recency boost applies.
const RECENCY_MIN_CALLS: u64 = 10;

/// Penalty applied when a backend's average latency exceeds the budget.
const LATENCY_GATE_PENALTY: f64 = 50.0;

/// A scored runner-up.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredAlternative {
    /// Backend model identifier.
    pub backend: String,
    /// Final score.
    pub score: f64,
    /// Compact explanation of the score.
    pub reason: String,
}

/// The router's answer for one request.
#[derive(Debug, Clone, Serialize)]
pub struct Selection {
    /// The winning backend.
    pub backend: String,
    /// The winning score.
    pub score: f64,
    /// Compact explanation of the score.
    pub reason: String,
    /// Up to three runners-up with their scores and reasons.
    pub alternatives: Vec<ScoredAlternative>,
}

struct Candidate {
    name: String,
    score: f64,
    tokens: Vec<String>,
    eligible: bool,
    call_count: u64,
    cost: f64,
}

/// Scores candidate backends against a [`RouterConfig`].
pub struct ModelRouter {
    descriptors: BTreeMap<String, BackendDescriptor>,
    telemetry: Arc<TelemetryStore>,
    default_backend: String,
}

impl ModelRouter {
    /// Creates a router over `descriptors`.
    ///
    /// `default_backend` is returned when the table is empty, so
    /// selection never fails for lack of configuration.
    #[must_use]
    pub fn new(
        descriptors: Vec<BackendDescriptor>,
        telemetry: Arc<TelemetryStore>,
        default_backend: impl Into<String>,
    ) -> Self {
        Self {
            descriptors: descriptors
                .into_iter()
                .map(|d| (d.name.clone(), d))
                .collect(),
            telemetry,
            default_backend: default_backend.into(),
        }
    }

    /// Shared telemetry store backing this router.
    #[must_use]
    pub fn telemetry(&self) -> &Arc<TelemetryStore> {
        &self.telemetry
    }

    /// Static descriptor for `name`, when configured.
    #[must_use]
    pub fn descriptor(&self, name: &str) -> Option<&BackendDescriptor> {
        self.descriptors.get(name)
    }

    /// Selects a backend for `config` and records the decision.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::NoEligibleBackend`] when a required
    /// capability excludes every configured backend. An empty backend
    /// table is not an error: the configured default wins by fallback.
    pub fn select(&self, config: &RouterConfig) -> Result<Selection, RouterError> {
        if self.descriptors.is_empty() {
            let selection = Selection {
                backend: self.default_backend.clone(),
                score: 0.0,
                reason: "default-fallback".to_string(),
                alternatives: Vec::new(),
            };
            self.record(config, &selection);
            return Ok(selection);
        }

        let now_ms = epoch_ms();
        let mut candidates: Vec<Candidate> = self
            .descriptors
            .values()
            .map(|d| self.score_backend(d, config, now_ms))
            .collect();

        if !candidates.iter().any(|c| c.eligible) {
            let missing = config
                .required_capabilities
                .iter()
                .map(|c| c.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(RouterError::NoEligibleBackend { missing });
        }

        // Deterministic ordering: score, then sample size, then price,
        // then name. Ineligible candidates sink to the bottom.
        candidates.sort_by(|a, b| {
            b.eligible
                .cmp(&a.eligible)
                .then_with(|| b.score.total_cmp(&a.score))
                .then_with(|| b.call_count.cmp(&a.call_count))
                .then_with(|| a.cost.total_cmp(&b.cost))
                .then_with(|| a.name.cmp(&b.name))
        });

        let winner = &candidates[0];
        let selection = Selection {
            backend: winner.name.clone(),
            score: winner.score,
            reason: winner.tokens.join(","),
            alternatives: candidates
                .iter()
                .skip(1)
                .take(3)
                .map(|c| ScoredAlternative {
                    backend: c.name.clone(),
                    score: c.score,
                    reason: c.tokens.join(","),
                })
                .collect(),
        };

        debug!(
            backend = %selection.backend,
            score = selection.score,
            task = config.task.as_str(),
            priority = config.priority.as_str(),
            "backend selected"
        );

        self.record(config, &selection);
        Ok(selection)
    }

    fn record(&self, config: &RouterConfig, selection: &Selection) {
        self.telemetry.record_decision(DecisionRecord {
            ts: epoch_ms(),
            config: config.clone(),
            selected_backend: selection.backend.clone(),
            reason_tokens: selection
                .reason
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            score: selection.score,
            alternatives: selection
                .alternatives
                .iter()
                .map(|a| DecisionAlternative {
                    backend: a.backend.clone(),
                    score: a.score,
                    reason: a.reason.clone(),
                })
                .collect(),
        });
    }

    #[allow(clippy::cast_precision_loss)]
    fn score_backend(
        &self,
        descriptor: &BackendDescriptor,
        config: &RouterConfig,
        now_ms: u64,
    ) -> Candidate {
        let telemetry = self
            .telemetry
            .backend(&descriptor.name)
            .unwrap_or_else(|| BackendTelemetry::seed(descriptor));

        let mut tokens: Vec<String> = Vec::new();

        // Capability requirements are a hard gate, not a penalty.
        for capability in &config.required_capabilities {
            if !descriptor.supports(*capability) {
                tokens.push(format!("missing-{}", capability.as_str()));
                return Candidate {
                    name: descriptor.name.clone(),
                    score: 0.0,
                    tokens,
                    eligible: false,
                    call_count: telemetry.call_count,
                    cost: telemetry.cost_per_1k_tokens,
                };
            }
        }

        let mut base = 100.0;

        let required = CapabilityTier::required_for(config.task);
        let tier = descriptor.capability_tier;
        if tier.index() < required.index() {
            base -= 30.0;
            tokens.push("under-tier".to_string());
        } else if tier.index() > required.index() + 1 {
            base -= 10.0;
            tokens.push("overkill".to_string());
        } else {
            tokens.push("tier-match".to_string());
        }

        // Latency budget violations survive priority blending at full
        // strength: an over-budget backend must lose to an in-budget one
        // even when the blend would otherwise favor its tier or price.
        let latency_penalty = match config.max_latency_ms {
            Some(max) if telemetry.avg_latency_ms > max as f64 => {
                tokens.push("latency-gate".to_string());
                LATENCY_GATE_PENALTY
            }
            _ => 0.0,
        };

        let cost = telemetry.cost_per_1k_tokens.max(1e-3);
        let latency = telemetry.avg_latency_ms.max(1.0);
        let tier_rank = (tier.index() + 1) as f64;

        let mut score = match config.priority {
            Priority::Cost => {
                tokens.push("priority-cost".to_string());
                0.3 * base + 0.7 * ((1.0 / cost) * 100.0)
            }
            Priority::Speed => {
                tokens.push("priority-speed".to_string());
                0.3 * base + 0.7 * ((1.0 / latency) * 10_000.0)
            }
            Priority::Quality => {
                tokens.push("priority-quality".to_string());
                0.3 * base + 0.7 * (tier_rank * 25.0)
            }
            Priority::Balanced => {
                tokens.push("priority-balanced".to_string());
                0.2 * base
                    + 0.3 * ((1.0 / cost) * 50.0)
                    + 0.3 * ((1.0 / latency) * 5000.0)
                    + 0.2 * (tier_rank * 15.0)
            }
        };

        score -= latency_penalty;

        if telemetry.success_rate < 0.95 {
            score -= (1.0 - telemetry.success_rate) * 50.0;
            tokens.push("reliability-penalty".to_string());
        }

        if telemetry.last_updated_ts > 0
            && now_ms.saturating_sub(telemetry.last_updated_ts) < RECENCY_WINDOW_MS
            && telemetry.call_count > RECENCY_MIN_CALLS
        {
            score += 5.0;
            tokens.push("recency-boost".to_string());
        }

        Candidate {
            name: descriptor.name.clone(),
            score: score.max(0.0),
            tokens,
            eligible: true,
            call_count: telemetry.call_count,
            cost: telemetry.cost_per_1k_tokens,
        }
    }
}

impl std::fmt::Debug for ModelRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRouter")
            .field("backends", &self.descriptors.len())
            .field("default_backend", &self.default_backend)
            .finish()
    }
}
