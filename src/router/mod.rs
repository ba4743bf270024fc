//! Model routing: pick the cheapest-adequate backend per request.
//!
//! The router scores every configured backend against a per-request
//! [`RouterConfig`] using static descriptors plus live telemetry, then
//! records the decision so future routing can learn from observed
//! outcomes.
//!
//! # Architecture
//!
//! ```text
//! RouterConfig ──► ModelRouter::select
//!   ├── BackendDescriptor table (static, loaded at init)
//!   ├── TelemetryStore snapshot (latency, success rate, call counts)
//!   ├── score each candidate ──► pick max (deterministic tie-break)
//!   └── TelemetryStore::record_decision (always, before returning)
//! ```

pub mod backend;
pub mod score;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

pub use backend::{BackendDescriptor, CapabilityTier, default_backends, load_descriptors};
pub use score::{ModelRouter, ScoredAlternative, Selection};

/// What kind of work the request represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Label assignment (moderation, intent detection).
    Classification,
    /// Condensing text.
    Summarization,
    /// Multi-step inference.
    Reasoning,
    /// Structured entity extraction.
    Extraction,
    /// Conversational exchange.
    Chat,
    /// Anything else; treated like standard-tier work.
    Other,
}

impl TaskKind {
    /// Stable lowercase name, used in reports and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Classification => "classification",
            Self::Summarization => "summarization",
            Self::Reasoning => "reasoning",
            Self::Extraction => "extraction",
            Self::Chat => "chat",
            Self::Other => "other",
        }
    }
}

/// What the caller wants optimized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Minimize spend.
    Cost,
    /// Maximize capability tier.
    Quality,
    /// Minimize latency.
    Speed,
    /// Blend of all three.
    Balanced,
}

impl Priority {
    /// Stable lowercase name, used in reports and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cost => "cost",
            Self::Quality => "quality",
            Self::Speed => "speed",
            Self::Balanced => "balanced",
        }
    }
}

/// Caller's estimate of task difficulty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    /// Trivial input.
    Low,
    /// Typical input.
    Medium,
    /// Dense or ambiguous input.
    High,
}

/// A backend capability a request may require.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Schema-constrained JSON output.
    StructuredOutput,
    /// Incremental token streaming.
    Streaming,
}

impl Capability {
    /// Stable snake_case name, used in reports and errors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StructuredOutput => "structured_output",
            Self::Streaming => "streaming",
        }
    }
}

/// Per-request routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Kind of work being routed.
    pub task: TaskKind,
    /// Optimization target.
    pub priority: Priority,
    /// Estimated difficulty.
    pub complexity: Complexity,
    /// Hard latency budget; backends averaging above it are penalized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_latency_ms: Option<u64>,
    /// Capabilities the backend must support; unsupported backends are
    /// ineligible, not merely penalized.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub required_capabilities: BTreeSet<Capability>,
}

impl RouterConfig {
    /// A config with no latency budget or capability requirements.
    #[must_use]
    pub const fn new(task: TaskKind, priority: Priority, complexity: Complexity) -> Self {
        Self {
            task,
            priority,
            complexity,
            max_latency_ms: None,
            required_capabilities: BTreeSet::new(),
        }
    }

    /// Sets the latency budget.
    #[must_use]
    pub const fn with_max_latency_ms(mut self, ms: u64) -> Self {
        self.max_latency_ms = Some(ms);
        self
    }

    /// Adds a required capability.
    #[must_use]
    pub fn require(mut self, capability: Capability) -> Self {
        self.required_capabilities.insert(capability);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_serialization_omits_empty_requirements() {
        let config = RouterConfig::new(TaskKind::Chat, Priority::Balanced, Complexity::Medium);
        let json = serde_json::to_string(&config).unwrap_or_default();
        assert!(!json.contains("required_capabilities"));
        assert!(!json.contains("max_latency_ms"));
    }

    #[test]
    fn test_config_round_trip() {
        let config = RouterConfig::new(TaskKind::Reasoning, Priority::Quality, Complexity::High)
            .with_max_latency_ms(5000)
            .require(Capability::StructuredOutput);
        let json = serde_json::to_string(&config).unwrap_or_default();
        let back: RouterConfig = serde_json::from_str(&json).unwrap_or_else(|_| unreachable!());
        assert_eq!(back.max_latency_ms, Some(5000));
        assert!(back.required_capabilities.contains(&Capability::StructuredOutput));
    }

    #[test]
    fn test_capability_serde_names() {
        let json = serde_json::to_string(&Capability::StructuredOutput).unwrap_or_default();
        assert_eq!(json, "\"structured_output\"");
    }
}
