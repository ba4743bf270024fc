//! Static backend descriptors.
//!
//! Descriptors capture each backend's fixed capability and pricing
//! profile. They are loaded once at init (from a JSON file or the
//! compiled-in defaults) and never mutated in-process; everything that
//! changes at runtime lives in telemetry.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{Capability, TaskKind};
use crate::error::CommandError;

/// Ordinal capability class of a backend.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityTier {
    /// Cheap, fast, shallow.
    Basic,
    /// General-purpose work.
    Standard,
    /// Stronger comprehension.
    Advanced,
    /// Extended multi-step inference.
    Reasoning,
}

impl CapabilityTier {
    /// 0-based ordinal index (basic = 0 … reasoning = 3).
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Basic => 0,
            Self::Standard => 1,
            Self::Advanced => 2,
            Self::Reasoning => 3,
        }
    }

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Standard => "standard",
            Self::Advanced => "advanced",
            Self::Reasoning => "reasoning",
        }
    }

    /// Minimum tier adequate for a task.
    #[must_use]
    pub const fn required_for(task: TaskKind) -> Self {
        match task {
            TaskKind::Classification => Self::Basic,
            TaskKind::Summarization | TaskKind::Extraction | TaskKind::Chat | TaskKind::Other => {
                Self::Standard
            }
            TaskKind::Reasoning => Self::Reasoning,
        }
    }
}

/// Fixed profile of one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    /// Backend model identifier.
    pub name: String,
    /// Capability class.
    pub capability_tier: CapabilityTier,
    /// List price per 1k tokens.
    pub base_cost_per_1k_tokens: f64,
    /// Vendor-stated worst-case latency.
    pub nominal_max_latency_ms: u64,
    /// Whether schema-constrained JSON output is supported.
    pub supports_structured_output: bool,
    /// Whether incremental streaming is supported.
    pub supports_streaming: bool,
}

impl BackendDescriptor {
    /// Whether this backend supports `capability`.
    #[must_use]
    pub const fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::StructuredOutput => self.supports_structured_output,
            Capability::Streaming => self.supports_streaming,
        }
    }
}

/// Compiled-in backend table used when no descriptor file is configured.
#[must_use]
pub fn default_backends() -> Vec<BackendDescriptor> {
    vec![
        BackendDescriptor {
            name: "gpt-5-nano-2025-08-07".to_string(),
            capability_tier: CapabilityTier::Basic,
            base_cost_per_1k_tokens: 0.01,
            nominal_max_latency_ms: 1500,
            supports_structured_output: true,
            supports_streaming: true,
        },
        BackendDescriptor {
            name: "gpt-5-mini-2025-08-07".to_string(),
            capability_tier: CapabilityTier::Standard,
            base_cost_per_1k_tokens: 0.03,
            nominal_max_latency_ms: 2500,
            supports_structured_output: true,
            supports_streaming: true,
        },
        BackendDescriptor {
            name: "gpt-5.2-2025-12-11".to_string(),
            capability_tier: CapabilityTier::Advanced,
            base_cost_per_1k_tokens: 0.10,
            nominal_max_latency_ms: 4000,
            supports_structured_output: true,
            supports_streaming: true,
        },
        BackendDescriptor {
            name: "gpt-5.2-pro-2025-12-11".to_string(),
            capability_tier: CapabilityTier::Reasoning,
            base_cost_per_1k_tokens: 0.60,
            nominal_max_latency_ms: 12_000,
            supports_structured_output: true,
            supports_streaming: false,
        },
    ]
}

/// Loads descriptors from a JSON file.
///
/// # Errors
///
/// Returns [`CommandError`] when the file is unreadable, unparseable,
/// or empty.
pub fn load_descriptors(path: &Path) -> Result<Vec<BackendDescriptor>, CommandError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| CommandError::Io(format!("{}: {e}", path.display())))?;
    let descriptors: Vec<BackendDescriptor> = serde_json::from_str(&raw).map_err(|e| {
        CommandError::ExecutionFailed(format!("invalid backend table {}: {e}", path.display()))
    })?;
    if descriptors.is_empty() {
        return Err(CommandError::ExecutionFailed(format!(
            "backend table {} is empty",
            path.display()
        )));
    }
    Ok(descriptors)
}
