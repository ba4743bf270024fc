//! Read-only projection of telemetry into report shapes.
//!
//! The projector folds the telemetry snapshot and decision log into the
//! structures the stats endpoint and CLI render. It never mutates the
//! store.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::telemetry::{TelemetrySnapshot, TelemetryStore};

/// How many recent decisions the timeline carries.
const TIMELINE_LEN: usize = 10;

/// Tunables for derived figures.
#[derive(Debug, Clone, Copy)]
pub struct StatsConfig {
    /// Tokens assumed per call when estimating spend. The store does
    /// not track token counts per call, so cost analysis extrapolates
    /// from call counts with this constant.
    pub assumed_tokens_per_call: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            assumed_tokens_per_call: 100,
        }
    }
}

/// Headline figures.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSummary {
    /// Decisions currently retained in the log.
    pub total_decisions: usize,
    /// Backends with telemetry entries.
    pub backends_tracked: usize,
    /// Observed calls across all backends.
    pub total_calls: u64,
    /// Call-weighted success rate across all backends.
    pub overall_success_rate: f64,
    /// Timestamp of the newest decision, if any.
    pub last_decision_ts: Option<u64>,
}

/// Per-backend observed performance.
#[derive(Debug, Clone, Serialize)]
pub struct BackendPerformance {
    /// Mean latency over observed calls.
    pub avg_latency_ms: f64,
    /// Latency of the most recent call.
    pub last_latency_ms: u64,
    /// Fraction of calls that succeeded.
    pub success_rate: f64,
    /// Observed call count.
    pub call_count: u64,
    /// Epoch milliseconds of the last update.
    pub last_updated_ts: u64,
}

/// Per-backend cost figures.
#[derive(Debug, Clone, Serialize)]
pub struct BackendCost {
    /// Current price per 1k tokens.
    pub cost_per_1k_tokens: f64,
    /// Extrapolated total spend over observed calls.
    pub estimated_total_cost: f64,
}

/// One recent decision.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    /// Epoch milliseconds of the decision.
    pub ts: u64,
    /// Task kind routed.
    pub task: String,
    /// Priority requested.
    pub priority: String,
    /// Backend selected.
    pub selected_backend: String,
    /// Winning score.
    pub score: f64,
}

/// One row of the side-by-side backend matrix.
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonRow {
    /// Backend model identifier.
    pub backend: String,
    /// Capability class.
    pub tier: String,
    /// Current price per 1k tokens.
    pub cost_per_1k_tokens: f64,
    /// Mean latency over observed calls.
    pub avg_latency_ms: f64,
    /// Fraction of calls that succeeded.
    pub success_rate: f64,
    /// Observed call count.
    pub call_count: u64,
    /// Times this backend won a retained decision.
    pub times_selected: u64,
}

/// Full stats report.
#[derive(Debug, Clone, Serialize)]
pub struct RouterStatsReport {
    /// Headline figures.
    pub summary: StatsSummary,
    /// Decisions won per backend.
    pub model_usage: BTreeMap<String, u64>,
    /// Decisions per task kind.
    pub task_distribution: BTreeMap<String, u64>,
    /// Decisions per priority.
    pub priority_distribution: BTreeMap<String, u64>,
    /// Observed performance per backend.
    pub performance: BTreeMap<String, BackendPerformance>,
    /// Cost figures per backend.
    pub cost_analysis: BTreeMap<String, BackendCost>,
    /// The ten most recent decisions, oldest first.
    pub timeline: Vec<TimelineEntry>,
    /// Side-by-side backend matrix.
    pub comparison: Vec<ComparisonRow>,
}

/// Builds [`RouterStatsReport`]s from the live store.
pub struct StatsProjector {
    telemetry: Arc<TelemetryStore>,
    config: StatsConfig,
}

impl StatsProjector {
    /// Creates a projector over `telemetry`.
    #[must_use]
    pub const fn new(telemetry: Arc<TelemetryStore>, config: StatsConfig) -> Self {
        Self { telemetry, config }
    }

    /// Projects the current snapshot into a report.
    #[must_use]
    pub fn report(&self) -> RouterStatsReport {
        self.project(&self.telemetry.snapshot())
    }

    #[allow(clippy::cast_precision_loss)]
    fn project(&self, snapshot: &TelemetrySnapshot) -> RouterStatsReport {
        let mut model_usage: BTreeMap<String, u64> = BTreeMap::new();
        let mut task_distribution: BTreeMap<String, u64> = BTreeMap::new();
        let mut priority_distribution: BTreeMap<String, u64> = BTreeMap::new();

        for decision in &snapshot.decisions {
            *model_usage
                .entry(decision.selected_backend.clone())
                .or_insert(0) += 1;
            *task_distribution
                .entry(decision.config.task.as_str().to_string())
                .or_insert(0) += 1;
            *priority_distribution
                .entry(decision.config.priority.as_str().to_string())
                .or_insert(0) += 1;
        }

        let total_calls: u64 = snapshot.backends.values().map(|t| t.call_count).sum();
        let weighted_successes: f64 = snapshot
            .backends
            .values()
            .map(|t| t.success_rate * t.call_count as f64)
            .sum();
        let overall_success_rate = if total_calls == 0 {
            1.0
        } else {
            weighted_successes / total_calls as f64
        };

        let performance: BTreeMap<String, BackendPerformance> = snapshot
            .backends
            .iter()
            .map(|(name, t)| {
                (
                    name.clone(),
                    BackendPerformance {
                        avg_latency_ms: t.avg_latency_ms,
                        last_latency_ms: t.last_latency_ms,
                        success_rate: t.success_rate,
                        call_count: t.call_count,
                        last_updated_ts: t.last_updated_ts,
                    },
                )
            })
            .collect();

        let tokens_per_call = self.config.assumed_tokens_per_call as f64;
        let cost_analysis: BTreeMap<String, BackendCost> = snapshot
            .backends
            .iter()
            .map(|(name, t)| {
                (
                    name.clone(),
                    BackendCost {
                        cost_per_1k_tokens: t.cost_per_1k_tokens,
                        estimated_total_cost: t.cost_per_1k_tokens
                            * (t.call_count as f64 * tokens_per_call / 1000.0),
                    },
                )
            })
            .collect();

        let timeline: Vec<TimelineEntry> = snapshot
            .decisions
            .iter()
            .rev()
            .take(TIMELINE_LEN)
            .rev()
            .map(|d| TimelineEntry {
                ts: d.ts,
                task: d.config.task.as_str().to_string(),
                priority: d.config.priority.as_str().to_string(),
                selected_backend: d.selected_backend.clone(),
                score: d.score,
            })
            .collect();

        let comparison: Vec<ComparisonRow> = snapshot
            .backends
            .iter()
            .map(|(name, t)| ComparisonRow {
                backend: name.clone(),
                tier: t.capability_tier.as_str().to_string(),
                cost_per_1k_tokens: t.cost_per_1k_tokens,
                avg_latency_ms: t.avg_latency_ms,
                success_rate: t.success_rate,
                call_count: t.call_count,
                times_selected: model_usage.get(name).copied().unwrap_or(0),
            })
            .collect();

        RouterStatsReport {
            summary: StatsSummary {
                total_decisions: snapshot.decisions.len(),
                backends_tracked: snapshot.backends.len(),
                total_calls,
                overall_success_rate,
                last_decision_ts: snapshot.decisions.last().map(|d| d.ts),
            },
            model_usage,
            task_distribution,
            priority_distribution,
            performance,
            cost_analysis,
            timeline,
            comparison,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{
        Complexity, ModelRouter, Priority, RouterConfig, TaskKind, default_backends,
    };

    fn seeded_projector() -> StatsProjector {
        let descriptors = default_backends();
        let telemetry = Arc::new(TelemetryStore::in_memory(&descriptors));
        let router = ModelRouter::new(descriptors, Arc::clone(&telemetry), "fallback");

        for i in 0u64..12 {
            let config = if i % 3 == 0 {
                RouterConfig::new(TaskKind::Classification, Priority::Speed, Complexity::Low)
            } else {
                RouterConfig::new(TaskKind::Summarization, Priority::Cost, Complexity::Medium)
            };
            let selection = router.select(&config).unwrap_or_else(|_| unreachable!());
            telemetry.update(&selection.backend, 800 + i * 10, i % 5 != 0);
        }

        StatsProjector::new(telemetry, StatsConfig::default())
    }

    #[test]
    fn test_distributions_sum_to_decision_count() {
        let report = seeded_projector().report();
        assert_eq!(report.summary.total_decisions, 12);
        assert_eq!(report.task_distribution.values().sum::<u64>(), 12);
        assert_eq!(report.priority_distribution.values().sum::<u64>(), 12);
        assert_eq!(report.model_usage.values().sum::<u64>(), 12);
        assert_eq!(report.task_distribution.get("classification"), Some(&4));
        assert_eq!(report.priority_distribution.get("cost"), Some(&8));
    }

    #[test]
    fn test_timeline_keeps_last_ten_in_order() {
        let report = seeded_projector().report();
        assert_eq!(report.timeline.len(), 10);
        for window in report.timeline.windows(2) {
            assert!(window[0].ts <= window[1].ts);
        }
    }

    #[test]
    fn test_cost_extrapolates_from_call_count() {
        let report = seeded_projector().report();
        for (name, cost) in &report.cost_analysis {
            let calls = report
                .performance
                .get(name)
                .map(|p| p.call_count)
                .unwrap_or_default();
            #[allow(clippy::cast_precision_loss)]
            let expected = cost.cost_per_1k_tokens * (calls as f64 * 100.0 / 1000.0);
            assert!((cost.estimated_total_cost - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn test_comparison_covers_every_backend() {
        let report = seeded_projector().report();
        assert_eq!(report.comparison.len(), report.summary.backends_tracked);
        let selected: u64 = report.comparison.iter().map(|r| r.times_selected).sum();
        assert_eq!(selected, 12);
    }

    #[test]
    fn test_empty_store_reports_cleanly() {
        let telemetry = Arc::new(TelemetryStore::in_memory(&[]));
        let report = StatsProjector::new(telemetry, StatsConfig::default()).report();
        assert_eq!(report.summary.total_decisions, 0);
        assert_eq!(report.summary.total_calls, 0);
        assert!((report.summary.overall_success_rate - 1.0).abs() < f64::EPSILON);
        assert!(report.timeline.is_empty());
    }
}
