//! Rolling moderation metrics.
//!
//! Incrementally updated aggregates over the service lifetime, exposed
//! read-only. The service wraps these in a short critical section; the
//! struct itself is plain data.

use std::collections::BTreeMap;

use serde::Serialize;

use super::result::ModerationResult;

/// Incrementally maintained counters and means.
#[derive(Debug, Clone, Default)]
pub struct RollingMetrics {
    evaluations: u64,
    flagged: u64,
    cache_hits: u64,
    streamed: u64,
    errors: u64,
    severity: BTreeMap<String, u64>,
    languages: BTreeMap<String, u64>,
    avg_latency_ms: f64,
    avg_risk_score: f64,
}

/// Read-only projection of [`RollingMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// All handled requests: evaluations, cache hits, streams, errors.
    pub total_requests: u64,
    /// Requests answered by a fresh model evaluation.
    pub evaluations: u64,
    /// Requests answered from cache.
    pub cache_hits: u64,
    /// Streaming requests served.
    pub streamed: u64,
    /// Requests that degraded to the fail-safe verdict.
    pub errors: u64,
    /// Evaluations that came back flagged.
    pub flagged: u64,
    /// Verdicts per severity.
    pub severity: BTreeMap<String, u64>,
    /// Verdicts per detected language code.
    pub languages: BTreeMap<String, u64>,
    /// Mean evaluation latency.
    pub avg_latency_ms: f64,
    /// Mean risk score across evaluations.
    pub avg_risk_score: f64,
}

impl RollingMetrics {
    /// Records a completed model evaluation.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_evaluation(&mut self, result: &ModerationResult, latency_ms: u64) {
        self.evaluations += 1;
        let n = self.evaluations as f64;
        self.avg_latency_ms = (self.avg_latency_ms * (n - 1.0) + latency_ms as f64) / n;
        self.avg_risk_score =
            (self.avg_risk_score * (n - 1.0) + f64::from(result.risk_score)) / n;
        if result.flagged {
            self.flagged += 1;
        }
        *self
            .severity
            .entry(result.severity.as_str().to_string())
            .or_insert(0) += 1;
        *self
            .languages
            .entry(result.language_code.clone())
            .or_insert(0) += 1;
    }

    /// Records a cache hit.
    pub fn record_cache_hit(&mut self) {
        self.cache_hits += 1;
    }

    /// Records a served stream.
    pub fn record_streamed(&mut self) {
        self.streamed += 1;
    }

    /// Records a request that degraded to the fail-safe verdict.
    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    /// Read-only snapshot.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.evaluations + self.cache_hits + self.streamed + self.errors,
            evaluations: self.evaluations,
            cache_hits: self.cache_hits,
            streamed: self.streamed,
            errors: self.errors,
            flagged: self.flagged,
            severity: self.severity.clone(),
            languages: self.languages.clone(),
            avg_latency_ms: self.avg_latency_ms,
            avg_risk_score: self.avg_risk_score,
        }
    }
}
