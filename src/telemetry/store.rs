//! Persistent rolling stats and decision history.
//!
//! State lives behind a single serialized critical section; the mutex
//! is never held across an `.await` point, so updates from concurrent
//! request tasks serialize without an actor task. Both maps are
//! write-through persisted as JSON files and reloaded on start, seeded
//! from the static descriptors when the files are missing.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::limiter::epoch_ms;
use crate::router::{BackendDescriptor, CapabilityTier, RouterConfig};
use crate::error::TelemetryError;

/// Maximum retained decision records.
pub const DECISION_LOG_CAP: usize = 100;

/// Telemetry file name within the state directory.
pub const TELEMETRY_FILE: &str = ".model-telemetry.json";

/// Decision history file name within the state directory.
pub const HISTORY_FILE: &str = ".routing-history.json";

/// Observed rolling stats for one backend.
///
/// `avg_latency_ms` and `success_rate` are running means over
/// `call_count` observations; `call_count` is monotonically
/// non-decreasing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendTelemetry {
    /// Backend model identifier.
    pub name: String,
    /// Latency of the most recent call.
    #[serde(default)]
    pub last_latency_ms: u64,
    /// Current price per 1k tokens.
    pub cost_per_1k_tokens: f64,
    /// Fraction of calls that succeeded, in `[0, 1]`.
    pub success_rate: f64,
    /// Capability class, mirrored from the descriptor for reporting.
    pub capability_tier: CapabilityTier,
    /// Epoch milliseconds of the last update; 0 when never observed.
    #[serde(default)]
    pub last_updated_ts: u64,
    /// Number of observed calls.
    #[serde(default)]
    pub call_count: u64,
    /// Mean latency over all observed calls.
    pub avg_latency_ms: f64,
}

impl BackendTelemetry {
    /// Initial telemetry for a backend that has never been called.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn seed(descriptor: &BackendDescriptor) -> Self {
        Self {
            name: descriptor.name.clone(),
            last_latency_ms: descriptor.nominal_max_latency_ms,
            cost_per_1k_tokens: descriptor.base_cost_per_1k_tokens,
            success_rate: 1.0,
            capability_tier: descriptor.capability_tier,
            last_updated_ts: 0,
            call_count: 0,
            avg_latency_ms: descriptor.nominal_max_latency_ms as f64,
        }
    }
}

/// A scored runner-up in a routing decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionAlternative {
    /// Backend model identifier.
    pub backend: String,
    /// Final score.
    pub score: f64,
    /// Compact explanation of the score.
    pub reason: String,
}

/// One routing decision, append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// Epoch milliseconds when the decision was made.
    pub ts: u64,
    /// The request configuration that drove the decision.
    pub config: RouterConfig,
    /// The winning backend.
    pub selected_backend: String,
    /// Factors that shaped the winning score.
    pub reason_tokens: Vec<String>,
    /// The winning score.
    pub score: f64,
    /// Up to three runners-up.
    #[serde(default)]
    pub alternatives: Vec<DecisionAlternative>,
}

/// Consistent copy of the store contents.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TelemetrySnapshot {
    /// Per-backend rolling stats.
    pub backends: BTreeMap<String, BackendTelemetry>,
    /// Decision history, oldest first.
    pub decisions: Vec<DecisionRecord>,
}

struct Inner {
    backends: BTreeMap<String, BackendTelemetry>,
    decisions: VecDeque<DecisionRecord>,
}

/// Single-writer telemetry store with write-through persistence.
pub struct TelemetryStore {
    inner: Mutex<Inner>,
    paths: Option<(PathBuf, PathBuf)>,
}

impl TelemetryStore {
    /// Opens the store under `state_dir`, creating it if needed.
    ///
    /// Missing files seed initial telemetry from `descriptors`; present
    /// files are loaded, tolerating unknown fields, and any backend
    /// added to the descriptor table since the last run is seeded in.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError`] when the directory cannot be created
    /// or an existing state file is unreadable or unparseable.
    pub fn open(
        state_dir: &Path,
        descriptors: &[BackendDescriptor],
    ) -> Result<Self, TelemetryError> {
        std::fs::create_dir_all(state_dir).map_err(|e| TelemetryError::Io {
            path: state_dir.display().to_string(),
            message: e.to_string(),
        })?;

        let telemetry_path = state_dir.join(TELEMETRY_FILE);
        let history_path = state_dir.join(HISTORY_FILE);

        let mut backends: BTreeMap<String, BackendTelemetry> = if telemetry_path.exists() {
            let raw =
                std::fs::read_to_string(&telemetry_path).map_err(|e| TelemetryError::Io {
                    path: telemetry_path.display().to_string(),
                    message: e.to_string(),
                })?;
            serde_json::from_str(&raw).map_err(|e| TelemetryError::Parse {
                path: telemetry_path.display().to_string(),
                message: e.to_string(),
            })?
        } else {
            BTreeMap::new()
        };

        for descriptor in descriptors {
            backends
                .entry(descriptor.name.clone())
                .or_insert_with(|| BackendTelemetry::seed(descriptor));
        }

        let decisions: VecDeque<DecisionRecord> = if history_path.exists() {
            let raw = std::fs::read_to_string(&history_path).map_err(|e| TelemetryError::Io {
                path: history_path.display().to_string(),
                message: e.to_string(),
            })?;
            let mut list: VecDeque<DecisionRecord> =
                serde_json::from_str(&raw).map_err(|e| TelemetryError::Parse {
                    path: history_path.display().to_string(),
                    message: e.to_string(),
                })?;
            while list.len() > DECISION_LOG_CAP {
                list.pop_front();
            }
            list
        } else {
            VecDeque::new()
        };

        Ok(Self {
            inner: Mutex::new(Inner {
                backends,
                decisions,
            }),
            paths: Some((telemetry_path, history_path)),
        })
    }

    /// An unpersisted store, for tests and dry runs.
    #[must_use]
    pub fn in_memory(descriptors: &[BackendDescriptor]) -> Self {
        let backends = descriptors
            .iter()
            .map(|d| (d.name.clone(), BackendTelemetry::seed(d)))
            .collect();
        Self {
            inner: Mutex::new(Inner {
                backends,
                decisions: VecDeque::new(),
            }),
            paths: None,
        }
    }

    /// Records one call outcome for `backend`.
    ///
    /// Uses a plain running mean over `call_count` observations rather
    /// than an EMA; the scoring formula treats the value as a point
    /// estimate either way, and the mean is exactly reproducible.
    #[allow(clippy::cast_precision_loss)]
    pub fn update(&self, backend: &str, latency_ms: u64, success: bool) {
        let Ok(mut inner) = self.inner.lock() else {
            warn!(backend, "telemetry mutex poisoned, dropping update");
            return;
        };

        let entry = inner
            .backends
            .entry(backend.to_string())
            .or_insert_with(|| {
                warn!(backend, "telemetry update for undeclared backend");
                BackendTelemetry {
                    name: backend.to_string(),
                    last_latency_ms: latency_ms,
                    cost_per_1k_tokens: 0.0,
                    success_rate: 1.0,
                    capability_tier: CapabilityTier::Standard,
                    last_updated_ts: 0,
                    call_count: 0,
                    avg_latency_ms: latency_ms as f64,
                }
            });

        let n = entry.call_count + 1;
        let n_f = n as f64;
        entry.avg_latency_ms =
            (entry.avg_latency_ms * (n_f - 1.0) + latency_ms as f64) / n_f;
        entry.success_rate =
            (entry.success_rate * (n_f - 1.0) + if success { 1.0 } else { 0.0 }) / n_f;
        entry.last_latency_ms = latency_ms;
        entry.last_updated_ts = epoch_ms();
        entry.call_count = n;

        debug!(
            backend,
            latency_ms,
            success,
            call_count = n,
            "telemetry updated"
        );

        if let Some((telemetry_path, _)) = &self.paths {
            persist(telemetry_path, &inner.backends);
        }
    }

    /// Appends a decision record, dropping the oldest past the cap.
    pub fn record_decision(&self, record: DecisionRecord) {
        let Ok(mut inner) = self.inner.lock() else {
            warn!("telemetry mutex poisoned, dropping decision record");
            return;
        };

        inner.decisions.push_back(record);
        while inner.decisions.len() > DECISION_LOG_CAP {
            inner.decisions.pop_front();
        }

        if let Some((_, history_path)) = &self.paths {
            let list: Vec<&DecisionRecord> = inner.decisions.iter().collect();
            persist(history_path, &list);
        }
    }

    /// Observed telemetry for one backend.
    #[must_use]
    pub fn backend(&self, name: &str) -> Option<BackendTelemetry> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.backends.get(name).cloned())
    }

    /// A consistent copy of all telemetry and the decision log.
    #[must_use]
    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.inner.lock().map_or_else(
            |_| TelemetrySnapshot::default(),
            |inner| TelemetrySnapshot {
                backends: inner.backends.clone(),
                decisions: inner.decisions.iter().cloned().collect(),
            },
        )
    }
}

/// Best-effort write-through. Persistence failures are logged, never
/// propagated; the in-memory state remains authoritative.
fn persist<T: Serialize>(path: &Path, value: &T) {
    match serde_json::to_vec_pretty(value) {
        Ok(bytes) => {
            if let Err(e) = std::fs::write(path, bytes) {
                warn!(path = %path.display(), error = %e, "telemetry persist failed");
            }
        }
        Err(e) => warn!(path = %path.display(), error = %e, "telemetry serialize failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{Complexity, Priority, TaskKind, default_backends};

    fn record(selected: &str) -> DecisionRecord {
        DecisionRecord {
            ts: 1,
            config: RouterConfig::new(TaskKind::Chat, Priority::Balanced, Complexity::Low),
            selected_backend: selected.to_string(),
            reason_tokens: vec!["tier-match".to_string()],
            score: 90.0,
            alternatives: Vec::new(),
        }
    }

    #[test]
    fn test_seed_values() {
        let store = TelemetryStore::in_memory(&default_backends());
        let t = store
            .backend("gpt-5-nano-2025-08-07")
            .unwrap_or_else(|| unreachable!());
        assert_eq!(t.call_count, 0);
        assert!((t.success_rate - 1.0).abs() < f64::EPSILON);
        assert!((t.avg_latency_ms - 1500.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_running_mean_update() {
        let store = TelemetryStore::in_memory(&default_backends());
        let name = "gpt-5-mini-2025-08-07";

        store.update(name, 1000, true);
        let t = store.backend(name).unwrap_or_else(|| unreachable!());
        // First observation replaces the nominal seed in the mean:
        // (2500*0 + 1000) / 1 — seeded avg participates with weight n-1.
        assert!((t.avg_latency_ms - 1000.0).abs() < 1e-9);
        assert_eq!(t.call_count, 1);

        store.update(name, 2000, false);
        let t = store.backend(name).unwrap_or_else(|| unreachable!());
        assert!((t.avg_latency_ms - 1500.0).abs() < 1e-9);
        assert!((t.success_rate - 0.5).abs() < 1e-9);
        assert_eq!(t.last_latency_ms, 2000);
        assert_eq!(t.call_count, 2);
    }

    #[test]
    fn test_call_count_monotonic() {
        let store = TelemetryStore::in_memory(&default_backends());
        let name = "gpt-5-mini-2025-08-07";
        let mut last = 0;
        for i in 0..20 {
            store.update(name, 100 + i, i % 3 != 0);
            let count = store
                .backend(name)
                .map(|t| t.call_count)
                .unwrap_or_default();
            assert!(count > last);
            last = count;
        }
    }

    #[test]
    fn test_decision_log_bounded() {
        let store = TelemetryStore::in_memory(&default_backends());
        for i in 0..150 {
            store.record_decision(record(&format!("m{i}")));
        }
        let snapshot = store.snapshot();
        assert_eq!(snapshot.decisions.len(), DECISION_LOG_CAP);
        // FIFO truncation: the oldest 50 were dropped.
        assert_eq!(snapshot.decisions[0].selected_backend, "m50");
        assert_eq!(
            snapshot.decisions[DECISION_LOG_CAP - 1].selected_backend,
            "m149"
        );
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap_or_else(|_| unreachable!());
        let descriptors = default_backends();

        {
            let store =
                TelemetryStore::open(dir.path(), &descriptors).unwrap_or_else(|_| unreachable!());
            store.update("gpt-5-mini-2025-08-07", 1200, true);
            store.record_decision(record("gpt-5-mini-2025-08-07"));
        }

        let reopened =
            TelemetryStore::open(dir.path(), &descriptors).unwrap_or_else(|_| unreachable!());
        let t = reopened
            .backend("gpt-5-mini-2025-08-07")
            .unwrap_or_else(|| unreachable!());
        assert_eq!(t.call_count, 1);
        assert_eq!(t.last_latency_ms, 1200);
        assert_eq!(reopened.snapshot().decisions.len(), 1);
    }

    #[test]
    fn test_load_tolerates_unknown_fields() {
        let dir = tempfile::tempdir().unwrap_or_else(|_| unreachable!());
        let path = dir.path().join(TELEMETRY_FILE);
        let raw = r#"{
            "future-model": {
                "name": "future-model",
                "cost_per_1k_tokens": 0.05,
                "success_rate": 0.9,
                "capability_tier": "standard",
                "avg_latency_ms": 800.0,
                "experimental_field_from_next_version": {"nested": true}
            }
        }"#;
        std::fs::write(&path, raw).unwrap_or_else(|_| unreachable!());

        let store =
            TelemetryStore::open(dir.path(), &default_backends()).unwrap_or_else(|_| unreachable!());
        let t = store.backend("future-model").unwrap_or_else(|| unreachable!());
        // Missing optional fields got defaults.
        assert_eq!(t.call_count, 0);
        assert_eq!(t.last_updated_ts, 0);
        assert!((t.success_rate - 0.9).abs() < f64::EPSILON);
    }
}
