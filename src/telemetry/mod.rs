//! Telemetry: observed backend behavior and routing decisions.
//!
//! The store closes the routing loop — every call outcome updates the
//! per-backend rolling stats the router scores against, and every
//! routing decision lands in a bounded history for introspection.

pub mod store;

pub use store::{
    BackendTelemetry, DECISION_LOG_CAP, DecisionAlternative, DecisionRecord, HISTORY_FILE,
    TELEMETRY_FILE, TelemetrySnapshot, TelemetryStore,
};
