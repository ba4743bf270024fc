//! Moderation serving path.
//!
//! One request flows rate limit → cache → router → backend → record →
//! alert. Failures degrade to a safe/unflagged verdict so a broken
//! moderator never silently blocks traffic.

pub mod alert;
pub mod metrics;
pub mod prompt;
pub mod result;
pub mod service;

pub use alert::{AlertRecord, AlertSink, LogAlertSink};
pub use metrics::{MetricsSnapshot, RollingMetrics};
pub use result::{ModerationCategory, ModerationResult, Severity, moderation_schema};
pub use service::{ModerationOutcome, ModerationRequest, ModerationService, ModerationStatus};
