//! Alert routing for flagged content.

use serde::Serialize;
use tracing::warn;

use super::result::{ModerationCategory, Severity};

/// How much of the offending message the alert carries.
const PREVIEW_LEN: usize = 120;

/// One alert for a flagged or critical verdict.
#[derive(Debug, Clone, Serialize)]
pub struct AlertRecord {
    /// Epoch milliseconds when the verdict was produced.
    pub ts: u64,
    /// Client identifier that submitted the content.
    pub client_id: String,
    /// Verdict severity.
    pub severity: Severity,
    /// Cited categories.
    pub categories: Vec<ModerationCategory>,
    /// Risk score in `[0, 100]`.
    pub risk_score: u8,
    /// Leading bytes of the offending message.
    pub message_preview: String,
    /// Model's explanation of the verdict.
    pub reasoning: String,
}

impl AlertRecord {
    /// Truncates `message` into a preview on a char boundary.
    #[must_use]
    pub fn preview_of(message: &str) -> String {
        if message.len() <= PREVIEW_LEN {
            return message.to_string();
        }
        let mut cut = PREVIEW_LEN;
        while cut > 0 && !message.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &message[..cut])
    }
}

/// Destination for alert records. Pluggable at service construction.
pub trait AlertSink: Send + Sync {
    /// Delivers one alert. Must not block the serving path.
    fn emit(&self, record: &AlertRecord);
}

/// Default sink: structured log line on stderr via `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn emit(&self, record: &AlertRecord) {
        warn!(
            client_id = %record.client_id,
            severity = record.severity.as_str(),
            risk_score = record.risk_score,
            categories = ?record.categories,
            preview = %record.message_preview,
            "content flagged"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_short_message_unchanged() {
        assert_eq!(AlertRecord::preview_of("short"), "short");
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let message = "ü".repeat(200);
        let preview = AlertRecord::preview_of(&message);
        assert!(preview.ends_with('…'));
        assert!(preview.len() <= PREVIEW_LEN + '…'.len_utf8());
    }
}
