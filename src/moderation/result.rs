//! Moderation verdicts.
//!
//! [`ModerationResult`] is the typed verdict returned to callers and
//! stored in the cache. Construction goes through [`normalized`] so the
//! cross-field invariants hold in every returned object: a critical
//! verdict is always flagged, and a safe verdict carries no categories.
//!
//! [`normalized`]: ModerationResult::normalized

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::client::{FieldSpec, Schema, SchemaNode};

/// Maximum categories attached to one verdict.
const MAX_CATEGORIES: usize = 3;

/// How bad the content is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Nothing actionable.
    Safe,
    /// Borderline; surfaced but not blocked.
    Warning,
    /// Actionable; always flagged and never cached.
    Critical,
}

impl Severity {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Policy category a verdict can cite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationCategory {
    /// Targeted abuse of a person.
    Harassment,
    /// Attacks on protected classes.
    HateSpeech,
    /// Threats or glorification of violence.
    Violence,
    /// Self-harm encouragement or instruction.
    SelfHarm,
    /// Sexual content.
    Sexual,
    /// Bulk or deceptive promotion.
    Spam,
    /// Demonstrably false, harmful claims.
    Misinformation,
}

impl ModerationCategory {
    /// Stable snake_case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Harassment => "harassment",
            Self::HateSpeech => "hate_speech",
            Self::Violence => "violence",
            Self::SelfHarm => "self_harm",
            Self::Sexual => "sexual",
            Self::Spam => "spam",
            Self::Misinformation => "misinformation",
        }
    }

    const ALL: [Self; 7] = [
        Self::Harassment,
        Self::HateSpeech,
        Self::Violence,
        Self::SelfHarm,
        Self::Sexual,
        Self::Spam,
        Self::Misinformation,
    ];
}

/// A moderation verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationResult {
    /// Detected language name.
    pub language: String,
    /// Two-letter lowercase language code.
    pub language_code: String,
    /// Verdict severity.
    pub severity: Severity,
    /// Cited categories, at most three, empty when safe.
    #[serde(default)]
    pub categories: Vec<ModerationCategory>,
    /// Model confidence in `[0, 1]`.
    pub confidence: f64,
    /// Risk score in `[0, 100]`.
    pub risk_score: u8,
    /// Whether the content should be surfaced for action.
    pub flagged: bool,
    /// Model's explanation of the verdict.
    pub reasoning: String,
}

impl ModerationResult {
    /// Enforces cross-field invariants, returning the repaired verdict.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.severity == Severity::Critical {
            self.flagged = true;
        }
        if self.severity == Severity::Safe {
            self.categories.clear();
        }
        self.categories.truncate(MAX_CATEGORIES);
        self.categories.dedup();
        self.confidence = self.confidence.clamp(0.0, 1.0);
        self.risk_score = self.risk_score.min(100);
        self.language_code = self
            .language_code
            .trim()
            .chars()
            .take(2)
            .flat_map(char::to_lowercase)
            .collect();
        if self.language_code.len() != 2 {
            self.language_code = "un".to_string();
        }
        self
    }

    /// The fail-safe verdict: safe and unflagged, with the failure in
    /// `reasoning`. A broken moderator must not silently block traffic.
    #[must_use]
    pub fn fail_safe(error: &str) -> Self {
        Self {
            language: "unknown".to_string(),
            language_code: "un".to_string(),
            severity: Severity::Safe,
            categories: Vec::new(),
            confidence: 0.0,
            risk_score: 0,
            flagged: false,
            reasoning: format!("error: {error}"),
        }
    }

    /// Last-resort parse of raw model output after schema validation
    /// failed twice: scan for a severity keyword and build a minimal
    /// verdict from it. Returns `None` when no keyword is present.
    #[must_use]
    pub fn hand_parse(raw: &str) -> Option<Self> {
        let lowered = raw.to_lowercase();
        let severity = if lowered.contains("critical") {
            Severity::Critical
        } else if lowered.contains("warning") {
            Severity::Warning
        } else if lowered.contains("safe") {
            Severity::Safe
        } else {
            return None;
        };
        Some(
            Self {
                language: "unknown".to_string(),
                language_code: "un".to_string(),
                severity,
                categories: Vec::new(),
                confidence: 0.0,
                risk_score: match severity {
                    Severity::Critical => 90,
                    Severity::Warning => 50,
                    Severity::Safe => 0,
                },
                flagged: severity == Severity::Critical,
                reasoning: "degraded parse of malformed moderation output".to_string(),
            }
            .normalized(),
        )
    }
}

/// Declared schema for moderation output.
#[must_use]
pub fn moderation_schema() -> Schema {
    let category_names: Vec<String> = ModerationCategory::ALL
        .iter()
        .map(|c| c.as_str().to_string())
        .collect();

    Schema::object(
        "moderation",
        vec![
            FieldSpec::with_default(
                "language",
                SchemaNode::String {
                    enum_values: None,
                    max_len: Some(64),
                },
                json!("unknown"),
            ),
            FieldSpec::with_default(
                "language_code",
                SchemaNode::String {
                    enum_values: None,
                    max_len: Some(8),
                },
                json!("un"),
            ),
            FieldSpec::required(
                "severity",
                SchemaNode::String {
                    enum_values: Some(vec![
                        "safe".to_string(),
                        "warning".to_string(),
                        "critical".to_string(),
                    ]),
                    max_len: None,
                },
            ),
            FieldSpec::with_default(
                "categories",
                SchemaNode::Array {
                    items: Box::new(SchemaNode::String {
                        enum_values: Some(category_names),
                        max_len: None,
                    }),
                    max_items: Some(MAX_CATEGORIES),
                },
                json!([]),
            ),
            FieldSpec::with_default(
                "confidence",
                SchemaNode::Number {
                    min: Some(0.0),
                    max: Some(1.0),
                },
                json!(0.0),
            ),
            FieldSpec::with_default(
                "risk_score",
                SchemaNode::Integer {
                    min: Some(0),
                    max: Some(100),
                },
                json!(0),
            ),
            FieldSpec::required("flagged", SchemaNode::Boolean),
            FieldSpec::with_default(
                "reasoning",
                SchemaNode::String {
                    enum_values: None,
                    max_len: Some(4_000),
                },
                json!(""),
            ),
        ],
    )
}
