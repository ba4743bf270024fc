//! Moderation prompt construction.

/// System prompt for moderation calls.
pub const MODERATION_SYSTEM_PROMPT: &str = "\
You are a content safety reviewer. Assess the user-submitted message and \
respond with JSON only, using exactly these keys: \"language\" (name), \
\"language_code\" (two letters), \"severity\" (safe|warning|critical), \
\"categories\" (up to three of harassment, hate_speech, violence, \
self_harm, sexual, spam, misinformation; empty when safe), \"confidence\" \
(0 to 1), \"risk_score\" (0 to 100), \"flagged\" (boolean), and \
\"reasoning\" (one or two sentences). A critical severity must always be \
flagged. Judge the message itself, not hypothetical context.";

/// Builds the user message for one moderation call.
///
/// The locale is a hint for language detection, not a constraint; the
/// model still reports what it actually sees.
#[must_use]
pub fn build_moderation_prompt(message: &str, locale: Option<&str>) -> String {
    let locale_hint = locale
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map_or_else(String::new, |l| {
            format!("\nThe submitter's locale hint is \"{l}\".")
        });
    format!("Review this message:\n\n<message>\n{message}\n</message>{locale_hint}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_embeds_message() {
        let prompt = build_moderation_prompt("hello there", Some("en"));
        assert!(prompt.contains("hello there"));
        assert!(prompt.contains("\"en\""));
    }

    #[test]
    fn test_prompt_omits_empty_locale() {
        let prompt = build_moderation_prompt("hello", None);
        assert!(!prompt.contains("locale"));
        let prompt = build_moderation_prompt("hello", Some("  "));
        assert!(!prompt.contains("locale"));
    }
}
