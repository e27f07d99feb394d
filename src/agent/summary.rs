//! Completion detection for the code agent.
//!
//! The agent signals that it is done by emitting a `<task_summary>` block.
//! The whole response text becomes the run's summary, tags included,
//! because downstream agents receive it verbatim.

use regex::Regex;
use std::sync::LazyLock;

use super::AgentState;

static TASK_SUMMARY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<task_summary>(.*?)(?:</task_summary>|$)").unwrap());

/// Response hook: store the response as the summary once it carries a
/// `<task_summary>` tag. Earlier summaries are overwritten.
pub fn capture_task_summary(text: &str, state: &mut AgentState) {
    if text.contains("<task_summary>") {
        state.summary = text.to_string();
    }
}

/// The inner text of the first `<task_summary>` block, trimmed.
pub fn extract_task_summary(text: &str) -> Option<&str> {
    TASK_SUMMARY_REGEX
        .captures(text)
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_sets_full_text() {
        let mut state = AgentState::default();
        let text = "All done.\n<task_summary>\nBuilt a landing page.\n</task_summary>";
        capture_task_summary(text, &mut state);
        assert_eq!(state.summary, text);
    }

    #[test]
    fn test_capture_ignores_plain_text() {
        let mut state = AgentState::default();
        capture_task_summary("Installing dependencies next.", &mut state);
        assert!(state.summary.is_empty());
    }

    #[test]
    fn test_extract_inner_text() {
        let text = "x <task_summary>\n  Created a todo app.\n</task_summary> y";
        assert_eq!(extract_task_summary(text), Some("Created a todo app."));
    }

    #[test]
    fn test_extract_unterminated_tag() {
        assert_eq!(
            extract_task_summary("<task_summary>Half written"),
            Some("Half written")
        );
        assert_eq!(extract_task_summary("<task_summary></task_summary>"), None);
        assert_eq!(extract_task_summary("no tag"), None);
    }
}
