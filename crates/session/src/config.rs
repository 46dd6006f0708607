use std::time::Duration;

use kedit_apply::DIFF_MAX_LINES;

/// Knobs for the edit session controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditConfig {
    /// Quiet period after the last keystroke before the draft is linted.
    pub lint_debounce: Duration,
    /// Line budget for drift diffs computed locally.
    pub diff_max_lines: usize,
    /// Keep `metadata.managedFields` in seeded drafts.
    pub show_managed_fields: bool,
    /// Record committed edits in the journal (when one is attached).
    pub journal_enabled: bool,
}

impl Default for EditConfig {
    fn default() -> Self {
        Self {
            lint_debounce: Duration::from_millis(200),
            diff_max_lines: DIFF_MAX_LINES,
            show_managed_fields: false,
            journal_enabled: true,
        }
    }
}

impl EditConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let lint_debounce = std::env::var("KEDIT_LINT_DEBOUNCE_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(d.lint_debounce);
        let diff_max_lines = std::env::var("KEDIT_DIFF_MAX_LINES")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(d.diff_max_lines);
        let show_managed_fields = env_flag("KEDIT_SHOW_MANAGED_FIELDS").unwrap_or(d.show_managed_fields);
        let journal_enabled = !env_flag("KEDIT_DISABLE_JOURNAL").unwrap_or(false);
        Self { lint_debounce, diff_max_lines, show_managed_fields, journal_enabled }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}
