//! Line diff shapes shared by the diff engine, the conflict codec and frontends.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DiffLineKind {
    Context,
    Added,
    Removed,
}

/// One emitted line of an edit script.
///
/// `Removed` lines carry only a left line number, `Added` only a right one,
/// `Context` both. Numbers are 1-based.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiffLine {
    #[serde(rename = "type")]
    pub kind: DiffLineKind,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_line_no: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right_line_no: Option<u32>,
}

impl DiffLine {
    pub fn context(value: impl Into<String>, left: u32, right: u32) -> Self {
        Self { kind: DiffLineKind::Context, value: value.into(), left_line_no: Some(left), right_line_no: Some(right) }
    }

    pub fn removed(value: impl Into<String>, left: u32) -> Self {
        Self { kind: DiffLineKind::Removed, value: value.into(), left_line_no: Some(left), right_line_no: None }
    }

    pub fn added(value: impl Into<String>, right: u32) -> Self {
        Self { kind: DiffLineKind::Added, value: value.into(), left_line_no: None, right_line_no: Some(right) }
    }
}

/// Result of a bounded line diff. When `truncated` is set, `lines` is empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffResult {
    pub lines: Vec<DiffLine>,
    pub truncated: bool,
}

impl DiffResult {
    pub fn truncated() -> Self {
        Self { lines: Vec::new(), truncated: true }
    }

    pub fn has_changes(&self) -> bool {
        self.truncated || self.lines.iter().any(|l| l.kind != DiffLineKind::Context)
    }

    /// Count of `(added, removed)` lines.
    pub fn counts(&self) -> (usize, usize) {
        self.lines.iter().fold((0, 0), |(a, r), l| match l.kind {
            DiffLineKind::Added => (a + 1, r),
            DiffLineKind::Removed => (a, r + 1),
            DiffLineKind::Context => (a, r),
        })
    }

    /// Text of the left side, rebuilt from context and removed lines.
    pub fn left_text(&self) -> String {
        self.side(DiffLineKind::Removed)
    }

    /// Text of the right side, rebuilt from context and added lines.
    pub fn right_text(&self) -> String {
        self.side(DiffLineKind::Added)
    }

    fn side(&self, keep: DiffLineKind) -> String {
        let kept: Vec<&str> = self
            .lines
            .iter()
            .filter(|l| l.kind == DiffLineKind::Context || l.kind == keep)
            .map(|l| l.value.as_str())
            .collect();
        kept.join("\n")
    }
}
