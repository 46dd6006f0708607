//! kedit apply: draft validation, canonical YAML and bounded line diffs.
//! Everything here is pure; no I/O and no network.

#![forbid(unsafe_code)]

pub mod diff;
pub mod managed;
pub mod validate;

pub use diff::{diff_lines, diff_lines_bounded, DIFF_MAX_LINES};
pub use managed::visible_text;
pub use validate::{canonical_yaml, parse_identity, validate_draft, validate_draft_with, DraftError, DraftLimits, ValidatedDraft};
