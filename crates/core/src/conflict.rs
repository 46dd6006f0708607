//! Conflict payload codec.
//!
//! Store failures travel as plain strings. Structured failures are encoded as
//! `ObjectYAMLError:` followed by a JSON payload; decoding never fails loudly,
//! anything unrecognised simply yields `None`.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::diff::{DiffLine, DiffLineKind, DiffResult};

pub const ERROR_PREFIX: &str = "ObjectYAMLError:";

/// Payload `code` for an optimistic-concurrency failure.
pub const RESOURCE_VERSION_MISMATCH: &str = "ResourceVersionMismatch";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConflictCause {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl std::fmt::Display for ConflictCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = self.message.as_deref().or(self.reason.as_deref()).unwrap_or("unknown cause");
        match &self.field {
            Some(field) => write!(f, "{}: {}", field, msg),
            None => f.write_str(msg),
        }
    }
}

/// Diff line as it appears on the wire; line numbers may be missing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WireDiffLine {
    #[serde(rename = "type")]
    pub kind: DiffLineKind,
    #[serde(default)]
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_line_no: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right_line_no: Option<u32>,
}

impl From<&DiffLine> for WireDiffLine {
    fn from(l: &DiffLine) -> Self {
        Self { kind: l.kind, value: l.value.clone(), left_line_no: l.left_line_no, right_line_no: l.right_line_no }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConflictPayload {
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<Vec<WireDiffLine>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causes: Option<SmallVec<[ConflictCause; 4]>>,
}

impl ConflictPayload {
    pub fn is_version_mismatch(&self) -> bool {
        self.code == RESOURCE_VERSION_MISMATCH
    }

    /// Build a version-mismatch payload, attaching a diff when one was computed.
    pub fn version_mismatch(message: impl Into<String>, current_rv: Option<String>, diff: Option<&DiffResult>) -> Self {
        let (lines, truncated) = match diff {
            Some(d) if d.truncated => (None, Some(true)),
            Some(d) => (Some(d.lines.iter().map(WireDiffLine::from).collect()), None),
            None => (None, None),
        };
        Self {
            code: RESOURCE_VERSION_MISMATCH.to_string(),
            message: message.into(),
            diff: lines,
            truncated,
            current_resource_version: current_rv,
            causes: None,
        }
    }

    /// Map the payload's diff lines into a [`DiffResult`]; `None` when it carries none.
    pub fn to_diff_result(&self) -> Option<DiffResult> {
        let lines = self.diff.as_ref().filter(|l| !l.is_empty())?;
        Some(DiffResult {
            lines: lines
                .iter()
                .map(|l| DiffLine {
                    kind: l.kind,
                    value: l.value.clone(),
                    left_line_no: l.left_line_no,
                    right_line_no: l.right_line_no,
                })
                .collect(),
            truncated: false,
        })
    }

    /// Causes rendered one per entry, in payload order.
    pub fn cause_messages(&self) -> Vec<String> {
        self.causes.iter().flatten().map(|c| c.to_string()).collect()
    }
}

/// Recover a structured payload from a store error string.
pub fn decode_conflict(error_text: &str) -> Option<ConflictPayload> {
    let idx = error_text.find(ERROR_PREFIX)?;
    let json = error_text[idx + ERROR_PREFIX.len()..].trim();
    serde_json::from_str(json).ok()
}

pub fn encode_conflict(payload: &ConflictPayload) -> String {
    // Serializing plain strings/options into JSON cannot fail.
    let json = serde_json::to_string(payload).unwrap_or_else(|_| String::from("{}"));
    format!("{}{}", ERROR_PREFIX, json)
}
