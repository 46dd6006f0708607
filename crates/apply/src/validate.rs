//! Identity extraction and draft validation.

use std::borrow::Cow;

use kedit_core::{ObjectIdentity, CLUSTER_SCOPE};
use metrics::counter;
use serde::Deserialize;
use serde_yaml::Value;
use tracing::debug;

/// Size guards applied before and right after parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DraftLimits {
    pub max_bytes: usize,
    pub max_nodes: usize,
}

impl Default for DraftLimits {
    fn default() -> Self {
        Self { max_bytes: 1_000_000, max_nodes: 100_000 }
    }
}

impl DraftLimits {
    /// `KEDIT_MAX_YAML_BYTES` / `KEDIT_MAX_YAML_NODES`, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let num = |k: &str| get(k).and_then(|s| s.trim().parse::<usize>().ok());
        Self {
            max_bytes: num("KEDIT_MAX_YAML_BYTES").unwrap_or(d.max_bytes),
            max_nodes: num("KEDIT_MAX_YAML_NODES").unwrap_or(d.max_nodes),
        }
    }
}

/// Validator failures. `Display` is the message shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DraftError {
    #[error("YAML content is required")]
    Empty,
    #[error("YAML payload too large (>{0} bytes)")]
    TooLarge(usize),
    #[error("multiple YAML documents are not supported; edit one object at a time")]
    MultipleDocuments,
    #[error("no YAML document found")]
    NoDocument,
    #[error("{}", parse_message(.line, .column, .message))]
    Parse { line: Option<usize>, column: Option<usize>, message: String },
    #[error("YAML root must be a mapping")]
    NotMapping,
    #[error("YAML document too complex (>{0} nodes)")]
    TooComplex(usize),
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("kind List is not supported; edit one object at a time")]
    ListKind,
    #[error("{field} mismatch: expected {expected}, found {found}")]
    Mismatch { field: &'static str, expected: String, found: String },
    #[error("metadata.resourceVersion is required")]
    MissingResourceVersion,
    #[error("metadata.resourceVersion must be a quoted string, found {0}")]
    NonStringResourceVersion(String),
    #[error("metadata.resourceVersion {found} differs from the value when edit mode began ({expected}); reload first")]
    StaleResourceVersion { expected: String, found: String },
    #[error("serializing YAML: {0}")]
    Serialize(String),
}

fn parse_message(line: &Option<usize>, column: &Option<usize>, message: &str) -> String {
    match (line, column) {
        (Some(l), Some(c)) => format!("YAML parse error at line {}, column {}: {}", l, c, message),
        (Some(l), None) => format!("YAML parse error at line {}: {}", l, message),
        _ => format!("YAML parse error: {}", message),
    }
}

/// Canonical form of an accepted draft plus its concurrency token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedDraft {
    pub normalized_text: String,
    pub resource_version: String,
}

/// Extract the identity of a single-document object. Anything unparsable,
/// non-mapping or missing `apiVersion`/`kind`/`metadata.name` yields `None`.
pub fn parse_identity(text: &str) -> Option<ObjectIdentity> {
    let value = single_document(text).ok()?;
    identity_of(&value)
}

/// Check a draft against structure and identity rules. First failure wins.
pub fn validate_draft(
    draft: &str,
    expected: Option<&ObjectIdentity>,
    baseline_version: Option<&str>,
) -> Result<ValidatedDraft, DraftError> {
    validate_draft_with(draft, expected, baseline_version, &DraftLimits::from_env())
}

/// [`validate_draft`] with explicit size guards.
pub fn validate_draft_with(
    draft: &str,
    expected: Option<&ObjectIdentity>,
    baseline_version: Option<&str>,
    limits: &DraftLimits,
) -> Result<ValidatedDraft, DraftError> {
    counter!("draft_validate_total", 1u64);
    let res = check_draft(draft, expected, baseline_version, limits);
    if let Err(e) = &res {
        counter!("draft_validate_err", 1u64);
        debug!(error = %e, "validate: draft rejected");
    }
    res
}

fn check_draft(
    draft: &str,
    expected: Option<&ObjectIdentity>,
    baseline_version: Option<&str>,
    limits: &DraftLimits,
) -> Result<ValidatedDraft, DraftError> {
    if draft.trim().is_empty() {
        return Err(DraftError::Empty);
    }
    if draft.len() > limits.max_bytes {
        return Err(DraftError::TooLarge(limits.max_bytes));
    }
    let value = single_document(draft)?;
    if !matches!(value, Value::Mapping(_)) {
        return Err(DraftError::NotMapping);
    }
    if node_budget_exceeded(&value, limits.max_nodes) {
        return Err(DraftError::TooComplex(limits.max_nodes));
    }

    let api_version = str_field(&value, &["apiVersion"]).ok_or(DraftError::MissingField("apiVersion"))?;
    let kind = str_field(&value, &["kind"]).ok_or(DraftError::MissingField("kind"))?;
    let name = str_field(&value, &["metadata", "name"]).ok_or(DraftError::MissingField("metadata.name"))?;
    if kind == "List" {
        return Err(DraftError::ListKind);
    }

    if let Some(exp) = expected {
        let namespace = str_field(&value, &["metadata", "namespace"]).unwrap_or(CLUSTER_SCOPE);
        let checks = [
            ("apiVersion", exp.api_version.as_str(), api_version),
            ("kind", exp.kind.as_str(), kind),
            ("metadata.name", exp.name.as_str(), name),
            ("metadata.namespace", exp.scope(), namespace),
        ];
        for (field, want, got) in checks {
            if want != got {
                return Err(DraftError::Mismatch { field, expected: want.to_string(), found: got.to_string() });
            }
        }
    }

    let resource_version = match lookup(&value, &["metadata", "resourceVersion"]) {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(v @ (Value::Number(_) | Value::Bool(_))) => {
            return Err(DraftError::NonStringResourceVersion(scalar_text(v)))
        }
        _ => return Err(DraftError::MissingResourceVersion),
    };
    if let Some(base) = baseline_version.filter(|b| !b.trim().is_empty()) {
        if base != resource_version {
            return Err(DraftError::StaleResourceVersion { expected: base.to_string(), found: resource_version });
        }
    }

    let normalized_text = canonical_yaml(value)?;
    Ok(ValidatedDraft { normalized_text, resource_version })
}

/// Parse exactly one YAML document.
fn single_document(text: &str) -> Result<Value, DraftError> {
    let mut found: Option<Value> = None;
    for (idx, doc) in serde_yaml::Deserializer::from_str(text).enumerate() {
        if idx > 0 {
            return Err(DraftError::MultipleDocuments);
        }
        found = Some(Value::deserialize(doc).map_err(parse_error)?);
    }
    match found {
        Some(Value::Null) if !has_content(text) => Err(DraftError::NoDocument),
        Some(v) => Ok(v),
        None => Err(DraftError::NoDocument),
    }
}

/// True when some line is more than a comment or document marker.
fn has_content(text: &str) -> bool {
    text.lines().map(str::trim).any(|l| !(l.is_empty() || l.starts_with('#') || l == "---" || l == "..."))
}

fn parse_error(e: serde_yaml::Error) -> DraftError {
    let text = e.to_string();
    match e.location() {
        Some(loc) => {
            // the position is rendered by `Display`; keep it out of the message
            let suffix = format!(" at line {} column {}", loc.line(), loc.column());
            DraftError::Parse {
                line: Some(loc.line()),
                column: Some(loc.column()),
                message: text.replacen(&suffix, "", 1),
            }
        }
        None => DraftError::Parse { line: None, column: None, message: text },
    }
}

fn identity_of(value: &Value) -> Option<ObjectIdentity> {
    if !matches!(value, Value::Mapping(_)) {
        return None;
    }
    Some(ObjectIdentity {
        api_version: str_field(value, &["apiVersion"])?.to_string(),
        kind: str_field(value, &["kind"])?.to_string(),
        name: str_field(value, &["metadata", "name"])?.to_string(),
        namespace: str_field(value, &["metadata", "namespace"]).map(|s| s.to_string()),
        resource_version: str_field(value, &["metadata", "resourceVersion"]).map(|s| s.to_string()),
    })
}

fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |cur, key| cur.get(*key))
}

/// Non-blank string at `path`.
fn str_field<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    match lookup(value, path)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.as_str()),
        _ => None,
    }
}

fn scalar_text(v: &Value) -> String {
    match v {
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => format!("{:?}", other),
    }
}

fn node_budget_exceeded(v: &Value, max: usize) -> bool {
    // Keep a running counter and bail early when exceeding max
    fn walk(v: &Value, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Value::Mapping(map) => {
                for (_k, vv) in map.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Value::Sequence(seq) => {
                for vv in seq.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Value::Tagged(t) => walk(&t.value, cur, max),
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Reserialize with mapping keys sorted at every level.
pub fn canonical_yaml(value: Value) -> Result<String, DraftError> {
    serde_yaml::to_string(&sorted(value)).map_err(|e| DraftError::Serialize(e.to_string()))
}

fn sorted(v: Value) -> Value {
    match v {
        Value::Mapping(m) => {
            let mut entries: Vec<(Value, Value)> = m.into_iter().map(|(k, v)| (k, sorted(v))).collect();
            entries.sort_by(|a, b| key_order(&a.0).cmp(&key_order(&b.0)));
            Value::Mapping(entries.into_iter().collect())
        }
        Value::Sequence(seq) => Value::Sequence(seq.into_iter().map(sorted).collect()),
        Value::Tagged(mut t) => {
            t.value = sorted(std::mem::replace(&mut t.value, Value::Null));
            Value::Tagged(t)
        }
        other => other,
    }
}

fn key_order(k: &Value) -> Cow<'_, str> {
    match k {
        Value::String(s) => Cow::Borrowed(s.as_str()),
        other => Cow::Owned(serde_yaml::to_string(other).unwrap_or_default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEPLOY: &str = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n  namespace: prod\n  resourceVersion: \"42\"\nspec:\n  replicas: 2\n";

    fn expected() -> ObjectIdentity {
        parse_identity(DEPLOY).unwrap()
    }

    #[test]
    fn parse_identity_reads_fields() {
        let id = expected();
        assert_eq!(id.api_version, "apps/v1");
        assert_eq!(id.kind, "Deployment");
        assert_eq!(id.name, "web");
        assert_eq!(id.namespace.as_deref(), Some("prod"));
        assert_eq!(id.resource_version.as_deref(), Some("42"));
    }

    #[test]
    fn parse_identity_is_lenient_with_bad_input() {
        assert!(parse_identity("").is_none());
        assert!(parse_identity("key: [unclosed").is_none());
        assert!(parse_identity("- a\n- b\n").is_none());
        assert!(parse_identity("apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n").is_none());
        assert!(parse_identity(&format!("{}---\n{}", DEPLOY, DEPLOY)).is_none());
    }

    #[test]
    fn parse_identity_normalizes_blank_optionals() {
        let id = parse_identity("apiVersion: v1\nkind: Namespace\nmetadata:\n  name: x\n  namespace: '  '\n  resourceVersion: ''\n").unwrap();
        assert_eq!(id.namespace, None);
        assert_eq!(id.resource_version, None);
    }

    #[test]
    fn empty_draft_is_rejected() {
        assert_eq!(validate_draft("  \n", None, None).unwrap_err(), DraftError::Empty);
    }

    #[test]
    fn multiple_documents_are_rejected_regardless_of_content() {
        let two = "a: 1\n---\nb: 2\n";
        let e = validate_draft(two, None, None).unwrap_err();
        assert!(e.to_string().contains("multiple YAML documents"), "e={}", e);
        let two_objects = format!("{}---\n{}", DEPLOY, DEPLOY);
        let e = validate_draft(&two_objects, Some(&expected()), Some("42")).unwrap_err();
        assert_eq!(e, DraftError::MultipleDocuments);
    }

    #[test]
    fn parse_errors_carry_line_numbers() {
        let bad = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: [x\n";
        match validate_draft(bad, None, None).unwrap_err() {
            DraftError::Parse { line, .. } => assert!(line.is_some()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parse_position_is_one_based() {
        let bad = "apiVersion: v1\nkind: ConfigMap\nkey: x: y\n";
        let e = validate_draft(bad, None, None).unwrap_err();
        match &e {
            DraftError::Parse { line, column, .. } => {
                assert_eq!(*line, Some(3));
                assert_eq!(*column, Some(7));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(e.to_string().starts_with("YAML parse error at line 3, column 7: "), "e={}", e);
    }

    #[test]
    fn parse_message_states_position_once() {
        let e = validate_draft("apiVersion: v1\nkind: ConfigMap\nkey: x: y\n", None, None).unwrap_err();
        let msg = e.to_string();
        assert_eq!(msg.matches("line 3").count(), 1, "msg={}", msg);
        assert!(!msg.contains("at line 3 column 7"), "msg={}", msg);
    }

    #[test]
    fn comment_only_draft_has_no_document() {
        let only_comments = "# nothing here\n\n  # still nothing\n";
        assert_eq!(validate_draft(only_comments, None, None).unwrap_err(), DraftError::NoDocument);
        assert!(parse_identity(only_comments).is_none());
        // an explicit null is content, not an absent document
        assert_eq!(validate_draft("~\n", None, None).unwrap_err(), DraftError::NotMapping);
    }

    #[test]
    fn byte_guard_runs_before_parsing() {
        let limits = DraftLimits { max_bytes: 32, max_nodes: 1_000 };
        let e = validate_draft_with(DEPLOY, Some(&expected()), Some("42"), &limits).unwrap_err();
        assert_eq!(e, DraftError::TooLarge(32));
        // unparsable input still trips the byte guard first
        let junk = format!("{}: [", "k".repeat(64));
        assert_eq!(validate_draft_with(&junk, None, None, &limits).unwrap_err(), DraftError::TooLarge(32));
    }

    #[test]
    fn node_guard_runs_before_field_checks() {
        let limits = DraftLimits { max_bytes: 1_000_000, max_nodes: 5 };
        let e = validate_draft_with(DEPLOY, Some(&expected()), Some("42"), &limits).unwrap_err();
        assert_eq!(e, DraftError::TooComplex(5));
        // missing apiVersion is not reported while the guard trips
        let no_api = "kind: Foo\nmetadata: {name: x, labels: {a: b, c: d}}\n";
        assert_eq!(validate_draft_with(no_api, None, None, &limits).unwrap_err(), DraftError::TooComplex(5));
        let roomy = DraftLimits::default();
        assert!(validate_draft_with(DEPLOY, Some(&expected()), Some("42"), &roomy).is_ok());
    }

    #[test]
    fn limits_read_overrides_and_ignore_garbage() {
        let limits = DraftLimits::from_lookup(|k| match k {
            "KEDIT_MAX_YAML_BYTES" => Some(" 2048 ".into()),
            "KEDIT_MAX_YAML_NODES" => Some("lots".into()),
            _ => None,
        });
        assert_eq!(limits, DraftLimits { max_bytes: 2048, max_nodes: 100_000 });
        assert_eq!(DraftLimits::from_lookup(|_| None), DraftLimits::default());
    }

    #[test]
    fn root_must_be_mapping() {
        assert_eq!(validate_draft("- a\n- b\n", None, None).unwrap_err(), DraftError::NotMapping);
        assert_eq!(validate_draft("just text", None, None).unwrap_err(), DraftError::NotMapping);
    }

    #[test]
    fn required_fields_in_order() {
        let e = validate_draft("kind: Foo\nmetadata:\n  name: x\n", None, None).unwrap_err();
        assert_eq!(e.to_string(), "apiVersion is required");
        let e = validate_draft("apiVersion: v1\nmetadata:\n  name: x\n", None, None).unwrap_err();
        assert_eq!(e.to_string(), "kind is required");
        let e = validate_draft("apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n", None, None).unwrap_err();
        assert_eq!(e.to_string(), "metadata.name is required");
    }

    #[test]
    fn list_kind_always_rejected() {
        let list = "apiVersion: v1\nkind: List\nmetadata:\n  name: x\n  resourceVersion: '1'\nitems: []\n";
        let exp = parse_identity(list).unwrap();
        assert_eq!(validate_draft(list, Some(&exp), Some("1")).unwrap_err(), DraftError::ListKind);
    }

    #[test]
    fn kind_mismatch_names_expected_and_found() {
        let mut exp = expected();
        exp.kind = "StatefulSet".into();
        let e = validate_draft(DEPLOY, Some(&exp), None).unwrap_err();
        let msg = e.to_string();
        assert!(msg.contains("kind mismatch"), "msg={}", msg);
        assert!(msg.contains("StatefulSet") && msg.contains("Deployment"), "msg={}", msg);
    }

    #[test]
    fn namespace_defaults_to_cluster_scope_on_both_sides() {
        let cm = "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: team\n  resourceVersion: '5'\n";
        let exp = parse_identity(cm).unwrap();
        assert!(validate_draft(cm, Some(&exp), Some("5")).is_ok());
        let moved = cm.replace("  name: team\n", "  name: team\n  namespace: other\n");
        let e = validate_draft(&moved, Some(&exp), Some("5")).unwrap_err();
        assert!(e.to_string().starts_with("metadata.namespace mismatch"), "e={}", e);
    }

    #[test]
    fn resource_version_is_required() {
        let draft = DEPLOY.replace("  resourceVersion: \"42\"\n", "");
        let e = validate_draft(&draft, Some(&expected()), None).unwrap_err();
        assert!(e.to_string().contains("resourceVersion is required"), "e={}", e);
    }

    #[test]
    fn stale_version_against_baseline() {
        let draft = DEPLOY.replace("\"42\"", "\"43\"");
        let e = validate_draft(&draft, Some(&expected()), Some("42")).unwrap_err();
        assert!(e.to_string().contains("differs from the value when edit mode began"), "e={}", e);
    }

    #[test]
    fn unquoted_version_token_is_rejected() {
        let hex = DEPLOY.replace("\"42\"", "0x2A");
        let e = validate_draft(&hex, None, Some("42")).unwrap_err();
        assert!(matches!(e, DraftError::NonStringResourceVersion(_)), "e={:?}", e);
        assert!(e.to_string().contains("must be a quoted string"), "e={}", e);
        let plain = DEPLOY.replace("\"42\"", "42");
        assert_eq!(
            validate_draft(&plain, None, None).unwrap_err(),
            DraftError::NonStringResourceVersion("42".into())
        );
        assert_eq!(parse_identity(&plain).unwrap().resource_version, None);
        // quoted tokens are kept verbatim
        let quoted = DEPLOY.replace("\"42\"", "\"0x2A\"");
        assert_eq!(validate_draft(&quoted, None, Some("0x2A")).unwrap().resource_version, "0x2A");
    }

    #[test]
    fn success_is_canonical_and_idempotent() {
        let shuffled = "metadata:\n  resourceVersion: \"42\"\n  namespace: prod\n  name: web\nspec: {replicas: 2}\nkind: Deployment\napiVersion: apps/v1\n";
        let exp = expected();
        let a = validate_draft(shuffled, Some(&exp), Some("42")).unwrap();
        let b = validate_draft(DEPLOY, Some(&exp), Some("42")).unwrap();
        assert_eq!(a, b);
        assert!(a.normalized_text.starts_with("apiVersion: apps/v1\nkind: Deployment\n"));
        let again = validate_draft(&a.normalized_text, Some(&exp), Some("42")).unwrap();
        assert_eq!(again, a);
        assert_eq!(parse_identity(&a.normalized_text), Some(exp));
    }

    #[test]
    fn node_budget_counts_nested_values() {
        let v: Value = serde_yaml::from_str("a: [1, 2, 3]\nb: {c: d}\n").unwrap();
        assert!(node_budget_exceeded(&v, 4));
        assert!(!node_budget_exceeded(&v, 100));
    }
}
