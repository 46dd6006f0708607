//! Managed-field visibility for seeded drafts.

use serde_yaml::Value;

use crate::validate::canonical_yaml;

/// Canonical text of a snapshot with `metadata.managedFields` dropped unless
/// `show_managed`. Text that does not parse as a single mapping is returned as is.
pub fn visible_text(text: &str, show_managed: bool) -> String {
    let mut value = match serde_yaml::from_str::<Value>(text) {
        Ok(v @ Value::Mapping(_)) => v,
        _ => return text.to_string(),
    };
    if !show_managed {
        if let Some(meta) = value.get_mut("metadata").and_then(|m| m.as_mapping_mut()) {
            meta.remove("managedFields");
        }
    }
    canonical_yaml(value).unwrap_or_else(|_| text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIVE: &str = "kind: ConfigMap\napiVersion: v1\nmetadata:\n  name: x\n  managedFields:\n  - manager: kubectl\n    operation: Update\n  resourceVersion: '9'\ndata:\n  k: v\n";

    #[test]
    fn hides_managed_fields_by_default() {
        let out = visible_text(LIVE, false);
        assert!(!out.contains("managedFields"));
        assert!(out.starts_with("apiVersion: v1\n"));
        assert!(out.contains("resourceVersion"));
    }

    #[test]
    fn keeps_managed_fields_when_asked() {
        let out = visible_text(LIVE, true);
        assert!(out.contains("managedFields"));
        assert!(out.contains("manager: kubectl"));
    }

    #[test]
    fn unparsable_text_passes_through() {
        assert_eq!(visible_text("a: [", false), "a: [");
        assert_eq!(visible_text("- 1\n- 2\n", false), "- 1\n- 2\n");
    }
}
