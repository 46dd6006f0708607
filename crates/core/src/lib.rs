//! kedit core types: object identity, diff shapes, collaborator errors.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod conflict;
pub mod diff;

pub use conflict::{decode_conflict, encode_conflict, ConflictCause, ConflictPayload, WireDiffLine};
pub use diff::{DiffLine, DiffLineKind, DiffResult};

/// Placeholder used when comparing the namespace of cluster-scoped objects.
pub const CLUSTER_SCOPE: &str = "<cluster>";

/// Names one generation of a remote object.
///
/// `resource_version` is an opaque store token: only equality is meaningful.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ObjectIdentity {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub resource_version: Option<String>,
}

impl ObjectIdentity {
    /// Namespace with cluster-scoped objects mapped to [`CLUSTER_SCOPE`].
    pub fn scope(&self) -> &str {
        self.namespace.as_deref().unwrap_or(CLUSTER_SCOPE)
    }

    /// Version-independent key: `apiVersion/kind/scope/name`.
    pub fn key(&self) -> String {
        format!("{}/{}/{}/{}", self.api_version, self.kind, self.scope(), self.name)
    }

    /// True when both identities address the same object, ignoring the version token.
    pub fn same_object(&self, other: &ObjectIdentity) -> bool {
        self.api_version == other.api_version
            && self.kind == other.kind
            && self.name == other.name
            && self.scope() == other.scope()
    }

    /// Split `apiVersion` into `(group, version)`; core kinds have an empty group.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", self.api_version.as_str()),
        }
    }

    pub fn with_resource_version(mut self, rv: Option<String>) -> Self {
        self.resource_version = rv;
        self
    }
}

impl std::fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Failures reported by the object store collaborator.
///
/// `Remote` carries the store's message verbatim; it may embed a structured
/// payload behind the [`conflict::ERROR_PREFIX`].
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum StoreError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Remote(String),
    #[error("transport: {0}")]
    Transport(String),
}

/// Accepted draft as reported by `ValidateDraft` / `ApplyDraft`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DraftAccepted {
    pub resource_version: String,
}

pub mod prelude {
    pub use super::{
        ConflictPayload, DiffLine, DiffLineKind, DiffResult, DraftAccepted, ObjectIdentity, StoreError,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(ns: Option<&str>, rv: Option<&str>) -> ObjectIdentity {
        ObjectIdentity {
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
            name: "web".into(),
            namespace: ns.map(|s| s.to_string()),
            resource_version: rv.map(|s| s.to_string()),
        }
    }

    #[test]
    fn same_object_ignores_version_token() {
        assert!(ident(Some("prod"), Some("1")).same_object(&ident(Some("prod"), Some("2"))));
        assert!(!ident(Some("prod"), None).same_object(&ident(None, None)));
    }

    #[test]
    fn key_and_group_version() {
        let id = ident(None, None);
        assert_eq!(id.key(), "apps/v1/Deployment/<cluster>/web");
        assert_eq!(id.group_version(), ("apps", "v1"));
        let core = ObjectIdentity { api_version: "v1".into(), ..id };
        assert_eq!(core.group_version(), ("", "v1"));
    }
}
