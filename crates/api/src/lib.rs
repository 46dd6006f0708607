//! kedit object store façade.
//!
//! The edit session talks to the authoritative store only through
//! [`ObjectStore`]. `KubeStore` reaches a live cluster; `MockStore` is a
//! scriptable in-memory stand-in for tests.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use kedit_core::{encode_conflict, ConflictPayload, DraftAccepted, ObjectIdentity, StoreError};
use kube::api::{Api, PostParams};
use kube::core::DynamicObject;
use metrics::{counter, histogram};
use tracing::{info, warn};

pub type StoreResult<T> = Result<T, StoreError>;

/// Collaborator contract consumed by the edit session controller.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Serialized text of the current object; `NotFound` once it is gone.
    async fn fetch_current(&self, identity: &ObjectIdentity) -> StoreResult<String>;

    /// Check a draft without mutating anything. A success may report a newer
    /// resourceVersion than the one submitted.
    async fn validate_draft(&self, text: &str, identity: &ObjectIdentity, resource_version: &str) -> StoreResult<DraftAccepted>;

    /// Write a draft, guarded by `resource_version`.
    async fn apply_draft(&self, text: &str, identity: &ObjectIdentity, resource_version: &str) -> StoreResult<DraftAccepted>;
}

// ----------------- Kube implementation -----------------

/// Store backed by the current kube context. Writes are full replaces carrying
/// the resourceVersion, so the API server performs the compare-and-swap.
pub struct KubeStore {
    field_manager: String,
}

impl Default for KubeStore {
    fn default() -> Self { Self::new() }
}

impl KubeStore {
    pub fn new() -> Self {
        let field_manager = std::env::var("KEDIT_FIELD_MANAGER").unwrap_or_else(|_| "kedit".to_string());
        Self { field_manager }
    }

    async fn api(&self, identity: &ObjectIdentity) -> StoreResult<Api<DynamicObject>> {
        let client = kedit_kubehub::get_kube_client().await.map_err(|e| StoreError::Transport(format!("{:#}", e)))?;
        kedit_kubehub::api_for(client, identity).await.map_err(|e| StoreError::Transport(format!("{:#}", e)))
    }

    async fn write(&self, text: &str, identity: &ObjectIdentity, rv: &str, dry_run: bool) -> StoreResult<DraftAccepted> {
        let t0 = Instant::now();
        info!(object = %identity, rv = %rv, dry_run, "store: write start");
        let api = self.api(identity).await?;
        let mut obj: DynamicObject = serde_yaml::from_str(text).map_err(|e| StoreError::Remote(format!("invalid draft: {}", e)))?;
        obj.metadata.resource_version = Some(rv.to_string());
        let pp = PostParams { dry_run, field_manager: Some(self.field_manager.clone()) };
        let res = match api.replace(&identity.name, &pp, &obj).await {
            Ok(o) => Ok(DraftAccepted { resource_version: o.metadata.resource_version.unwrap_or_else(|| rv.to_string()) }),
            Err(kube::Error::Api(ae)) if ae.code == 409 && ae.reason == "Conflict" => {
                counter!("store_conflicts_total", 1u64);
                Err(self.conflict(&api, identity, text, ae.message).await)
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(StoreError::NotFound(ae.message)),
            Err(kube::Error::Api(ae)) => Err(StoreError::Remote(encode_conflict(&ConflictPayload {
                code: ae.reason,
                message: ae.message,
                ..Default::default()
            }))),
            Err(e) => Err(StoreError::Transport(e.to_string())),
        };
        histogram!("store_apply_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(took_ms = %t0.elapsed().as_millis(), ok = res.is_ok(), dry_run, "store: write done");
        res
    }

    /// Version-mismatch payload with the store's current version and a diff
    /// from the current canonical text to the submitted draft.
    async fn conflict(&self, api: &Api<DynamicObject>, identity: &ObjectIdentity, text: &str, message: String) -> StoreError {
        let current = match api.get_opt(&identity.name).await {
            Ok(Some(o)) => Some(o),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "store: refetch after conflict failed");
                None
            }
        };
        let rv = current.as_ref().and_then(|o| o.metadata.resource_version.clone());
        let diff = current
            .as_ref()
            .and_then(|o| kedit_kubehub::object_to_yaml(o).ok())
            .map(|y| kedit_apply::diff_lines(&kedit_apply::visible_text(&y, false), text));
        StoreError::Remote(encode_conflict(&ConflictPayload::version_mismatch(message, rv, diff.as_ref())))
    }
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn fetch_current(&self, identity: &ObjectIdentity) -> StoreResult<String> {
        let t0 = Instant::now();
        info!(object = %identity, "store: fetch start");
        let api = self.api(identity).await?;
        let obj = api
            .get_opt(&identity.name)
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?
            .ok_or_else(|| StoreError::NotFound(identity.to_string()))?;
        let text = kedit_kubehub::object_to_yaml(&obj).map_err(|e| StoreError::Transport(format!("{:#}", e)))?;
        info!(bytes = text.len(), took_ms = %t0.elapsed().as_millis(), "store: fetch ok");
        Ok(text)
    }

    async fn validate_draft(&self, text: &str, identity: &ObjectIdentity, resource_version: &str) -> StoreResult<DraftAccepted> {
        self.write(text, identity, resource_version, true).await
    }

    async fn apply_draft(&self, text: &str, identity: &ObjectIdentity, resource_version: &str) -> StoreResult<DraftAccepted> {
        self.write(text, identity, resource_version, false).await
    }
}

// ----------------- Mock implementation -----------------

/// A recorded call against [`MockStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Fetch { key: String },
    Validate { resource_version: String },
    Apply { resource_version: String, text: String },
}

/// Scripted store for tests. Queued results are consumed in order; an empty
/// validate queue accepts the submitted version, an empty apply queue fails.
#[derive(Default)]
pub struct MockStore {
    pub current: Mutex<Option<String>>,
    pub validate_results: Mutex<VecDeque<StoreResult<DraftAccepted>>>,
    pub apply_results: Mutex<VecDeque<StoreResult<DraftAccepted>>>,
    pub fetch_results: Mutex<VecDeque<StoreResult<String>>>,
    /// When set, `validate_draft` waits for a notification before answering.
    pub validate_gate: Mutex<Option<Arc<tokio::sync::Notify>>>,
    pub calls: Mutex<Vec<MockCall>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl MockStore {
    pub fn new() -> Self { Self::default() }

    pub fn with_current(self, text: impl Into<String>) -> Self {
        *lock(&self.current) = Some(text.into());
        self
    }

    pub fn set_current(&self, text: impl Into<String>) {
        *lock(&self.current) = Some(text.into());
    }

    pub fn push_validate(&self, res: StoreResult<DraftAccepted>) {
        lock(&self.validate_results).push_back(res);
    }

    pub fn push_apply(&self, res: StoreResult<DraftAccepted>) {
        lock(&self.apply_results).push_back(res);
    }

    pub fn push_fetch(&self, res: StoreResult<String>) {
        lock(&self.fetch_results).push_back(res);
    }

    pub fn gate_validate(&self) -> Arc<tokio::sync::Notify> {
        let gate = Arc::new(tokio::sync::Notify::new());
        *lock(&self.validate_gate) = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.calls).clone()
    }

    pub fn apply_count(&self) -> usize {
        self.calls().iter().filter(|c| matches!(c, MockCall::Apply { .. })).count()
    }
}

#[async_trait::async_trait]
impl ObjectStore for MockStore {
    async fn fetch_current(&self, identity: &ObjectIdentity) -> StoreResult<String> {
        lock(&self.calls).push(MockCall::Fetch { key: identity.key() });
        if let Some(res) = lock(&self.fetch_results).pop_front() {
            return res;
        }
        lock(&self.current).clone().ok_or_else(|| StoreError::NotFound(identity.to_string()))
    }

    async fn validate_draft(&self, _text: &str, _identity: &ObjectIdentity, resource_version: &str) -> StoreResult<DraftAccepted> {
        lock(&self.calls).push(MockCall::Validate { resource_version: resource_version.to_string() });
        let gate = lock(&self.validate_gate).clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let scripted = lock(&self.validate_results).pop_front();
        scripted.unwrap_or_else(|| Ok(DraftAccepted { resource_version: resource_version.to_string() }))
    }

    async fn apply_draft(&self, text: &str, _identity: &ObjectIdentity, resource_version: &str) -> StoreResult<DraftAccepted> {
        lock(&self.calls).push(MockCall::Apply { resource_version: resource_version.to_string(), text: text.to_string() });
        let scripted = lock(&self.apply_results).pop_front();
        scripted.unwrap_or_else(|| Err(StoreError::Remote("no apply configured".into())))
    }
}
