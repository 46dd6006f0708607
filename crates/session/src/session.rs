use kedit_core::ObjectIdentity;

use crate::model::{DriftState, InFlight, LintTimer, SaveFailure, SessionId, SessionPhase};

/// State of one open edit. Owned by the controller; dropping it cancels any
/// pending lint timer and in-flight save or reload.
#[derive(Debug)]
pub struct EditSession {
    pub(crate) id: SessionId,
    pub(crate) draft: String,
    pub(crate) baseline_identity: ObjectIdentity,
    pub(crate) baseline_version: Option<String>,
    pub(crate) compare_version: Option<String>,
    pub(crate) drift: DriftState,
    pub(crate) lint_error: Option<String>,
    pub(crate) save_error: Option<SaveFailure>,
    pub(crate) phase: SessionPhase,
    pub(crate) lint: LintTimer,
    pub(crate) inflight: Option<InFlight>,
    /// Baseline sequence number when the current reload started.
    pub(crate) reload_mark: u64,
}

impl EditSession {
    pub(crate) fn start(identity: ObjectIdentity, draft: String) -> Self {
        let version = identity.resource_version.clone();
        Self {
            id: SessionId::new(),
            draft,
            baseline_identity: identity,
            baseline_version: version.clone(),
            compare_version: version,
            drift: DriftState::Clean,
            lint_error: None,
            save_error: None,
            phase: SessionPhase::Editing,
            lint: LintTimer::default(),
            inflight: None,
            reload_mark: 0,
        }
    }

    /// Move the concurrency anchor to a freshly fetched revision.
    pub(crate) fn rebase(&mut self, identity: ObjectIdentity, draft: String) {
        self.lint.cancel();
        self.baseline_version = identity.resource_version.clone();
        self.compare_version = self.baseline_version.clone();
        self.baseline_identity = identity;
        self.draft = draft;
        self.drift = DriftState::Clean;
        self.lint_error = None;
        self.save_error = None;
    }

    pub(crate) fn finish_inflight(&mut self) {
        self.inflight = None;
        self.phase = SessionPhase::Editing;
    }

    pub fn id(&self) -> SessionId { self.id }
    pub fn draft(&self) -> &str { &self.draft }
    pub fn baseline_identity(&self) -> &ObjectIdentity { &self.baseline_identity }

    /// Version captured when the session began (or at the last reload).
    pub fn baseline_version(&self) -> Option<&str> { self.baseline_version.as_deref() }

    /// Version the next save is measured against. Moves to the store's
    /// current version after a conflict; the captured baseline does not.
    pub fn compare_version(&self) -> Option<&str> { self.compare_version.as_deref() }

    pub fn drift(&self) -> &DriftState { &self.drift }
    pub fn lint_error(&self) -> Option<&str> { self.lint_error.as_deref() }
    pub fn save_error(&self) -> Option<&SaveFailure> { self.save_error.as_ref() }
    pub fn phase(&self) -> SessionPhase { self.phase }
    pub fn is_saving(&self) -> bool { self.phase == SessionPhase::Saving }
}

impl Drop for EditSession {
    fn drop(&mut self) {
        self.lint.cancel();
        if let Some(inflight) = self.inflight.take() {
            inflight.abort();
        }
    }
}
