#![forbid(unsafe_code)]

use kedit_apply::parse_identity;
use kedit_core::{DiffResult, DraftAccepted, ObjectIdentity, StoreError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Random tag carried by every async result so late answers for a closed
/// session can be told apart from the open one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub(crate) fn new() -> Self { Self(Uuid::new_v4()) }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Latest published snapshot of the remote object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Baseline {
    pub text: String,
    /// Identity supplied by the publisher; `None` means "parse it from `text`".
    pub identity: Option<ObjectIdentity>,
}

impl Baseline {
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let identity = parse_identity(&text);
        Self { text, identity }
    }

    pub fn with_identity(text: impl Into<String>, identity: Option<ObjectIdentity>) -> Self {
        Self { text: text.into(), identity }
    }

    pub fn resolved_identity(&self) -> Option<ObjectIdentity> {
        self.identity.clone().or_else(|| parse_identity(&self.text))
    }

    pub fn resource_version(&self) -> Option<String> {
        self.resolved_identity().and_then(|id| id.resource_version)
    }
}

/// How far the remote object has moved away from the session's baseline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DriftState {
    #[default]
    Clean,
    /// A background refresh published a different resourceVersion.
    SoftDrift { latest_version: String },
    /// The store rejected a write as stale. Sticky until reload.
    ForcedDrift { diff: Option<DiffResult>, current_version: Option<String> },
}

impl DriftState {
    pub fn is_drifted(&self) -> bool {
        !matches!(self, DriftState::Clean)
    }

    pub fn is_forced(&self) -> bool {
        matches!(self, DriftState::ForcedDrift { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Editing,
    Saving,
    Reloading,
}

/// A failed save as shown to the user. The draft is never touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveFailure {
    pub message: String,
    pub causes: Vec<String>,
}

impl std::fmt::Display for SaveFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)?;
        for c in &self.causes {
            write!(f, "\n  - {}", c)?;
        }
        Ok(())
    }
}

/// Results delivered back to the controller by its spawned tasks.
#[derive(Debug)]
pub(crate) enum EditUpdate {
    LintDue { session: SessionId, generation: u64 },
    SaveFinished { session: SessionId, text: String, result: Result<DraftAccepted, StoreError> },
    ReloadFetched { session: SessionId, result: Result<String, StoreError> },
    BaselineFetched { identity: ObjectIdentity, fallback: String, result: Result<String, StoreError> },
}

/// What changed after the controller absorbed an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditEvent {
    Linted { error: Option<String> },
    Committed { resource_version: String },
    Conflicted { current_version: Option<String> },
    SaveFailed(SaveFailure),
    Reloaded { resource_version: Option<String> },
    ReloadFailed { message: String },
    BaselineRefreshed { resource_version: Option<String> },
    /// The result belonged to a superseded timer or a closed session.
    Ignored,
}

/// Debounce timer for lint passes. Rescheduling aborts the pending task and
/// bumps the generation so an already-queued result is recognisably stale.
#[derive(Debug, Default)]
pub(crate) struct LintTimer {
    pub(crate) generation: u64,
    pub(crate) task: Option<JoinHandle<()>>,
}

impl LintTimer {
    pub(crate) fn supersede(&mut self) -> u64 {
        self.cancel();
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }

    pub(crate) fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Save or reload currently running for a session.
#[derive(Debug)]
pub(crate) struct InFlight {
    pub(crate) cancel: CancellationToken,
    pub(crate) task: JoinHandle<()>,
}

impl InFlight {
    pub(crate) fn abort(self) {
        self.cancel.cancel();
        self.task.abort();
    }
}
