//! kedit edit sessions.
//!
//! The controller owns at most one [`EditSession`] for the object it watches.
//! It runs on a single thread of control: operations that reach the store are
//! spawned onto tokio and report back through an internal channel, drained
//! with [`EditController::pump`] / [`EditController::try_pump`]. Every result
//! is tagged with the session it belongs to and dropped if that session has
//! since closed.

#![forbid(unsafe_code)]

use std::sync::Arc;

use kedit_api::ObjectStore;
use kedit_apply::{diff_lines_bounded, parse_identity, validate_draft, visible_text, DraftError};
use kedit_core::{decode_conflict, DiffResult, DraftAccepted, ObjectIdentity, StoreError};
use kedit_persist::{CommittedEdit, EditJournal};
use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod config;
mod model;
mod session;
mod tasks;

pub use config::EditConfig;
pub use model::{Baseline, DriftState, EditEvent, SaveFailure, SessionId, SessionPhase};
pub use session::EditSession;

use model::{EditUpdate, InFlight};

/// Rejections raised synchronously by controller operations.
#[derive(Debug, thiserror::Error)]
pub enum EditError {
    #[error("not in edit mode")]
    NotEditing,
    #[error("cannot resolve the object identity; edit mode is unavailable")]
    IdentityUnresolved,
    #[error("the object changed since edit mode began; reload before saving")]
    DriftDetected,
    #[error("a save or reload is already in progress")]
    Busy,
    #[error(transparent)]
    Invalid(#[from] DraftError),
}

pub struct EditController {
    store: Arc<dyn ObjectStore>,
    cfg: EditConfig,
    journal: Option<Arc<dyn EditJournal>>,
    latest: Option<Baseline>,
    /// Bumped on every observed baseline.
    baseline_seq: u64,
    session: Option<EditSession>,
    status: String,
    updates_tx: mpsc::UnboundedSender<EditUpdate>,
    updates_rx: mpsc::UnboundedReceiver<EditUpdate>,
}

impl EditController {
    pub fn new(store: Arc<dyn ObjectStore>, cfg: EditConfig) -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Self { store, cfg, journal: None, latest: None, baseline_seq: 0, session: None, status: String::new(), updates_tx, updates_rx }
    }

    pub fn with_journal(mut self, journal: Arc<dyn EditJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn config(&self) -> &EditConfig { &self.cfg }
    pub fn latest(&self) -> Option<&Baseline> { self.latest.as_ref() }
    pub fn session(&self) -> Option<&EditSession> { self.session.as_ref() }
    pub fn is_editing(&self) -> bool { self.session.is_some() }
    pub fn status(&self) -> &str { &self.status }

    /// Absorb a snapshot published by the background refresher.
    ///
    /// While editing, a resourceVersion different from the comparison version
    /// marks the session as drifted; a snapshot naming a different object
    /// closes the session.
    pub fn observe_baseline(&mut self, baseline: Baseline) {
        let identity = baseline.resolved_identity();
        let latest_rv = identity.as_ref().and_then(|id| id.resource_version.clone());
        self.baseline_seq = self.baseline_seq.wrapping_add(1);
        let scope_lost = match (&self.session, &identity) {
            (Some(s), Some(id)) => !id.same_object(&s.baseline_identity),
            _ => false,
        };
        self.latest = Some(baseline);
        if scope_lost {
            info!("session: baseline names another object; closing edit session");
            self.exit();
            return;
        }
        let Some(s) = self.session.as_mut() else { return };
        if s.drift.is_forced() {
            return;
        }
        if let (Some(latest), Some(cmp)) = (latest_rv, s.compare_version.as_deref()) {
            if latest != cmp {
                if !s.drift.is_drifted() {
                    counter!("session_drift_detected", 1u64);
                    info!(session = %s.id, base = %cmp, latest = %latest, "session: drift detected");
                }
                s.drift = DriftState::SoftDrift { latest_version: latest };
            }
        }
    }

    /// Open an edit session on the latest baseline.
    pub fn enter_edit(&mut self) -> Result<(), EditError> {
        if self.session.is_some() {
            return Ok(());
        }
        let latest = self.latest.as_ref().ok_or(EditError::IdentityUnresolved)?;
        let identity = latest.resolved_identity().ok_or(EditError::IdentityUnresolved)?;
        let draft = visible_text(&latest.text, self.cfg.show_managed_fields);
        let s = EditSession::start(identity, draft);
        info!(session = %s.id, object = %s.baseline_identity, rv = ?s.baseline_version, "session: edit mode entered");
        self.status = "editing".into();
        self.session = Some(s);
        Ok(())
    }

    /// Replace the draft and (re)arm the debounced lint.
    pub fn update_draft(&mut self, text: impl Into<String>) -> Result<(), EditError> {
        let s = self.session.as_mut().ok_or(EditError::NotEditing)?;
        s.draft = text.into();
        let generation = s.lint.supersede();
        s.lint.task = Some(tasks::spawn_lint_timer(self.updates_tx.clone(), s.id, generation, self.cfg.lint_debounce));
        Ok(())
    }

    /// Validate locally, then validate and apply remotely in the background.
    pub fn save(&mut self) -> Result<(), EditError> {
        let s = self.session.as_mut().ok_or(EditError::NotEditing)?;
        if s.phase != SessionPhase::Editing {
            return Err(EditError::Busy);
        }
        if s.drift.is_drifted() {
            return Err(EditError::DriftDetected);
        }
        counter!("session_save_attempts", 1u64);
        let validated = match validate_draft(&s.draft, Some(&s.baseline_identity), s.compare_version.as_deref()) {
            Ok(v) => v,
            Err(e) => {
                info!(session = %s.id, error = %e, "session: save blocked by local validation");
                s.lint_error = Some(e.to_string());
                s.save_error = Some(SaveFailure { message: e.to_string(), causes: Vec::new() });
                return Err(e.into());
            }
        };
        s.save_error = None;
        s.phase = SessionPhase::Saving;
        let cancel = CancellationToken::new();
        let task = tasks::spawn_save(
            self.updates_tx.clone(),
            self.store.clone(),
            s.id,
            s.baseline_identity.clone(),
            validated.normalized_text,
            validated.resource_version,
            cancel.clone(),
        );
        s.inflight = Some(InFlight { cancel, task });
        self.status = "saving…".into();
        Ok(())
    }

    /// Fetch the authoritative object and rebase the session on it.
    pub fn reload(&mut self) -> Result<(), EditError> {
        let s = self.session.as_mut().ok_or(EditError::NotEditing)?;
        if s.phase != SessionPhase::Editing {
            return Err(EditError::Busy);
        }
        s.phase = SessionPhase::Reloading;
        s.reload_mark = self.baseline_seq;
        let cancel = CancellationToken::new();
        let task = tasks::spawn_reload(self.updates_tx.clone(), self.store.clone(), s.id, s.baseline_identity.clone(), cancel.clone());
        s.inflight = Some(InFlight { cancel, task });
        self.status = "reloading…".into();
        Ok(())
    }

    /// Discard the draft and all session state.
    pub fn exit(&mut self) {
        if let Some(s) = self.session.take() {
            info!(session = %s.id, saving = s.is_saving(), "session: edit mode left");
            self.status = "viewing".into();
        }
    }

    /// Diff to show under a drift banner: the store's diff after a forced
    /// conflict when it sent one, otherwise latest baseline → draft, computed now.
    pub fn drift_diff(&self) -> Option<DiffResult> {
        let s = self.session.as_ref()?;
        match &s.drift {
            DriftState::Clean => None,
            DriftState::ForcedDrift { diff: Some(d), .. } => Some(d.clone()),
            _ => {
                let latest = self.latest.as_ref()?;
                let remote = visible_text(&latest.text, self.cfg.show_managed_fields);
                Some(diff_lines_bounded(&remote, &s.draft, self.cfg.diff_max_lines))
            }
        }
    }

    /// Wait for the next task result and apply it.
    pub async fn pump(&mut self) -> Option<EditEvent> {
        let update = self.updates_rx.recv().await?;
        Some(self.handle(update))
    }

    /// Apply a task result if one is ready.
    pub fn try_pump(&mut self) -> Option<EditEvent> {
        let update = self.updates_rx.try_recv().ok()?;
        Some(self.handle(update))
    }

    fn current_session(&mut self, id: SessionId) -> Option<&mut EditSession> {
        self.session.as_mut().filter(|s| s.id == id)
    }

    fn handle(&mut self, update: EditUpdate) -> EditEvent {
        match update {
            EditUpdate::LintDue { session, generation } => self.on_lint_due(session, generation),
            EditUpdate::SaveFinished { session, text, result } => self.on_save_finished(session, text, result),
            EditUpdate::ReloadFetched { session, result } => self.on_reload_fetched(session, result),
            EditUpdate::BaselineFetched { identity, fallback, result } => {
                let baseline = match result {
                    Ok(text) => Baseline::from_text(text),
                    Err(e) => {
                        warn!(error = %e, object = %identity, "session: refetch after apply failed; keeping applied text");
                        Baseline::with_identity(fallback, Some(identity))
                    }
                };
                let resource_version = baseline.resource_version();
                self.observe_baseline(baseline);
                EditEvent::BaselineRefreshed { resource_version }
            }
        }
    }

    fn on_lint_due(&mut self, session: SessionId, generation: u64) -> EditEvent {
        let Some(s) = self.current_session(session) else { return EditEvent::Ignored };
        if s.lint.generation != generation {
            return EditEvent::Ignored;
        }
        s.lint.task = None;
        let error = validate_draft(&s.draft, Some(&s.baseline_identity), s.compare_version.as_deref())
            .err()
            .map(|e| e.to_string());
        s.lint_error = error.clone();
        EditEvent::Linted { error }
    }

    fn on_save_finished(&mut self, session: SessionId, text: String, result: Result<DraftAccepted, StoreError>) -> EditEvent {
        let Some(s) = self.current_session(session) else {
            warn!(session = %session, "session: dropping save result for a closed session");
            return EditEvent::Ignored;
        };
        s.finish_inflight();
        match result {
            Ok(accepted) => {
                counter!("session_save_ok", 1u64);
                let identity = s.baseline_identity.clone().with_resource_version(Some(accepted.resource_version.clone()));
                info!(session = %session, object = %identity, rv = %accepted.resource_version, "session: committed");
                self.record_commit(&identity, &text);
                self.session = None;
                self.status = format!("saved  •  rv={}", accepted.resource_version);
                tasks::spawn_baseline_refresh(self.updates_tx.clone(), self.store.clone(), identity, text);
                EditEvent::Committed { resource_version: accepted.resource_version }
            }
            Err(e) => self.on_save_failed(e),
        }
    }

    fn on_save_failed(&mut self, err: StoreError) -> EditEvent {
        let raw = err.to_string();
        let payload = decode_conflict(&raw);
        let Some(s) = self.session.as_mut() else { return EditEvent::Ignored };
        match payload {
            Some(p) if p.is_version_mismatch() => {
                counter!("session_conflicts", 1u64);
                warn!(session = %s.id, current = ?p.current_resource_version, "session: store reported a version conflict");
                if let Some(cur) = &p.current_resource_version {
                    s.compare_version = Some(cur.clone());
                }
                s.drift = DriftState::ForcedDrift { diff: p.to_diff_result(), current_version: p.current_resource_version.clone() };
                self.status = "conflict: object changed on the server; reload to continue".into();
                EditEvent::Conflicted { current_version: p.current_resource_version }
            }
            other => {
                counter!("session_save_err", 1u64);
                let failure = match other {
                    Some(p) => SaveFailure {
                        message: if p.message.is_empty() { raw } else { p.message.clone() },
                        causes: p.cause_messages(),
                    },
                    None => SaveFailure { message: raw, causes: Vec::new() },
                };
                warn!(session = %s.id, error = %failure.message, "session: save failed");
                s.save_error = Some(failure.clone());
                self.status = format!("save error: {}", failure.message);
                EditEvent::SaveFailed(failure)
            }
        }
    }

    fn on_reload_fetched(&mut self, session: SessionId, result: Result<String, StoreError>) -> EditEvent {
        let show_managed = self.cfg.show_managed_fields;
        let baseline_seq = self.baseline_seq;
        let Some(s) = self.current_session(session) else { return EditEvent::Ignored };
        s.finish_inflight();
        let text = match result {
            Ok(t) => t,
            Err(e) => {
                warn!(session = %session, error = %e, "session: reload failed");
                let message = e.to_string();
                self.status = format!("reload error: {}", message);
                return EditEvent::ReloadFailed { message };
            }
        };
        let identity = match parse_identity(&text) {
            Some(id) if id.same_object(&s.baseline_identity) => id,
            _ => {
                let message = "reloaded object does not match the edited object".to_string();
                self.status = format!("reload error: {}", message);
                return EditEvent::ReloadFailed { message };
            }
        };
        let resource_version = identity.resource_version.clone();
        let published_meanwhile = s.reload_mark != baseline_seq;
        s.rebase(identity.clone(), visible_text(&text, show_managed));
        info!(session = %session, rv = ?resource_version, "session: reloaded");
        self.status = "editing (reloaded)".into();
        match self.latest.clone().filter(|_| published_meanwhile) {
            // a revision published while the fetch was in flight is the newer view
            Some(newer) => self.observe_baseline(newer),
            None => self.latest = Some(Baseline::with_identity(text, Some(identity))),
        }
        EditEvent::Reloaded { resource_version }
    }

    fn record_commit(&self, identity: &ObjectIdentity, text: &str) {
        let Some(journal) = self.journal.as_ref().filter(|_| self.cfg.journal_enabled) else { return };
        if identity.kind == "Secret" {
            warn!("skipping journal entry for Secret kind");
            return;
        }
        if let Err(e) = journal.record(&CommittedEdit::now(identity.clone(), text)) {
            warn!(error = %e, "journal write failed; commit stands");
        }
    }
}
