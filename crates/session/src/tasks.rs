#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use kedit_api::ObjectStore;
use kedit_core::ObjectIdentity;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::model::{EditUpdate, SessionId};

pub(crate) fn spawn_lint_timer(tx: UnboundedSender<EditUpdate>, session: SessionId, generation: u64, delay: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(EditUpdate::LintDue { session, generation });
    })
}

/// Remote validate then apply. Cancelling the token before apply starts
/// guarantees nothing is written.
pub(crate) fn spawn_save(
    tx: UnboundedSender<EditUpdate>,
    store: Arc<dyn ObjectStore>,
    session: SessionId,
    identity: ObjectIdentity,
    text: String,
    resource_version: String,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let t0 = Instant::now();
        info!(session = %session, object = %identity, rv = %resource_version, "session: save start");
        let work = async {
            let accepted = store.validate_draft(&text, &identity, &resource_version).await?;
            debug!(rv = %accepted.resource_version, "session: remote validate ok");
            store.apply_draft(&text, &identity, &accepted.resource_version).await
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(session = %session, "session: save cancelled");
                return;
            }
            r = work => r,
        };
        info!(session = %session, ok = result.is_ok(), took_ms = %t0.elapsed().as_millis(), "session: save task ended");
        let _ = tx.send(EditUpdate::SaveFinished { session, text, result });
    })
}

pub(crate) fn spawn_reload(
    tx: UnboundedSender<EditUpdate>,
    store: Arc<dyn ObjectStore>,
    session: SessionId,
    identity: ObjectIdentity,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(session = %session, object = %identity, "session: reload start");
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            r = store.fetch_current(&identity) => r,
        };
        let _ = tx.send(EditUpdate::ReloadFetched { session, result });
        info!("session: reload task ended");
    })
}

/// Refetch after a commit; `fallback` is the text we know was applied.
pub(crate) fn spawn_baseline_refresh(
    tx: UnboundedSender<EditUpdate>,
    store: Arc<dyn ObjectStore>,
    identity: ObjectIdentity,
    fallback: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = store.fetch_current(&identity).await;
        let _ = tx.send(EditUpdate::BaselineFetched { identity, fallback, result });
    })
}
