//! Interactive `kedit edit`: $EDITOR round-trips driven by an [`EditController`].

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use kedit_api::{KubeStore, ObjectStore};
use kedit_core::ObjectIdentity;
use kedit_session::{Baseline, EditConfig, EditController, EditError, EditEvent};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{print_diff, Output};

pub(crate) async fn run(identity: ObjectIdentity, cfg: EditConfig, output: Output) -> Result<()> {
    let store: Arc<dyn ObjectStore> = Arc::new(KubeStore::new());
    let initial = store.fetch_current(&identity).await.map_err(|e| anyhow!("fetching {}: {}", identity, e))?;

    let mut ctl = EditController::new(store, cfg.clone());
    if cfg.journal_enabled {
        match kedit_persist::SqliteJournal::open(&kedit_persist::JournalConfig::from_env()) {
            Ok(j) => ctl = ctl.with_journal(Arc::new(j)),
            Err(e) => warn!(error = %e, "journal unavailable; commits will not be recorded"),
        }
    }
    ctl.observe_baseline(Baseline::from_text(initial));
    ctl.enter_edit()?;

    let (tx, mut rx) = mpsc::channel::<String>(16);
    let client = kedit_kubehub::get_kube_client().await?;
    let watcher = tokio::spawn({
        let identity = identity.clone();
        async move {
            if let Err(e) = kedit_kubehub::watch_object(client, &identity, tx).await {
                warn!(error = %e, "baseline watcher failed");
            }
        }
    });

    let res = edit_loop(&mut ctl, &mut rx, output).await;
    ctl.exit();
    watcher.abort();
    res
}

async fn edit_loop(ctl: &mut EditController, rx: &mut mpsc::Receiver<String>, output: Output) -> Result<()> {
    loop {
        let Some(draft) = ctl.session().map(|s| s.draft().to_string()) else {
            eprintln!("edit session closed");
            return Ok(());
        };
        let edited = open_editor(&draft).await?;
        while let Ok(text) = rx.try_recv() {
            ctl.observe_baseline(Baseline::from_text(text));
        }
        if !ctl.is_editing() {
            bail!("the watched object was replaced; edit discarded");
        }
        if edited == draft {
            eprintln!("edit cancelled, no changes made");
            return Ok(());
        }
        ctl.update_draft(edited)?;

        match ctl.save() {
            Ok(()) => {}
            Err(EditError::DriftDetected) => {
                eprintln!("the object changed on the server since editing began:");
                if let Some(diff) = ctl.drift_diff() {
                    print_diff(&diff);
                }
                if !offer_reload(ctl, rx).await? {
                    return Ok(());
                }
                continue;
            }
            Err(EditError::Invalid(e)) => {
                eprintln!("error: {}", e);
                if confirm("re-open the editor? [Y/n] ", true).await? {
                    continue;
                }
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        match wait_for_outcome(ctl, rx).await? {
            EditEvent::Committed { resource_version } => {
                match output {
                    Output::Human => println!("saved  •  rv={}", resource_version),
                    Output::Json => println!("{}", serde_json::json!({ "saved": true, "resourceVersion": resource_version })),
                }
                return Ok(());
            }
            EditEvent::Conflicted { current_version } => {
                eprintln!("conflict: object is now at rv={}", current_version.as_deref().unwrap_or("?"));
                if let Some(diff) = ctl.drift_diff() {
                    print_diff(&diff);
                }
                if !offer_reload(ctl, rx).await? {
                    return Ok(());
                }
            }
            EditEvent::SaveFailed(failure) => {
                eprintln!("save failed: {}", failure);
                if !confirm("re-open the editor? [Y/n] ", true).await? {
                    return Ok(());
                }
            }
            other => warn!(event = ?other, "unexpected save outcome"),
        }
    }
}

/// Keep a copy of the user's draft, then reseed from the server on request.
async fn offer_reload(ctl: &mut EditController, rx: &mut mpsc::Receiver<String>) -> Result<bool> {
    if !confirm("reload the latest version and edit again? [y/N] ", false).await? {
        return Ok(false);
    }
    if let Some(s) = ctl.session() {
        let path = std::env::temp_dir().join(format!("kedit-draft-{}.yaml", s.id()));
        std::fs::write(&path, s.draft()).with_context(|| format!("saving draft to {}", path.display()))?;
        eprintln!("your draft was saved to {}", path.display());
    }
    ctl.reload()?;
    match wait_for_outcome(ctl, rx).await? {
        EditEvent::Reloaded { resource_version } => {
            info!(rv = ?resource_version, "reloaded");
            Ok(true)
        }
        EditEvent::ReloadFailed { message } => Err(anyhow!("reload failed: {}", message)),
        other => Err(anyhow!("unexpected reload outcome: {:?}", other)),
    }
}

/// Pump controller events until a save or reload settles, folding in watcher
/// revisions as they arrive.
async fn wait_for_outcome(ctl: &mut EditController, rx: &mut mpsc::Receiver<String>) -> Result<EditEvent> {
    loop {
        tokio::select! {
            ev = ctl.pump() => match ev {
                None => bail!("edit controller stopped"),
                Some(EditEvent::Linted { .. } | EditEvent::Ignored | EditEvent::BaselineRefreshed { .. }) => {}
                Some(ev) => return Ok(ev),
            },
            Some(text) = rx.recv() => ctl.observe_baseline(Baseline::from_text(text)),
            _ = tokio::signal::ctrl_c() => {
                ctl.exit();
                bail!("interrupted");
            }
        }
    }
}

async fn open_editor(text: &str) -> Result<String> {
    let path = std::env::temp_dir().join(format!("kedit-{}.yaml", uuid::Uuid::new_v4()));
    std::fs::write(&path, text).with_context(|| format!("writing {}", path.display()))?;
    let editor = std::env::var("VISUAL")
        .or_else(|_| std::env::var("EDITOR"))
        .unwrap_or_else(|_| "vi".to_string());
    let file = path.clone();
    let status = tokio::task::spawn_blocking(move || {
        let mut parts = editor.split_whitespace();
        let program = parts.next().unwrap_or("vi");
        std::process::Command::new(program).args(parts).arg(&file).status()
    })
    .await
    .context("editor task")?
    .context("launching editor")?;
    let edited = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()));
    let _ = std::fs::remove_file(&path);
    if !status.success() {
        bail!("editor exited with {}", status);
    }
    edited
}

async fn confirm(prompt: &'static str, default_yes: bool) -> Result<bool> {
    let line = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
        eprint!("{}", prompt);
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        Ok(line)
    })
    .await
    .context("prompt task")?
    .context("reading answer")?;
    Ok(match line.trim().to_ascii_lowercase().as_str() {
        "" => default_yes,
        "y" | "yes" => true,
        _ => false,
    })
}
