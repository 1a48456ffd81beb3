//! Restore a raw store snapshot over the live database.
//!
//! The sequence is: confirmation gate, maintenance scope, pool close, safety
//! copy of the current store, staged copy of the snapshot, sidecar removal,
//! atomic rename, pool reopen. Failure before the rename leaves the live
//! store untouched.

use std::ffi::OsString;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::task;

use super::{load_registry, ArtifactFormat, BackupArtifact, JobStates};
use crate::notify::{Notification, NotifyKind};
use crate::state::EngineState;
use crate::time::now_ms;
use crate::{db, AppError, AppResult};

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    /// Registry id of a store-copy artifact, e.g. `database/2024-05-05_10-00-00_full.db`.
    pub artifact_id: String,
    /// Restore overwrites the live store; the embedder must set this after
    /// its own confirmation flow.
    pub confirmed: bool,
}

#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    pub artifact_id: String,
    /// Copy of the pre-restore store, kept next to the live file.
    pub safety_copy: PathBuf,
    pub finished_at_ms: i64,
}

pub async fn restore(
    state: &Arc<EngineState>,
    request: &RestoreRequest,
) -> AppResult<RestoreOutcome> {
    if !request.confirmed {
        return Err(AppError::new(
            "RESTORE/NOT_CONFIRMED",
            "Restore overwrites the live store and requires explicit confirmation",
        ));
    }

    let root = state.backup_root();
    let artifact = {
        let root = root.clone();
        let id = request.artifact_id.clone();
        task::spawn_blocking(move || resolve_artifact(&root, &id))
            .await
            .map_err(|err| AppError::new("RUNTIME/TASK", err.to_string()))??
    };

    // Exclusive scope: mutations and backup jobs refuse to start from here.
    let _guard = state.begin_maintenance()?;
    tracing::info!(
        target: "pointledger",
        event = "restore_start",
        artifact = %artifact.id
    );

    // The maintenance flag only blocks new jobs. A snapshot job that started
    // earlier may still be reading the live store file, so wait it out
    // before the swap.
    wait_for_idle_jobs(&state.jobs, JOB_DRAIN_LIMIT).await?;

    // Drain in-flight transactions before touching the file.
    state.pool_clone().close().await;

    let live = state.db_path.clone();
    let source = artifact.path(&root);
    let swapped = task::spawn_blocking(move || swap_store(&live, &source))
        .await
        .map_err(|err| AppError::new("RUNTIME/TASK", err.to_string()))
        .and_then(|result| result);

    // Reopen regardless of the swap outcome so the engine keeps serving
    // whichever store file is now live.
    let pool = db::open_sqlite_pool(&state.db_path).await?;
    state.replace_pool(pool);

    match swapped {
        Ok(safety_copy) => {
            tracing::info!(
                target: "pointledger",
                event = "restore_complete",
                artifact = %artifact.id,
                safety_copy = %safety_copy.display()
            );
            state.notifier.notify(&Notification::new(
                NotifyKind::RestoreSucceeded,
                format!("restored {}", artifact.id),
            ));
            Ok(RestoreOutcome {
                artifact_id: artifact.id,
                safety_copy,
                finished_at_ms: now_ms(),
            })
        }
        Err(err) => {
            tracing::warn!(
                target: "pointledger",
                event = "restore_failed",
                artifact = %artifact.id,
                error = %err
            );
            state.notifier.notify(&Notification::new(
                NotifyKind::RestoreFailed,
                format!("restore of {} failed: {err}", artifact.id),
            ));
            Err(err)
        }
    }
}

const JOB_DRAIN_POLL: Duration = Duration::from_millis(25);
const JOB_DRAIN_LIMIT: Duration = Duration::from_secs(30);

async fn wait_for_idle_jobs(jobs: &JobStates, limit: Duration) -> AppResult<()> {
    let deadline = tokio::time::Instant::now() + limit;
    while jobs.any_running() {
        if tokio::time::Instant::now() >= deadline {
            return Err(AppError::new(
                "RESTORE/BUSY",
                "A backup job is still running; try again once it finishes",
            ));
        }
        tokio::time::sleep(JOB_DRAIN_POLL).await;
    }
    Ok(())
}

fn resolve_artifact(root: &Path, id: &str) -> AppResult<BackupArtifact> {
    load_registry(root)?
        .into_iter()
        .find(|a| a.id == id && a.format == ArtifactFormat::StoreCopy)
        .ok_or_else(|| {
            AppError::not_found("ARTIFACT", "No store snapshot with this id")
                .with_context("artifact_id", id.to_string())
        })
}

fn swap_store(live: &Path, source: &Path) -> AppResult<PathBuf> {
    if !source.exists() {
        // The registry can be stale if an operator pruned files by hand.
        return Err(AppError::not_found("ARTIFACT", "Snapshot file is missing on disk")
            .with_context("path", source.display().to_string()));
    }

    let safety_copy = safety_path(live);
    if live.exists() {
        fs::copy(live, &safety_copy).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "safety_copy")
                .with_context("path", safety_copy.display().to_string())
        })?;
    }

    // Stage next to the live file so the final promotion is one rename on
    // the same filesystem.
    let staged = sibling(live, ".incoming");
    fs::copy(source, &staged).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "stage_snapshot")
            .with_context("path", staged.display().to_string())
    })?;
    if let Ok(file) = File::open(&staged) {
        let _ = file.sync_all();
    }

    // Stale WAL or shm sidecars must not be replayed into the restored store.
    for suffix in ["-wal", "-shm"] {
        let _ = fs::remove_file(sibling(live, suffix));
    }

    fs::rename(&staged, live).map_err(|err| {
        let _ = fs::remove_file(&staged);
        AppError::from(err)
            .with_context("operation", "promote_snapshot")
            .with_context("from", staged.display().to_string())
            .with_context("to", live.display().to_string())
    })?;

    if let Some(parent) = live.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(safety_copy)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn safety_path(live: &Path) -> PathBuf {
    let stem = live
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("store");
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    live.with_file_name(format!("{stem}_safety_backup_{stamp}.db"))
}
