//! Snapshot pipeline: every trigger produces a JSON document, an operator
//! spreadsheet and a raw store copy, fail-fast in that order, and registers
//! the artifacts in `artifacts.json` at the backup root.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Local};
use fs2::available_space;
use serde::{Deserialize, Serialize};
use tokio::task;

use crate::db::write_atomic;
use crate::notify::{Notification, NotifyKind};
use crate::state::EngineState;
use crate::time::now_ms;
use crate::{AppError, AppResult};

pub mod dataset;
mod restore;
mod scheduler;
mod writers;

pub use dataset::{BackupDataset, BackupMetadata, RecordCounts};
pub use restore::{restore, RestoreOutcome, RestoreRequest};
pub use scheduler::Scheduler;

pub const REGISTRY_FILE: &str = "artifacts.json";

const REALTIME_DIR: &str = "realtime";
const DAILY_DIR: &str = "daily";
const MONTHLY_DIR: &str = "monthly";
const DATABASE_DIR: &str = "database";
const SUBDIRS: [&str; 4] = [REALTIME_DIR, DAILY_DIR, MONTHLY_DIR, DATABASE_DIR];

/// Extra free space demanded beyond the projected artifact size.
const DISK_HEADROOM_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Realtime,
    Daily,
    Monthly,
    Manual,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Realtime => "realtime",
            TriggerKind::Daily => "daily",
            TriggerKind::Monthly => "monthly",
            TriggerKind::Manual => "manual",
        }
    }

    /// Manually requested snapshots land next to the realtime ones.
    fn subdir(&self) -> &'static str {
        match self {
            TriggerKind::Realtime | TriggerKind::Manual => REALTIME_DIR,
            TriggerKind::Daily => DAILY_DIR,
            TriggerKind::Monthly => MONTHLY_DIR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactFormat {
    Json,
    Spreadsheet,
    StoreCopy,
}

impl ArtifactFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactFormat::Json => "json",
            ArtifactFormat::Spreadsheet => "xlsx",
            ArtifactFormat::StoreCopy => "db",
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "json" => Some(ArtifactFormat::Json),
            "xlsx" => Some(ArtifactFormat::Spreadsheet),
            "db" => Some(ArtifactFormat::StoreCopy),
            _ => None,
        }
    }
}

/// One produced snapshot file. `id` is the path relative to the backup root
/// and is the handle restore takes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupArtifact {
    pub id: String,
    pub format: ArtifactFormat,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    pub created_at: String,
}

impl BackupArtifact {
    pub fn path(&self, root: &Path) -> PathBuf {
        root.join(&self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded,
    Failed,
    /// Another job for the same trigger was running, or maintenance was
    /// active. Nothing was written.
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub trigger: TriggerKind,
    pub status: JobStatus,
    pub artifacts: Vec<BackupArtifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AppError>,
    pub finished_at_ms: i64,
}

impl JobOutcome {
    fn skipped(trigger: TriggerKind) -> Self {
        JobOutcome {
            trigger,
            status: JobStatus::Skipped,
            artifacts: Vec::new(),
            error: None,
            finished_at_ms: now_ms(),
        }
    }
}

/// Per-trigger single-flight bookkeeping. Overlapping requests for the same
/// trigger are skipped, never queued.
#[derive(Default)]
pub struct JobStates {
    inner: Mutex<HashMap<TriggerKind, TriggerJob>>,
}

#[derive(Default)]
struct TriggerJob {
    running: bool,
    last: Option<JobOutcome>,
}

impl JobStates {
    fn begin(&self, trigger: TriggerKind) -> Option<JobGuard<'_>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let slot = map.entry(trigger).or_default();
        if slot.running {
            return None;
        }
        slot.running = true;
        Some(JobGuard {
            states: self,
            trigger,
            done: false,
        })
    }

    fn finish(&self, trigger: TriggerKind, outcome: JobOutcome) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let slot = map.entry(trigger).or_default();
        slot.running = false;
        slot.last = Some(outcome);
    }

    pub fn is_running(&self, trigger: TriggerKind) -> bool {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.get(&trigger).map(|slot| slot.running).unwrap_or(false)
    }

    pub fn any_running(&self) -> bool {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.values().any(|slot| slot.running)
    }

    pub fn last_outcome(&self, trigger: TriggerKind) -> Option<JobOutcome> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.get(&trigger).and_then(|slot| slot.last.clone())
    }
}

struct JobGuard<'a> {
    states: &'a JobStates,
    trigger: TriggerKind,
    done: bool,
}

impl JobGuard<'_> {
    fn complete(mut self, outcome: JobOutcome) {
        self.states.finish(self.trigger, outcome);
        self.done = true;
    }
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.states.finish(
                self.trigger,
                JobOutcome {
                    trigger: self.trigger,
                    status: JobStatus::Failed,
                    artifacts: Vec::new(),
                    error: Some(AppError::new(
                        "BACKUP/ABORTED",
                        "Backup job dropped before completion",
                    )),
                    finished_at_ms: now_ms(),
                },
            );
        }
    }
}

/// Run one snapshot job for `trigger`. Never panics the caller's task; the
/// outcome carries the error when the job fails.
pub async fn run_job(state: std::sync::Arc<EngineState>, trigger: TriggerKind) -> JobOutcome {
    let guard = match state.jobs.begin(trigger) {
        Some(guard) => guard,
        None => {
            tracing::debug!(
                target: "pointledger",
                event = "backup_skipped",
                trigger = trigger.as_str(),
                reason = "already_running"
            );
            return JobOutcome::skipped(trigger);
        }
    };

    if state.maintenance_active() {
        tracing::debug!(
            target: "pointledger",
            event = "backup_skipped",
            trigger = trigger.as_str(),
            reason = "maintenance"
        );
        let outcome = JobOutcome::skipped(trigger);
        guard.complete(outcome.clone());
        return outcome;
    }

    tracing::info!(target: "pointledger", event = "backup_start", trigger = trigger.as_str());
    match execute(&state, trigger).await {
        Ok(artifacts) => {
            let outcome = JobOutcome {
                trigger,
                status: JobStatus::Succeeded,
                artifacts,
                error: None,
                finished_at_ms: now_ms(),
            };
            tracing::info!(
                target: "pointledger",
                event = "backup_complete",
                trigger = trigger.as_str(),
                artifacts = outcome.artifacts.len()
            );
            state.notifier.notify(&Notification::new(
                NotifyKind::BackupSucceeded,
                format!("{} backup completed", trigger.as_str()),
            ));
            guard.complete(outcome.clone());
            outcome
        }
        Err(err) => {
            tracing::warn!(
                target: "pointledger",
                event = "backup_failed",
                trigger = trigger.as_str(),
                error = %err
            );
            state.notifier.notify(&Notification::new(
                NotifyKind::BackupFailed,
                format!("{} backup failed: {err}", trigger.as_str()),
            ));
            let outcome = JobOutcome {
                trigger,
                status: JobStatus::Failed,
                artifacts: Vec::new(),
                error: Some(err),
                finished_at_ms: now_ms(),
            };
            guard.complete(outcome.clone());
            outcome
        }
    }
}

async fn execute(state: &EngineState, trigger: TriggerKind) -> AppResult<Vec<BackupArtifact>> {
    let stamp = Local::now();
    let pool = state.pool_clone();
    let dataset = dataset::collect(&pool, trigger.as_str(), stamp).await?;

    let root = state.backup_root();
    let db_path = state.db_path.clone();
    task::spawn_blocking(move || write_artifacts(&root, &db_path, trigger, stamp, &dataset))
        .await
        .map_err(|err| AppError::new("RUNTIME/TASK", err.to_string()))?
}

fn write_artifacts(
    root: &Path,
    db_path: &Path,
    trigger: TriggerKind,
    stamp: DateTime<Local>,
    dataset: &BackupDataset,
) -> AppResult<Vec<BackupArtifact>> {
    ensure_layout(root)?;
    check_disk_space(root, db_path)?;

    let created_at = stamp.to_rfc3339();
    let mut artifacts = Vec::with_capacity(3);

    for (format, rel) in artifact_names(trigger, stamp) {
        let path = root.join(&rel);
        let size_bytes = match format {
            ArtifactFormat::Json => writers::write_json(dataset, &path)?,
            ArtifactFormat::Spreadsheet => writers::write_spreadsheet(dataset, &path)?,
            ArtifactFormat::StoreCopy => writers::copy_store(db_path, &path)?,
        };
        let sha256 = writers::file_sha256(&path)?;
        artifacts.push(BackupArtifact {
            id: rel,
            format,
            size_bytes,
            sha256: Some(sha256),
            created_at: created_at.clone(),
        });
    }

    register(root, &artifacts)?;
    Ok(artifacts)
}

/// Relative artifact paths for one job. Monthly archives are named by month
/// and overwrite within the month; everything else is stamped to the second.
fn artifact_names(trigger: TriggerKind, stamp: DateTime<Local>) -> [(ArtifactFormat, String); 3] {
    let subdir = trigger.subdir();
    let stem = match trigger {
        TriggerKind::Monthly => format!("{}_archive", stamp.format("%Y-%m")),
        _ => stamp.format("%Y-%m-%d_%H-%M-%S").to_string(),
    };
    let copy_stem = stamp.format("%Y-%m-%d_%H-%M-%S");
    [
        (ArtifactFormat::Json, format!("{subdir}/{stem}.json")),
        (ArtifactFormat::Spreadsheet, format!("{subdir}/{stem}.xlsx")),
        (
            ArtifactFormat::StoreCopy,
            format!("{DATABASE_DIR}/{copy_stem}_full.db"),
        ),
    ]
}

fn ensure_layout(root: &Path) -> AppResult<()> {
    for dir in SUBDIRS {
        let path = root.join(dir);
        fs::create_dir_all(&path).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "create_backup_dir")
                .with_context("path", path.display().to_string())
        })?;
    }
    Ok(())
}

/// Refuse to start when the volume cannot hold another store copy. Checking
/// up front keeps a full disk from producing a torn artifact set.
fn check_disk_space(root: &Path, db_path: &Path) -> AppResult<()> {
    let db_size = fs::metadata(db_path).map(|m| m.len()).unwrap_or(0);
    let required = db_size.saturating_mul(2) + DISK_HEADROOM_BYTES;
    let free = available_space(root).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "available_space")
            .with_context("path", root.display().to_string())
    })?;
    if free < required {
        return Err(AppError::storage_io(
            "LOW_DISK",
            "Not enough free space for a snapshot",
        )
        .with_context("required_bytes", required.to_string())
        .with_context("available_bytes", free.to_string()));
    }
    Ok(())
}

fn register(root: &Path, new: &[BackupArtifact]) -> AppResult<()> {
    let mut all = load_registry(root)?;
    // Monthly artifacts reuse their path within a month; drop stale rows.
    all.retain(|a| !new.iter().any(|n| n.id == a.id));
    all.extend_from_slice(new);
    let bytes = serde_json::to_vec_pretty(&all).map_err(AppError::from)?;
    write_atomic(&root.join(REGISTRY_FILE), &bytes)
}

/// Read the artifact registry. A missing or corrupt registry falls back to a
/// directory scan so existing snapshots stay restorable.
pub fn load_registry(root: &Path) -> AppResult<Vec<BackupArtifact>> {
    let path = root.join(REGISTRY_FILE);
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return scan(root),
        Err(err) => {
            return Err(AppError::from(err).with_context("path", path.display().to_string()))
        }
    };
    match serde_json::from_slice(&raw) {
        Ok(artifacts) => Ok(artifacts),
        Err(err) => {
            tracing::warn!(
                target: "pointledger",
                event = "registry_corrupt",
                path = %path.display(),
                error = %err,
                "rebuilding artifact list from directory scan"
            );
            scan(root)
        }
    }
}

fn scan(root: &Path) -> AppResult<Vec<BackupArtifact>> {
    let mut artifacts = Vec::new();
    for dir in SUBDIRS {
        let dir_path = root.join(dir);
        let entries = match fs::read_dir(&dir_path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => {
                return Err(
                    AppError::from(err).with_context("path", dir_path.display().to_string())
                )
            }
        };
        for entry in entries {
            let entry = entry.map_err(AppError::from)?;
            let path = entry.path();
            let Some(format) = path
                .extension()
                .and_then(|ext| ext.to_str())
                .and_then(ArtifactFormat::from_extension)
            else {
                continue;
            };
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let meta = entry.metadata().map_err(AppError::from)?;
            let created_at = meta
                .modified()
                .map(|t| DateTime::<Local>::from(t).to_rfc3339())
                .unwrap_or_default();
            artifacts.push(BackupArtifact {
                id: format!("{dir}/{name}"),
                format,
                size_bytes: meta.len(),
                sha256: None,
                created_at,
            });
        }
    }
    artifacts.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(artifacts)
}

/// All known artifacts, newest first.
pub async fn list_artifacts(state: &EngineState) -> AppResult<Vec<BackupArtifact>> {
    let root = state.backup_root();
    let mut artifacts = task::spawn_blocking(move || load_registry(&root))
        .await
        .map_err(|err| AppError::new("RUNTIME/TASK", err.to_string()))??;
    artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    Ok(artifacts)
}
