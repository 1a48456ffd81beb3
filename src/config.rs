use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

const BACKUP_DIR_NAME: &str = "backups";

/// Whether derived totals may go negative after manual deductions.
///
/// The legacy system had no floor; both behaviors are deployment choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClampPolicy {
    AllowNegative,
    FloorAtZero,
}

impl ClampPolicy {
    pub fn apply(&self, value: i64) -> i64 {
        match self {
            ClampPolicy::AllowNegative => value,
            ClampPolicy::FloorAtZero => value.max(0),
        }
    }
}

/// Whether the integrity sweep rewrites drifted balances or only reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepPolicy {
    ReportOnly,
    AutoCorrect,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path of the live SQLite store.
    pub db_path: PathBuf,
    /// Root for snapshot artifacts; defaults to `backups/` next to the store.
    pub backup_root: Option<PathBuf>,
    pub clamp: ClampPolicy,
    pub sweep: SweepPolicy,
    /// Fire a best-effort snapshot after every settled mutation.
    pub realtime_backups: bool,
    /// Granularity of the schedule polling loop. Must stay at or below one
    /// minute so the fixed wall-clock triggers are not missed.
    pub poll_interval: Duration,
    pub daily_at: NaiveTime,
    pub monthly_at: NaiveTime,
}

impl EngineConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        EngineConfig {
            db_path: db_path.into(),
            backup_root: None,
            clamp: ClampPolicy::AllowNegative,
            sweep: SweepPolicy::ReportOnly,
            realtime_backups: true,
            poll_interval: Duration::from_secs(30),
            daily_at: NaiveTime::from_hms_opt(22, 0, 0).expect("valid daily trigger time"),
            monthly_at: NaiveTime::from_hms_opt(23, 0, 0).expect("valid monthly trigger time"),
        }
    }

    pub fn with_clamp(mut self, clamp: ClampPolicy) -> Self {
        self.clamp = clamp;
        self
    }

    pub fn with_sweep(mut self, sweep: SweepPolicy) -> Self {
        self.sweep = sweep;
        self
    }

    pub fn with_realtime_backups(mut self, enabled: bool) -> Self {
        self.realtime_backups = enabled;
        self
    }

    pub fn with_backup_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.backup_root = Some(root.into());
        self
    }

    pub fn backup_root(&self) -> PathBuf {
        if let Some(root) = &self.backup_root {
            return root.clone();
        }
        let parent = self
            .db_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        parent.join(BACKUP_DIR_NAME)
    }
}
