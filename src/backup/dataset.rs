use chrono::{DateTime, Local, SecondsFormat};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::model::{Child, Entry, HistoryRow};
use crate::{children, entries, history, AppError, AppResult};

pub const DATA_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordCounts {
    pub children: usize,
    pub entries: usize,
    pub history: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub backup_id: String,
    pub backup_type: String,
    pub timestamp: String,
    pub data_version: String,
    pub records_count: RecordCounts,
}

/// A full point-in-time export of the ledger: children, entries (each with
/// its parsed manual ledger) and the audit history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupDataset {
    pub backup_metadata: BackupMetadata,
    pub children: Vec<Child>,
    pub entries: Vec<Entry>,
    pub history: Vec<HistoryRow>,
}

/// Collect the dataset inside one read transaction so every table reflects
/// the same point in time, even while mutations continue on other
/// connections.
pub async fn collect(
    pool: &SqlitePool,
    trigger: &str,
    stamp: DateTime<Local>,
) -> AppResult<BackupDataset> {
    let mut tx = pool.begin().await.map_err(AppError::from)?;

    let children = children::list_children_in_conn(&mut tx).await?;
    let entries = entries::list_all_in_conn(&mut tx).await?;
    let history = history::list_all(&mut tx).await?;

    tx.commit().await.map_err(AppError::from)?;

    let backup_metadata = BackupMetadata {
        backup_id: stamp.format("%Y-%m-%d_%H-%M-%S").to_string(),
        backup_type: trigger.to_string(),
        timestamp: stamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        data_version: DATA_VERSION.to_string(),
        records_count: RecordCounts {
            children: children.len(),
            entries: entries.len(),
            history: history.len(),
        },
    };

    Ok(BackupDataset {
        backup_metadata,
        children,
        entries,
        history,
    })
}
