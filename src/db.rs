use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};

use crate::{AppError, AppResult};

/// Open the live store with the engine's standard pragmas: WAL journal,
/// full synchronous, foreign keys on, busy timeout for concurrent writers.
pub async fn open_sqlite_pool(db_path: &Path) -> AppResult<Pool<Sqlite>> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            AppError::from(e)
                .with_context("operation", "create_store_dir")
                .with_context("path", parent.display().to_string())
        })?;
    }
    tracing::info!(target: "pointledger", event = "db_path", path = %db_path.display());

    let path_str = db_path.to_str().ok_or_else(|| {
        AppError::storage_io("DB_PATH", "Database path is not valid UTF-8")
            .with_context("path", db_path.display().to_string())
    })?;
    let opts = SqliteConnectOptions::from_str(path_str)
        .map_err(AppError::from)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .after_connect(|conn, _| {
            Box::pin(async move {
                sqlx::query("PRAGMA foreign_keys=ON;")
                    .execute(&mut *conn)
                    .await?;
                sqlx::query("PRAGMA busy_timeout = 5000;")
                    .execute(&mut *conn)
                    .await?;
                Ok::<_, sqlx::Error>(())
            })
        })
        .connect_with(opts)
        .await
        .map_err(AppError::from)?;

    log_effective_pragmas(&pool).await;

    Ok(pool)
}

async fn log_effective_pragmas(pool: &Pool<Sqlite>) {
    use tracing::{info, warn};

    let (sqlite_ver,): (String,) = sqlx::query_as("select sqlite_version()")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let jm: (String,) = sqlx::query_as("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let fks: (i64,) = sqlx::query_as("PRAGMA foreign_keys;")
        .fetch_one(pool)
        .await
        .unwrap_or((i64::MIN,));

    info!(
        target: "pointledger",
        event = "db_open",
        sqlite_version = %sqlite_ver,
        journal_mode = %jm.0,
        foreign_keys = %fks.0
    );

    if !jm.0.eq_ignore_ascii_case("wal") {
        warn!(
            target: "pointledger",
            event = "db_open_warning",
            msg = "journal_mode != WAL; running with reduced crash safety"
        );
    }
}

/// Write `bytes` to `path` through a temp file and an atomic rename, fsyncing
/// both the file and its directory. Used for snapshot documents and the
/// artifact registry so a crashed writer never leaves a torn file behind.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> AppResult<()> {
    use std::fs::{self, File};
    use std::io::Write;

    let parent = path.parent().ok_or_else(|| {
        AppError::storage_io("NO_PARENT", "Target path has no parent directory")
            .with_context("path", path.display().to_string())
    })?;
    fs::create_dir_all(parent).map_err(|e| {
        AppError::from(e)
            .with_context("operation", "create_parent_dir")
            .with_context("path", parent.display().to_string())
    })?;

    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp_path = std::path::PathBuf::from(tmp);

    let mut file = File::create(&tmp_path).map_err(|e| {
        AppError::from(e)
            .with_context("operation", "create_temp_file")
            .with_context("path", tmp_path.display().to_string())
    })?;
    file.write_all(bytes).map_err(|e| {
        AppError::from(e)
            .with_context("operation", "write_temp_file")
            .with_context("path", tmp_path.display().to_string())
    })?;
    file.sync_all().map_err(|e| {
        AppError::from(e)
            .with_context("operation", "sync_temp_file")
            .with_context("path", tmp_path.display().to_string())
    })?;
    drop(file);

    fs::rename(&tmp_path, path).map_err(|e| {
        AppError::from(e)
            .with_context("operation", "finalize_write")
            .with_context("from", tmp_path.display().to_string())
            .with_context("to", path.display().to_string())
    })?;
    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn opens_pool_with_wal_mode() {
        let tmp = tempdir().unwrap();
        let db_path = tmp.path().join("ledger.db");
        let pool = open_sqlite_pool(&db_path).await.unwrap();
        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode;")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert!(mode.eq_ignore_ascii_case("wal"));
    }

    #[test]
    fn write_atomic_replaces_existing_file() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("doc.json");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert!(!tmp.path().join("doc.json.tmp").exists());
    }
}
