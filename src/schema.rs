use sqlx::SqlitePool;

use crate::config::ClampPolicy;
use crate::error::is_unique_violation;
use crate::{reconcile, AppError, AppResult};

const CREATE_CHILDREN: &str = "\
CREATE TABLE IF NOT EXISTS children (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    grade INTEGER NOT NULL,
    cumulative_points INTEGER NOT NULL DEFAULT 0,
    include_in_stats INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL
)";

const CREATE_DAILY_POINTS: &str = "\
CREATE TABLE IF NOT EXISTS daily_points (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    child_id INTEGER NOT NULL REFERENCES children(id) ON DELETE CASCADE,
    date TEXT NOT NULL,
    korean_points INTEGER NOT NULL DEFAULT 0,
    math_points INTEGER NOT NULL DEFAULT 0,
    ssen_points INTEGER NOT NULL DEFAULT 0,
    reading_points INTEGER NOT NULL DEFAULT 0,
    piano_points INTEGER NOT NULL DEFAULT 0,
    english_points INTEGER NOT NULL DEFAULT 0,
    advanced_math_points INTEGER NOT NULL DEFAULT 0,
    writing_points INTEGER NOT NULL DEFAULT 0,
    manual_points INTEGER NOT NULL DEFAULT 0,
    manual_history TEXT NOT NULL DEFAULT '[]',
    manual_seq INTEGER NOT NULL DEFAULT 0,
    total_points INTEGER NOT NULL DEFAULT 0,
    created_by TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
)";

const CREATE_POINTS_HISTORY: &str = "\
CREATE TABLE IF NOT EXISTS points_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    child_id INTEGER NOT NULL,
    date TEXT NOT NULL,
    old_total_points INTEGER NOT NULL DEFAULT 0,
    new_total_points INTEGER NOT NULL DEFAULT 0,
    change_type TEXT NOT NULL,
    changed_by TEXT NOT NULL,
    changed_at INTEGER NOT NULL,
    change_reason TEXT NOT NULL DEFAULT ''
)";

const CREATE_CHILD_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_daily_points_child ON daily_points(child_id)";

/// The storage-layer uniqueness guarantee for `(child_id, date)`.
const CREATE_UNIQUE_INDEX: &str = "CREATE UNIQUE INDEX IF NOT EXISTS \
     idx_daily_points_child_date ON daily_points(child_id, date)";

/// Create the ledger tables and indexes.
///
/// A legacy store may still contain duplicate `(child_id, date)` rows, which
/// makes the unique index fail to build. In that case the dedup reconciler
/// runs once and the index creation is retried, so a drifted store heals on
/// startup instead of refusing to open.
pub async fn ensure_schema(pool: &SqlitePool, clamp: ClampPolicy) -> AppResult<()> {
    for statement in [
        CREATE_CHILDREN,
        CREATE_DAILY_POINTS,
        CREATE_POINTS_HISTORY,
        CREATE_CHILD_INDEX,
    ] {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(AppError::from)?;
    }

    ensure_column(pool, "daily_points", "manual_seq", "INTEGER NOT NULL DEFAULT 0").await?;

    match sqlx::query(CREATE_UNIQUE_INDEX).execute(pool).await {
        Ok(_) => Ok(()),
        Err(err) => {
            let err = AppError::from(err);
            if !is_unique_violation(&err) {
                return Err(err.with_context("operation", "create_unique_index"));
            }
            tracing::warn!(
                target: "pointledger",
                event = "schema_duplicate_entries",
                "duplicate (child_id, date) rows block the unique index; running dedup"
            );
            let report = reconcile::dedup(pool, clamp).await?;
            tracing::info!(
                target: "pointledger",
                event = "schema_dedup_applied",
                removed = report.removed,
                children = report.affected_children.len()
            );
            sqlx::query(CREATE_UNIQUE_INDEX)
                .execute(pool)
                .await
                .map_err(|e| {
                    AppError::from(e).with_context("operation", "create_unique_index_retry")
                })?;
            Ok(())
        }
    }
}

/// Add a column that older stores predate. `CREATE TABLE IF NOT EXISTS` never
/// alters an existing table, so late additions need their own guard.
async fn ensure_column(
    pool: &SqlitePool,
    table: &str,
    column: &str,
    definition: &str,
) -> AppResult<()> {
    let (present,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?")
            .bind(table)
            .bind(column)
            .fetch_one(pool)
            .await
            .map_err(AppError::from)?;
    if present > 0 {
        return Ok(());
    }
    tracing::info!(
        target: "pointledger",
        event = "schema_add_column",
        table,
        column
    );
    sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"))
        .execute(pool)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "add_column"))?;
    Ok(())
}
