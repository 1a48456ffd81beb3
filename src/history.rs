use chrono::NaiveDate;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::model::{ChangeType, HistoryRow};
use crate::time::now_ms;
use crate::{AppError, AppResult};

/// Audit row about to be written; id and timestamp are assigned on insert.
pub struct NewHistory<'a> {
    pub child_id: i64,
    pub date: NaiveDate,
    pub old_total_points: i64,
    pub new_total_points: i64,
    pub change_type: ChangeType,
    pub changed_by: &'a str,
    pub change_reason: &'a str,
}

pub async fn record(conn: &mut SqliteConnection, row: NewHistory<'_>) -> AppResult<()> {
    sqlx::query(
        "INSERT INTO points_history \
         (child_id, date, old_total_points, new_total_points, change_type, \
          changed_by, changed_at, change_reason) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(row.child_id)
    .bind(row.date.to_string())
    .bind(row.old_total_points)
    .bind(row.new_total_points)
    .bind(row.change_type.as_str())
    .bind(row.changed_by)
    .bind(now_ms())
    .bind(row.change_reason)
    .execute(conn)
    .await
    .map_err(AppError::from)?;
    Ok(())
}

pub async fn list_for_child(pool: &SqlitePool, child_id: i64) -> AppResult<Vec<HistoryRow>> {
    let rows = sqlx::query(
        "SELECT id, child_id, date, old_total_points, new_total_points, \
         change_type, changed_by, changed_at, change_reason \
         FROM points_history WHERE child_id = ? ORDER BY id DESC",
    )
    .bind(child_id)
    .fetch_all(pool)
    .await
    .map_err(AppError::from)?;
    rows.iter().map(history_from_row).collect()
}

pub(crate) async fn list_all(conn: &mut SqliteConnection) -> AppResult<Vec<HistoryRow>> {
    let rows = sqlx::query(
        "SELECT id, child_id, date, old_total_points, new_total_points, \
         change_type, changed_by, changed_at, change_reason \
         FROM points_history ORDER BY id",
    )
    .fetch_all(conn)
    .await
    .map_err(AppError::from)?;
    rows.iter().map(history_from_row).collect()
}

fn history_from_row(row: &SqliteRow) -> AppResult<HistoryRow> {
    let date_raw: String = row.try_get("date").map_err(AppError::from)?;
    let date = date_raw.parse::<NaiveDate>().map_err(|_| {
        AppError::validation("MALFORMED_DATE", "History row carries a malformed date")
            .with_context("date", date_raw.clone())
    })?;
    Ok(HistoryRow {
        id: row.try_get("id").map_err(AppError::from)?,
        child_id: row.try_get("child_id").map_err(AppError::from)?,
        date,
        old_total_points: row.try_get("old_total_points").map_err(AppError::from)?,
        new_total_points: row.try_get("new_total_points").map_err(AppError::from)?,
        change_type: row.try_get("change_type").map_err(AppError::from)?,
        changed_by: row.try_get("changed_by").map_err(AppError::from)?,
        changed_at: row.try_get("changed_at").map_err(AppError::from)?,
        change_reason: row.try_get("change_reason").map_err(AppError::from)?,
    })
}
