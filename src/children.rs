use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::model::Child;
use crate::time::now_ms;
use crate::{AppError, AppResult};

pub async fn create_child(pool: &SqlitePool, name: &str, grade: i64) -> AppResult<Child> {
    if name.trim().is_empty() {
        return Err(AppError::validation("CHILD_NAME", "Child name must not be empty"));
    }
    let now = now_ms();
    let result = sqlx::query(
        "INSERT INTO children (name, grade, cumulative_points, include_in_stats, created_at) \
         VALUES (?, ?, 0, 1, ?)",
    )
    .bind(name)
    .bind(grade)
    .bind(now)
    .execute(pool)
    .await
    .map_err(AppError::from)?;

    Ok(Child {
        id: result.last_insert_rowid(),
        name: name.to_string(),
        grade,
        cumulative_points: 0,
        include_in_stats: true,
        created_at: now,
    })
}

pub async fn get_child(pool: &SqlitePool, child_id: i64) -> AppResult<Child> {
    let mut conn = pool.acquire().await.map_err(AppError::from)?;
    get_child_in_conn(conn.as_mut(), child_id).await
}

pub(crate) async fn get_child_in_conn(
    conn: &mut SqliteConnection,
    child_id: i64,
) -> AppResult<Child> {
    let row = sqlx::query(
        "SELECT id, name, grade, cumulative_points, include_in_stats, created_at \
         FROM children WHERE id = ?",
    )
    .bind(child_id)
    .fetch_optional(conn)
    .await
    .map_err(AppError::from)?;

    match row {
        Some(row) => child_from_row(&row),
        None => Err(AppError::not_found("CHILD", "Unknown child")
            .with_context("child_id", child_id.to_string())),
    }
}

pub async fn list_children(pool: &SqlitePool) -> AppResult<Vec<Child>> {
    let mut conn = pool.acquire().await.map_err(AppError::from)?;
    list_children_in_conn(conn.as_mut()).await
}

pub(crate) async fn list_children_in_conn(
    conn: &mut SqliteConnection,
) -> AppResult<Vec<Child>> {
    let rows = sqlx::query(
        "SELECT id, name, grade, cumulative_points, include_in_stats, created_at \
         FROM children ORDER BY grade, name",
    )
    .fetch_all(conn)
    .await
    .map_err(AppError::from)?;
    rows.iter().map(child_from_row).collect()
}

pub async fn set_include_in_stats(
    pool: &SqlitePool,
    child_id: i64,
    include: bool,
) -> AppResult<()> {
    let result = sqlx::query("UPDATE children SET include_in_stats = ? WHERE id = ?")
        .bind(include as i64)
        .bind(child_id)
        .execute(pool)
        .await
        .map_err(AppError::from)?;
    if result.rows_affected() == 0 {
        return Err(AppError::not_found("CHILD", "Unknown child")
            .with_context("child_id", child_id.to_string()));
    }
    Ok(())
}

fn child_from_row(row: &SqliteRow) -> AppResult<Child> {
    let include: i64 = row.try_get("include_in_stats").map_err(AppError::from)?;
    Ok(Child {
        id: row.try_get("id").map_err(AppError::from)?,
        name: row.try_get("name").map_err(AppError::from)?,
        grade: row.try_get("grade").map_err(AppError::from)?,
        cumulative_points: row.try_get("cumulative_points").map_err(AppError::from)?,
        include_in_stats: include != 0,
        created_at: row.try_get("created_at").map_err(AppError::from)?,
    })
}
