use chrono::NaiveDate;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::config::ClampPolicy;
use crate::error::is_unique_violation;
use crate::model::{parse_manual_ledger, CategoryPoints, Entry};
use crate::time::now_ms;
use crate::{children, AppError, AppResult};

const ENTRY_COLUMNS: &str = "id, child_id, date, \
    korean_points, math_points, ssen_points, reading_points, \
    piano_points, english_points, advanced_math_points, writing_points, \
    manual_points, manual_history, total_points, created_by, created_at, updated_at";

const EXCLUDED_CATEGORY_SUM: &str = "excluded.korean_points + excluded.math_points + \
    excluded.ssen_points + excluded.reading_points + excluded.piano_points + \
    excluded.english_points + excluded.advanced_math_points + excluded.writing_points";

/// Create or replace the day's automatic category points for a child.
///
/// The `(child_id, date)` uniqueness is enforced by the store's unique index,
/// so concurrent submissions collapse onto one row instead of racing an
/// application-level check-then-insert. On conflict the category columns are
/// replaced, the manual ledger and its cached sum are preserved, and the
/// total is recomputed in the same statement.
pub async fn upsert_in_conn(
    conn: &mut SqliteConnection,
    child_id: i64,
    date: NaiveDate,
    points: &CategoryPoints,
    actor: &str,
    clamp: ClampPolicy,
) -> AppResult<Entry> {
    points.validate()?;
    children::get_child_in_conn(&mut *conn, child_id).await?;

    let now = now_ms();
    let total = clamp.apply(points.sum());
    let total_expr = match clamp {
        ClampPolicy::AllowNegative => {
            format!("{EXCLUDED_CATEGORY_SUM} + daily_points.manual_points")
        }
        ClampPolicy::FloorAtZero => {
            format!("MAX(0, {EXCLUDED_CATEGORY_SUM} + daily_points.manual_points)")
        }
    };
    let sql = format!(
        "INSERT INTO daily_points (child_id, date, \
         korean_points, math_points, ssen_points, reading_points, \
         piano_points, english_points, advanced_math_points, writing_points, \
         manual_points, manual_history, total_points, created_by, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, '[]', ?, ?, ?, ?) \
         ON CONFLICT(child_id, date) DO UPDATE SET \
         korean_points = excluded.korean_points, \
         math_points = excluded.math_points, \
         ssen_points = excluded.ssen_points, \
         reading_points = excluded.reading_points, \
         piano_points = excluded.piano_points, \
         english_points = excluded.english_points, \
         advanced_math_points = excluded.advanced_math_points, \
         writing_points = excluded.writing_points, \
         total_points = {total_expr}, \
         updated_at = excluded.updated_at"
    );

    let values = points.as_array();
    let mut query = sqlx::query(&sql).bind(child_id).bind(date.to_string());
    for value in values {
        query = query.bind(value);
    }
    query
        .bind(total)
        .bind(actor)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(AppError::from)?;

    get_in_conn(conn, child_id, date).await?.ok_or_else(|| {
        AppError::integrity("UPSERT_READBACK", "Upserted entry could not be read back")
            .with_context("child_id", child_id.to_string())
            .with_context("date", date.to_string())
    })
}

/// Insert-or-fail variant for callers that must not overwrite an existing
/// day. Surfaces the unique-index violation as a `CONFLICT` error.
pub async fn insert_new_in_conn(
    conn: &mut SqliteConnection,
    child_id: i64,
    date: NaiveDate,
    points: &CategoryPoints,
    actor: &str,
    clamp: ClampPolicy,
) -> AppResult<Entry> {
    points.validate()?;
    children::get_child_in_conn(&mut *conn, child_id).await?;

    let now = now_ms();
    let total = clamp.apply(points.sum());
    let mut query = sqlx::query(
        "INSERT INTO daily_points (child_id, date, \
         korean_points, math_points, ssen_points, reading_points, \
         piano_points, english_points, advanced_math_points, writing_points, \
         manual_points, manual_history, total_points, created_by, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, '[]', ?, ?, ?, ?)",
    )
    .bind(child_id)
    .bind(date.to_string());
    for value in points.as_array() {
        query = query.bind(value);
    }
    query
        .bind(total)
        .bind(actor)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(AppError::from)
        .map_err(|err| {
            if is_unique_violation(&err) {
                AppError::conflict("DUPLICATE_ENTRY", "An entry already exists for this day")
                    .with_context("child_id", child_id.to_string())
                    .with_context("date", date.to_string())
                    .with_cause(err)
            } else {
                err
            }
        })?;

    get_in_conn(conn, child_id, date).await?.ok_or_else(|| {
        AppError::integrity("INSERT_READBACK", "Inserted entry could not be read back")
            .with_context("child_id", child_id.to_string())
    })
}

pub async fn get(pool: &SqlitePool, child_id: i64, date: NaiveDate) -> AppResult<Option<Entry>> {
    let mut conn = pool.acquire().await.map_err(AppError::from)?;
    get_in_conn(conn.as_mut(), child_id, date).await
}

pub(crate) async fn get_in_conn(
    conn: &mut SqliteConnection,
    child_id: i64,
    date: NaiveDate,
) -> AppResult<Option<Entry>> {
    let sql = format!("SELECT {ENTRY_COLUMNS} FROM daily_points WHERE child_id = ? AND date = ?");
    let row = sqlx::query(&sql)
        .bind(child_id)
        .bind(date.to_string())
        .fetch_optional(conn)
        .await
        .map_err(AppError::from)?;
    row.as_ref().map(entry_from_row).transpose()
}

/// All entries for one child, newest day first.
pub async fn list_by_child(pool: &SqlitePool, child_id: i64) -> AppResult<Vec<Entry>> {
    let mut conn = pool.acquire().await.map_err(AppError::from)?;
    list_by_child_in_conn(conn.as_mut(), child_id).await
}

pub(crate) async fn list_by_child_in_conn(
    conn: &mut SqliteConnection,
    child_id: i64,
) -> AppResult<Vec<Entry>> {
    let sql =
        format!("SELECT {ENTRY_COLUMNS} FROM daily_points WHERE child_id = ? ORDER BY date DESC");
    let rows = sqlx::query(&sql)
        .bind(child_id)
        .fetch_all(conn)
        .await
        .map_err(AppError::from)?;
    rows.iter().map(entry_from_row).collect()
}

pub(crate) async fn list_all_in_conn(conn: &mut SqliteConnection) -> AppResult<Vec<Entry>> {
    let sql = format!("SELECT {ENTRY_COLUMNS} FROM daily_points ORDER BY child_id, date");
    let rows = sqlx::query(&sql)
        .fetch_all(conn)
        .await
        .map_err(AppError::from)?;
    rows.iter().map(entry_from_row).collect()
}

/// Administrative removal of a whole day. Returns the deleted entry so the
/// caller can audit it; the caller must recompute the owning balance.
pub(crate) async fn delete_in_conn(
    conn: &mut SqliteConnection,
    child_id: i64,
    date: NaiveDate,
) -> AppResult<Entry> {
    let entry = get_in_conn(&mut *conn, child_id, date).await?.ok_or_else(|| {
        AppError::not_found("ENTRY", "No entry exists for this child and day")
            .with_context("child_id", child_id.to_string())
            .with_context("date", date.to_string())
    })?;

    sqlx::query("DELETE FROM daily_points WHERE id = ?")
        .bind(entry.id)
        .execute(conn)
        .await
        .map_err(AppError::from)?;
    Ok(entry)
}

pub(crate) fn entry_from_row(row: &SqliteRow) -> AppResult<Entry> {
    let date_raw: String = row.try_get("date").map_err(AppError::from)?;
    let date = date_raw.parse::<NaiveDate>().map_err(|_| {
        AppError::validation("MALFORMED_DATE", "Entry row carries a malformed date")
            .with_context("date", date_raw.clone())
    })?;
    let ledger_raw: String = row.try_get("manual_history").map_err(AppError::from)?;
    let manual_ledger = parse_manual_ledger(&ledger_raw)?;

    Ok(Entry {
        id: row.try_get("id").map_err(AppError::from)?,
        child_id: row.try_get("child_id").map_err(AppError::from)?,
        date,
        points: CategoryPoints {
            korean: row.try_get("korean_points").map_err(AppError::from)?,
            math: row.try_get("math_points").map_err(AppError::from)?,
            ssen: row.try_get("ssen_points").map_err(AppError::from)?,
            reading: row.try_get("reading_points").map_err(AppError::from)?,
            piano: row.try_get("piano_points").map_err(AppError::from)?,
            english: row.try_get("english_points").map_err(AppError::from)?,
            advanced_math: row.try_get("advanced_math_points").map_err(AppError::from)?,
            writing: row.try_get("writing_points").map_err(AppError::from)?,
        },
        manual_points: row.try_get("manual_points").map_err(AppError::from)?,
        total_points: row.try_get("total_points").map_err(AppError::from)?,
        manual_ledger,
        created_by: row.try_get("created_by").map_err(AppError::from)?,
        created_at: row.try_get("created_at").map_err(AppError::from)?,
        updated_at: row.try_get("updated_at").map_err(AppError::from)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::children::create_child;
    use crate::db::open_sqlite_pool;
    use crate::schema::ensure_schema;
    use tempfile::tempdir;

    async fn setup() -> (tempfile::TempDir, SqlitePool, i64) {
        let tmp = tempdir().unwrap();
        let pool = open_sqlite_pool(&tmp.path().join("ledger.db")).await.unwrap();
        ensure_schema(&pool, ClampPolicy::AllowNegative).await.unwrap();
        let child = create_child(&pool, "Juno", 4).await.unwrap();
        (tmp, pool, child.id)
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn upsert_replaces_categories_and_keeps_one_row() {
        let (_tmp, pool, child_id) = setup().await;
        let mut conn = pool.acquire().await.unwrap();

        let first = CategoryPoints {
            korean: 200,
            math: 100,
            ..Default::default()
        };
        let entry = upsert_in_conn(
            conn.as_mut(),
            child_id,
            date("2024-02-10"),
            &first,
            "teacher",
            ClampPolicy::AllowNegative,
        )
        .await
        .unwrap();
        assert_eq!(entry.total_points, 300);

        let second = CategoryPoints {
            korean: 100,
            reading: 100,
            ..Default::default()
        };
        let replaced = upsert_in_conn(
            conn.as_mut(),
            child_id,
            date("2024-02-10"),
            &second,
            "teacher",
            ClampPolicy::AllowNegative,
        )
        .await
        .unwrap();
        assert_eq!(replaced.id, entry.id);
        assert_eq!(replaced.points, second);
        assert_eq!(replaced.total_points, 200);

        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM daily_points WHERE child_id = ?")
                .bind(child_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn insert_new_surfaces_conflict() {
        let (_tmp, pool, child_id) = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        let points = CategoryPoints::default();
        insert_new_in_conn(
            conn.as_mut(),
            child_id,
            date("2024-03-01"),
            &points,
            "teacher",
            ClampPolicy::AllowNegative,
        )
        .await
        .unwrap();
        let err = insert_new_in_conn(
            conn.as_mut(),
            child_id,
            date("2024-03-01"),
            &points,
            "teacher",
            ClampPolicy::AllowNegative,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "CONFLICT/DUPLICATE_ENTRY");
    }

    #[tokio::test]
    async fn negative_category_is_rejected() {
        let (_tmp, pool, child_id) = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        let points = CategoryPoints {
            reading: -1,
            ..Default::default()
        };
        let err = upsert_in_conn(
            conn.as_mut(),
            child_id,
            date("2024-03-01"),
            &points,
            "teacher",
            ClampPolicy::AllowNegative,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "VALIDATION/NEGATIVE_POINTS");
    }

    #[tokio::test]
    async fn unknown_child_is_rejected() {
        let (_tmp, pool, _child_id) = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        let err = upsert_in_conn(
            conn.as_mut(),
            404,
            date("2024-03-01"),
            &CategoryPoints::default(),
            "teacher",
            ClampPolicy::AllowNegative,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND/CHILD");
    }

    #[tokio::test]
    async fn list_by_child_orders_date_descending() {
        let (_tmp, pool, child_id) = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        for day in ["2024-01-01", "2024-01-03", "2024-01-02"] {
            upsert_in_conn(
                conn.as_mut(),
                child_id,
                date(day),
                &CategoryPoints::default(),
                "teacher",
                ClampPolicy::AllowNegative,
            )
            .await
            .unwrap();
        }
        let entries = list_by_child(&pool, child_id).await.unwrap();
        let dates: Vec<String> = entries.iter().map(|e| e.date.to_string()).collect();
        assert_eq!(dates, vec!["2024-01-03", "2024-01-02", "2024-01-01"]);
    }
}
