use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::config::ClampPolicy;
use crate::history::{self, NewHistory};
use crate::model::ChangeType;
use crate::{balance, AppError, AppResult};

const RECONCILER_ACTOR: &str = "reconciler";

/// Entries sharing one `(child_id, date)` key. `entry_ids` is ascending, so
/// the first element is the canonical (earliest created) record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub child_id: i64,
    pub date: NaiveDate,
    pub entry_ids: Vec<i64>,
}

impl DuplicateGroup {
    pub fn canonical_id(&self) -> i64 {
        self.entry_ids[0]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupReport {
    pub groups: Vec<DuplicateGroup>,
    pub removed: usize,
    pub affected_children: Vec<i64>,
}

/// Scan the whole entry store for `(child_id, date)` keys with more than one
/// row. Maintenance operation; not part of the hot mutation path.
pub async fn find_duplicates(pool: &SqlitePool) -> AppResult<Vec<DuplicateGroup>> {
    let rows = sqlx::query(
        "SELECT child_id, date FROM daily_points \
         GROUP BY child_id, date HAVING COUNT(*) > 1 \
         ORDER BY child_id, date",
    )
    .fetch_all(pool)
    .await
    .map_err(AppError::from)?;

    let mut groups = Vec::with_capacity(rows.len());
    for row in rows {
        let child_id: i64 = row.try_get("child_id").map_err(AppError::from)?;
        let date_raw: String = row.try_get("date").map_err(AppError::from)?;
        let date = date_raw.parse::<NaiveDate>().map_err(|_| {
            AppError::validation("MALFORMED_DATE", "Duplicate scan found a malformed date")
                .with_context("date", date_raw.clone())
                .with_context("child_id", child_id.to_string())
        })?;

        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM daily_points WHERE child_id = ? AND date = ? ORDER BY id",
        )
        .bind(child_id)
        .bind(&date_raw)
        .fetch_all(pool)
        .await
        .map_err(AppError::from)?;

        groups.push(DuplicateGroup {
            child_id,
            date,
            entry_ids: ids,
        });
    }
    Ok(groups)
}

/// Collapse every duplicate group onto its canonical (lowest id) row, then
/// recompute the balance of every affected child.
///
/// Idempotent: a second run over a store with no new duplicates is a no-op.
pub async fn dedup(pool: &SqlitePool, clamp: ClampPolicy) -> AppResult<DedupReport> {
    let groups = find_duplicates(pool).await?;
    if groups.is_empty() {
        return Ok(DedupReport::default());
    }

    let mut tx = pool.begin().await.map_err(AppError::from)?;
    let mut removed = 0usize;
    let mut affected_children: Vec<i64> = Vec::new();

    for group in &groups {
        let keep = group.canonical_id();
        let kept_total: i64 =
            sqlx::query_scalar("SELECT total_points FROM daily_points WHERE id = ?")
                .bind(keep)
                .fetch_one(&mut *tx)
                .await
                .map_err(AppError::from)?;
        let group_total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(total_points), 0) FROM daily_points \
             WHERE child_id = ? AND date = ?",
        )
        .bind(group.child_id)
        .bind(group.date.to_string())
        .fetch_one(&mut *tx)
        .await
        .map_err(AppError::from)?;

        let result = sqlx::query(
            "DELETE FROM daily_points WHERE child_id = ? AND date = ? AND id != ?",
        )
        .bind(group.child_id)
        .bind(group.date.to_string())
        .bind(keep)
        .execute(&mut *tx)
        .await
        .map_err(AppError::from)?;
        removed += result.rows_affected() as usize;

        history::record(
            &mut tx,
            NewHistory {
                child_id: group.child_id,
                date: group.date,
                old_total_points: group_total,
                new_total_points: kept_total,
                change_type: ChangeType::Dedup,
                changed_by: RECONCILER_ACTOR,
                change_reason: "duplicate daily rows collapsed onto earliest record",
            },
        )
        .await?;

        if !affected_children.contains(&group.child_id) {
            affected_children.push(group.child_id);
        }
    }

    for child_id in &affected_children {
        balance::recompute_in_conn(&mut tx, *child_id, clamp).await?;
    }

    tx.commit().await.map_err(AppError::from)?;

    tracing::info!(
        target: "pointledger",
        event = "dedup_complete",
        groups = groups.len(),
        removed,
        children = affected_children.len()
    );

    Ok(DedupReport {
        groups,
        removed,
        affected_children,
    })
}
