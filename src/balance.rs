use serde::{Deserialize, Serialize};
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::config::{ClampPolicy, SweepPolicy};
use crate::{AppError, AppResult};

/// One child whose stored balance disagreed with the derived sum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceDrift {
    pub child_id: i64,
    pub name: String,
    pub stored: i64,
    pub derived: i64,
    pub corrected: bool,
}

impl BalanceDrift {
    /// The drift expressed as the integrity error it represents.
    pub fn as_error(&self) -> AppError {
        AppError::integrity(
            "BALANCE_DRIFT",
            format!(
                "Stored balance {} does not match derived sum {}",
                self.stored, self.derived
            ),
        )
        .with_context("child_id", self.child_id.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub drifted: Vec<BalanceDrift>,
}

/// Recompute one child's cumulative balance from its entries and persist it.
///
/// Must run inside the same transaction as the mutation that made the
/// balance stale, so no reader ever observes the invariant broken.
pub(crate) async fn recompute_in_conn(
    conn: &mut SqliteConnection,
    child_id: i64,
    clamp: ClampPolicy,
) -> AppResult<i64> {
    let derived = derived_balance(&mut *conn, child_id, clamp).await?;
    let result = sqlx::query("UPDATE children SET cumulative_points = ? WHERE id = ?")
        .bind(derived)
        .bind(child_id)
        .execute(&mut *conn)
        .await
        .map_err(AppError::from)?;
    if result.rows_affected() == 0 {
        return Err(AppError::not_found("CHILD", "Unknown child")
            .with_context("child_id", child_id.to_string()));
    }
    Ok(derived)
}

pub(crate) async fn derived_balance(
    conn: &mut SqliteConnection,
    child_id: i64,
    clamp: ClampPolicy,
) -> AppResult<i64> {
    let sum: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(total_points), 0) FROM daily_points WHERE child_id = ?",
    )
    .bind(child_id)
    .fetch_one(conn)
    .await
    .map_err(AppError::from)?;
    Ok(clamp.apply(sum))
}

/// Scan every child and compare the stored balance against the derived sum.
///
/// With `SweepPolicy::AutoCorrect` drifted balances are rewritten in place;
/// with `ReportOnly` they are left untouched for operator review. Either way
/// each drift is reported, never silently hidden.
pub async fn sweep(
    pool: &SqlitePool,
    clamp: ClampPolicy,
    policy: SweepPolicy,
) -> AppResult<SweepReport> {
    let mut tx = pool.begin().await.map_err(AppError::from)?;

    let rows = sqlx::query("SELECT id, name, cumulative_points FROM children ORDER BY id")
        .fetch_all(&mut *tx)
        .await
        .map_err(AppError::from)?;

    let mut report = SweepReport {
        scanned: rows.len(),
        drifted: Vec::new(),
    };

    for row in rows {
        let child_id: i64 = row.try_get("id").map_err(AppError::from)?;
        let name: String = row.try_get("name").map_err(AppError::from)?;
        let stored: i64 = row.try_get("cumulative_points").map_err(AppError::from)?;
        let derived = derived_balance(&mut tx, child_id, clamp).await?;
        if stored == derived {
            continue;
        }

        let corrected = policy == SweepPolicy::AutoCorrect;
        if corrected {
            sqlx::query("UPDATE children SET cumulative_points = ? WHERE id = ?")
                .bind(derived)
                .bind(child_id)
                .execute(&mut *tx)
                .await
                .map_err(AppError::from)?;
        }

        let drift = BalanceDrift {
            child_id,
            name,
            stored,
            derived,
            corrected,
        };
        tracing::warn!(
            target: "pointledger",
            event = "balance_drift",
            child_id = drift.child_id,
            stored = drift.stored,
            derived = drift.derived,
            corrected = drift.corrected,
            error = %drift.as_error(),
            "balance drift detected"
        );
        report.drifted.push(drift);
    }

    tx.commit().await.map_err(AppError::from)?;
    Ok(report)
}
