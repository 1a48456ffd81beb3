use chrono::NaiveDate;
use sqlx::SqliteConnection;

use crate::config::ClampPolicy;
use crate::model::{
    manual_total, serialize_manual_ledger, Entry, ManualRecord, MANUAL_RECORD_VERSION,
};
use crate::time::now_ms;
use crate::{entries, AppError, AppResult};

/// A manual adjustment request as supplied by the caller.
#[derive(Debug, Clone)]
pub struct ManualInput {
    pub subject: String,
    /// Signed delta; deductions are negative.
    pub points: i64,
    pub reason: String,
    pub author: String,
}

/// Append a signed adjustment to the entry's ledger.
///
/// Assigns the next local id, recomputes the cached `manual_points` sum and
/// the entry total. The caller holds the child lock and recomputes the
/// balance inside the same transaction.
///
/// Ids come from a per-entry high-water mark (`manual_seq`), not from the
/// surviving records, so removing the newest record never frees its id for
/// reuse and audit rows stay unambiguous.
pub(crate) async fn append_in_conn(
    conn: &mut SqliteConnection,
    child_id: i64,
    date: NaiveDate,
    input: &ManualInput,
    clamp: ClampPolicy,
) -> AppResult<(Entry, ManualRecord)> {
    let entry = require_entry(conn, child_id, date).await?;

    let (seq,): (i64,) = sqlx::query_as("SELECT manual_seq FROM daily_points WHERE id = ?")
        .bind(entry.id)
        .fetch_one(&mut *conn)
        .await
        .map_err(AppError::from)?;
    // Rows from before the high-water column carry seq 0; their ledger still
    // knows the largest id issued so far.
    let high_water = seq.max(entry.manual_ledger.last().map(|r| r.id).unwrap_or(0));
    let next_id = high_water + 1;
    let record = ManualRecord {
        version: MANUAL_RECORD_VERSION,
        id: next_id,
        points: input.points,
        subject: input.subject.clone(),
        reason: input.reason.clone(),
        author: input.author.clone(),
        created_at: now_ms(),
    };

    let mut ledger = entry.manual_ledger.clone();
    ledger.push(record.clone());
    let updated = write_ledger(conn, &entry, ledger, clamp, next_id).await?;
    Ok((updated, record))
}

/// Remove exactly one ledger record by its local id. Corrections are modeled
/// as remove-then-append; records are never edited in place.
pub(crate) async fn remove_in_conn(
    conn: &mut SqliteConnection,
    child_id: i64,
    date: NaiveDate,
    record_id: i64,
    clamp: ClampPolicy,
) -> AppResult<(Entry, ManualRecord)> {
    let entry = require_entry(conn, child_id, date).await?;

    let index = entry
        .manual_ledger
        .iter()
        .position(|r| r.id == record_id)
        .ok_or_else(|| {
            AppError::not_found("MANUAL_RECORD", "No manual record with this id")
                .with_context("child_id", child_id.to_string())
                .with_context("date", date.to_string())
                .with_context("record_id", record_id.to_string())
        })?;

    let mut ledger = entry.manual_ledger.clone();
    let removed = ledger.remove(index);
    let updated = write_ledger(conn, &entry, ledger, clamp, 0).await?;
    Ok((updated, removed))
}

async fn require_entry(
    conn: &mut SqliteConnection,
    child_id: i64,
    date: NaiveDate,
) -> AppResult<Entry> {
    entries::get_in_conn(conn, child_id, date)
        .await?
        .ok_or_else(|| {
            AppError::not_found("ENTRY", "No entry exists for this child and day")
                .with_context("child_id", child_id.to_string())
                .with_context("date", date.to_string())
        })
}

/// Persist the rewritten ledger. `issued` is the newest id handed out by the
/// caller, or 0 when no id was issued; the high-water mark only ever grows.
async fn write_ledger(
    conn: &mut SqliteConnection,
    entry: &Entry,
    ledger: Vec<ManualRecord>,
    clamp: ClampPolicy,
    issued: i64,
) -> AppResult<Entry> {
    let manual_points = manual_total(&ledger);
    let total_points = clamp.apply(entry.points.sum() + manual_points);
    let serialized = serialize_manual_ledger(&ledger)?;

    sqlx::query(
        "UPDATE daily_points SET manual_points = ?, manual_history = ?, \
         total_points = ?, manual_seq = MAX(manual_seq, ?), updated_at = ? WHERE id = ?",
    )
    .bind(manual_points)
    .bind(&serialized)
    .bind(total_points)
    .bind(issued)
    .bind(now_ms())
    .bind(entry.id)
    .execute(&mut *conn)
    .await
    .map_err(AppError::from)?;

    entries::get_in_conn(conn, entry.child_id, entry.date)
        .await?
        .ok_or_else(|| {
            AppError::integrity("LEDGER_READBACK", "Updated entry could not be read back")
                .with_context("entry_id", entry.id.to_string())
        })
}
