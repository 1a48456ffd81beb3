use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{AppError, AppResult};

/// Current on-disk version of a manual adjustment record.
pub const MANUAL_RECORD_VERSION: u32 = 1;

/// A child enrolled at the center. `cumulative_points` is derived state and
/// is only ever written by the balance recomputer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Child {
    pub id: i64,
    pub name: String,
    pub grade: i64,
    pub cumulative_points: i64,
    pub include_in_stats: bool,
    pub created_at: i64,
}

/// The fixed set of automatic scoring categories, one column each on the
/// daily entry row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryPoints {
    #[serde(default)]
    pub korean: i64,
    #[serde(default)]
    pub math: i64,
    #[serde(default)]
    pub ssen: i64,
    #[serde(default)]
    pub reading: i64,
    #[serde(default)]
    pub piano: i64,
    #[serde(default)]
    pub english: i64,
    #[serde(default)]
    pub advanced_math: i64,
    #[serde(default)]
    pub writing: i64,
}

impl CategoryPoints {
    /// Storage column names, in the order `as_array` yields values.
    pub const COLUMNS: [&'static str; 8] = [
        "korean_points",
        "math_points",
        "ssen_points",
        "reading_points",
        "piano_points",
        "english_points",
        "advanced_math_points",
        "writing_points",
    ];

    pub fn as_array(&self) -> [i64; 8] {
        [
            self.korean,
            self.math,
            self.ssen,
            self.reading,
            self.piano,
            self.english,
            self.advanced_math,
            self.writing,
        ]
    }

    pub fn sum(&self) -> i64 {
        self.as_array().iter().sum()
    }

    /// Category values are contributed by the automatic scoring process and
    /// must be non-negative.
    pub fn validate(&self) -> AppResult<()> {
        for (column, value) in Self::COLUMNS.iter().zip(self.as_array()) {
            if value < 0 {
                return Err(AppError::validation(
                    "NEGATIVE_POINTS",
                    format!("Category value must be non-negative, got {value}"),
                )
                .with_context("category", *column));
            }
        }
        Ok(())
    }
}

/// One signed adjustment in an entry's manual ledger.
///
/// Records are append-only: a correction is modeled as a removal followed by
/// a new record. `version` and `points` are deliberately required fields so a
/// malformed or legacy-shaped record fails parsing loudly instead of summing
/// as zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualRecord {
    pub version: u32,
    pub id: i64,
    pub points: i64,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub created_at: i64,
}

/// Parse and validate the embedded manual ledger of one entry.
///
/// Enforces the record version and the unique, strictly increasing local ids
/// the ledger invariant requires.
pub fn parse_manual_ledger(raw: &str) -> AppResult<Vec<ManualRecord>> {
    let records: Vec<ManualRecord> = serde_json::from_str(raw).map_err(|err| {
        AppError::validation("MANUAL_RECORD", "Manual ledger failed to parse")
            .with_cause(AppError::from(err))
    })?;

    let mut last_id: Option<i64> = None;
    for record in &records {
        if record.version != MANUAL_RECORD_VERSION {
            return Err(AppError::validation(
                "MANUAL_RECORD_VERSION",
                format!("Unsupported manual record version {}", record.version),
            )
            .with_context("record_id", record.id.to_string()));
        }
        if let Some(prev) = last_id {
            if record.id <= prev {
                return Err(AppError::integrity(
                    "MANUAL_LEDGER_IDS",
                    "Manual ledger ids must be unique and strictly increasing",
                )
                .with_context("record_id", record.id.to_string())
                .with_context("previous_id", prev.to_string()));
            }
        }
        last_id = Some(record.id);
    }
    Ok(records)
}

pub fn serialize_manual_ledger(records: &[ManualRecord]) -> AppResult<String> {
    serde_json::to_string(records).map_err(AppError::from)
}

pub fn manual_total(records: &[ManualRecord]) -> i64 {
    records.iter().map(|r| r.points).sum()
}

/// The authoritative per-child, per-calendar-day point record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: i64,
    pub child_id: i64,
    pub date: NaiveDate,
    pub points: CategoryPoints,
    pub manual_points: i64,
    pub total_points: i64,
    pub manual_ledger: Vec<ManualRecord>,
    pub created_by: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    PointsInput,
    ManualAdd,
    ManualRemove,
    EntryDelete,
    Dedup,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::PointsInput => "points_input",
            ChangeType::ManualAdd => "manual_add",
            ChangeType::ManualRemove => "manual_remove",
            ChangeType::EntryDelete => "entry_delete",
            ChangeType::Dedup => "dedup",
        }
    }
}

/// One row of the audit trail written alongside every mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub id: i64,
    pub child_id: i64,
    pub date: NaiveDate,
    pub old_total_points: i64,
    pub new_total_points: i64,
    pub change_type: String,
    pub changed_by: String,
    pub changed_at: i64,
    #[serde(default)]
    pub change_reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_category_fails_validation() {
        let points = CategoryPoints {
            math: -10,
            ..Default::default()
        };
        let err = points.validate().unwrap_err();
        assert_eq!(err.code(), "VALIDATION/NEGATIVE_POINTS");
        assert_eq!(
            err.context().get("category"),
            Some(&"math_points".to_string())
        );
    }

    #[test]
    fn category_sum_covers_all_columns() {
        let points = CategoryPoints {
            korean: 100,
            math: 200,
            ssen: 100,
            reading: 100,
            piano: 50,
            english: 50,
            advanced_math: 100,
            writing: 100,
        };
        assert_eq!(points.sum(), 800);
        assert_eq!(CategoryPoints::COLUMNS.len(), points.as_array().len());
    }

    #[test]
    fn ledger_roundtrip() {
        let records = vec![
            ManualRecord {
                version: MANUAL_RECORD_VERSION,
                id: 1,
                points: -150,
                subject: "behavior".into(),
                reason: "correction".into(),
                author: "admin".into(),
                created_at: 1_700_000_000_000,
            },
            ManualRecord {
                version: MANUAL_RECORD_VERSION,
                id: 2,
                points: 50,
                subject: "bonus".into(),
                reason: "reading club".into(),
                author: "teacher".into(),
                created_at: 1_700_000_100_000,
            },
        ];
        let raw = serialize_manual_ledger(&records).unwrap();
        let parsed = parse_manual_ledger(&raw).unwrap();
        assert_eq!(parsed, records);
        assert_eq!(manual_total(&parsed), -100);
    }

    #[test]
    fn legacy_record_without_points_is_rejected() {
        // The legacy store held loosely-shaped dicts; a record missing its
        // delta must fail instead of parsing as zero.
        let raw = r#"[{"version":1,"id":1,"subject":"x","reason":"y"}]"#;
        let err = parse_manual_ledger(raw).unwrap_err();
        assert_eq!(err.code(), "VALIDATION/MANUAL_RECORD");
    }

    #[test]
    fn unknown_version_is_rejected() {
        let raw = r#"[{"version":9,"id":1,"points":10}]"#;
        let err = parse_manual_ledger(raw).unwrap_err();
        assert_eq!(err.code(), "VALIDATION/MANUAL_RECORD_VERSION");
    }

    #[test]
    fn non_increasing_ids_are_rejected() {
        let raw = r#"[{"version":1,"id":2,"points":10},{"version":1,"id":2,"points":5}]"#;
        let err = parse_manual_ledger(raw).unwrap_err();
        assert_eq!(err.code(), "INTEGRITY/MANUAL_LEDGER_IDS");
    }
}
