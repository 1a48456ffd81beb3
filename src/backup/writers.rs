use std::fs::{self, File};
use std::path::Path;
use std::time::Duration;

use rusqlite::{backup::Backup, Connection, OpenFlags};
use rust_xlsxwriter::{Format, Workbook, Worksheet, XlsxError};
use sha2::{Digest, Sha256};

use super::dataset::BackupDataset;
use crate::db::write_atomic;
use crate::{AppError, AppResult};

/// Write the snapshot document as pretty JSON. Returns the byte size.
pub fn write_json(dataset: &BackupDataset, path: &Path) -> AppResult<u64> {
    let bytes = serde_json::to_vec_pretty(dataset).map_err(AppError::from)?;
    write_atomic(path, &bytes)?;
    Ok(bytes.len() as u64)
}

/// Write the operator-facing spreadsheet: one sheet per entity plus a
/// metadata sheet, headers in bold.
pub fn write_spreadsheet(dataset: &BackupDataset, path: &Path) -> AppResult<u64> {
    let mut workbook = Workbook::new();
    let bold = Format::new().set_bold();

    build_children_sheet(workbook.add_worksheet(), dataset, &bold)
        .and_then(|_| build_entries_sheet(workbook.add_worksheet(), dataset, &bold))
        .and_then(|_| build_manual_sheet(workbook.add_worksheet(), dataset, &bold))
        .and_then(|_| build_history_sheet(workbook.add_worksheet(), dataset, &bold))
        .and_then(|_| build_metadata_sheet(workbook.add_worksheet(), dataset, &bold))
        .map_err(|err| xlsx_err("build_workbook", err))?;

    workbook
        .save(path)
        .map_err(|err| xlsx_err("save_workbook", err).with_context("path", path.display().to_string()))?;
    file_size(path)
}

fn xlsx_err(operation: &str, err: XlsxError) -> AppError {
    AppError::storage_io("SPREADSHEET", err.to_string()).with_context("operation", operation)
}

fn write_headers(sheet: &mut Worksheet, headers: &[&str], bold: &Format) -> Result<(), XlsxError> {
    for (col, header) in headers.iter().enumerate() {
        sheet.write_with_format(0, col as u16, *header, bold)?;
    }
    Ok(())
}

fn build_children_sheet(
    sheet: &mut Worksheet,
    dataset: &BackupDataset,
    bold: &Format,
) -> Result<(), XlsxError> {
    sheet.set_name("children")?;
    write_headers(
        sheet,
        &["id", "name", "grade", "cumulative_points", "include_in_stats", "created_at"],
        bold,
    )?;
    for (i, child) in dataset.children.iter().enumerate() {
        let row = (i + 1) as u32;
        sheet.write_number(row, 0, child.id as f64)?;
        sheet.write_string(row, 1, &child.name)?;
        sheet.write_number(row, 2, child.grade as f64)?;
        sheet.write_number(row, 3, child.cumulative_points as f64)?;
        sheet.write_boolean(row, 4, child.include_in_stats)?;
        sheet.write_number(row, 5, child.created_at as f64)?;
    }
    Ok(())
}

fn build_entries_sheet(
    sheet: &mut Worksheet,
    dataset: &BackupDataset,
    bold: &Format,
) -> Result<(), XlsxError> {
    sheet.set_name("daily_points")?;
    write_headers(
        sheet,
        &[
            "id",
            "child_id",
            "date",
            "korean",
            "math",
            "ssen",
            "reading",
            "piano",
            "english",
            "advanced_math",
            "writing",
            "manual_points",
            "total_points",
            "created_by",
        ],
        bold,
    )?;
    for (i, entry) in dataset.entries.iter().enumerate() {
        let row = (i + 1) as u32;
        sheet.write_number(row, 0, entry.id as f64)?;
        sheet.write_number(row, 1, entry.child_id as f64)?;
        sheet.write_string(row, 2, &entry.date.to_string())?;
        for (offset, value) in entry.points.as_array().iter().enumerate() {
            sheet.write_number(row, (3 + offset) as u16, *value as f64)?;
        }
        sheet.write_number(row, 11, entry.manual_points as f64)?;
        sheet.write_number(row, 12, entry.total_points as f64)?;
        sheet.write_string(row, 13, &entry.created_by)?;
    }
    Ok(())
}

fn build_manual_sheet(
    sheet: &mut Worksheet,
    dataset: &BackupDataset,
    bold: &Format,
) -> Result<(), XlsxError> {
    sheet.set_name("manual_adjustments")?;
    write_headers(
        sheet,
        &["child_id", "date", "record_id", "subject", "points", "reason", "author", "created_at"],
        bold,
    )?;
    let mut row = 1u32;
    for entry in &dataset.entries {
        for record in &entry.manual_ledger {
            sheet.write_number(row, 0, entry.child_id as f64)?;
            sheet.write_string(row, 1, &entry.date.to_string())?;
            sheet.write_number(row, 2, record.id as f64)?;
            sheet.write_string(row, 3, &record.subject)?;
            sheet.write_number(row, 4, record.points as f64)?;
            sheet.write_string(row, 5, &record.reason)?;
            sheet.write_string(row, 6, &record.author)?;
            sheet.write_number(row, 7, record.created_at as f64)?;
            row += 1;
        }
    }
    Ok(())
}

fn build_history_sheet(
    sheet: &mut Worksheet,
    dataset: &BackupDataset,
    bold: &Format,
) -> Result<(), XlsxError> {
    sheet.set_name("points_history")?;
    write_headers(
        sheet,
        &[
            "id",
            "child_id",
            "date",
            "old_total_points",
            "new_total_points",
            "change_type",
            "changed_by",
            "changed_at",
            "change_reason",
        ],
        bold,
    )?;
    for (i, row_data) in dataset.history.iter().enumerate() {
        let row = (i + 1) as u32;
        sheet.write_number(row, 0, row_data.id as f64)?;
        sheet.write_number(row, 1, row_data.child_id as f64)?;
        sheet.write_string(row, 2, &row_data.date.to_string())?;
        sheet.write_number(row, 3, row_data.old_total_points as f64)?;
        sheet.write_number(row, 4, row_data.new_total_points as f64)?;
        sheet.write_string(row, 5, &row_data.change_type)?;
        sheet.write_string(row, 6, &row_data.changed_by)?;
        sheet.write_number(row, 7, row_data.changed_at as f64)?;
        sheet.write_string(row, 8, &row_data.change_reason)?;
    }
    Ok(())
}

fn build_metadata_sheet(
    sheet: &mut Worksheet,
    dataset: &BackupDataset,
    bold: &Format,
) -> Result<(), XlsxError> {
    sheet.set_name("metadata")?;
    let meta = &dataset.backup_metadata;
    let rows = [
        ("backup_id", meta.backup_id.clone()),
        ("backup_type", meta.backup_type.clone()),
        ("timestamp", meta.timestamp.clone()),
        ("data_version", meta.data_version.clone()),
        ("children", meta.records_count.children.to_string()),
        ("entries", meta.records_count.entries.to_string()),
        ("history", meta.records_count.history.to_string()),
    ];
    for (i, (key, value)) in rows.iter().enumerate() {
        let row = i as u32;
        sheet.write_with_format(row, 0, *key, bold)?;
        sheet.write_string(row, 1, value)?;
    }
    Ok(())
}

/// Copy the live store with the SQLite online backup API, so readers and
/// writers on the source are never blocked. The copy is checkpointed and
/// flipped to DELETE journal mode so it is a single self-contained file.
pub fn copy_store(src: &Path, dest: &Path) -> AppResult<u64> {
    let src_flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI;
    let src_conn = Connection::open_with_flags(src, src_flags).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "open_source_db")
            .with_context("path", src.display().to_string())
    })?;
    let mut dest_conn = Connection::open(dest).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "create_backup_db")
            .with_context("path", dest.display().to_string())
    })?;

    {
        let backup = Backup::new(&src_conn, &mut dest_conn)
            .map_err(|err| AppError::from(err).with_context("operation", "backup_init"))?;
        backup
            .run_to_completion(64, Duration::from_millis(25), None)
            .map_err(|err| AppError::from(err).with_context("operation", "backup_step"))?;
    }

    dest_conn
        .execute_batch("PRAGMA wal_checkpoint(PASSIVE);")
        .ok();
    dest_conn.execute_batch("PRAGMA journal_mode=DELETE;").ok();

    dest_conn
        .close()
        .map_err(|(_, err)| AppError::from(err).with_context("operation", "close_backup_db"))?;
    src_conn
        .close()
        .map_err(|(_, err)| AppError::from(err).with_context("operation", "close_source_db"))?;

    file_size(dest)
}

pub fn file_size(path: &Path) -> AppResult<u64> {
    Ok(fs::metadata(path)
        .map_err(|err| AppError::from(err).with_context("path", path.display().to_string()))?
        .len())
}

pub fn file_sha256(path: &Path) -> AppResult<String> {
    let mut file = File::open(path)
        .map_err(|err| AppError::from(err).with_context("path", path.display().to_string()))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)
        .map_err(|err| AppError::from(err).with_context("operation", "hash_file"))?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::dataset::{BackupMetadata, RecordCounts};
    use crate::model::{CategoryPoints, Child, Entry, ManualRecord, MANUAL_RECORD_VERSION};
    use tempfile::tempdir;

    fn sample_dataset() -> BackupDataset {
        BackupDataset {
            backup_metadata: BackupMetadata {
                backup_id: "2024-05-05_10-00-00".into(),
                backup_type: "manual".into(),
                timestamp: "2024-05-05T10:00:00.000+09:00".into(),
                data_version: "1.0.0".into(),
                records_count: RecordCounts {
                    children: 1,
                    entries: 1,
                    history: 0,
                },
            },
            children: vec![Child {
                id: 1,
                name: "Mina".into(),
                grade: 3,
                cumulative_points: 250,
                include_in_stats: true,
                created_at: 0,
            }],
            entries: vec![Entry {
                id: 1,
                child_id: 1,
                date: "2024-05-05".parse().unwrap(),
                points: CategoryPoints {
                    math: 300,
                    ..Default::default()
                },
                manual_points: -50,
                total_points: 250,
                manual_ledger: vec![ManualRecord {
                    version: MANUAL_RECORD_VERSION,
                    id: 1,
                    points: -50,
                    subject: "behavior".into(),
                    reason: "late".into(),
                    author: "director".into(),
                    created_at: 0,
                }],
                created_by: "teacher".into(),
                created_at: 0,
                updated_at: 0,
            }],
            history: Vec::new(),
        }
    }

    #[test]
    fn json_writer_round_trips() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("snapshot.json");
        let dataset = sample_dataset();
        let size = write_json(&dataset, &path).unwrap();
        assert_eq!(size, fs::metadata(&path).unwrap().len());
        let parsed: BackupDataset =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(parsed, dataset);
    }

    #[test]
    fn spreadsheet_writer_produces_a_file() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("snapshot.xlsx");
        let size = write_spreadsheet(&sample_dataset(), &path).unwrap();
        assert!(size > 0);
        assert!(path.exists());
    }

    #[test]
    fn store_copy_is_readable_standalone() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("live.db");
        let dest = tmp.path().join("copy.db");

        let conn = Connection::open(&src).unwrap();
        conn.execute_batch(
            "CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (41), (1);",
        )
        .unwrap();
        conn.close().unwrap();

        let size = copy_store(&src, &dest).unwrap();
        assert!(size > 0);

        let copy = Connection::open(&dest).unwrap();
        let sum: i64 = copy
            .query_row("SELECT SUM(v) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(sum, 42);
    }

    #[test]
    fn sha256_matches_known_vector() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("abc.txt");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            file_sha256(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
