//! The embedder-facing facade. Every mutation runs under the owning child's
//! lock, inside one transaction that also recomputes the cumulative balance
//! and appends the audit row, so no reader ever observes a stale balance.

use std::sync::{Arc, Mutex};

use chrono::NaiveDate;

use crate::backup::{self, BackupArtifact, JobOutcome, JobStatus, RestoreOutcome, RestoreRequest, Scheduler, TriggerKind};
use crate::balance::{self, SweepReport};
use crate::config::EngineConfig;
use crate::history::{self, NewHistory};
use crate::manual::ManualInput;
use crate::model::{CategoryPoints, ChangeType, Child, Entry, HistoryRow, ManualRecord};
use crate::notify::{LogSink, NotificationSink};
use crate::reconcile::{self, DedupReport, DuplicateGroup};
use crate::state::EngineState;
use crate::{children, db, entries, manual, schema, AppError, AppResult};

pub struct Engine {
    state: Arc<EngineState>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl Engine {
    pub async fn open(config: EngineConfig) -> AppResult<Engine> {
        Engine::open_with_sink(config, Arc::new(LogSink)).await
    }

    pub async fn open_with_sink(
        config: EngineConfig,
        sink: Arc<dyn NotificationSink>,
    ) -> AppResult<Engine> {
        let pool = db::open_sqlite_pool(&config.db_path).await?;
        schema::ensure_schema(&pool, config.clamp).await?;
        Ok(Engine {
            state: Arc::new(EngineState::new(pool, config, sink)),
            scheduler: Mutex::new(None),
        })
    }

    // ---- child registry ----

    pub async fn create_child(&self, name: &str, grade: i64) -> AppResult<Child> {
        self.state.ensure_not_maintenance()?;
        children::create_child(&self.state.pool_clone(), name, grade).await
    }

    pub async fn child(&self, child_id: i64) -> AppResult<Child> {
        children::get_child(&self.state.pool_clone(), child_id).await
    }

    pub async fn list_children(&self) -> AppResult<Vec<Child>> {
        children::list_children(&self.state.pool_clone()).await
    }

    pub async fn set_include_in_stats(&self, child_id: i64, include: bool) -> AppResult<()> {
        self.state.ensure_not_maintenance()?;
        children::set_include_in_stats(&self.state.pool_clone(), child_id, include).await
    }

    /// The stored cumulative balance, without recomputation.
    pub async fn balance(&self, child_id: i64) -> AppResult<i64> {
        Ok(self.child(child_id).await?.cumulative_points)
    }

    // ---- daily entries ----

    /// Create or replace the day's automatic category points. Replacing
    /// preserves the entry's manual ledger.
    pub async fn submit_points(
        &self,
        child_id: i64,
        date: NaiveDate,
        points: CategoryPoints,
        actor: &str,
    ) -> AppResult<Entry> {
        let _lock = self.state.lock_child(child_id).await;
        let _writes = self.state.lock_writes().await;
        self.state.ensure_not_maintenance()?;

        let pool = self.state.pool_clone();
        let mut tx = pool.begin().await.map_err(AppError::from)?;
        let old_total = entries::get_in_conn(&mut tx, child_id, date)
            .await?
            .map(|e| e.total_points)
            .unwrap_or(0);
        let entry =
            entries::upsert_in_conn(&mut tx, child_id, date, &points, actor, self.clamp()).await?;
        balance::recompute_in_conn(&mut tx, child_id, self.clamp()).await?;
        history::record(
            &mut tx,
            NewHistory {
                child_id,
                date,
                old_total_points: old_total,
                new_total_points: entry.total_points,
                change_type: ChangeType::PointsInput,
                changed_by: actor,
                change_reason: "",
            },
        )
        .await?;
        tx.commit().await.map_err(AppError::from)?;

        self.after_mutation();
        Ok(entry)
    }

    /// Append a signed manual adjustment to the day's ledger.
    pub async fn append_manual(
        &self,
        child_id: i64,
        date: NaiveDate,
        input: ManualInput,
    ) -> AppResult<(Entry, ManualRecord)> {
        let _lock = self.state.lock_child(child_id).await;
        let _writes = self.state.lock_writes().await;
        self.state.ensure_not_maintenance()?;

        let pool = self.state.pool_clone();
        let mut tx = pool.begin().await.map_err(AppError::from)?;
        let old_total = entries::get_in_conn(&mut tx, child_id, date)
            .await?
            .map(|e| e.total_points)
            .unwrap_or(0);
        let (entry, record) =
            manual::append_in_conn(&mut tx, child_id, date, &input, self.clamp()).await?;
        balance::recompute_in_conn(&mut tx, child_id, self.clamp()).await?;
        history::record(
            &mut tx,
            NewHistory {
                child_id,
                date,
                old_total_points: old_total,
                new_total_points: entry.total_points,
                change_type: ChangeType::ManualAdd,
                changed_by: &input.author,
                change_reason: &input.reason,
            },
        )
        .await?;
        tx.commit().await.map_err(AppError::from)?;

        self.after_mutation();
        Ok((entry, record))
    }

    /// Remove one manual record by its ledger-local id.
    pub async fn remove_manual(
        &self,
        child_id: i64,
        date: NaiveDate,
        record_id: i64,
        actor: &str,
    ) -> AppResult<(Entry, ManualRecord)> {
        let _lock = self.state.lock_child(child_id).await;
        let _writes = self.state.lock_writes().await;
        self.state.ensure_not_maintenance()?;

        let pool = self.state.pool_clone();
        let mut tx = pool.begin().await.map_err(AppError::from)?;
        let old_total = entries::get_in_conn(&mut tx, child_id, date)
            .await?
            .map(|e| e.total_points)
            .unwrap_or(0);
        let (entry, removed) =
            manual::remove_in_conn(&mut tx, child_id, date, record_id, self.clamp()).await?;
        balance::recompute_in_conn(&mut tx, child_id, self.clamp()).await?;
        let reason = format!("removed manual record {record_id}");
        history::record(
            &mut tx,
            NewHistory {
                child_id,
                date,
                old_total_points: old_total,
                new_total_points: entry.total_points,
                change_type: ChangeType::ManualRemove,
                changed_by: actor,
                change_reason: &reason,
            },
        )
        .await?;
        tx.commit().await.map_err(AppError::from)?;

        self.after_mutation();
        Ok((entry, removed))
    }

    /// Remove a whole day's entry. Returns the deleted entry for auditing.
    pub async fn delete_entry(
        &self,
        child_id: i64,
        date: NaiveDate,
        actor: &str,
    ) -> AppResult<Entry> {
        let _lock = self.state.lock_child(child_id).await;
        let _writes = self.state.lock_writes().await;
        self.state.ensure_not_maintenance()?;

        let pool = self.state.pool_clone();
        let mut tx = pool.begin().await.map_err(AppError::from)?;
        let entry = entries::delete_in_conn(&mut tx, child_id, date).await?;
        balance::recompute_in_conn(&mut tx, child_id, self.clamp()).await?;
        history::record(
            &mut tx,
            NewHistory {
                child_id,
                date,
                old_total_points: entry.total_points,
                new_total_points: 0,
                change_type: ChangeType::EntryDelete,
                changed_by: actor,
                change_reason: "daily entry removed",
            },
        )
        .await?;
        tx.commit().await.map_err(AppError::from)?;

        self.after_mutation();
        Ok(entry)
    }

    pub async fn entry(&self, child_id: i64, date: NaiveDate) -> AppResult<Option<Entry>> {
        entries::get(&self.state.pool_clone(), child_id, date).await
    }

    pub async fn entries_for_child(&self, child_id: i64) -> AppResult<Vec<Entry>> {
        entries::list_by_child(&self.state.pool_clone(), child_id).await
    }

    pub async fn history_for_child(&self, child_id: i64) -> AppResult<Vec<HistoryRow>> {
        history::list_for_child(&self.state.pool_clone(), child_id).await
    }

    // ---- reconciliation ----

    /// Recompute and persist one child's balance from its entries.
    pub async fn recompute_balance(&self, child_id: i64) -> AppResult<i64> {
        let _lock = self.state.lock_child(child_id).await;
        let _writes = self.state.lock_writes().await;
        self.state.ensure_not_maintenance()?;
        let pool = self.state.pool_clone();
        let mut conn = pool.acquire().await.map_err(AppError::from)?;
        balance::recompute_in_conn(conn.as_mut(), child_id, self.clamp()).await
    }

    pub async fn sweep(&self) -> AppResult<SweepReport> {
        let _writes = self.state.lock_writes().await;
        self.state.ensure_not_maintenance()?;
        balance::sweep(
            &self.state.pool_clone(),
            self.state.config.clamp,
            self.state.config.sweep,
        )
        .await
    }

    pub async fn find_duplicates(&self) -> AppResult<Vec<DuplicateGroup>> {
        reconcile::find_duplicates(&self.state.pool_clone()).await
    }

    pub async fn dedup(&self) -> AppResult<DedupReport> {
        let _writes = self.state.lock_writes().await;
        self.state.ensure_not_maintenance()?;
        reconcile::dedup(&self.state.pool_clone(), self.clamp()).await
    }

    // ---- backup and restore ----

    /// Run a snapshot now and wait for it. Fails if one is already running.
    pub async fn backup_now(&self) -> AppResult<JobOutcome> {
        let outcome = backup::run_job(self.state.clone(), TriggerKind::Manual).await;
        match outcome.status {
            JobStatus::Succeeded => Ok(outcome),
            JobStatus::Skipped => Err(AppError::new(
                "BACKUP/ALREADY_RUNNING",
                "A manual backup is already in progress",
            )),
            JobStatus::Failed => Err(outcome
                .error
                .unwrap_or_else(|| AppError::new("BACKUP/FAILED", "Backup failed"))),
        }
    }

    pub async fn list_artifacts(&self) -> AppResult<Vec<BackupArtifact>> {
        backup::list_artifacts(&self.state).await
    }

    pub async fn restore(&self, request: RestoreRequest) -> AppResult<RestoreOutcome> {
        backup::restore(&self.state, &request).await
    }

    // ---- scheduler lifecycle ----

    pub fn start_scheduler(&self) -> AppResult<()> {
        let mut slot = self.scheduler.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Err(AppError::new(
                "SCHEDULER/ALREADY_RUNNING",
                "The backup scheduler is already running",
            ));
        }
        *slot = Some(Scheduler::start(self.state.clone()));
        Ok(())
    }

    pub async fn stop_scheduler(&self) {
        let scheduler = {
            let mut slot = self.scheduler.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some(scheduler) = scheduler {
            scheduler.stop().await;
        }
    }

    /// Stop background work and close the store.
    pub async fn close(&self) {
        self.stop_scheduler().await;
        self.state.pool_clone().close().await;
    }

    fn clamp(&self) -> crate::config::ClampPolicy {
        self.state.config.clamp
    }

    /// Fire-and-forget realtime snapshot after a settled mutation. Skips and
    /// overlaps are handled by the job's single-flight state.
    fn after_mutation(&self) {
        if !self.state.config.realtime_backups {
            return;
        }
        let state = self.state.clone();
        tokio::spawn(async move {
            backup::run_job(state, TriggerKind::Realtime).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn open_engine(tmp: &tempfile::TempDir) -> Engine {
        let config = EngineConfig::new(tmp.path().join("ledger.db"))
            .with_backup_root(tmp.path().join("backups"))
            .with_realtime_backups(false);
        Engine::open(config).await.unwrap()
    }

    #[tokio::test]
    async fn submit_then_adjust_keeps_balance_derived() {
        let tmp = tempdir().unwrap();
        let engine = open_engine(&tmp).await;
        let child = engine.create_child("Jiwoo", 3).await.unwrap();
        let day1: NaiveDate = "2024-05-01".parse().unwrap();
        let day2: NaiveDate = "2024-05-02".parse().unwrap();

        engine
            .submit_points(
                child.id,
                day1,
                CategoryPoints {
                    korean: 200,
                    math: 200,
                    ..Default::default()
                },
                "teacher",
            )
            .await
            .unwrap();
        engine
            .submit_points(
                child.id,
                day2,
                CategoryPoints {
                    reading: 300,
                    ..Default::default()
                },
                "teacher",
            )
            .await
            .unwrap();
        assert_eq!(engine.balance(child.id).await.unwrap(), 700);

        let (entry, record) = engine
            .append_manual(
                child.id,
                day2,
                ManualInput {
                    subject: "behavior".into(),
                    points: -150,
                    reason: "misbehavior".into(),
                    author: "director".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(record.id, 1);
        assert_eq!(entry.manual_points, -150);
        assert_eq!(entry.total_points, 150);
        assert_eq!(engine.balance(child.id).await.unwrap(), 550);

        // Re-submitting the day's categories preserves the manual ledger.
        let entry = engine
            .submit_points(
                child.id,
                day2,
                CategoryPoints {
                    reading: 400,
                    ..Default::default()
                },
                "teacher",
            )
            .await
            .unwrap();
        assert_eq!(entry.manual_ledger.len(), 1);
        assert_eq!(entry.total_points, 250);
        assert_eq!(engine.balance(child.id).await.unwrap(), 650);

        let history = engine.history_for_child(child.id).await.unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].change_type, "points_input");
        assert_eq!(history[1].change_type, "manual_add");
        assert_eq!(history[1].change_reason, "misbehavior");
    }

    #[tokio::test]
    async fn remove_manual_and_delete_entry_roll_the_balance_back() {
        let tmp = tempdir().unwrap();
        let engine = open_engine(&tmp).await;
        let child = engine.create_child("Minho", 5).await.unwrap();
        let day: NaiveDate = "2024-06-10".parse().unwrap();

        engine
            .submit_points(
                child.id,
                day,
                CategoryPoints {
                    piano: 100,
                    ..Default::default()
                },
                "teacher",
            )
            .await
            .unwrap();
        let (_, record) = engine
            .append_manual(
                child.id,
                day,
                ManualInput {
                    subject: "bonus".into(),
                    points: 50,
                    reason: "helped cleanup".into(),
                    author: "teacher".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(engine.balance(child.id).await.unwrap(), 150);

        let (entry, removed) = engine
            .remove_manual(child.id, day, record.id, "director")
            .await
            .unwrap();
        assert_eq!(removed.id, record.id);
        assert_eq!(entry.total_points, 100);
        assert_eq!(engine.balance(child.id).await.unwrap(), 100);

        let deleted = engine.delete_entry(child.id, day, "director").await.unwrap();
        assert_eq!(deleted.total_points, 100);
        assert_eq!(engine.balance(child.id).await.unwrap(), 0);
        assert!(engine.entry(child.id, day).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_targets_surface_not_found() {
        let tmp = tempdir().unwrap();
        let engine = open_engine(&tmp).await;
        let day: NaiveDate = "2024-06-10".parse().unwrap();

        let err = engine
            .submit_points(99, day, CategoryPoints::default(), "teacher")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND/CHILD");

        let child = engine.create_child("Sol", 2).await.unwrap();
        let err = engine
            .append_manual(
                child.id,
                day,
                ManualInput {
                    subject: "x".into(),
                    points: 1,
                    reason: String::new(),
                    author: "a".into(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND/ENTRY");
    }

    #[tokio::test]
    async fn scheduler_start_is_exclusive() {
        let tmp = tempdir().unwrap();
        let engine = open_engine(&tmp).await;
        engine.start_scheduler().unwrap();
        let err = engine.start_scheduler().unwrap_err();
        assert_eq!(err.code(), "SCHEDULER/ALREADY_RUNNING");
        engine.stop_scheduler().await;
        engine.start_scheduler().unwrap();
        engine.close().await;
    }
}
