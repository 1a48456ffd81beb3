//! Wall-clock trigger loop: a daily snapshot at the configured time, a
//! monthly archive on the last calendar day, and the integrity sweep after
//! each daily run.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Local, NaiveDate};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::{run_job, JobStatus, TriggerKind};
use crate::balance;
use crate::state::EngineState;

pub struct Scheduler {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl Scheduler {
    pub fn start(state: Arc<EngineState>) -> Scheduler {
        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(run_loop(state, shutdown.clone()));
        tracing::info!(target: "pointledger", event = "scheduler_started");
        Scheduler { shutdown, handle }
    }

    /// Stop the loop and wait for an in-progress tick to finish.
    pub async fn stop(self) {
        self.shutdown.notify_one();
        let _ = self.handle.await;
        tracing::info!(target: "pointledger", event = "scheduler_stopped");
    }
}

async fn run_loop(state: Arc<EngineState>, shutdown: Arc<Notify>) {
    let poll = state.config.poll_interval;
    let mut fired = FiredMarkers::default();
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = tokio::time::sleep(poll) => {}
        }
        tick(&state, Local::now(), &mut fired).await;
    }
}

/// Last periods each trigger already fired for, so a trigger fires at most
/// once per period no matter how often the loop polls.
#[derive(Default)]
struct FiredMarkers {
    daily: Option<NaiveDate>,
    monthly: Option<(i32, u32)>,
}

async fn tick(state: &Arc<EngineState>, now: DateTime<Local>, fired: &mut FiredMarkers) {
    let today = now.date_naive();

    if now.time() >= state.config.daily_at && fired.daily != Some(today) {
        fired.daily = Some(today);
        let outcome = run_job(state.clone(), TriggerKind::Daily).await;
        if outcome.status == JobStatus::Succeeded {
            run_daily_sweep(state).await;
        }
    }

    let month = (today.year(), today.month());
    if is_last_day_of_month(today)
        && now.time() >= state.config.monthly_at
        && fired.monthly != Some(month)
    {
        fired.monthly = Some(month);
        run_job(state.clone(), TriggerKind::Monthly).await;
    }
}

async fn run_daily_sweep(state: &Arc<EngineState>) {
    let _writes = state.lock_writes().await;
    let pool = state.pool_clone();
    match balance::sweep(&pool, state.config.clamp, state.config.sweep).await {
        Ok(report) => {
            tracing::info!(
                target: "pointledger",
                event = "daily_sweep",
                scanned = report.scanned,
                drifted = report.drifted.len()
            );
        }
        Err(err) => {
            tracing::warn!(target: "pointledger", event = "daily_sweep_failed", error = %err);
        }
    }
}

fn is_last_day_of_month(date: NaiveDate) -> bool {
    date.succ_opt()
        .map(|next| next.month() != date.month())
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClampPolicy, EngineConfig};
    use crate::db::open_sqlite_pool;
    use crate::notify::MemorySink;
    use crate::schema::ensure_schema;
    use chrono::{NaiveTime, TimeZone};
    use tempfile::tempdir;

    #[test]
    fn last_day_of_month_handles_lengths_and_leap_years() {
        let cases = [
            ("2024-01-31", true),
            ("2024-01-30", false),
            ("2024-02-29", true),
            ("2023-02-28", true),
            ("2024-02-28", false),
            ("2024-04-30", true),
            ("2024-12-31", true),
        ];
        for (day, expected) in cases {
            let date: NaiveDate = day.parse().unwrap();
            assert_eq!(is_last_day_of_month(date), expected, "{day}");
        }
    }

    async fn state_with_times(
        tmp: &tempfile::TempDir,
        daily: NaiveTime,
        monthly: NaiveTime,
    ) -> Arc<EngineState> {
        let db_path = tmp.path().join("ledger.db");
        let pool = open_sqlite_pool(&db_path).await.unwrap();
        ensure_schema(&pool, ClampPolicy::AllowNegative).await.unwrap();
        let mut config = EngineConfig::new(&db_path).with_backup_root(tmp.path().join("backups"));
        config.daily_at = daily;
        config.monthly_at = monthly;
        Arc::new(EngineState::new(pool, config, Arc::new(MemorySink::new())))
    }

    fn at(day: &str, hms: (u32, u32, u32)) -> DateTime<Local> {
        let date: NaiveDate = day.parse().unwrap();
        let time = NaiveTime::from_hms_opt(hms.0, hms.1, hms.2).unwrap();
        Local.from_local_datetime(&date.and_time(time)).unwrap()
    }

    #[tokio::test]
    async fn daily_trigger_fires_once_per_day() {
        let tmp = tempdir().unwrap();
        let state = state_with_times(
            &tmp,
            NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(23, 0, 0).unwrap(),
        )
        .await;
        let mut fired = FiredMarkers::default();

        // Before the trigger time nothing happens.
        tick(&state, at("2024-05-15", (21, 59, 0)), &mut fired).await;
        assert!(state.jobs.last_outcome(TriggerKind::Daily).is_none());

        tick(&state, at("2024-05-15", (22, 0, 30)), &mut fired).await;
        let first = state.jobs.last_outcome(TriggerKind::Daily).unwrap();
        assert_eq!(first.status, JobStatus::Succeeded);

        // Later polls on the same day do not fire again.
        tick(&state, at("2024-05-15", (23, 30, 0)), &mut fired).await;
        let second = state.jobs.last_outcome(TriggerKind::Daily).unwrap();
        assert_eq!(second.finished_at_ms, first.finished_at_ms);

        // 2024-05-15 is not the last day of May.
        assert!(state.jobs.last_outcome(TriggerKind::Monthly).is_none());
    }

    #[tokio::test]
    async fn monthly_trigger_fires_on_last_calendar_day() {
        let tmp = tempdir().unwrap();
        let state = state_with_times(
            &tmp,
            NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(23, 0, 0).unwrap(),
        )
        .await;
        let mut fired = FiredMarkers::default();

        tick(&state, at("2024-05-31", (23, 5, 0)), &mut fired).await;
        let outcome = state.jobs.last_outcome(TriggerKind::Monthly).unwrap();
        assert_eq!(outcome.status, JobStatus::Succeeded);
        assert!(outcome
            .artifacts
            .iter()
            .any(|a| a.id == "monthly/2024-05_archive.json"));
    }

    #[tokio::test]
    async fn scheduler_stops_cleanly() {
        let tmp = tempdir().unwrap();
        let state = state_with_times(
            &tmp,
            NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(23, 0, 0).unwrap(),
        )
        .await;
        let scheduler = Scheduler::start(state);
        scheduler.stop().await;
    }
}
