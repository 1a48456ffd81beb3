//! Concurrent mutations must collapse onto single rows and keep balances
//! derivable, with no lost updates between children.

use std::sync::Arc;

use chrono::NaiveDate;
use pointledger::model::manual_total;
use pointledger::{CategoryPoints, Engine, EngineConfig, ManualInput};
use tempfile::tempdir;

fn day(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

async fn open_engine(tmp: &tempfile::TempDir) -> Arc<Engine> {
    let config = EngineConfig::new(tmp.path().join("ledger.db"))
        .with_backup_root(tmp.path().join("backups"))
        .with_realtime_backups(false);
    Arc::new(Engine::open(config).await.unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_for_one_day_collapse_onto_one_row() {
    let tmp = tempdir().unwrap();
    let engine = open_engine(&tmp).await;
    let child = engine.create_child("Race", 3).await.unwrap();
    let date = day("2024-05-20");

    let mut tasks = Vec::new();
    for i in 0..8i64 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            engine
                .submit_points(
                    child.id,
                    date,
                    CategoryPoints {
                        math: 100 + i,
                        ..Default::default()
                    },
                    "teacher",
                )
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let entries = engine.entries_for_child(child.id).await.unwrap();
    assert_eq!(entries.len(), 1);
    // Whichever submission settled last, the balance matches the entry.
    assert_eq!(
        engine.balance(child.id).await.unwrap(),
        entries[0].total_points
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_manual_appends_get_unique_increasing_ids() {
    let tmp = tempdir().unwrap();
    let engine = open_engine(&tmp).await;
    let child = engine.create_child("Ledger", 2).await.unwrap();
    let date = day("2024-05-21");
    engine
        .submit_points(child.id, date, CategoryPoints::default(), "teacher")
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for i in 0..10i64 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            engine
                .append_manual(
                    child.id,
                    date,
                    ManualInput {
                        subject: "bonus".into(),
                        points: i + 1,
                        reason: String::new(),
                        author: "teacher".into(),
                    },
                )
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let entry = engine.entry(child.id, date).await.unwrap().unwrap();
    assert_eq!(entry.manual_ledger.len(), 10);
    let ids: Vec<i64> = entry.manual_ledger.iter().map(|r| r.id).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids not increasing: {ids:?}");
    assert_eq!(entry.manual_points, (1..=10).sum::<i64>());
    assert_eq!(entry.manual_points, manual_total(&entry.manual_ledger));
    assert_eq!(engine.balance(child.id).await.unwrap(), entry.total_points);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mutations_to_different_children_do_not_interfere() {
    let tmp = tempdir().unwrap();
    let engine = open_engine(&tmp).await;
    let a = engine.create_child("A", 1).await.unwrap();
    let b = engine.create_child("B", 1).await.unwrap();

    let mut tasks = Vec::new();
    for (child_id, base) in [(a.id, 0i64), (b.id, 1000)] {
        for offset in 0..5i64 {
            let engine = engine.clone();
            tasks.push(tokio::spawn(async move {
                let date = format!("2024-05-{:02}", offset + 1).parse().unwrap();
                engine
                    .submit_points(
                        child_id,
                        date,
                        CategoryPoints {
                            reading: base + offset,
                            ..Default::default()
                        },
                        "teacher",
                    )
                    .await
            }));
        }
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(engine.balance(a.id).await.unwrap(), 0 + 1 + 2 + 3 + 4);
    assert_eq!(
        engine.balance(b.id).await.unwrap(),
        (0..5).map(|o| 1000 + o).sum::<i64>()
    );
}
