use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use sqlx::SqlitePool;
use tokio::sync::OwnedMutexGuard;

use crate::backup::JobStates;
use crate::config::EngineConfig;
use crate::notify::NotificationSink;
use crate::{AppError, AppResult};

/// Shared engine state: the live pool (swappable during restore), the
/// per-child mutual-exclusion scopes, the restore maintenance flag, and the
/// per-trigger backup job states.
pub struct EngineState {
    pool: RwLock<SqlitePool>,
    pub db_path: PathBuf,
    pub config: EngineConfig,
    locks: ChildLocks,
    writes: tokio::sync::Mutex<()>,
    maintenance: Arc<AtomicBool>,
    pub jobs: JobStates,
    pub notifier: Arc<dyn NotificationSink>,
}

impl EngineState {
    pub fn new(
        pool: SqlitePool,
        config: EngineConfig,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        EngineState {
            pool: RwLock::new(pool),
            db_path: config.db_path.clone(),
            config,
            locks: ChildLocks::default(),
            writes: tokio::sync::Mutex::new(()),
            maintenance: Arc::new(AtomicBool::new(false)),
            jobs: JobStates::default(),
            notifier,
        }
    }

    pub fn pool_clone(&self) -> SqlitePool {
        self.pool.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn replace_pool(&self, new_pool: SqlitePool) {
        let mut guard = self.pool.write().unwrap_or_else(|e| e.into_inner());
        *guard = new_pool;
    }

    /// Claim the exclusive maintenance scope used by restore. Mutations and
    /// backup jobs refuse to start while the guard is held.
    pub fn begin_maintenance(&self) -> AppResult<MaintenanceGuard> {
        MaintenanceGuard::begin(self.maintenance.clone())
    }

    pub fn maintenance_active(&self) -> bool {
        self.maintenance.load(Ordering::SeqCst)
    }

    pub fn ensure_not_maintenance(&self) -> AppResult<()> {
        if self.maintenance_active() {
            return Err(AppError::new(
                "MAINTENANCE/ACTIVE",
                "A restore is in progress; the store is read-only",
            ));
        }
        Ok(())
    }

    /// Serialize all mutations for one child. The guard must span the whole
    /// mutate-then-recompute sequence.
    pub async fn lock_child(&self, child_id: i64) -> OwnedMutexGuard<()> {
        self.locks.acquire(child_id).await
    }

    /// SQLite admits one writer at a time; serializing write transactions up
    /// front turns snapshot-upgrade busy errors into plain waiting. Always
    /// acquired after the child lock.
    pub async fn lock_writes(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.writes.lock().await
    }

    pub fn backup_root(&self) -> PathBuf {
        self.config.backup_root()
    }
}

/// Registry of per-child async mutexes; mutations to different children
/// proceed fully in parallel.
#[derive(Default)]
struct ChildLocks {
    inner: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl ChildLocks {
    async fn acquire(&self, child_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(child_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[derive(Debug)]
pub struct MaintenanceGuard {
    flag: Arc<AtomicBool>,
}

impl MaintenanceGuard {
    fn begin(flag: Arc<AtomicBool>) -> AppResult<Self> {
        if flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::new(
                "MAINTENANCE/ALREADY_RUNNING",
                "A restore is already running.",
            ));
        }
        Ok(Self { flag })
    }
}

impl Drop for MaintenanceGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
