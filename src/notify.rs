use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::time::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyKind {
    BackupSucceeded,
    BackupFailed,
    RestoreSucceeded,
    RestoreFailed,
}

/// Event emitted after every backup and restore attempt. Delivery and
/// display are the collaborator's responsibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotifyKind,
    pub message: String,
    pub at_ms: i64,
}

impl Notification {
    pub fn new(kind: NotifyKind, message: impl Into<String>) -> Self {
        Notification {
            kind,
            message: message.into(),
            at_ms: now_ms(),
        }
    }
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, note: &Notification);
}

/// Default sink: structured log lines.
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, note: &Notification) {
        match note.kind {
            NotifyKind::BackupSucceeded | NotifyKind::RestoreSucceeded => {
                tracing::info!(
                    target: "pointledger",
                    event = "notification",
                    kind = ?note.kind,
                    message = %note.message
                );
            }
            NotifyKind::BackupFailed | NotifyKind::RestoreFailed => {
                tracing::warn!(
                    target: "pointledger",
                    event = "notification",
                    kind = ?note.kind,
                    message = %note.message
                );
            }
        }
    }
}

/// In-memory sink for tests and embedders that poll instead of push.
#[derive(Default)]
pub struct MemorySink {
    notes: Mutex<Vec<Notification>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.notes.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn snapshot(&self) -> Vec<Notification> {
        self.notes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl NotificationSink for MemorySink {
    fn notify(&self, note: &Notification) {
        self.notes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(note.clone());
    }
}
