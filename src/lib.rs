//! Points ledger and reconciliation engine for a children's center.
//!
//! The engine owns a SQLite store of per-child, per-day point entries, keeps
//! each child's cumulative balance derivable from those entries at all times,
//! and runs the snapshot pipeline (JSON, spreadsheet and raw store copies on
//! realtime, daily and monthly triggers) plus restore with a safety copy.
//!
//! [`engine::Engine`] is the embedder-facing entry point.

pub mod backup;
pub mod balance;
pub mod children;
pub mod config;
pub mod db;
pub mod engine;
pub mod entries;
pub mod error;
pub mod history;
pub mod logging;
pub mod manual;
pub mod model;
pub mod notify;
pub mod reconcile;
pub mod schema;
pub mod state;
pub mod time;

pub use config::{ClampPolicy, EngineConfig, SweepPolicy};
pub use engine::Engine;
pub use error::{is_unique_violation, AppError, AppResult};
pub use manual::ManualInput;
pub use model::{CategoryPoints, Child, Entry, HistoryRow, ManualRecord};
