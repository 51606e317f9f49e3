//! Core release engine for differentially private vote counts.
//! This crate is the single source of truth for the lifetime budget invariant.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod noise;
pub mod repo;
pub mod service;
pub mod source;

pub use config::{ConfigError, ConfigResult, ReleaseConfig};
pub use db::{open_db, open_db_in_memory, DbError, DbResult};
pub use logging::{default_log_level, init_logging, init_stderr_logging, logging_status};
pub use model::item::{ItemId, ItemIdError};
pub use model::ledger::{LedgerEntry, PrivacyStatus, EPSILON_TOLERANCE};
pub use model::release::{
    ConfidenceInterval, NoisyValue, Release, ReleaseDecision, ReleaseId, ReleaseStatus,
};
pub use model::summary::ItemSummary;
pub use model::window::{Window, WindowGrid, WindowIndex, WindowStatus};
pub use repo::{RepoError, RepoResult};
pub use service::ledger::{BudgetLedger, LedgerError, LedgerReceipt, LedgerResult};
pub use service::query::{
    budget_status, current_release, item_summary, release_history, BudgetStatus, CurrentRelease,
    ReleaseRecord, SummaryRecord,
};
pub use service::release_store::{
    recover_drafts, EvaluationError, EvaluationOutcome, EvaluationResult, ReleaseStore,
};
pub use service::scheduler::{
    Clock, ItemFailure, ManualClock, SchedulerError, SchedulerResult, StopHandle, SystemClock,
    TickReport, WindowScheduler,
};
pub use source::{
    SourceError, SourceResult, SqliteCountSource, TimeoutSource, TrueCountSource,
    DEFAULT_COUNT_QUERY,
};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
