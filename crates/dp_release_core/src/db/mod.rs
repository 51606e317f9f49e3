//! Release database bootstrap.
//!
//! # Responsibility
//! - Open release databases with the pragmas the scheduler and concurrent
//!   evaluators rely on.
//! - Bring the window, release and ledger schema to this binary's version.
//!
//! # Invariants
//! - The schema version lives in `PRAGMA user_version`.
//! - A connection is handed out only after every pending migration committed.

use rusqlite::ErrorCode;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod migrations;
mod open;

pub use open::{open_db, open_db_in_memory};

pub type DbResult<T> = Result<T, DbError>;

/// Storage failure below the repository layer.
#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
    /// Migration `version` failed; the whole upgrade was rolled back.
    MigrationFailed {
        version: u32,
        source: rusqlite::Error,
    },
    /// The database was written by a newer release engine.
    SchemaTooNew {
        db_version: u32,
        latest_supported: u32,
    },
}

impl DbError {
    /// `true` when another writer held the database past the busy timeout.
    /// The evaluation can be retried on the next tick.
    pub fn is_busy(&self) -> bool {
        let code = match self {
            Self::Sqlite(err) | Self::MigrationFailed { source: err, .. } => {
                err.sqlite_error_code()
            }
            Self::SchemaTooNew { .. } => None,
        };
        matches!(
            code,
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    }

    /// Message of a failed statement, e.g. the text of a `RAISE(ABORT, ..)`
    /// from a ledger trigger.
    pub fn failure_message(&self) -> Option<&str> {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(_, Some(message))) => Some(message),
            _ => None,
        }
    }
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::MigrationFailed { version, source } => {
                write!(f, "release schema migration {version} failed: {source}")
            }
            Self::SchemaTooNew {
                db_version,
                latest_supported,
            } => write!(
                f,
                "release database schema {db_version} is newer than supported {latest_supported}"
            ),
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) | Self::MigrationFailed { source: err, .. } => Some(err),
            Self::SchemaTooNew { .. } => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}
