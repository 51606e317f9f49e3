//! Release window repository contracts and SQLite implementation.
//!
//! # Invariants
//! - At most one window is `active` (enforced by a partial unique index).
//! - Closed windows are never reopened.

use crate::model::window::{Window, WindowIndex, WindowStatus};
use crate::repo::{RepoError, RepoResult};
use rusqlite::{params, Connection, Row};

const WINDOW_SELECT_SQL: &str = "SELECT
    window_index,
    start_ms,
    end_ms,
    status,
    opened_at,
    closed_at
FROM release_windows";

/// Repository interface for release windows.
pub trait WindowRepository {
    /// Returns the single active window, if any.
    fn active_window(&self) -> RepoResult<Option<Window>>;
    /// Returns the window with the highest index regardless of status.
    fn latest_window(&self) -> RepoResult<Option<Window>>;
    fn get_window(&self, index: WindowIndex) -> RepoResult<Option<Window>>;
    /// Inserts a new active window.
    fn open_window(
        &self,
        index: WindowIndex,
        start_ms: i64,
        end_ms: i64,
        opened_at: i64,
    ) -> RepoResult<Window>;
    /// Marks an active window closed.
    fn close_window(&self, index: WindowIndex, closed_at: i64) -> RepoResult<()>;
}

/// SQLite-backed window repository.
pub struct SqliteWindowRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteWindowRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl WindowRepository for SqliteWindowRepository<'_> {
    fn active_window(&self) -> RepoResult<Option<Window>> {
        let mut stmt = self.conn.prepare(&format!(
            "{WINDOW_SELECT_SQL}
             WHERE status = 'active'
             ORDER BY window_index DESC
             LIMIT 1;"
        ))?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => Ok(Some(parse_window_row(row)?)),
            None => Ok(None),
        }
    }

    fn latest_window(&self) -> RepoResult<Option<Window>> {
        let mut stmt = self.conn.prepare(&format!(
            "{WINDOW_SELECT_SQL}
             ORDER BY window_index DESC
             LIMIT 1;"
        ))?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => Ok(Some(parse_window_row(row)?)),
            None => Ok(None),
        }
    }

    fn get_window(&self, index: WindowIndex) -> RepoResult<Option<Window>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{WINDOW_SELECT_SQL} WHERE window_index = ?1;"))?;
        let mut rows = stmt.query([index])?;
        match rows.next()? {
            Some(row) => Ok(Some(parse_window_row(row)?)),
            None => Ok(None),
        }
    }

    fn open_window(
        &self,
        index: WindowIndex,
        start_ms: i64,
        end_ms: i64,
        opened_at: i64,
    ) -> RepoResult<Window> {
        self.conn.execute(
            "INSERT INTO release_windows (
                window_index,
                start_ms,
                end_ms,
                status,
                opened_at
            ) VALUES (?1, ?2, ?3, ?4, ?5);",
            params![
                index,
                start_ms,
                end_ms,
                WindowStatus::Active.as_db(),
                opened_at
            ],
        )?;

        Ok(Window {
            index,
            start_ms,
            end_ms,
            status: WindowStatus::Active,
            opened_at,
            closed_at: None,
        })
    }

    fn close_window(&self, index: WindowIndex, closed_at: i64) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE release_windows
             SET status = 'closed',
                 closed_at = ?2
             WHERE window_index = ?1
               AND status = 'active';",
            params![index, closed_at],
        )?;

        if changed == 0 {
            return Err(RepoError::NotFound(format!("active window {index}")));
        }
        Ok(())
    }
}

fn parse_window_row(row: &Row<'_>) -> RepoResult<Window> {
    let status_text: String = row.get("status")?;
    let status = WindowStatus::from_db(&status_text).ok_or_else(|| {
        RepoError::InvalidData(format!(
            "invalid window status `{status_text}` in release_windows.status"
        ))
    })?;

    Ok(Window {
        index: row.get("window_index")?,
        start_ms: row.get("start_ms")?,
        end_ms: row.get("end_ms")?,
        status,
        opened_at: row.get("opened_at")?,
        closed_at: row.get("closed_at")?,
    })
}
