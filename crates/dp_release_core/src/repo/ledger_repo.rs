//! Epsilon ledger repository contracts and SQLite implementation.
//!
//! # Invariants
//! - Entries are insert-only; the schema rejects updates and deletes.
//! - Every entry references an existing release row for the same pair.

use crate::model::item::ItemId;
use crate::model::ledger::LedgerEntry;
use crate::model::window::WindowIndex;
use crate::repo::{bool_to_int, int_to_bool, parse_item_id, RepoResult};
use rusqlite::{params, Connection, Row};

const LEDGER_SELECT_SQL: &str = "SELECT
    item_id,
    window_index,
    epsilon_used,
    epsilon_remaining,
    lifetime_cap,
    is_locked,
    locked_at,
    recorded_at
FROM epsilon_ledger";

/// Repository interface for ledger entries.
pub trait LedgerRepository {
    fn get_entry(&self, item_id: &ItemId, window: WindowIndex) -> RepoResult<Option<LedgerEntry>>;
    /// Earliest locked entry for the item.
    fn first_locked_entry(&self, item_id: &ItemId) -> RepoResult<Option<LedgerEntry>>;
    /// Sum of `epsilon_used` over every entry of the item.
    fn lifetime_spent(&self, item_id: &ItemId) -> RepoResult<f64>;
    /// All entries of the item, oldest window first.
    fn list_entries(&self, item_id: &ItemId) -> RepoResult<Vec<LedgerEntry>>;
    fn insert_entry(&self, entry: &LedgerEntry) -> RepoResult<()>;
}

/// SQLite-backed ledger repository.
pub struct SqliteLedgerRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteLedgerRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    fn query_entries(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> RepoResult<Vec<LedgerEntry>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(parse_ledger_row(row)?);
        }
        Ok(entries)
    }
}

impl LedgerRepository for SqliteLedgerRepository<'_> {
    fn get_entry(&self, item_id: &ItemId, window: WindowIndex) -> RepoResult<Option<LedgerEntry>> {
        let entries = self.query_entries(
            &format!(
                "{LEDGER_SELECT_SQL}
                 WHERE item_id = ?1
                   AND window_index = ?2;"
            ),
            params![item_id.as_str(), window],
        )?;
        Ok(entries.into_iter().next())
    }

    fn first_locked_entry(&self, item_id: &ItemId) -> RepoResult<Option<LedgerEntry>> {
        let entries = self.query_entries(
            &format!(
                "{LEDGER_SELECT_SQL}
                 WHERE item_id = ?1
                   AND is_locked = 1
                 ORDER BY window_index ASC
                 LIMIT 1;"
            ),
            [item_id.as_str()],
        )?;
        Ok(entries.into_iter().next())
    }

    fn lifetime_spent(&self, item_id: &ItemId) -> RepoResult<f64> {
        let spent: f64 = self.conn.query_row(
            "SELECT COALESCE(SUM(epsilon_used), 0.0)
             FROM epsilon_ledger
             WHERE item_id = ?1;",
            [item_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(spent)
    }

    fn list_entries(&self, item_id: &ItemId) -> RepoResult<Vec<LedgerEntry>> {
        self.query_entries(
            &format!(
                "{LEDGER_SELECT_SQL}
                 WHERE item_id = ?1
                 ORDER BY window_index ASC;"
            ),
            [item_id.as_str()],
        )
    }

    fn insert_entry(&self, entry: &LedgerEntry) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO epsilon_ledger (
                item_id,
                window_index,
                epsilon_used,
                epsilon_remaining,
                lifetime_cap,
                is_locked,
                locked_at,
                recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
            params![
                entry.item_id.as_str(),
                entry.window_index,
                entry.epsilon_used,
                entry.epsilon_remaining,
                entry.lifetime_cap,
                bool_to_int(entry.is_locked),
                entry.locked_at,
                entry.recorded_at,
            ],
        )?;
        Ok(())
    }
}

fn parse_ledger_row(row: &Row<'_>) -> RepoResult<LedgerEntry> {
    let item_text: String = row.get("item_id")?;
    Ok(LedgerEntry {
        item_id: parse_item_id(&item_text, "epsilon_ledger.item_id")?,
        window_index: row.get("window_index")?,
        epsilon_used: row.get("epsilon_used")?,
        epsilon_remaining: row.get("epsilon_remaining")?,
        lifetime_cap: row.get("lifetime_cap")?,
        is_locked: int_to_bool(row.get("is_locked")?, "epsilon_ledger.is_locked")?,
        locked_at: row.get("locked_at")?,
        recorded_at: row.get("recorded_at")?,
    })
}
