//! Tracked item registry.
//!
//! # Invariants
//! - Untracking only stops future evaluation; history is untouched.
//! - Listing order is deterministic (`item_id ASC`).

use crate::model::item::ItemId;
use crate::repo::{parse_item_id, RepoResult};
use rusqlite::{params, Connection, OptionalExtension};

/// Repository interface for the set of items the scheduler evaluates.
pub trait ItemRepository {
    /// Starts tracking an item; returns `false` when it was already active.
    fn track_item(&self, item_id: &ItemId, tracked_at: i64) -> RepoResult<bool>;
    /// Stops tracking an item; returns `false` when it was not active.
    fn untrack_item(&self, item_id: &ItemId) -> RepoResult<bool>;
    fn is_tracked(&self, item_id: &ItemId) -> RepoResult<bool>;
    fn list_tracked_items(&self) -> RepoResult<Vec<ItemId>>;
}

/// SQLite-backed tracked item registry.
pub struct SqliteItemRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteItemRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl ItemRepository for SqliteItemRepository<'_> {
    fn track_item(&self, item_id: &ItemId, tracked_at: i64) -> RepoResult<bool> {
        let changed = self.conn.execute(
            "INSERT INTO tracked_items (item_id, tracked_at, is_active)
             VALUES (?1, ?2, 1)
             ON CONFLICT (item_id) DO UPDATE SET
                is_active = 1,
                tracked_at = excluded.tracked_at
             WHERE tracked_items.is_active = 0;",
            params![item_id.as_str(), tracked_at],
        )?;
        Ok(changed == 1)
    }

    fn untrack_item(&self, item_id: &ItemId) -> RepoResult<bool> {
        let changed = self.conn.execute(
            "UPDATE tracked_items
             SET is_active = 0
             WHERE item_id = ?1
               AND is_active = 1;",
            [item_id.as_str()],
        )?;
        Ok(changed == 1)
    }

    fn is_tracked(&self, item_id: &ItemId) -> RepoResult<bool> {
        let active: Option<i64> = self
            .conn
            .query_row(
                "SELECT is_active FROM tracked_items WHERE item_id = ?1;",
                [item_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(active == Some(1))
    }

    fn list_tracked_items(&self) -> RepoResult<Vec<ItemId>> {
        let mut stmt = self.conn.prepare(
            "SELECT item_id
             FROM tracked_items
             WHERE is_active = 1
             ORDER BY item_id ASC;",
        )?;
        let mut rows = stmt.query([])?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            let raw: String = row.get(0)?;
            items.push(parse_item_id(&raw, "tracked_items.item_id")?);
        }
        Ok(items)
    }
}
