//! Item summary repository.
//!
//! Rows here are a cache of `service::projector::fold`; writers always
//! replace the whole row.

use crate::model::item::ItemId;
use crate::model::summary::ItemSummary;
use crate::repo::{bool_to_int, int_to_bool, parse_item_id, RepoError, RepoResult};
use rusqlite::{params, Connection, Row};

const SUMMARY_SELECT_SQL: &str = "SELECT
    item_id,
    current_window,
    last_true_count,
    is_currently_locked,
    total_epsilon_spent,
    release_count,
    last_updated
FROM item_summaries";

/// Repository interface for derived item summaries.
pub trait SummaryRepository {
    fn get_summary(&self, item_id: &ItemId) -> RepoResult<Option<ItemSummary>>;
    /// Inserts or fully replaces the item's summary row.
    fn upsert_summary(&self, summary: &ItemSummary) -> RepoResult<()>;
}

/// SQLite-backed summary repository.
pub struct SqliteSummaryRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteSummaryRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl SummaryRepository for SqliteSummaryRepository<'_> {
    fn get_summary(&self, item_id: &ItemId) -> RepoResult<Option<ItemSummary>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SUMMARY_SELECT_SQL} WHERE item_id = ?1;"))?;
        let mut rows = stmt.query([item_id.as_str()])?;
        match rows.next()? {
            Some(row) => Ok(Some(parse_summary_row(row)?)),
            None => Ok(None),
        }
    }

    fn upsert_summary(&self, summary: &ItemSummary) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO item_summaries (
                item_id,
                current_window,
                last_true_count,
                is_currently_locked,
                total_epsilon_spent,
                release_count,
                last_updated
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (item_id) DO UPDATE SET
                current_window = excluded.current_window,
                last_true_count = excluded.last_true_count,
                is_currently_locked = excluded.is_currently_locked,
                total_epsilon_spent = excluded.total_epsilon_spent,
                release_count = excluded.release_count,
                last_updated = excluded.last_updated;",
            params![
                summary.item_id.as_str(),
                summary.current_window,
                summary.last_true_count,
                bool_to_int(summary.is_currently_locked),
                summary.total_epsilon_spent,
                i64::from(summary.release_count),
                summary.last_updated,
            ],
        )?;
        Ok(())
    }
}

fn parse_summary_row(row: &Row<'_>) -> RepoResult<ItemSummary> {
    let item_text: String = row.get("item_id")?;
    let release_count: i64 = row.get("release_count")?;
    let release_count = u32::try_from(release_count).map_err(|_| {
        RepoError::InvalidData(format!(
            "invalid release_count `{release_count}` in item_summaries.release_count"
        ))
    })?;

    Ok(ItemSummary {
        item_id: parse_item_id(&item_text, "item_summaries.item_id")?,
        current_window: row.get("current_window")?,
        last_true_count: row.get("last_true_count")?,
        is_currently_locked: int_to_bool(
            row.get("is_currently_locked")?,
            "item_summaries.is_currently_locked",
        )?,
        total_epsilon_spent: row.get("total_epsilon_spent")?,
        release_count,
        last_updated: row.get("last_updated")?,
    })
}
