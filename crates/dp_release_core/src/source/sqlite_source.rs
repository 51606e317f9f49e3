//! True counts read from the voting platform's SQLite database.

use super::{SourceError, SourceResult, TrueCountSource};
use crate::model::item::ItemId;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::Mutex;

/// Counts votes for one post; `?1` is bound to the item id.
pub const DEFAULT_COUNT_QUERY: &str = "SELECT COUNT(*) FROM post_votes WHERE post_id = ?1";

/// Read-only count source over a platform database.
pub struct SqliteCountSource {
    conn: Mutex<Connection>,
    query: String,
}

impl SqliteCountSource {
    /// Opens `path` read-only and uses `DEFAULT_COUNT_QUERY`.
    pub fn open(path: impl AsRef<Path>) -> SourceResult<Self> {
        Self::open_with_query(path, DEFAULT_COUNT_QUERY)
    }

    /// Opens `path` read-only with a custom single-value count query.
    pub fn open_with_query(path: impl AsRef<Path>, query: impl Into<String>) -> SourceResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|err| SourceError::Unavailable(err.to_string()))?;
        Ok(Self::from_connection(conn, query))
    }

    pub fn from_connection(conn: Connection, query: impl Into<String>) -> Self {
        Self {
            conn: Mutex::new(conn),
            query: query.into(),
        }
    }
}

impl TrueCountSource for SqliteCountSource {
    fn true_count(&self, item_id: &ItemId) -> SourceResult<i64> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| SourceError::Unavailable("count connection poisoned".to_string()))?;
        let count: i64 = conn
            .query_row(self.query.as_str(), [item_id.as_str()], |row| row.get(0))
            .map_err(|err| SourceError::Unavailable(err.to_string()))?;
        if count < 0 {
            return Err(SourceError::InvalidCount {
                item_id: item_id.clone(),
                count,
            });
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::{SqliteCountSource, DEFAULT_COUNT_QUERY};
    use crate::model::item::ItemId;
    use crate::source::TrueCountSource;
    use rusqlite::Connection;

    #[test]
    fn counts_votes_for_one_post() {
        let conn = Connection::open_in_memory().expect("in-memory db");
        conn.execute_batch(
            "CREATE TABLE post_votes (post_id TEXT NOT NULL, user_id TEXT NOT NULL);
             INSERT INTO post_votes VALUES ('7', 'a'), ('7', 'b'), ('8', 'c');",
        )
        .expect("fixture schema");
        let source = SqliteCountSource::from_connection(conn, DEFAULT_COUNT_QUERY);

        let seven = ItemId::parse("7").expect("valid id");
        let nine = ItemId::parse("9").expect("valid id");
        assert_eq!(source.true_count(&seven), Ok(2));
        assert_eq!(source.true_count(&nine), Ok(0));
    }
}
