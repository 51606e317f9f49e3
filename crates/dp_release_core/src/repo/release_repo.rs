//! Release repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Persist draft and published releases keyed by `(item, window)`.
//! - Serve latest-published lookups for the noise-reuse decision.
//!
//! # Invariants
//! - `insert_draft` is the arbiter of "only one evaluation wins": a second
//!   insert for the same pair changes nothing.
//! - Only drafts can be published or discarded; the schema rejects updates
//!   and deletes of published rows.

use crate::model::item::ItemId;
use crate::model::release::{
    ConfidenceInterval, NoisyValue, Release, ReleaseDecision, ReleaseId, ReleaseStatus,
};
use crate::model::window::WindowIndex;
use crate::repo::{bool_to_int, int_to_bool, parse_item_id, RepoError, RepoResult};
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

const RELEASE_SELECT_SQL: &str = "SELECT
    release_uuid,
    item_id,
    window_index,
    true_count,
    noisy_count,
    ci_lower,
    ci_upper,
    epsilon_used,
    meets_threshold,
    decision,
    status,
    created_at,
    published_at
FROM dp_releases";

/// Draft claim for one `(item, window)` pair.
#[derive(Debug, Clone)]
pub struct NewDraft<'a> {
    pub release_id: ReleaseId,
    pub item_id: &'a ItemId,
    pub window_index: WindowIndex,
    pub true_count: i64,
    pub created_at: i64,
}

/// Resolved fields written when a draft is promoted to published.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Publication {
    pub decision: ReleaseDecision,
    pub value: Option<NoisyValue>,
    pub epsilon_used: f64,
    pub meets_threshold: bool,
    pub published_at: i64,
}

/// Repository interface for releases.
pub trait ReleaseRepository {
    /// Loads the release for one pair, draft or published.
    fn get_release(&self, item_id: &ItemId, window: WindowIndex) -> RepoResult<Option<Release>>;
    /// Latest published release of an item by window index.
    fn latest_published(&self, item_id: &ItemId) -> RepoResult<Option<Release>>;
    /// Latest published release of an item that carries a noisy value.
    fn latest_published_value(&self, item_id: &ItemId) -> RepoResult<Option<NoisyValue>>;
    /// All published releases of an item, oldest window first.
    fn list_published(&self, item_id: &ItemId) -> RepoResult<Vec<Release>>;
    /// Inserts a draft; returns `false` when the pair already has a release.
    fn insert_draft(&self, draft: &NewDraft<'_>) -> RepoResult<bool>;
    /// Promotes the pair's draft to published.
    fn publish_draft(
        &self,
        item_id: &ItemId,
        window: WindowIndex,
        publication: &Publication,
    ) -> RepoResult<()>;
    /// Lists every persisted draft.
    fn list_drafts(&self) -> RepoResult<Vec<Release>>;
    /// Deletes the pair's draft.
    fn discard_draft(&self, item_id: &ItemId, window: WindowIndex) -> RepoResult<()>;
    /// Distinct items with at least one published release.
    fn published_item_ids(&self) -> RepoResult<Vec<ItemId>>;
}

/// SQLite-backed release repository.
pub struct SqliteReleaseRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteReleaseRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    fn query_releases(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> RepoResult<Vec<Release>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut releases = Vec::new();
        while let Some(row) = rows.next()? {
            releases.push(parse_release_row(row)?);
        }
        Ok(releases)
    }
}

impl ReleaseRepository for SqliteReleaseRepository<'_> {
    fn get_release(&self, item_id: &ItemId, window: WindowIndex) -> RepoResult<Option<Release>> {
        let releases = self.query_releases(
            &format!(
                "{RELEASE_SELECT_SQL}
                 WHERE item_id = ?1
                   AND window_index = ?2;"
            ),
            params![item_id.as_str(), window],
        )?;
        Ok(releases.into_iter().next())
    }

    fn latest_published(&self, item_id: &ItemId) -> RepoResult<Option<Release>> {
        let releases = self.query_releases(
            &format!(
                "{RELEASE_SELECT_SQL}
                 WHERE item_id = ?1
                   AND status = 'published'
                 ORDER BY window_index DESC
                 LIMIT 1;"
            ),
            [item_id.as_str()],
        )?;
        Ok(releases.into_iter().next())
    }

    fn latest_published_value(&self, item_id: &ItemId) -> RepoResult<Option<NoisyValue>> {
        let releases = self.query_releases(
            &format!(
                "{RELEASE_SELECT_SQL}
                 WHERE item_id = ?1
                   AND status = 'published'
                   AND noisy_count IS NOT NULL
                 ORDER BY window_index DESC
                 LIMIT 1;"
            ),
            [item_id.as_str()],
        )?;
        Ok(releases.into_iter().next().and_then(|release| release.value))
    }

    fn list_published(&self, item_id: &ItemId) -> RepoResult<Vec<Release>> {
        self.query_releases(
            &format!(
                "{RELEASE_SELECT_SQL}
                 WHERE item_id = ?1
                   AND status = 'published'
                 ORDER BY window_index ASC;"
            ),
            [item_id.as_str()],
        )
    }

    fn insert_draft(&self, draft: &NewDraft<'_>) -> RepoResult<bool> {
        let changed = self.conn.execute(
            "INSERT INTO dp_releases (
                release_uuid,
                item_id,
                window_index,
                true_count,
                status,
                created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (item_id, window_index) DO NOTHING;",
            params![
                draft.release_id.to_string(),
                draft.item_id.as_str(),
                draft.window_index,
                draft.true_count,
                ReleaseStatus::Draft.as_db(),
                draft.created_at,
            ],
        )?;
        Ok(changed == 1)
    }

    fn publish_draft(
        &self,
        item_id: &ItemId,
        window: WindowIndex,
        publication: &Publication,
    ) -> RepoResult<()> {
        let value = publication.value;
        let changed = self.conn.execute(
            "UPDATE dp_releases
             SET noisy_count = ?3,
                 ci_lower = ?4,
                 ci_upper = ?5,
                 epsilon_used = ?6,
                 meets_threshold = ?7,
                 decision = ?8,
                 status = 'published',
                 published_at = ?9
             WHERE item_id = ?1
               AND window_index = ?2
               AND status = 'draft';",
            params![
                item_id.as_str(),
                window,
                value.map(|value| value.noisy_count),
                value.map(|value| value.interval.lower),
                value.map(|value| value.interval.upper),
                publication.epsilon_used,
                bool_to_int(publication.meets_threshold),
                publication.decision.as_db(),
                publication.published_at,
            ],
        )?;

        if changed == 0 {
            return Err(RepoError::NotFound(format!(
                "draft release for item {item_id} window {window}"
            )));
        }
        Ok(())
    }

    fn list_drafts(&self) -> RepoResult<Vec<Release>> {
        self.query_releases(
            &format!(
                "{RELEASE_SELECT_SQL}
                 WHERE status = 'draft'
                 ORDER BY window_index ASC, item_id ASC;"
            ),
            [],
        )
    }

    fn discard_draft(&self, item_id: &ItemId, window: WindowIndex) -> RepoResult<()> {
        let changed = self.conn.execute(
            "DELETE FROM dp_releases
             WHERE item_id = ?1
               AND window_index = ?2
               AND status = 'draft';",
            params![item_id.as_str(), window],
        )?;

        if changed == 0 {
            return Err(RepoError::NotFound(format!(
                "draft release for item {item_id} window {window}"
            )));
        }
        Ok(())
    }

    fn published_item_ids(&self) -> RepoResult<Vec<ItemId>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT item_id
             FROM dp_releases
             WHERE status = 'published'
             ORDER BY item_id ASC;",
        )?;
        let mut rows = stmt.query([])?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next()? {
            let raw: String = row.get(0)?;
            ids.push(parse_item_id(&raw, "dp_releases.item_id")?);
        }
        Ok(ids)
    }
}

fn parse_release_row(row: &Row<'_>) -> RepoResult<Release> {
    let uuid_text: String = row.get("release_uuid")?;
    let release_id = Uuid::parse_str(&uuid_text).map_err(|_| {
        RepoError::InvalidData(format!(
            "invalid uuid value `{uuid_text}` in dp_releases.release_uuid"
        ))
    })?;

    let item_text: String = row.get("item_id")?;
    let item_id = parse_item_id(&item_text, "dp_releases.item_id")?;

    let status_text: String = row.get("status")?;
    let status = ReleaseStatus::from_db(&status_text).ok_or_else(|| {
        RepoError::InvalidData(format!(
            "invalid release status `{status_text}` in dp_releases.status"
        ))
    })?;

    let decision = match row.get::<_, Option<String>>("decision")? {
        Some(text) => Some(ReleaseDecision::from_db(&text).ok_or_else(|| {
            RepoError::InvalidData(format!(
                "invalid release decision `{text}` in dp_releases.decision"
            ))
        })?),
        None => None,
    };

    let noisy_count: Option<f64> = row.get("noisy_count")?;
    let ci_lower: Option<f64> = row.get("ci_lower")?;
    let ci_upper: Option<f64> = row.get("ci_upper")?;
    let value = match (noisy_count, ci_lower, ci_upper) {
        (Some(noisy_count), Some(lower), Some(upper)) => Some(NoisyValue {
            noisy_count,
            interval: ConfidenceInterval { lower, upper },
        }),
        (None, None, None) => None,
        _ => {
            return Err(RepoError::InvalidData(format!(
                "partial noisy value for item {item_id} in dp_releases"
            )));
        }
    };

    Ok(Release {
        release_id,
        item_id,
        window_index: row.get("window_index")?,
        true_count: row.get("true_count")?,
        value,
        epsilon_used: row.get("epsilon_used")?,
        meets_threshold: int_to_bool(row.get("meets_threshold")?, "dp_releases.meets_threshold")?,
        decision,
        status,
        created_at: row.get("created_at")?,
        published_at: row.get("published_at")?,
    })
}
