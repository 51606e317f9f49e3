//! Summary projection over release and ledger history.
//!
//! # Responsibility
//! - Fold an item's published releases and ledger entries into `ItemSummary`.
//! - Persist the fold inside the caller's transaction.
//! - Rebuild or verify stored summaries from history.
//!
//! # Invariants
//! - `fold` is pure: the same history always yields the same summary.
//! - A stored summary is only ever written from `fold`.

use crate::model::item::ItemId;
use crate::model::ledger::{LedgerEntry, EPSILON_TOLERANCE};
use crate::model::release::Release;
use crate::model::summary::ItemSummary;
use crate::repo::ledger_repo::{LedgerRepository, SqliteLedgerRepository};
use crate::repo::release_repo::{ReleaseRepository, SqliteReleaseRepository};
use crate::repo::summary_repo::{SqliteSummaryRepository, SummaryRepository};
use crate::repo::RepoResult;
use log::{info, warn};
use rusqlite::{Connection, Transaction, TransactionBehavior};

/// Difference between a stored summary and the fold of its history.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryDrift {
    pub stored: Option<ItemSummary>,
    pub expected: Option<ItemSummary>,
}

/// Folds published history into a summary. Drafts are ignored.
///
/// Returns `None` when the item has no published release.
pub fn fold(
    item_id: &ItemId,
    releases: &[Release],
    entries: &[LedgerEntry],
) -> Option<ItemSummary> {
    let published = releases
        .iter()
        .filter(|release| release.is_published() && &release.item_id == item_id);
    let latest = published
        .clone()
        .max_by_key(|release| release.window_index)?;

    let own_entries = entries.iter().filter(|entry| &entry.item_id == item_id);
    Some(ItemSummary {
        item_id: item_id.clone(),
        current_window: Some(latest.window_index),
        last_true_count: Some(latest.true_count),
        is_currently_locked: own_entries.clone().any(|entry| entry.is_locked),
        total_epsilon_spent: own_entries.map(|entry| entry.epsilon_used).sum(),
        release_count: published.clone().count() as u32,
        last_updated: published
            .filter_map(|release| release.published_at)
            .max()
            .unwrap_or(latest.created_at),
    })
}

/// Loads the item's history through `conn` and folds it.
pub fn compute(conn: &Connection, item_id: &ItemId) -> RepoResult<Option<ItemSummary>> {
    let releases = SqliteReleaseRepository::new(conn).list_published(item_id)?;
    let entries = SqliteLedgerRepository::new(conn).list_entries(item_id)?;
    Ok(fold(item_id, &releases, &entries))
}

/// Recomputes and stores the item's summary on the caller's connection.
pub fn project(conn: &Connection, item_id: &ItemId) -> RepoResult<Option<ItemSummary>> {
    let summary = compute(conn, item_id)?;
    if let Some(summary) = &summary {
        SqliteSummaryRepository::new(conn).upsert_summary(summary)?;
    }
    Ok(summary)
}

/// Recomputes every summary from history in one transaction.
///
/// Returns the number of summaries written.
pub fn rebuild_all(conn: &Connection) -> RepoResult<usize> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let items = SqliteReleaseRepository::new(&tx).published_item_ids()?;
    let mut rebuilt = 0;
    for item_id in &items {
        if project(&tx, item_id)?.is_some() {
            rebuilt += 1;
        }
    }
    tx.commit()?;

    info!(
        "event=summary_rebuild module=projector status=ok items={}",
        rebuilt
    );
    Ok(rebuilt)
}

/// Compares the stored summary against a fresh fold.
///
/// Returns `None` when they agree.
pub fn verify(conn: &Connection, item_id: &ItemId) -> RepoResult<Option<SummaryDrift>> {
    let stored = SqliteSummaryRepository::new(conn).get_summary(item_id)?;
    let expected = compute(conn, item_id)?;
    if summaries_match(stored.as_ref(), expected.as_ref()) {
        return Ok(None);
    }

    warn!(
        "event=summary_verify module=projector status=error item_id={} error_code=summary_drift",
        item_id
    );
    Ok(Some(SummaryDrift { stored, expected }))
}

fn summaries_match(stored: Option<&ItemSummary>, expected: Option<&ItemSummary>) -> bool {
    match (stored, expected) {
        (None, None) => true,
        (Some(stored), Some(expected)) => {
            stored.item_id == expected.item_id
                && stored.current_window == expected.current_window
                && stored.last_true_count == expected.last_true_count
                && stored.is_currently_locked == expected.is_currently_locked
                && stored.release_count == expected.release_count
                && stored.last_updated == expected.last_updated
                && (stored.total_epsilon_spent - expected.total_epsilon_spent).abs()
                    <= EPSILON_TOLERANCE
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::fold;
    use crate::model::item::ItemId;
    use crate::model::ledger::LedgerEntry;
    use crate::model::release::{Release, ReleaseDecision, ReleaseStatus};
    use uuid::Uuid;

    fn release(item: &ItemId, window: i64, true_count: i64, status: ReleaseStatus) -> Release {
        Release {
            release_id: Uuid::new_v4(),
            item_id: item.clone(),
            window_index: window,
            true_count,
            value: None,
            epsilon_used: 0.0,
            meets_threshold: false,
            decision: (status == ReleaseStatus::Published).then_some(ReleaseDecision::Suppressed),
            status,
            created_at: window * 10,
            published_at: (status == ReleaseStatus::Published).then_some(window * 10 + 1),
        }
    }

    fn entry(item: &ItemId, window: i64, epsilon_used: f64, is_locked: bool) -> LedgerEntry {
        LedgerEntry {
            item_id: item.clone(),
            window_index: window,
            epsilon_used,
            epsilon_remaining: 0.0,
            lifetime_cap: 1.0,
            is_locked,
            locked_at: is_locked.then_some(window),
            recorded_at: window,
        }
    }

    #[test]
    fn fold_without_published_history_is_none() {
        let item = ItemId::parse("post-1").expect("valid id");
        let draft = release(&item, 0, 3, ReleaseStatus::Draft);
        assert_eq!(fold(&item, &[draft], &[]), None);
    }

    #[test]
    fn fold_tracks_latest_window_and_totals() {
        let item = ItemId::parse("post-1").expect("valid id");
        let releases = vec![
            release(&item, 0, 3, ReleaseStatus::Published),
            release(&item, 2, 9, ReleaseStatus::Published),
            release(&item, 1, 5, ReleaseStatus::Published),
        ];
        let entries = vec![
            entry(&item, 0, 0.5, false),
            entry(&item, 1, 0.5, true),
            entry(&item, 2, 0.0, true),
        ];

        let summary = fold(&item, &releases, &entries).expect("published history");
        assert_eq!(summary.current_window, Some(2));
        assert_eq!(summary.last_true_count, Some(9));
        assert_eq!(summary.release_count, 3);
        assert_eq!(summary.total_epsilon_spent, 1.0);
        assert!(summary.is_currently_locked);
        assert_eq!(summary.last_updated, 21);
    }
}
