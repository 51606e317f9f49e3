//! Read-side queries for dashboards and API layers.
//!
//! # Invariants
//! - Only published releases are visible.
//! - No returned type carries a true count.
//! - Each query reads from one snapshot, so a release is never paired with
//!   a lock flag from a later commit.

use crate::config::ReleaseConfig;
use crate::model::item::ItemId;
use crate::model::ledger::EPSILON_TOLERANCE;
use crate::model::release::{ConfidenceInterval, ReleaseDecision};
use crate::model::summary::ItemSummary;
use crate::model::window::WindowIndex;
use crate::repo::release_repo::{ReleaseRepository, SqliteReleaseRepository};
use crate::repo::summary_repo::{SqliteSummaryRepository, SummaryRepository};
use crate::repo::RepoResult;
use crate::service::ledger::BudgetLedger;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};

/// Latest published release of an item, as shown to readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentRelease {
    pub item_id: ItemId,
    pub window: WindowIndex,
    pub noisy_count: Option<f64>,
    pub confidence_interval: Option<ConfidenceInterval>,
    pub meets_threshold: bool,
    pub is_locked: bool,
}

/// Budget view of one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub item_id: ItemId,
    pub epsilon_remaining: f64,
    pub lifetime_cap: f64,
    pub total_spent: f64,
    pub is_locked: bool,
    /// Fresh releases the remaining budget still pays for.
    pub queries_remaining: u32,
}

/// One published release without its true count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseRecord {
    pub window: WindowIndex,
    pub noisy_count: Option<f64>,
    pub confidence_interval: Option<ConfidenceInterval>,
    pub epsilon_used: f64,
    pub meets_threshold: bool,
    pub decision: ReleaseDecision,
    pub published_at: i64,
}

/// Published summary of one item without its true count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub item_id: ItemId,
    pub current_window: Option<WindowIndex>,
    pub is_currently_locked: bool,
    pub total_epsilon_spent: f64,
    pub release_count: u32,
    pub last_updated: i64,
}

impl From<ItemSummary> for SummaryRecord {
    fn from(summary: ItemSummary) -> Self {
        Self {
            item_id: summary.item_id,
            current_window: summary.current_window,
            is_currently_locked: summary.is_currently_locked,
            total_epsilon_spent: summary.total_epsilon_spent,
            release_count: summary.release_count,
            last_updated: summary.last_updated,
        }
    }
}

/// Returns `None` when the item has never been published.
pub fn current_release(
    conn: &Connection,
    config: &ReleaseConfig,
    item_id: &ItemId,
) -> RepoResult<Option<CurrentRelease>> {
    in_snapshot(conn, |conn| {
        let Some(release) = SqliteReleaseRepository::new(conn).latest_published(item_id)? else {
            return Ok(None);
        };
        let status = BudgetLedger::new(conn, config).status(item_id)?;
        Ok(Some(CurrentRelease {
            item_id: release.item_id,
            window: release.window_index,
            noisy_count: release.value.map(|value| value.noisy_count),
            confidence_interval: release.value.map(|value| value.interval),
            meets_threshold: release.meets_threshold,
            is_locked: status.is_locked(),
        }))
    })
}

/// Budget status of an item. Items with no history report the full cap.
pub fn budget_status(
    conn: &Connection,
    config: &ReleaseConfig,
    item_id: &ItemId,
) -> RepoResult<BudgetStatus> {
    let (status, total_spent) = in_snapshot(conn, |conn| {
        let ledger = BudgetLedger::new(conn, config);
        Ok((ledger.status(item_id)?, ledger.lifetime_spent(item_id)?))
    })?;
    let epsilon_remaining = status.epsilon_remaining();
    let queries_remaining = if status.is_locked() {
        0
    } else {
        ((epsilon_remaining + EPSILON_TOLERANCE) / config.epsilon_per_query).floor() as u32
    };

    Ok(BudgetStatus {
        item_id: item_id.clone(),
        epsilon_remaining,
        lifetime_cap: config.lifetime_epsilon_cap,
        total_spent,
        is_locked: status.is_locked(),
        queries_remaining,
    })
}

/// Published releases of an item, oldest window first.
pub fn release_history(conn: &Connection, item_id: &ItemId) -> RepoResult<Vec<ReleaseRecord>> {
    let releases = SqliteReleaseRepository::new(conn).list_published(item_id)?;
    Ok(releases
        .into_iter()
        .filter_map(|release| {
            Some(ReleaseRecord {
                window: release.window_index,
                noisy_count: release.value.map(|value| value.noisy_count),
                confidence_interval: release.value.map(|value| value.interval),
                epsilon_used: release.epsilon_used,
                meets_threshold: release.meets_threshold,
                decision: release.decision?,
                published_at: release.published_at?,
            })
        })
        .collect())
}

/// Stored summary of an item.
pub fn item_summary(conn: &Connection, item_id: &ItemId) -> RepoResult<Option<SummaryRecord>> {
    let summary = SqliteSummaryRepository::new(conn).get_summary(item_id)?;
    Ok(summary.map(SummaryRecord::from))
}

/// Runs `read` inside one deferred transaction. In WAL mode every statement
/// then sees the same committed state.
fn in_snapshot<T>(
    conn: &Connection,
    read: impl FnOnce(&Connection) -> RepoResult<T>,
) -> RepoResult<T> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Deferred)?;
    let value = read(&*tx)?;
    tx.commit()?;
    Ok(value)
}
