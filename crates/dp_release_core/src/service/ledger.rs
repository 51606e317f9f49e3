//! Per-item epsilon budget ledger.
//!
//! # Responsibility
//! - Decide whether an item can afford another fresh noisy release.
//! - Record exactly one ledger entry per published release.
//! - Derive the item's `PrivacyStatus` from its ledger history.
//!
//! # Invariants
//! - Lifetime spend never exceeds the cap (within `EPSILON_TOLERANCE`).
//! - Once an item is locked, every later entry is locked with the original
//!   `locked_at`.
//! - Every write returns a `LedgerReceipt`; releases take `epsilon_used`
//!   from the receipt and nowhere else.

use crate::config::ReleaseConfig;
use crate::model::item::ItemId;
use crate::model::ledger::{LedgerEntry, PrivacyStatus, EPSILON_TOLERANCE};
use crate::model::release::{NoisyValue, ReleaseDecision};
use crate::model::window::WindowIndex;
use crate::repo::ledger_repo::{LedgerRepository, SqliteLedgerRepository};
use crate::repo::release_repo::{Publication, ReleaseRepository, SqliteReleaseRepository};
use crate::repo::{RepoError, RepoResult};
use log::{info, warn};
use rusqlite::Connection;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug)]
pub enum LedgerError {
    Repo(RepoError),
    /// A write would push lifetime spend past the cap.
    BudgetExceeded {
        item_id: ItemId,
        spent: f64,
        requested: f64,
        lifetime_cap: f64,
    },
}

impl Display for LedgerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Repo(err) => write!(f, "{err}"),
            Self::BudgetExceeded {
                item_id,
                spent,
                requested,
                lifetime_cap,
            } => write!(
                f,
                "item {item_id} cannot spend {requested}: {spent} of {lifetime_cap} already used"
            ),
        }
    }
}

impl Error for LedgerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Repo(err) => Some(err),
            Self::BudgetExceeded { .. } => None,
        }
    }
}

impl From<RepoError> for LedgerError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Repo(value.into())
    }
}

/// Proof that a ledger entry was written for one `(item, window)` pair.
///
/// Only the ledger can build one, and the only way to turn it into a
/// `Publication` is `into_publication`, which copies `epsilon_used` as-is.
#[derive(Debug, PartialEq)]
#[must_use]
pub struct LedgerReceipt {
    item_id: ItemId,
    window_index: WindowIndex,
    epsilon_used: f64,
    is_locked: bool,
}

impl LedgerReceipt {
    pub fn item_id(&self) -> &ItemId {
        &self.item_id
    }

    pub fn window_index(&self) -> WindowIndex {
        self.window_index
    }

    pub fn epsilon_used(&self) -> f64 {
        self.epsilon_used
    }

    pub fn is_locked(&self) -> bool {
        self.is_locked
    }

    pub fn into_publication(
        self,
        decision: ReleaseDecision,
        value: Option<NoisyValue>,
        meets_threshold: bool,
        published_at: i64,
    ) -> Publication {
        Publication {
            decision,
            value,
            epsilon_used: self.epsilon_used,
            meets_threshold,
            published_at,
        }
    }
}

/// Budget accounting for one connection or transaction.
pub struct BudgetLedger<'conn> {
    conn: &'conn Connection,
    lifetime_cap: f64,
    epsilon_per_query: f64,
}

impl<'conn> BudgetLedger<'conn> {
    pub fn new(conn: &'conn Connection, config: &ReleaseConfig) -> Self {
        Self {
            conn,
            lifetime_cap: config.lifetime_epsilon_cap,
            epsilon_per_query: config.epsilon_per_query,
        }
    }

    pub fn lifetime_cap(&self) -> f64 {
        self.lifetime_cap
    }

    pub fn epsilon_per_query(&self) -> f64 {
        self.epsilon_per_query
    }

    pub fn lifetime_spent(&self, item_id: &ItemId) -> RepoResult<f64> {
        SqliteLedgerRepository::new(self.conn).lifetime_spent(item_id)
    }

    /// Current privacy status, derived from the item's ledger history.
    ///
    /// A locked item reports the last noisy value it ever published as its
    /// final release.
    pub fn status(&self, item_id: &ItemId) -> RepoResult<PrivacyStatus> {
        let ledger = SqliteLedgerRepository::new(self.conn);
        if let Some(entry) = ledger.first_locked_entry(item_id)? {
            let locked_at = entry.locked_at.ok_or_else(|| {
                RepoError::InvalidData(format!(
                    "locked ledger entry for item {item_id} window {} has no locked_at",
                    entry.window_index
                ))
            })?;
            let final_release =
                SqliteReleaseRepository::new(self.conn).latest_published_value(item_id)?;
            return Ok(PrivacyStatus::Locked {
                locked_at,
                final_release,
            });
        }

        let spent = ledger.lifetime_spent(item_id)?;
        Ok(PrivacyStatus::Active {
            epsilon_remaining: spendable_after(self.lifetime_cap, spent, false),
        })
    }

    /// `true` when the item is active and one more fresh release fits the cap.
    pub fn can_spend(&self, item_id: &ItemId) -> RepoResult<bool> {
        let ledger = SqliteLedgerRepository::new(self.conn);
        if ledger.first_locked_entry(item_id)?.is_some() {
            return Ok(false);
        }
        let spent = ledger.lifetime_spent(item_id)?;
        Ok(spent + self.epsilon_per_query <= self.lifetime_cap + EPSILON_TOLERANCE)
    }

    /// Charges one fresh release. Locks the item when the cap is reached.
    pub fn spend(
        &self,
        item_id: &ItemId,
        window: WindowIndex,
        at: i64,
    ) -> LedgerResult<LedgerReceipt> {
        if !self.can_spend(item_id)? {
            return Err(LedgerError::BudgetExceeded {
                item_id: item_id.clone(),
                spent: self.lifetime_spent(item_id)?,
                requested: self.epsilon_per_query,
                lifetime_cap: self.lifetime_cap,
            });
        }
        self.record(item_id, window, self.epsilon_per_query, false, at)
    }

    /// Zero-cost entry for a window that reuses the previous noisy value.
    pub fn reuse(
        &self,
        item_id: &ItemId,
        window: WindowIndex,
        at: i64,
    ) -> LedgerResult<LedgerReceipt> {
        self.record(item_id, window, 0.0, false, at)
    }

    /// Zero-cost entry for a below-threshold window.
    pub fn record_suppressed(
        &self,
        item_id: &ItemId,
        window: WindowIndex,
        at: i64,
    ) -> LedgerResult<LedgerReceipt> {
        self.record(item_id, window, 0.0, false, at)
    }

    /// Zero-cost entry for a window of an already locked item.
    pub fn record_locked(
        &self,
        item_id: &ItemId,
        window: WindowIndex,
        at: i64,
    ) -> LedgerResult<LedgerReceipt> {
        let receipt = self.record(item_id, window, 0.0, false, at)?;
        if !receipt.is_locked {
            warn!(
                "event=ledger_record module=ledger status=skip item_id={} window={} reason=not_locked",
                item_id, window
            );
        }
        Ok(receipt)
    }

    /// Locks an item whose remaining budget cannot cover another release.
    pub fn lock(
        &self,
        item_id: &ItemId,
        window: WindowIndex,
        at: i64,
    ) -> LedgerResult<LedgerReceipt> {
        self.record(item_id, window, 0.0, true, at)
    }

    fn record(
        &self,
        item_id: &ItemId,
        window: WindowIndex,
        epsilon_used: f64,
        lock_now: bool,
        at: i64,
    ) -> LedgerResult<LedgerReceipt> {
        let ledger = SqliteLedgerRepository::new(self.conn);
        let spent = ledger.lifetime_spent(item_id)?;
        let total = spent + epsilon_used;
        if total > self.lifetime_cap + EPSILON_TOLERANCE {
            return Err(LedgerError::BudgetExceeded {
                item_id: item_id.clone(),
                spent,
                requested: epsilon_used,
                lifetime_cap: self.lifetime_cap,
            });
        }

        let previous_lock = ledger
            .first_locked_entry(item_id)?
            .and_then(|entry| entry.locked_at);
        let reaches_cap = epsilon_used > 0.0 && total >= self.lifetime_cap - EPSILON_TOLERANCE;
        let locked_at = match previous_lock {
            Some(locked_at) => Some(locked_at),
            None if lock_now || reaches_cap => Some(at),
            None => None,
        };

        let entry = LedgerEntry {
            item_id: item_id.clone(),
            window_index: window,
            epsilon_used,
            epsilon_remaining: spendable_after(self.lifetime_cap, total, locked_at.is_some()),
            lifetime_cap: self.lifetime_cap,
            is_locked: locked_at.is_some(),
            locked_at,
            recorded_at: at,
        };
        ledger.insert_entry(&entry)?;

        if previous_lock.is_none() && entry.is_locked {
            info!(
                "event=budget_locked module=ledger status=ok item_id={} window={} total_spent={} lifetime_cap={}",
                item_id, window, total, self.lifetime_cap
            );
        }

        Ok(LedgerReceipt {
            item_id: entry.item_id,
            window_index: window,
            epsilon_used,
            is_locked: entry.is_locked,
        })
    }
}

/// Budget an item can still spend. A locked item has none, whatever is
/// left under its cap.
fn spendable_after(lifetime_cap: f64, spent: f64, is_locked: bool) -> f64 {
    if is_locked {
        0.0
    } else {
        (lifetime_cap - spent).max(0.0)
    }
}
