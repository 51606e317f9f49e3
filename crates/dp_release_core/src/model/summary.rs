//! Derived per-item summary read model.

use crate::model::item::ItemId;
use crate::model::window::WindowIndex;
use serde::{Deserialize, Serialize};

/// Snapshot of one item's release history.
///
/// Always equal to a fold over the item's releases and ledger entries; see
/// `service::projector`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSummary {
    pub item_id: ItemId,
    /// Window of the latest published release.
    pub current_window: Option<WindowIndex>,
    pub last_true_count: Option<i64>,
    pub is_currently_locked: bool,
    /// Lifetime epsilon spend; never decreases.
    pub total_epsilon_spent: f64,
    pub release_count: u32,
    /// `published_at` of the latest release, epoch milliseconds.
    pub last_updated: i64,
}
