//! Epsilon ledger model and the per-item privacy status.
//!
//! # Invariants
//! - Sum of `epsilon_used` over an item's entries never exceeds its cap.
//! - Once an entry is locked, every later entry for the item is locked.
//! - `PrivacyStatus::Locked` has no transition back to `Active`.

use crate::model::item::ItemId;
use crate::model::release::NoisyValue;
use crate::model::window::WindowIndex;
use serde::{Deserialize, Serialize};

/// Float slack used for every budget comparison.
pub const EPSILON_TOLERANCE: f64 = 1e-9;

/// One ledger row, keyed by `(item_id, window_index)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub item_id: ItemId,
    pub window_index: WindowIndex,
    pub epsilon_used: f64,
    /// Budget still spendable after this entry; zero once the item is locked.
    pub epsilon_remaining: f64,
    pub lifetime_cap: f64,
    pub is_locked: bool,
    pub locked_at: Option<i64>,
    pub recorded_at: i64,
}

/// Privacy status of one item, derived from its ledger history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PrivacyStatus {
    Active {
        epsilon_remaining: f64,
    },
    Locked {
        locked_at: i64,
        /// Last noisy value published before the lock; copied forward forever.
        final_release: Option<NoisyValue>,
    },
}

impl PrivacyStatus {
    /// Status of an item that has never spent budget.
    pub fn untouched(lifetime_cap: f64) -> Self {
        Self::Active {
            epsilon_remaining: lifetime_cap,
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked { .. })
    }

    pub fn final_release(&self) -> Option<NoisyValue> {
        match self {
            Self::Active { .. } => None,
            Self::Locked { final_release, .. } => *final_release,
        }
    }

    pub fn epsilon_remaining(&self) -> f64 {
        match self {
            Self::Active { epsilon_remaining } => *epsilon_remaining,
            Self::Locked { .. } => 0.0,
        }
    }

    /// Terminal transition. Locking an already locked status keeps the
    /// original timestamp and final value.
    pub fn lock(self, locked_at: i64, final_release: Option<NoisyValue>) -> Self {
        match self {
            Self::Active { .. } => Self::Locked {
                locked_at,
                final_release,
            },
            locked @ Self::Locked { .. } => locked,
        }
    }
}
