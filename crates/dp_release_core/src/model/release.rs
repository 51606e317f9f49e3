//! Release model.
//!
//! # Invariants
//! - At most one release exists per `(item, window)`.
//! - `noisy_count` and its interval are present together or not at all.
//! - Published releases are never rewritten or deleted.

use crate::model::item::ItemId;
use crate::model::window::WindowIndex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of one persisted release row.
pub type ReleaseId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Draft,
    Published,
}

impl ReleaseStatus {
    pub(crate) fn as_db(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
        }
    }

    pub(crate) fn from_db(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "published" => Some(Self::Published),
            _ => None,
        }
    }
}

/// How the published value of a release was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseDecision {
    /// Fresh Laplace noise; costs `epsilon_per_query`.
    Fresh,
    /// True count unchanged; previous noisy value copied at zero cost.
    Reused,
    /// True count below threshold; nothing released.
    Suppressed,
    /// Budget exhausted; final value copied forward at zero cost.
    Locked,
}

impl ReleaseDecision {
    pub(crate) fn as_db(self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Reused => "reused",
            Self::Suppressed => "suppressed",
            Self::Locked => "locked",
        }
    }

    pub(crate) fn from_db(value: &str) -> Option<Self> {
        match value {
            "fresh" => Some(Self::Fresh),
            "reused" => Some(Self::Reused),
            "suppressed" => Some(Self::Suppressed),
            "locked" => Some(Self::Locked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
}

impl ConfidenceInterval {
    pub fn contains(&self, value: f64) -> bool {
        self.lower <= value && value <= self.upper
    }

    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }
}

/// A noisy count together with the interval published alongside it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoisyValue {
    pub noisy_count: f64,
    pub interval: ConfidenceInterval,
}

/// One release row, keyed by `(item_id, window_index)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub release_id: ReleaseId,
    pub item_id: ItemId,
    pub window_index: WindowIndex,
    /// Snapshot of the platform count at evaluation time. Never exposed by
    /// the read API.
    pub true_count: i64,
    /// Absent for drafts and for below-threshold releases.
    pub value: Option<NoisyValue>,
    pub epsilon_used: f64,
    pub meets_threshold: bool,
    /// `None` only while the row is a draft.
    pub decision: Option<ReleaseDecision>,
    pub status: ReleaseStatus,
    pub created_at: i64,
    pub published_at: Option<i64>,
}

impl Release {
    pub fn noisy_count(&self) -> Option<f64> {
        self.value.map(|value| value.noisy_count)
    }

    pub fn is_published(&self) -> bool {
        self.status == ReleaseStatus::Published
    }
}
