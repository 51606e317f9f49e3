//! Release window model and deterministic window arithmetic.
//!
//! # Invariants
//! - Window `k` always spans `[origin + k*length, origin + (k+1)*length)`.
//! - Windows never overlap and leave no gaps on the timeline.

use serde::{Deserialize, Serialize};

/// Window identity: the index `k` on the `origin + k*length` grid.
pub type WindowIndex = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowStatus {
    Active,
    Closed,
}

impl WindowStatus {
    pub(crate) fn as_db(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }

    pub(crate) fn from_db(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Persisted release window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub index: WindowIndex,
    /// Inclusive start, epoch milliseconds.
    pub start_ms: i64,
    /// Exclusive end, epoch milliseconds.
    pub end_ms: i64,
    pub status: WindowStatus,
    pub opened_at: i64,
    pub closed_at: Option<i64>,
}

impl Window {
    pub fn contains(&self, now_ms: i64) -> bool {
        self.start_ms <= now_ms && now_ms < self.end_ms
    }

    pub fn is_active(&self) -> bool {
        self.status == WindowStatus::Active
    }
}

/// Fixed grid of windows anchored at `origin_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowGrid {
    origin_ms: i64,
    length_ms: i64,
}

impl WindowGrid {
    /// Builds a grid; `length_ms` must be positive (checked by config validation).
    pub fn new(origin_ms: i64, length_ms: i64) -> Self {
        Self {
            origin_ms,
            length_ms: length_ms.max(1),
        }
    }

    pub fn length_ms(&self) -> i64 {
        self.length_ms
    }

    /// Index of the window containing `now_ms`. Times before the origin map to
    /// negative indices so the grid stays uniform.
    pub fn index_at(&self, now_ms: i64) -> WindowIndex {
        (now_ms - self.origin_ms).div_euclid(self.length_ms)
    }

    /// `(start_ms, end_ms)` for window `index`.
    pub fn bounds(&self, index: WindowIndex) -> (i64, i64) {
        let start = self.origin_ms + index * self.length_ms;
        (start, start + self.length_ms)
    }
}
