//! Item identity.
//!
//! Items are owned by the voting platform; the release engine only keeps
//! their identifier and whatever it snapshots into releases.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

const MAX_ITEM_ID_CHARS: usize = 128;

static ITEM_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.:\-]+$").expect("valid item id regex"));

/// Validation failure for externally supplied item identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemIdError {
    Empty,
    TooLong(usize),
    InvalidCharacters(String),
}

impl Display for ItemIdError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "item id must not be empty"),
            Self::TooLong(len) => write!(
                f,
                "item id has {len} chars; maximum is {MAX_ITEM_ID_CHARS}"
            ),
            Self::InvalidCharacters(value) => write!(
                f,
                "item id `{value}` must match [A-Za-z0-9_.:-]"
            ),
        }
    }
}

impl Error for ItemIdError {}

/// Stable identifier of one externally-owned item (for example a post id).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ItemId(String);

impl ItemId {
    /// Validates and wraps an item identifier.
    pub fn parse(value: &str) -> Result<Self, ItemIdError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(ItemIdError::Empty);
        }
        let len = trimmed.chars().count();
        if len > MAX_ITEM_ID_CHARS {
            return Err(ItemIdError::TooLong(len));
        }
        if !ITEM_ID_RE.is_match(trimmed) {
            return Err(ItemIdError::InvalidCharacters(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for ItemId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ItemId {
    type Error = ItemIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ItemId> for String {
    fn from(value: ItemId) -> Self {
        value.0
    }
}
