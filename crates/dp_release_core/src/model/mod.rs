//! Domain model for windowed, privacy-protected count releases.
//!
//! # Responsibility
//! - Define canonical data structures used by the release engine.
//! - Keep window arithmetic and privacy-status transitions pure.
//!
//! # Invariants
//! - Every release is identified by its `(item, window)` pair.
//! - Published releases and ledger entries are append-only history.
//! - `ItemSummary` is derived, never authoritative.

pub mod item;
pub mod ledger;
pub mod release;
pub mod summary;
pub mod window;
