//! Release engine services.
//!
//! # Responsibility
//! - Orchestrate repository calls into budget, release and scheduling
//!   use cases.
//! - Keep callers (CLI, API layers) decoupled from storage details.

pub mod ledger;
pub mod projector;
pub mod query;
pub mod release_store;
pub mod scheduler;
