//! Release store: the per-item, per-window release decision.
//!
//! # Responsibility
//! - Resolve one `(item, window)` pair to a published release.
//! - Choose between locked copy-forward, suppression, reuse and fresh noise.
//! - Write release, ledger entry and summary in one IMMEDIATE transaction.
//!
//! # Invariants
//! - A published pair is never evaluated twice; re-evaluation is a no-op.
//! - The true count is fetched before the transaction opens, so a failed
//!   fetch leaves no state behind.
//! - Drafts never outlive the transaction that created them.

use crate::config::{ConfigResult, ReleaseConfig};
use crate::model::item::ItemId;
use crate::model::release::{NoisyValue, ReleaseDecision, ReleaseStatus};
use crate::model::window::WindowIndex;
use crate::noise::{confidence_interval, perturb, NoiseError};
use crate::repo::release_repo::{NewDraft, ReleaseRepository, SqliteReleaseRepository};
use crate::repo::window_repo::{SqliteWindowRepository, WindowRepository};
use crate::repo::{RepoError, RepoResult};
use crate::service::ledger::{BudgetLedger, LedgerError, LedgerReceipt};
use crate::service::projector;
use crate::source::{SourceError, TrueCountSource};
use log::{debug, error, info, warn};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Instant;
use uuid::Uuid;

const LEDGER_MISMATCH_MESSAGE: &str = "release epsilon does not match ledger entry";

pub type EvaluationResult<T> = Result<T, EvaluationError>;

/// Failure of one evaluation. Never affects other items.
#[derive(Debug)]
pub enum EvaluationError {
    /// Transient; the item is retried on the next tick.
    Source(SourceError),
    Repo(RepoError),
    Noise(NoiseError),
    /// Persisted state disagrees with itself. Logged, never repaired.
    ConsistencyViolation(String),
}

impl EvaluationError {
    /// Source outages and lock contention with another evaluator clear up
    /// on their own; the item is retried on the next tick.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Source(_) => true,
            Self::Repo(RepoError::Db(db)) => db.is_busy(),
            _ => false,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Source(_) => "source_failed",
            Self::Repo(_) => "repo_failed",
            Self::Noise(_) => "noise_failed",
            Self::ConsistencyViolation(_) => "consistency_violation",
        }
    }
}

impl Display for EvaluationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source(err) => write!(f, "{err}"),
            Self::Repo(err) => write!(f, "{err}"),
            Self::Noise(err) => write!(f, "{err}"),
            Self::ConsistencyViolation(message) => {
                write!(f, "consistency violation: {message}")
            }
        }
    }
}

impl Error for EvaluationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Source(err) => Some(err),
            Self::Repo(err) => Some(err),
            Self::Noise(err) => Some(err),
            Self::ConsistencyViolation(_) => None,
        }
    }
}

impl From<SourceError> for EvaluationError {
    fn from(value: SourceError) -> Self {
        Self::Source(value)
    }
}

impl From<RepoError> for EvaluationError {
    fn from(value: RepoError) -> Self {
        if is_ledger_mismatch(&value) {
            return Self::ConsistencyViolation(LEDGER_MISMATCH_MESSAGE.to_string());
        }
        Self::Repo(value)
    }
}

impl From<rusqlite::Error> for EvaluationError {
    fn from(value: rusqlite::Error) -> Self {
        RepoError::from(value).into()
    }
}

impl From<NoiseError> for EvaluationError {
    fn from(value: NoiseError) -> Self {
        Self::Noise(value)
    }
}

impl From<LedgerError> for EvaluationError {
    fn from(value: LedgerError) -> Self {
        match value {
            LedgerError::Repo(err) => err.into(),
            exceeded @ LedgerError::BudgetExceeded { .. } => {
                Self::ConsistencyViolation(exceeded.to_string())
            }
        }
    }
}

fn is_ledger_mismatch(err: &RepoError) -> bool {
    match err {
        RepoError::Db(db) => db
            .failure_message()
            .is_some_and(|message| message.contains(LEDGER_MISMATCH_MESSAGE)),
        _ => false,
    }
}

/// Result of evaluating one pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EvaluationOutcome {
    Published {
        decision: ReleaseDecision,
        epsilon_used: f64,
    },
    /// The pair was already published, here or by a concurrent evaluator.
    AlreadyPublished,
    /// The window is not the active one anymore.
    WindowNotActive,
}

/// Decides and persists releases.
pub struct ReleaseStore {
    config: ReleaseConfig,
    rng: ChaCha20Rng,
}

impl ReleaseStore {
    /// Builds a store with an entropy-seeded noise generator.
    pub fn new(config: ReleaseConfig) -> ConfigResult<Self> {
        Self::with_rng(config, ChaCha20Rng::from_entropy())
    }

    /// Builds a store with a caller-supplied generator, e.g. a seeded one.
    pub fn with_rng(config: ReleaseConfig, rng: ChaCha20Rng) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self { config, rng })
    }

    pub fn config(&self) -> &ReleaseConfig {
        &self.config
    }

    /// Evaluates `item_id` for `window` at time `now` (epoch milliseconds).
    ///
    /// # Errors
    /// - `Source` when the true count cannot be fetched; nothing is written.
    /// - `ConsistencyViolation` when persisted state is contradictory; the
    ///   transaction is rolled back.
    pub fn evaluate(
        &mut self,
        conn: &Connection,
        source: &dyn TrueCountSource,
        item_id: &ItemId,
        window: WindowIndex,
        now: i64,
    ) -> EvaluationResult<EvaluationOutcome> {
        let started_at = Instant::now();
        let result = self.evaluate_inner(conn, source, item_id, window, now);
        match &result {
            Ok(EvaluationOutcome::Published {
                decision,
                epsilon_used,
            }) => info!(
                "event=evaluate module=release_store status=ok item_id={} window={} decision={} epsilon_used={} duration_ms={}",
                item_id,
                window,
                decision.as_db(),
                epsilon_used,
                started_at.elapsed().as_millis()
            ),
            Ok(EvaluationOutcome::AlreadyPublished) => debug!(
                "event=evaluate module=release_store status=skip item_id={} window={} reason=already_published",
                item_id, window
            ),
            Ok(EvaluationOutcome::WindowNotActive) => warn!(
                "event=evaluate module=release_store status=skip item_id={} window={} reason=window_not_active",
                item_id, window
            ),
            Err(err) if err.is_transient() => warn!(
                "event=evaluate module=release_store status=error item_id={} window={} error_code={} error={}",
                item_id,
                window,
                err.code(),
                err
            ),
            Err(err) => error!(
                "event=evaluate module=release_store status=error item_id={} window={} error_code={} error={}",
                item_id,
                window,
                err.code(),
                err
            ),
        }
        result
    }

    fn evaluate_inner(
        &mut self,
        conn: &Connection,
        source: &dyn TrueCountSource,
        item_id: &ItemId,
        window: WindowIndex,
        now: i64,
    ) -> EvaluationResult<EvaluationOutcome> {
        if let Some(existing) = SqliteReleaseRepository::new(conn).get_release(item_id, window)? {
            if existing.status == ReleaseStatus::Published {
                return Ok(EvaluationOutcome::AlreadyPublished);
            }
        }

        let true_count = source.true_count(item_id)?;
        if true_count < 0 {
            return Err(SourceError::InvalidCount {
                item_id: item_id.clone(),
                count: true_count,
            }
            .into());
        }

        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;

        let active = SqliteWindowRepository::new(&tx).active_window()?;
        if active.map(|active| active.index) != Some(window) {
            return Ok(EvaluationOutcome::WindowNotActive);
        }

        let releases = SqliteReleaseRepository::new(&tx);
        let inserted = releases.insert_draft(&NewDraft {
            release_id: Uuid::new_v4(),
            item_id,
            window_index: window,
            true_count,
            created_at: now,
        })?;
        if !inserted {
            return match releases.get_release(item_id, window)? {
                Some(existing) if existing.is_published() => {
                    Ok(EvaluationOutcome::AlreadyPublished)
                }
                _ => Err(EvaluationError::ConsistencyViolation(format!(
                    "stale draft blocks item {item_id} window {window}"
                ))),
            };
        }

        let (decision, value, meets_threshold, receipt) =
            self.decide(&tx, item_id, window, true_count, now)?;
        if receipt.item_id() != item_id || receipt.window_index() != window {
            return Err(EvaluationError::ConsistencyViolation(format!(
                "ledger receipt for item {} window {} used for item {item_id} window {window}",
                receipt.item_id(),
                receipt.window_index()
            )));
        }

        let publication = receipt.into_publication(decision, value, meets_threshold, now);
        releases.publish_draft(item_id, window, &publication)?;
        projector::project(&tx, item_id)?;
        tx.commit()?;

        Ok(EvaluationOutcome::Published {
            decision,
            epsilon_used: publication.epsilon_used,
        })
    }

    fn decide(
        &mut self,
        conn: &Connection,
        item_id: &ItemId,
        window: WindowIndex,
        true_count: i64,
        now: i64,
    ) -> EvaluationResult<(ReleaseDecision, Option<NoisyValue>, bool, LedgerReceipt)> {
        let ledger = BudgetLedger::new(conn, &self.config);
        let meets_threshold = true_count >= self.config.threshold;
        let status = ledger.status(item_id)?;

        if status.is_locked() {
            let receipt = ledger.record_locked(item_id, window, now)?;
            return Ok((
                ReleaseDecision::Locked,
                status.final_release(),
                meets_threshold,
                receipt,
            ));
        }

        if !meets_threshold {
            let receipt = ledger.record_suppressed(item_id, window, now)?;
            return Ok((ReleaseDecision::Suppressed, None, false, receipt));
        }

        let releases = SqliteReleaseRepository::new(conn);
        if let Some(previous) = releases.latest_published(item_id)? {
            if previous.true_count == true_count {
                if let Some(value) = previous.value {
                    let receipt = ledger.reuse(item_id, window, now)?;
                    return Ok((ReleaseDecision::Reused, Some(value), true, receipt));
                }
            }
        }

        if !ledger.can_spend(item_id)? {
            let receipt = ledger.lock(item_id, window, now)?;
            let locked = status.lock(now, releases.latest_published_value(item_id)?);
            return Ok((
                ReleaseDecision::Locked,
                locked.final_release(),
                true,
                receipt,
            ));
        }

        let epsilon = self.config.epsilon_per_query;
        let noisy_count = perturb(&mut self.rng, true_count, epsilon)?;
        let interval = confidence_interval(noisy_count, epsilon, self.config.confidence)?;
        let receipt = ledger.spend(item_id, window, now)?;
        Ok((
            ReleaseDecision::Fresh,
            Some(NoisyValue {
                noisy_count,
                interval,
            }),
            true,
            receipt,
        ))
    }
}

/// Discards drafts left behind by an interrupted process.
///
/// Drafts are only valid inside the transaction that created them, so any
/// persisted draft is an abandoned evaluation. It is deleted, never
/// published; the next tick evaluates the pair again.
pub fn recover_drafts(conn: &Connection) -> RepoResult<usize> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let releases = SqliteReleaseRepository::new(&tx);
    let drafts = releases.list_drafts()?;
    for draft in &drafts {
        releases.discard_draft(&draft.item_id, draft.window_index)?;
    }
    tx.commit()?;

    if drafts.is_empty() {
        info!("event=draft_recovery module=release_store status=ok discarded=0");
    } else {
        warn!(
            "event=draft_recovery module=release_store status=ok discarded={}",
            drafts.len()
        );
    }
    Ok(drafts.len())
}
