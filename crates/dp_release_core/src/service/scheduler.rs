//! Window scheduler.
//!
//! # Responsibility
//! - Partition time into fixed windows on the `origin + k*length` grid.
//! - Rotate the active window and drive one evaluation per tracked item.
//!
//! # Invariants
//! - Exactly one window is active once the first tick has run.
//! - The active window rotates once `now` reaches its persisted `end_ms`.
//! - A late tick opens only the window containing `now`; skipped windows are
//!   never fabricated.
//! - Persisted windows must sit on the configured grid; a changed grid is
//!   rejected at startup.
//! - A closed window is never reopened or evaluated again, across restarts.
//! - One item's failure never stops the remaining items of a tick.

use crate::config::{ConfigError, ReleaseConfig};
use crate::model::item::ItemId;
use crate::model::release::ReleaseDecision;
use crate::model::window::{Window, WindowGrid, WindowIndex};
use crate::repo::item_repo::{ItemRepository, SqliteItemRepository};
use crate::repo::window_repo::{SqliteWindowRepository, WindowRepository};
use crate::repo::{RepoError, RepoResult};
use crate::service::release_store::{recover_drafts, EvaluationOutcome, ReleaseStore};
use crate::source::TrueCountSource;
use log::{error, info, warn};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const STOP_POLL_SLICE: Duration = Duration::from_millis(50);

pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[derive(Debug)]
pub enum SchedulerError {
    Config(ConfigError),
    Repo(RepoError),
}

impl Display for SchedulerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(err) => write!(f, "{err}"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for SchedulerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Repo(err) => Some(err),
        }
    }
}

impl From<ConfigError> for SchedulerError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<RepoError> for SchedulerError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

impl From<rusqlite::Error> for SchedulerError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Repo(value.into())
    }
}

/// Source of the current time in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

impl<T: Clock + ?Sized> Clock for Arc<T> {
    fn now_ms(&self) -> i64 {
        (**self).now_ms()
    }
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by_ms: i64) {
        self.now_ms.fetch_add(by_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Cooperative shutdown flag, checked between item evaluations.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// One item that could not be evaluated this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub item_id: ItemId,
    pub transient: bool,
    pub message: String,
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TickReport {
    pub now: i64,
    /// Active window after rotation; `None` when the tick was skipped.
    pub window: Option<Window>,
    pub opened: bool,
    pub closed: Option<WindowIndex>,
    pub fresh: u32,
    pub reused: u32,
    pub suppressed: u32,
    pub locked: u32,
    /// Pairs that were already published.
    pub unchanged: u32,
    pub failures: Vec<ItemFailure>,
    /// `true` when a stop request cut the tick short.
    pub interrupted: bool,
}

impl TickReport {
    pub fn published(&self) -> u32 {
        self.fresh + self.reused + self.suppressed + self.locked
    }

    fn record(&mut self, decision: ReleaseDecision) {
        match decision {
            ReleaseDecision::Fresh => self.fresh += 1,
            ReleaseDecision::Reused => self.reused += 1,
            ReleaseDecision::Suppressed => self.suppressed += 1,
            ReleaseDecision::Locked => self.locked += 1,
        }
    }
}

struct WindowTransition {
    window: Option<Window>,
    opened: bool,
    closed: Option<WindowIndex>,
}

/// Drives window rotation and per-item evaluation.
pub struct WindowScheduler<'conn, C: Clock, S: TrueCountSource> {
    conn: &'conn Connection,
    clock: C,
    source: S,
    store: ReleaseStore,
    grid: WindowGrid,
    poll_interval: Duration,
}

impl<'conn, C: Clock, S: TrueCountSource> WindowScheduler<'conn, C, S> {
    /// Validates `config`, recovers abandoned drafts and builds a scheduler
    /// with an entropy-seeded store.
    ///
    /// # Errors
    /// - `Config` when the configuration is invalid; nothing is touched.
    pub fn from_config(
        conn: &'conn Connection,
        config: ReleaseConfig,
        clock: C,
        source: S,
    ) -> SchedulerResult<Self> {
        let store = ReleaseStore::new(config)?;
        Self::new(conn, store, clock, source)
    }

    /// Builds a scheduler around an existing store and recovers abandoned
    /// drafts.
    pub fn new(
        conn: &'conn Connection,
        store: ReleaseStore,
        clock: C,
        source: S,
    ) -> SchedulerResult<Self> {
        store.config().validate()?;
        let grid = store.config().window_grid();
        check_grid(conn, grid)?;
        recover_drafts(conn)?;
        let poll_interval = store.config().poll_interval();
        Ok(Self {
            conn,
            clock,
            source,
            store,
            grid,
            poll_interval,
        })
    }

    pub fn grid(&self) -> WindowGrid {
        self.grid
    }

    /// Runs one tick at the injected clock's current time.
    pub fn tick_now(&mut self) -> SchedulerResult<TickReport> {
        let now = self.clock.now_ms();
        self.tick(now)
    }

    /// Rotates the window for `now` and evaluates every tracked item.
    pub fn tick(&mut self, now: i64) -> SchedulerResult<TickReport> {
        self.tick_until(now, None)
    }

    /// Ticks on the poll interval until `stop` is raised or `max_ticks`
    /// ticks have run. Returns the number of ticks.
    ///
    /// A failing tick is logged and the loop continues.
    pub fn run(&mut self, stop: &StopHandle, max_ticks: Option<u64>) -> SchedulerResult<u64> {
        info!(
            "event=scheduler_run module=scheduler status=start poll_interval_ms={} max_ticks={}",
            self.poll_interval.as_millis(),
            max_ticks.map_or_else(|| "none".to_string(), |max| max.to_string())
        );

        let mut ticks = 0u64;
        while !stop.is_stopped() {
            if max_ticks.is_some_and(|max| ticks >= max) {
                break;
            }
            let now = self.clock.now_ms();
            if let Err(err) = self.tick_until(now, Some(stop)) {
                error!(
                    "event=tick module=scheduler status=error now={} error_code=tick_failed error={}",
                    now, err
                );
            }
            ticks += 1;
            if max_ticks.is_some_and(|max| ticks >= max) {
                break;
            }
            sleep_unless_stopped(stop, self.poll_interval);
        }

        info!(
            "event=scheduler_run module=scheduler status=ok ticks={} stopped={}",
            ticks,
            stop.is_stopped()
        );
        Ok(ticks)
    }

    fn tick_until(&mut self, now: i64, stop: Option<&StopHandle>) -> SchedulerResult<TickReport> {
        let started_at = Instant::now();
        let transition = self.ensure_window(now)?;
        let mut report = TickReport {
            now,
            window: transition.window.clone(),
            opened: transition.opened,
            closed: transition.closed,
            ..TickReport::default()
        };

        let Some(window) = transition.window else {
            return Ok(report);
        };

        let items = SqliteItemRepository::new(self.conn).list_tracked_items()?;
        for item_id in &items {
            if stop.is_some_and(StopHandle::is_stopped) {
                report.interrupted = true;
                break;
            }
            match self
                .store
                .evaluate(self.conn, &self.source, item_id, window.index, now)
            {
                Ok(EvaluationOutcome::Published { decision, .. }) => report.record(decision),
                Ok(EvaluationOutcome::AlreadyPublished) => report.unchanged += 1,
                Ok(EvaluationOutcome::WindowNotActive) => {
                    report.interrupted = true;
                    break;
                }
                Err(err) => report.failures.push(ItemFailure {
                    item_id: item_id.clone(),
                    transient: err.is_transient(),
                    message: err.to_string(),
                }),
            }
        }

        info!(
            "event=tick module=scheduler status=ok now={} window={} opened={} items={} fresh={} reused={} suppressed={} locked={} unchanged={} failed={} interrupted={} duration_ms={}",
            now,
            window.index,
            report.opened,
            items.len(),
            report.fresh,
            report.reused,
            report.suppressed,
            report.locked,
            report.unchanged,
            report.failures.len(),
            report.interrupted,
            started_at.elapsed().as_millis()
        );
        Ok(report)
    }

    fn ensure_window(&self, now: i64) -> RepoResult<WindowTransition> {
        let target = self.grid.index_at(now);
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let windows = SqliteWindowRepository::new(&tx);

        let transition = match windows.active_window()? {
            Some(active) if now >= active.end_ms => {
                if target <= active.index {
                    return Err(RepoError::InvalidData(format!(
                        "active window {} ends at {} but the grid places {now} in window {target}",
                        active.index, active.end_ms
                    )));
                }
                windows.close_window(active.index, now)?;
                let (start_ms, end_ms) = self.grid.bounds(target);
                let opened = windows.open_window(target, start_ms, end_ms, now)?;
                info!(
                    "event=window_rotate module=scheduler status=ok closed={} opened={} skipped={}",
                    active.index,
                    target,
                    target - active.index - 1
                );
                WindowTransition {
                    window: Some(opened),
                    opened: true,
                    closed: Some(active.index),
                }
            }
            Some(active) => {
                if now < active.start_ms {
                    warn!(
                        "event=window_rotate module=scheduler status=skip now={} active={} reason=clock_behind_active_window",
                        now, active.index
                    );
                }
                WindowTransition {
                    window: Some(active),
                    opened: false,
                    closed: None,
                }
            }
            None => match windows.latest_window()? {
                Some(latest) if now < latest.end_ms || target <= latest.index => {
                    warn!(
                        "event=window_rotate module=scheduler status=skip now={} latest={} reason=window_already_closed",
                        now, latest.index
                    );
                    WindowTransition {
                        window: None,
                        opened: false,
                        closed: None,
                    }
                }
                _ => {
                    let (start_ms, end_ms) = self.grid.bounds(target);
                    let opened = windows.open_window(target, start_ms, end_ms, now)?;
                    info!(
                        "event=window_rotate module=scheduler status=ok opened={}",
                        target
                    );
                    WindowTransition {
                        window: Some(opened),
                        opened: true,
                        closed: None,
                    }
                }
            },
        };

        tx.commit()?;
        Ok(transition)
    }
}

/// Rejects a grid that would not reproduce the latest persisted window.
fn check_grid(conn: &Connection, grid: WindowGrid) -> SchedulerResult<()> {
    let Some(latest) = SqliteWindowRepository::new(conn).latest_window()? else {
        return Ok(());
    };
    if grid.bounds(latest.index) == (latest.start_ms, latest.end_ms) {
        return Ok(());
    }

    let (start_ms, end_ms) = grid.bounds(latest.index);
    error!(
        "event=scheduler_start module=scheduler status=error window={} persisted_start_ms={} persisted_end_ms={} grid_start_ms={} grid_end_ms={} error_code=window_grid_mismatch",
        latest.index, latest.start_ms, latest.end_ms, start_ms, end_ms
    );
    Err(ConfigError::Invalid(format!(
        "window grid places window {} at [{start_ms}, {end_ms}) but it was persisted as [{}, {}); restore window-length-secs and window-origin-secs",
        latest.index, latest.start_ms, latest.end_ms
    ))
    .into())
}

fn sleep_unless_stopped(stop: &StopHandle, total: Duration) {
    let deadline = Instant::now() + total;
    while !stop.is_stopped() {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep(STOP_POLL_SLICE.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::{Clock, ManualClock, StopHandle, TickReport};
    use crate::model::release::ReleaseDecision;

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance(500);
        assert_eq!(clock.now_ms(), 1_500);
        clock.set(10);
        assert_eq!(clock.now_ms(), 10);
    }

    #[test]
    fn stop_handle_is_shared_between_clones() {
        let stop = StopHandle::new();
        let observer = stop.clone();
        assert!(!observer.is_stopped());
        stop.stop();
        assert!(observer.is_stopped());
    }

    #[test]
    fn report_counts_each_decision() {
        let mut report = TickReport::default();
        report.record(ReleaseDecision::Fresh);
        report.record(ReleaseDecision::Reused);
        report.record(ReleaseDecision::Reused);
        report.record(ReleaseDecision::Locked);
        assert_eq!(report.fresh, 1);
        assert_eq!(report.reused, 2);
        assert_eq!(report.published(), 4);
    }
}
