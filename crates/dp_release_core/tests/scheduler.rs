use dp_release_core::repo::item_repo::{ItemRepository, SqliteItemRepository};
use dp_release_core::repo::release_repo::{ReleaseRepository, SqliteReleaseRepository};
use dp_release_core::repo::window_repo::{SqliteWindowRepository, WindowRepository};
use dp_release_core::{
    open_db, open_db_in_memory, ItemId, ManualClock, ReleaseConfig, ReleaseStore, SchedulerError,
    SourceError, SourceResult, StopHandle, TrueCountSource, WindowScheduler, WindowStatus,
};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rusqlite::Connection;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Default)]
struct ScriptedSource {
    counts: Mutex<HashMap<String, i64>>,
    failing: Mutex<HashSet<String>>,
    stop_on_fetch: Mutex<Option<StopHandle>>,
}

impl ScriptedSource {
    fn set(&self, item: &str, count: i64) {
        self.counts.lock().unwrap().insert(item.to_string(), count);
    }

    fn fail(&self, item: &str, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(item.to_string());
        } else {
            set.remove(item);
        }
    }
}

impl TrueCountSource for ScriptedSource {
    fn true_count(&self, item_id: &ItemId) -> SourceResult<i64> {
        if let Some(stop) = self.stop_on_fetch.lock().unwrap().as_ref() {
            stop.stop();
        }
        if self.failing.lock().unwrap().contains(item_id.as_str()) {
            return Err(SourceError::Unavailable("scripted outage".to_string()));
        }
        self.counts
            .lock()
            .unwrap()
            .get(item_id.as_str())
            .copied()
            .ok_or_else(|| SourceError::Unavailable(format!("no count for {item_id}")))
    }
}

type TestScheduler<'conn> = WindowScheduler<'conn, Arc<ManualClock>, Arc<ScriptedSource>>;

fn config() -> ReleaseConfig {
    ReleaseConfig {
        window_length_secs: 10,
        poll_interval_ms: 1,
        ..ReleaseConfig::default()
    }
}

fn scheduler<'conn>(
    conn: &'conn Connection,
    clock: &Arc<ManualClock>,
    source: &Arc<ScriptedSource>,
) -> TestScheduler<'conn> {
    let store = ReleaseStore::with_rng(config(), ChaCha20Rng::seed_from_u64(17)).unwrap();
    WindowScheduler::new(conn, store, Arc::clone(clock), Arc::clone(source)).unwrap()
}

fn track(conn: &Connection, items: &[&str]) {
    let repo = SqliteItemRepository::new(conn);
    for raw in items {
        repo.track_item(&ItemId::parse(raw).unwrap(), 0).unwrap();
    }
}

fn window_count(conn: &Connection) -> i64 {
    conn.query_row("SELECT COUNT(*) FROM release_windows;", [], |row| {
        row.get(0)
    })
    .unwrap()
}

#[test]
fn first_tick_opens_the_window_containing_now() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(25_000));
    let source = Arc::new(ScriptedSource::default());
    track(&conn, &["post-1"]);
    source.set("post-1", 3);

    let mut scheduler = scheduler(&conn, &clock, &source);
    let report = scheduler.tick_now().unwrap();

    let window = report.window.clone().unwrap();
    assert!(report.opened);
    assert_eq!(report.closed, None);
    assert_eq!(window.index, 2);
    assert_eq!((window.start_ms, window.end_ms), (20_000, 30_000));
    assert!(window.contains(25_000));
    assert_eq!(report.fresh, 1);
    assert!(report.failures.is_empty());
}

#[test]
fn late_tick_opens_only_the_current_window() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(5_000));
    let source = Arc::new(ScriptedSource::default());
    track(&conn, &["post-1"]);
    source.set("post-1", 3);
    let mut scheduler = scheduler(&conn, &clock, &source);

    scheduler.tick_now().unwrap();
    clock.set(57_000);
    let report = scheduler.tick_now().unwrap();

    assert!(report.opened);
    assert_eq!(report.closed, Some(0));
    assert_eq!(report.window.as_ref().map(|window| window.index), Some(5));
    assert_eq!(report.reused, 1);
    assert_eq!(window_count(&conn), 2);

    let windows = SqliteWindowRepository::new(&conn);
    let closed = windows.get_window(0).unwrap().unwrap();
    assert_eq!(closed.status, WindowStatus::Closed);
    assert_eq!(closed.closed_at, Some(57_000));
    assert!(windows.get_window(3).unwrap().is_none());
}

#[test]
fn tick_inside_the_active_window_keeps_it() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(1_000));
    let source = Arc::new(ScriptedSource::default());
    track(&conn, &["post-1"]);
    source.set("post-1", 3);
    let mut scheduler = scheduler(&conn, &clock, &source);

    scheduler.tick(1_000).unwrap();
    let report = scheduler.tick(9_999).unwrap();

    assert!(!report.opened);
    assert_eq!(report.window.as_ref().map(|window| window.index), Some(0));
    assert_eq!(report.unchanged, 1);
    assert_eq!(report.published(), 0);
}

#[test]
fn tick_before_the_active_window_does_not_move_time_backwards() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(25_000));
    let source = Arc::new(ScriptedSource::default());
    let mut scheduler = scheduler(&conn, &clock, &source);

    scheduler.tick_now().unwrap();
    let report = scheduler.tick(5_000).unwrap();

    assert!(!report.opened);
    assert_eq!(report.window.as_ref().map(|window| window.index), Some(2));
    assert_eq!(window_count(&conn), 1);
}

#[test]
fn restart_resumes_the_active_window_without_double_evaluation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("releases.sqlite3");
    let clock = Arc::new(ManualClock::new(1_000));
    let source = Arc::new(ScriptedSource::default());
    source.set("post-1", 8);

    {
        let conn = open_db(&path).unwrap();
        track(&conn, &["post-1"]);
        let mut first = scheduler(&conn, &clock, &source);
        assert_eq!(first.tick_now().unwrap().fresh, 1);
    }

    let conn = open_db(&path).unwrap();
    let mut second = scheduler(&conn, &clock, &source);
    clock.set(2_000);
    let report = second.tick_now().unwrap();
    assert!(!report.opened);
    assert_eq!(report.unchanged, 1);
    assert_eq!(report.published(), 0);

    clock.set(12_000);
    let report = second.tick_now().unwrap();
    assert_eq!(report.closed, Some(0));
    assert_eq!(report.reused, 1);
}

#[test]
fn active_window_rotates_exactly_at_its_persisted_end() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let source = Arc::new(ScriptedSource::default());
    let mut scheduler = scheduler(&conn, &clock, &source);

    scheduler.tick(9_999).unwrap();
    let report = scheduler.tick(10_000).unwrap();

    assert!(report.opened);
    assert_eq!(report.closed, Some(0));
    let window = report.window.unwrap();
    assert_eq!((window.index, window.start_ms, window.end_ms), (1, 10_000, 20_000));
}

#[test]
fn restart_with_a_different_window_grid_refuses_to_start() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("releases.sqlite3");
    let clock = Arc::new(ManualClock::new(25_000));
    let source = Arc::new(ScriptedSource::default());

    {
        let conn = open_db(&path).unwrap();
        let mut first = scheduler(&conn, &clock, &source);
        assert!(first.tick_now().unwrap().opened);
    }

    let conn = open_db(&path).unwrap();
    for changed in [
        ReleaseConfig {
            window_length_secs: 60,
            ..config()
        },
        ReleaseConfig {
            window_origin_secs: 5,
            ..config()
        },
    ] {
        let result = WindowScheduler::from_config(
            &conn,
            changed,
            Arc::clone(&clock),
            Arc::clone(&source),
        );
        match result {
            Err(SchedulerError::Config(err)) => {
                assert!(err.to_string().contains("window 2"), "{err}")
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("scheduler started on a mismatched grid"),
        }
    }

    let mut resumed = scheduler(&conn, &clock, &source);
    clock.set(30_000);
    let report = resumed.tick_now().unwrap();
    assert_eq!(report.closed, Some(2));
    assert_eq!(report.window.map(|window| window.index), Some(3));
}

#[test]
fn closed_windows_are_never_reopened() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(1_000));
    let source = Arc::new(ScriptedSource::default());
    track(&conn, &["post-1"]);
    source.set("post-1", 2);
    let mut scheduler = scheduler(&conn, &clock, &source);

    scheduler.tick_now().unwrap();
    SqliteWindowRepository::new(&conn)
        .close_window(0, 1_500)
        .unwrap();

    let report = scheduler.tick(2_000).unwrap();
    assert!(report.window.is_none());
    assert!(!report.opened);
    assert_eq!(window_count(&conn), 1);

    let report = scheduler.tick(10_000).unwrap();
    assert!(report.opened);
    assert_eq!(report.window.as_ref().map(|window| window.index), Some(1));
}

#[test]
fn failing_item_is_isolated_and_retried_on_the_next_tick() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(1_000));
    let source = Arc::new(ScriptedSource::default());
    track(&conn, &["post-a", "post-b"]);
    source.set("post-a", 4);
    source.set("post-b", 6);
    source.fail("post-a", true);
    let mut scheduler = scheduler(&conn, &clock, &source);

    let report = scheduler.tick_now().unwrap();
    assert_eq!(report.fresh, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].item_id.as_str(), "post-a");
    assert!(report.failures[0].transient);

    source.fail("post-a", false);
    clock.advance(1_000);
    let report = scheduler.tick_now().unwrap();
    assert_eq!(report.fresh, 1);
    assert_eq!(report.unchanged, 1);
    assert!(report.failures.is_empty());

    let releases = SqliteReleaseRepository::new(&conn);
    let post_a = ItemId::parse("post-a").unwrap();
    assert!(releases.get_release(&post_a, 0).unwrap().unwrap().is_published());
}

#[test]
fn untracked_items_keep_history_but_are_not_evaluated() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(1_000));
    let source = Arc::new(ScriptedSource::default());
    track(&conn, &["post-1"]);
    source.set("post-1", 2);
    let mut scheduler = scheduler(&conn, &clock, &source);
    scheduler.tick_now().unwrap();

    let post = ItemId::parse("post-1").unwrap();
    let items = SqliteItemRepository::new(&conn);
    assert!(items.untrack_item(&post).unwrap());
    assert!(!items.untrack_item(&post).unwrap());
    assert!(!items.is_tracked(&post).unwrap());

    clock.set(15_000);
    let report = scheduler.tick_now().unwrap();
    assert!(report.opened);
    assert_eq!(report.published(), 0);

    let releases = SqliteReleaseRepository::new(&conn);
    assert_eq!(releases.list_published(&post).unwrap().len(), 1);
    assert!(items.track_item(&post, 15_000).unwrap());
    assert!(!items.track_item(&post, 15_000).unwrap());
}

#[test]
fn invalid_configuration_refuses_to_start() {
    let conn = open_db_in_memory().unwrap();
    let config = ReleaseConfig {
        threshold: 0,
        ..config()
    };

    let result = WindowScheduler::from_config(
        &conn,
        config,
        Arc::new(ManualClock::new(0)),
        Arc::new(ScriptedSource::default()),
    );
    assert!(matches!(result, Err(SchedulerError::Config(_))));
    assert_eq!(window_count(&conn), 0);
}

#[test]
fn run_stops_after_max_ticks() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(1_000));
    let source = Arc::new(ScriptedSource::default());
    track(&conn, &["post-1"]);
    source.set("post-1", 2);
    let mut scheduler = scheduler(&conn, &clock, &source);

    let stop = StopHandle::new();
    assert_eq!(scheduler.run(&stop, Some(3)).unwrap(), 3);

    let post = ItemId::parse("post-1").unwrap();
    let releases = SqliteReleaseRepository::new(&conn);
    assert_eq!(releases.list_published(&post).unwrap().len(), 1);
}

#[test]
fn raised_stop_handle_prevents_any_tick() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(1_000));
    let source = Arc::new(ScriptedSource::default());
    let mut scheduler = scheduler(&conn, &clock, &source);

    let stop = StopHandle::new();
    stop.stop();
    assert_eq!(scheduler.run(&stop, None).unwrap(), 0);
    assert_eq!(window_count(&conn), 0);
}

#[test]
fn stop_request_is_honored_between_items() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(1_000));
    let source = Arc::new(ScriptedSource::default());
    track(&conn, &["post-a", "post-b"]);
    source.set("post-a", 1);
    source.set("post-b", 1);
    let stop = StopHandle::new();
    *source.stop_on_fetch.lock().unwrap() = Some(stop.clone());
    let mut scheduler = scheduler(&conn, &clock, &source);

    assert_eq!(scheduler.run(&stop, None).unwrap(), 1);

    let releases = SqliteReleaseRepository::new(&conn);
    let post_a = ItemId::parse("post-a").unwrap();
    let post_b = ItemId::parse("post-b").unwrap();
    assert!(releases.get_release(&post_a, 0).unwrap().unwrap().is_published());
    assert!(releases.get_release(&post_b, 0).unwrap().is_none());
}

#[test]
fn stop_raised_from_another_thread_ends_an_unbounded_run() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(1_000));
    let source = Arc::new(ScriptedSource::default());
    track(&conn, &["post-1"]);
    source.set("post-1", 2);
    let store = ReleaseStore::with_rng(
        ReleaseConfig {
            poll_interval_ms: 60_000,
            ..config()
        },
        ChaCha20Rng::seed_from_u64(5),
    )
    .unwrap();
    let mut scheduler =
        WindowScheduler::new(&conn, store, Arc::clone(&clock), Arc::clone(&source)).unwrap();

    let stop = StopHandle::new();
    let signal = stop.clone();
    let signaller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        signal.stop();
    });

    let started = Instant::now();
    assert_eq!(scheduler.run(&stop, None).unwrap(), 1);
    assert!(started.elapsed() < Duration::from_secs(30));
    signaller.join().unwrap();

    let post = ItemId::parse("post-1").unwrap();
    let releases = SqliteReleaseRepository::new(&conn);
    assert!(releases.get_release(&post, 0).unwrap().unwrap().is_published());
}
