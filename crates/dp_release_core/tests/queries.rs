use dp_release_core::repo::window_repo::{SqliteWindowRepository, WindowRepository};
use dp_release_core::{
    budget_status, current_release, item_summary, open_db, open_db_in_memory, release_history,
    EvaluationOutcome, ItemId, PrivacyStatus, ReleaseConfig, ReleaseDecision, ReleaseStore,
    SourceResult, TrueCountSource,
};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

struct Fixed(i64);

impl TrueCountSource for Fixed {
    fn true_count(&self, _item_id: &ItemId) -> SourceResult<i64> {
        Ok(self.0)
    }
}

#[test]
fn untouched_item_reports_full_budget_and_no_release() {
    let conn = open_db_in_memory().unwrap();
    let config = ReleaseConfig::default();
    let post = ItemId::parse("post-new").unwrap();

    assert_eq!(current_release(&conn, &config, &post).unwrap(), None);
    assert!(release_history(&conn, &post).unwrap().is_empty());
    assert_eq!(item_summary(&conn, &post).unwrap(), None);

    let budget = budget_status(&conn, &config, &post).unwrap();
    assert_eq!(budget.epsilon_remaining, 20.0);
    assert_eq!(budget.lifetime_cap, 20.0);
    assert_eq!(budget.total_spent, 0.0);
    assert!(!budget.is_locked);
    assert_eq!(budget.queries_remaining, 40);
}

#[test]
fn published_release_is_visible_without_its_true_count() {
    let conn = open_db_in_memory().unwrap();
    let config = ReleaseConfig::default();
    let mut store =
        ReleaseStore::with_rng(config.clone(), ChaCha20Rng::seed_from_u64(8)).unwrap();
    let post = ItemId::parse("post-1").unwrap();
    SqliteWindowRepository::new(&conn)
        .open_window(0, 0, 86_400_000, 0)
        .unwrap();
    store.evaluate(&conn, &Fixed(30), &post, 0, 100).unwrap();

    let current = current_release(&conn, &config, &post).unwrap().unwrap();
    assert_eq!(current.window, 0);
    assert!(current.meets_threshold);
    assert!(!current.is_locked);
    let noisy = current.noisy_count.unwrap();
    assert!(current.confidence_interval.unwrap().contains(noisy));

    let budget = budget_status(&conn, &config, &post).unwrap();
    assert_eq!(budget.epsilon_remaining, 19.5);
    assert_eq!(budget.total_spent, 0.5);
    assert_eq!(budget.queries_remaining, 39);

    let history = release_history(&conn, &post).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].decision, ReleaseDecision::Fresh);
    assert_eq!(history[0].published_at, 100);

    let json = serde_json::to_value(&history[0]).unwrap();
    assert!(json.get("true_count").is_none());
    assert_eq!(json["decision"], "fresh");

    let summary = item_summary(&conn, &post).unwrap().unwrap();
    assert_eq!(summary.current_window, Some(0));
    assert_eq!(summary.release_count, 1);
    let json = serde_json::to_value(&summary).unwrap();
    assert!(json.get("last_true_count").is_none());
}

#[test]
fn current_release_never_pairs_a_value_with_a_later_lock() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("releases.sqlite3");
    let config = ReleaseConfig {
        epsilon_per_query: 0.5,
        lifetime_epsilon_cap: 1.0,
        ..ReleaseConfig::default()
    };
    let items: Vec<ItemId> = (0..150)
        .map(|n| ItemId::parse(&format!("post-{n}")).unwrap())
        .collect();
    let reader = open_db(&path).unwrap();
    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let path = path.clone();
        let config = config.clone();
        let items = items.clone();
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let conn = open_db(&path).unwrap();
            let mut store = ReleaseStore::with_rng(config, ChaCha20Rng::seed_from_u64(3)).unwrap();
            let windows = SqliteWindowRepository::new(&conn);
            windows.open_window(0, 0, 1_000, 0).unwrap();
            for item in &items {
                store.evaluate(&conn, &Fixed(5), item, 0, 10).unwrap();
            }
            windows.close_window(0, 1_000).unwrap();
            windows.open_window(1, 1_000, 2_000, 1_000).unwrap();
            for item in &items {
                let outcome = store.evaluate(&conn, &Fixed(6), item, 1, 1_010).unwrap();
                assert_eq!(
                    outcome,
                    EvaluationOutcome::Published {
                        decision: ReleaseDecision::Fresh,
                        epsilon_used: 0.5,
                    }
                );
            }
            done.store(true, Ordering::SeqCst);
        })
    };

    while !done.load(Ordering::SeqCst) {
        for item in &items {
            if let Some(current) = current_release(&reader, &config, item).unwrap() {
                // The fresh release of window 1 spends the last of the cap.
                assert_eq!(current.is_locked, current.window == 1, "{item}");
            }
        }
    }
    writer.join().unwrap();

    for item in &items {
        let current = current_release(&reader, &config, item).unwrap().unwrap();
        assert_eq!(current.window, 1);
        assert!(current.is_locked);
    }
}

#[test]
fn privacy_status_serializes_as_tagged_state() {
    let active = serde_json::to_value(PrivacyStatus::untouched(20.0)).unwrap();
    assert_eq!(
        active,
        serde_json::json!({ "state": "active", "epsilon_remaining": 20.0 })
    );

    let locked = PrivacyStatus::untouched(20.0).lock(1_700, None);
    let value = serde_json::to_value(&locked).unwrap();
    assert_eq!(value["state"], "locked");
    assert_eq!(value["locked_at"], 1_700);

    let decoded: PrivacyStatus = serde_json::from_value(value).unwrap();
    assert_eq!(decoded, locked);
}

#[test]
fn item_ids_are_validated_when_deserialized() {
    let err = serde_json::from_value::<ItemId>(serde_json::json!("post 1; DROP")).unwrap_err();
    assert!(err.to_string().contains("must match"), "{err}");
}
