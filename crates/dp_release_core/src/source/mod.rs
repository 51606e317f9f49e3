//! True-count sources owned by the voting platform.
//!
//! # Responsibility
//! - Define the read-only contract for fetching an item's current count.
//! - Bound every fetch with a timeout so one slow item cannot stall a tick.
//! - Keep a hung source from consuming more than one worker thread.
//!
//! # Invariants
//! - Fetching never mutates release engine state.
//! - Counts are non-negative; anything else is reported as an error.

mod sqlite_source;

pub use sqlite_source::{SqliteCountSource, DEFAULT_COUNT_QUERY};

use crate::model::item::ItemId;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::marker::PhantomData;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type SourceResult<T> = Result<T, SourceError>;

/// Transient fetch failure. The item is retried on the next tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    Unavailable(String),
    Timeout { item_id: ItemId, timeout_ms: u128 },
    InvalidCount { item_id: ItemId, count: i64 },
}

impl Display for SourceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(message) => write!(f, "true count source unavailable: {message}"),
            Self::Timeout {
                item_id,
                timeout_ms,
            } => write!(
                f,
                "true count fetch for item {item_id} timed out after {timeout_ms} ms"
            ),
            Self::InvalidCount { item_id, count } => {
                write!(f, "true count source returned {count} for item {item_id}")
            }
        }
    }
}

impl Error for SourceError {}

/// Read-only access to current true counts.
pub trait TrueCountSource: Send + Sync {
    fn true_count(&self, item_id: &ItemId) -> SourceResult<i64>;
}

impl<T: TrueCountSource + ?Sized> TrueCountSource for Arc<T> {
    fn true_count(&self, item_id: &ItemId) -> SourceResult<i64> {
        (**self).true_count(item_id)
    }
}

impl<T: TrueCountSource + ?Sized> TrueCountSource for Box<T> {
    fn true_count(&self, item_id: &ItemId) -> SourceResult<i64> {
        (**self).true_count(item_id)
    }
}

type FetchRequest = (ItemId, mpsc::Sender<SourceResult<i64>>);

/// Runs fetches on one long-lived worker thread and gives up waiting after
/// `timeout`.
///
/// While the worker is stuck on a slow fetch, at most one further request
/// queues behind it; later fetches fail fast with `Unavailable` instead of
/// piling up threads. A timed-out result is dropped when it arrives.
pub struct TimeoutSource<S> {
    requests: Mutex<mpsc::SyncSender<FetchRequest>>,
    timeout: Duration,
    source: PhantomData<fn() -> S>,
}

impl<S: TrueCountSource + 'static> TimeoutSource<S> {
    /// Moves `inner` onto a new `true-count-fetch` worker thread.
    pub fn new(inner: S, timeout: Duration) -> SourceResult<Self> {
        let (requests, queue) = mpsc::sync_channel::<FetchRequest>(1);
        std::thread::Builder::new()
            .name("true-count-fetch".to_string())
            .spawn(move || {
                for (item_id, reply) in queue {
                    let _ = reply.send(inner.true_count(&item_id));
                }
            })
            .map_err(|err| {
                SourceError::Unavailable(format!("failed to spawn fetch worker: {err}"))
            })?;

        Ok(Self {
            requests: Mutex::new(requests),
            timeout,
            source: PhantomData,
        })
    }
}

impl<S: TrueCountSource + 'static> TrueCountSource for TimeoutSource<S> {
    fn true_count(&self, item_id: &ItemId) -> SourceResult<i64> {
        let (reply, receiver) = mpsc::channel();
        {
            let requests = self.requests.lock().map_err(|_| {
                SourceError::Unavailable("fetch request queue poisoned".to_string())
            })?;
            match requests.try_send((item_id.clone(), reply)) {
                Ok(()) => {}
                Err(mpsc::TrySendError::Full(_)) => {
                    return Err(SourceError::Unavailable(format!(
                        "fetch worker busy with an earlier fetch; item {item_id} skipped"
                    )))
                }
                Err(mpsc::TrySendError::Disconnected(_)) => {
                    return Err(SourceError::Unavailable(
                        "fetch worker stopped".to_string(),
                    ))
                }
            }
        }

        match receiver.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(SourceError::Timeout {
                item_id: item_id.clone(),
                timeout_ms: self.timeout.as_millis(),
            }),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(SourceError::Unavailable(format!(
                "fetch for item {item_id} ended without a result"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SourceError, SourceResult, TimeoutSource, TrueCountSource};
    use crate::model::item::ItemId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc, Mutex};
    use std::time::{Duration, Instant};

    struct Fixed(i64);

    impl TrueCountSource for Fixed {
        fn true_count(&self, _item_id: &ItemId) -> SourceResult<i64> {
            Ok(self.0)
        }
    }

    struct Slow;

    impl TrueCountSource for Slow {
        fn true_count(&self, _item_id: &ItemId) -> SourceResult<i64> {
            std::thread::sleep(Duration::from_millis(500));
            Ok(1)
        }
    }

    #[test]
    fn timeout_source_passes_fast_results_through() {
        let source = TimeoutSource::new(Fixed(9), Duration::from_secs(1)).expect("fetch worker");
        let item = ItemId::parse("post-1").expect("valid id");
        assert_eq!(source.true_count(&item), Ok(9));
    }

    #[test]
    fn timeout_source_reports_slow_fetches() {
        let source = TimeoutSource::new(Slow, Duration::from_millis(20)).expect("fetch worker");
        let item = ItemId::parse("post-2").expect("valid id");
        let err = source.true_count(&item).expect_err("slow fetch must time out");
        assert!(matches!(err, SourceError::Timeout { timeout_ms: 20, .. }));
    }

    /// Blocks every fetch until the gate's sender is dropped.
    struct Gated {
        entered: AtomicUsize,
        gate: Mutex<mpsc::Receiver<()>>,
    }

    impl TrueCountSource for Gated {
        fn true_count(&self, _item_id: &ItemId) -> SourceResult<i64> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            let gate = self.gate.lock().expect("gate lock");
            let _ = gate.recv();
            Ok(3)
        }
    }

    #[test]
    fn hung_source_occupies_a_single_worker() {
        let (release, gate) = mpsc::channel::<()>();
        let gated = Arc::new(Gated {
            entered: AtomicUsize::new(0),
            gate: Mutex::new(gate),
        });
        let source = TimeoutSource::new(Arc::clone(&gated), Duration::from_millis(5))
            .expect("fetch worker");
        let item = ItemId::parse("post-3").expect("valid id");

        let first = source.true_count(&item).expect_err("gated fetch must time out");
        assert!(matches!(first, SourceError::Timeout { .. }));
        for _ in 0..50 {
            assert!(source.true_count(&item).is_err());
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while gated.entered.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(gated.entered.load(Ordering::SeqCst), 1);

        drop(release);
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match source.true_count(&item) {
                Ok(count) => {
                    assert_eq!(count, 3);
                    break;
                }
                Err(err) if Instant::now() < deadline => {
                    assert!(!matches!(err, SourceError::InvalidCount { .. }));
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(err) => panic!("worker never recovered: {err}"),
            }
        }
    }
}
