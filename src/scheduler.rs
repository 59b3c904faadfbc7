//! Poll scheduler
//!
//!  Fetches the primary feed at a fixed cadence while the consumer is in
//!  the foreground. Going to the background drops the interval; coming
//!  back starts a fresh one, so missed time is a gap rather than a burst
//!  of catch-up ticks.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::sample::SourceKind;
use crate::source::{PollSource, Query};
use crate::store::TrackStore;
use crate::track_map::TrackMap;

/// Default poll cadence
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Wall-clock time in milliseconds since the epoch
pub fn wall_clock_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Foreground/background signal gating the poll scheduler
pub struct Visibility {
    tx: watch::Sender<bool>,
}

impl Visibility {
    pub fn new(foreground: bool) -> Self {
        let (tx, _) = watch::channel(foreground);
        Self { tx }
    }

    pub fn is_foreground(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn set_foreground(&self, foreground: bool) {
        let previous = self.tx.send_replace(foreground);
        if previous != foreground {
            debug!("Visibility changed: foreground={}", foreground);
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Everything a poll tick touches
pub struct PollContext {
    pub source: Arc<dyn PollSource>,
    pub query: Query,
    pub map: Arc<TrackMap>,
    pub store: Arc<TrackStore>,
    pub interval: Duration,
}

/// Handle to a running poll scheduler
pub struct PollHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollHandle {
    /// Halt new ticks. Fetches already in flight are not cancelled, but
    /// their results are discarded.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Stop and wait for the scheduler loop to exit
    pub async fn shutdown(self) {
        self.stop();
        let _ = self.task.await;
    }
}

pub fn spawn_poll_scheduler(ctx: PollContext, visibility: watch::Receiver<bool>) -> PollHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(run(Arc::new(ctx), visibility, stop_rx));
    PollHandle { stop_tx, task }
}

async fn run(
    ctx: Arc<PollContext>,
    mut visibility: watch::Receiver<bool>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if !wait_for_foreground(&mut visibility, &mut stop).await {
            return;
        }
        info!("Polling every {:?}", ctx.interval);

        let mut interval = tokio::time::interval(ctx.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let ctx = Arc::clone(&ctx);
                    let stop = stop.clone();
                    // ticks may overlap; each applies its result atomically
                    tokio::spawn(async move {
                        poll_once(&ctx, &stop).await;
                    });
                }
                changed = visibility.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if !*visibility.borrow_and_update() {
                        info!("Polling suspended while in background");
                        break;
                    }
                }
                _ = stop.changed() => return,
            }
        }
    }
}

/// Resolves `true` once in the foreground, `false` when stopped
async fn wait_for_foreground(
    visibility: &mut watch::Receiver<bool>,
    stop: &mut watch::Receiver<bool>,
) -> bool {
    loop {
        if *stop.borrow() {
            return false;
        }
        if *visibility.borrow_and_update() {
            return true;
        }
        tokio::select! {
            changed = visibility.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
            _ = stop.changed() => return false,
        }
    }
}

/// Run one poll tick. Returns whether a response was applied.
pub async fn poll_once(ctx: &PollContext, stop: &watch::Receiver<bool>) -> bool {
    let response = match ctx.source.fetch(&ctx.query).await {
        Ok(response) => response,
        Err(e) => {
            error!("Failed to update aircraft: {}", e);
            // keep ageing out tracks while the feed is down
            ctx.map.maybe_sweep(wall_clock_ms());
            return false;
        }
    };
    if *stop.borrow() {
        debug!("Discarding poll response received after stop");
        return false;
    }

    // seeding and write-back hit the durable store
    let map = Arc::clone(&ctx.map);
    let store = Arc::clone(&ctx.store);
    let applied = tokio::task::spawn_blocking(move || {
        let written = map.apply_poll(&response, |id| store.get_track(id), wall_clock_ms());
        if store.bulk_append(&written, SourceKind::Primary).is_err() {
            debug!("Durable write-back incomplete for this tick");
        }
    })
    .await;
    if let Err(e) = applied {
        error!("Poll update task failed: {}", e);
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::aircraft::{AircraftSnapshot, PollResponse};
    use crate::error::{SourceError, StorageError};
    use crate::merge::DEDUP_WINDOW_MS;
    use crate::sample::{PositionSample, Track};
    use crate::storage::{KeyValueStorage, MemoryStorage};
    use crate::track_map::TrackMapConfig;

    /// Reports one aircraft at the wall clock; every third fetch fails
    struct CountingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PollSource for CountingSource {
        async fn fetch(&self, _query: &Query) -> Result<PollResponse, SourceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n % 3 == 2 {
                return Err(SourceError::Exhausted);
            }
            let mut ac = AircraftSnapshot::new("abc123");
            ac.lat = Some(40.0);
            ac.lon = Some(-111.0);
            Ok(PollResponse {
                ac: vec![ac],
                now: wall_clock_ms() + n as i64,
            })
        }
    }

    fn context(source: Arc<CountingSource>) -> PollContext {
        PollContext {
            source,
            query: Query::Military,
            map: Arc::new(TrackMap::new(TrackMapConfig::default())),
            store: Arc::new(TrackStore::new(MemoryStorage::new(), DEDUP_WINDOW_MS)),
            interval: POLL_INTERVAL,
        }
    }

    fn calls(source: &CountingSource) -> usize {
        source.calls.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn test_poll_once_applies_and_persists() {
        let source = Arc::new(CountingSource { calls: AtomicUsize::new(0) });
        let ctx = context(Arc::clone(&source));
        let (_stop_tx, stop_rx) = watch::channel(false);

        assert!(poll_once(&ctx, &stop_rx).await);
        assert!(poll_once(&ctx, &stop_rx).await);
        // third fetch fails; state untouched
        assert!(!poll_once(&ctx, &stop_rx).await);

        assert_eq!(ctx.map.get("abc123").unwrap().track.len(), 2);
        assert_eq!(ctx.store.get_track("abc123").len(), 2);
        assert_eq!(ctx.map.active_ids(), vec!["abc123"]);
    }

    #[tokio::test]
    async fn test_poll_once_seeds_from_store() {
        let source = Arc::new(CountingSource { calls: AtomicUsize::new(0) });
        let ctx = context(Arc::clone(&source));
        let earlier = wall_clock_ms() - 60_000;
        ctx.store
            .append_samples(
                "abc123",
                &[PositionSample::new(40.0, -111.0, None, earlier)],
                SourceKind::Primary,
            )
            .unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);

        assert!(poll_once(&ctx, &stop_rx).await);
        let track = ctx.map.get("abc123").unwrap().track;
        assert_eq!(track.len(), 2);
        assert_eq!(track.samples()[0].timestamp, earlier);
    }

    /// Records the thread of every durable write
    struct ThreadRecordingStorage {
        inner: MemoryStorage,
        writers: Arc<parking_lot::Mutex<Vec<std::thread::ThreadId>>>,
    }

    impl KeyValueStorage for ThreadRecordingStorage {
        fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
            self.writers.lock().push(std::thread::current().id());
            self.inner.set(key, value)
        }

        fn keys(&self) -> Result<Vec<String>, StorageError> {
            self.inner.keys()
        }

        fn delete(&self, key: &str) -> Result<(), StorageError> {
            self.inner.delete(key)
        }
    }

    #[tokio::test]
    async fn test_poll_write_back_runs_off_the_runtime_thread() {
        let writers = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let storage = ThreadRecordingStorage {
            inner: MemoryStorage::new(),
            writers: Arc::clone(&writers),
        };
        let source = Arc::new(CountingSource { calls: AtomicUsize::new(0) });
        let ctx = PollContext {
            store: Arc::new(TrackStore::new(storage, DEDUP_WINDOW_MS)),
            ..context(source)
        };
        let (_stop_tx, stop_rx) = watch::channel(false);

        assert!(poll_once(&ctx, &stop_rx).await);
        assert_eq!(ctx.store.get_track("abc123").len(), 1);

        // the current-thread test runtime lives on this thread
        let runtime_thread = std::thread::current().id();
        let writers = writers.lock();
        assert!(!writers.is_empty());
        assert!(writers.iter().all(|id| *id != runtime_thread));
    }

    #[tokio::test]
    async fn test_poll_result_discarded_after_stop() {
        let source = Arc::new(CountingSource { calls: AtomicUsize::new(0) });
        let ctx = context(Arc::clone(&source));
        let (_stop_tx, stop_rx) = watch::channel(true);

        assert!(!poll_once(&ctx, &stop_rx).await);
        assert_eq!(calls(&source), 1);
        assert!(ctx.map.get("abc123").is_none());
        assert_eq!(ctx.store.get_track("abc123"), Track::new());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_ticks_and_suspends() {
        let source = Arc::new(CountingSource { calls: AtomicUsize::new(0) });
        let visibility = Visibility::new(true);
        let handle = spawn_poll_scheduler(context(Arc::clone(&source)), visibility.subscribe());

        // first tick fires immediately, then one per second
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(calls(&source), 3);

        visibility.set_foreground(false);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let suspended_at = calls(&source);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls(&source), suspended_at);

        // resuming restarts the interval without catching up
        visibility.set_foreground(true);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(calls(&source), suspended_at + 1);

        handle.shutdown().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls(&source), suspended_at + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_waits_while_hidden() {
        let source = Arc::new(CountingSource { calls: AtomicUsize::new(0) });
        let visibility = Visibility::new(false);
        assert!(!visibility.is_foreground());
        let handle = spawn_poll_scheduler(context(Arc::clone(&source)), visibility.subscribe());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls(&source), 0);

        visibility.set_foreground(true);
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(calls(&source), 2);

        handle.shutdown().await;
    }
}
