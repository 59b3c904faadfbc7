//! Durable eviction sweeper
//!
//!  Purges stale tracks from the durable store on a fixed cadence. Runs
//!  regardless of visibility so the store stays bounded while polling is
//!  suspended. In-memory eviction happens inside [`crate::track_map`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::scheduler::wall_clock_ms;
use crate::store::TrackStore;

/// Durable tracks older than this are purged (milliseconds)
pub const DURABLE_STALE_MS: i64 = 2 * 60 * 1000;

/// Durable sweep cadence
pub const DURABLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Evict tracks whose last sample is older than `now - stale_after_ms`.
/// Returns how many were evicted.
pub fn sweep_durable(store: &TrackStore, now: i64, stale_after_ms: i64) -> usize {
    match store.evict_older_than(now - stale_after_ms) {
        Ok(evicted) => {
            if !evicted.is_empty() {
                info!("Evicted {} stale tracks from the durable store", evicted.len());
            }
            evicted.len()
        }
        Err(e) => {
            warn!("Durable sweep incomplete: {}", e);
            0
        }
    }
}

pub fn spawn_durable_sweeper(
    store: Arc<TrackStore>,
    every: Duration,
    stale_after_ms: i64,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let store = Arc::clone(&store);
                    let sweep = tokio::task::spawn_blocking(move || {
                        sweep_durable(&store, wall_clock_ms(), stale_after_ms)
                    });
                    match sweep.await {
                        Ok(evicted) => debug!("Durable sweep done ({} evicted)", evicted),
                        Err(e) => warn!("Durable sweep task failed: {}", e),
                    }
                }
                _ = stop.changed() => return,
            }
        }
    })
}
