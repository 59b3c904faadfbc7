//! Enrichment ingest
//!
//!  Enrichment sources are fetched on their own cadence, one task per
//!  aircraft, completing in any order. Finished batches travel over a
//!  bounded channel to a single worker that merges them into the track map
//!  as secondary samples and writes accepted samples back to the store.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::sample::SourceKind;
use crate::scheduler::wall_clock_ms;
use crate::source::{EnrichmentPosition, EnrichmentSource};
use crate::store::TrackStore;
use crate::track_map::TrackMap;

/// Default enrichment cadence
pub const ENRICHMENT_INTERVAL: Duration = Duration::from_secs(15);

/// Capacity of the batch channel
pub const BATCH_CHANNEL_CAPACITY: usize = 256;

/// Positions fetched for one aircraft
#[derive(Debug, Clone)]
pub struct EnrichmentBatch {
    pub entity_id: String,
    pub positions: Vec<EnrichmentPosition>,
}

/// Merge one batch and persist what the map accepted. Returns the number of
/// accepted samples.
pub fn apply_batch(map: &TrackMap, store: &TrackStore, batch: &EnrichmentBatch, now: i64) -> usize {
    let accepted = map.upsert(
        &batch.entity_id,
        batch.positions.iter().map(EnrichmentPosition::to_raw),
        SourceKind::Secondary,
        now,
    );
    if accepted.is_empty() {
        return 0;
    }
    if let Err(e) = store.append_samples(&batch.entity_id, &accepted, SourceKind::Secondary) {
        warn!("Failed to persist enrichment for {}: {}", batch.entity_id, e);
    }
    debug!(
        "Merged {} of {} enrichment positions for {}",
        accepted.len(),
        batch.positions.len(),
        batch.entity_id
    );
    accepted.len()
}

/// Apply batches until every sender is dropped. Blocks; run it on a
/// blocking thread.
pub fn process_batches(rx: Receiver<EnrichmentBatch>, map: Arc<TrackMap>, store: Arc<TrackStore>) {
    while let Ok(batch) = rx.recv() {
        apply_batch(&map, &store, &batch, wall_clock_ms());
    }
    debug!("Enrichment channel closed");
}

/// Periodically fetch enrichment for every active aircraft
pub fn spawn_enrichment_fetcher(
    source: Arc<dyn EnrichmentSource>,
    map: Arc<TrackMap>,
    every: Duration,
    tx: Sender<EnrichmentBatch>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for id in map.active_ids() {
                        let source = Arc::clone(&source);
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            fetch_and_send(source.as_ref(), id, &tx).await;
                        });
                    }
                }
                _ = stop.changed() => return,
            }
        }
    })
}

async fn fetch_and_send(source: &dyn EnrichmentSource, id: String, tx: &Sender<EnrichmentBatch>) {
    let positions = match source.fetch(&id).await {
        Ok(Some(positions)) if !positions.is_empty() => positions,
        Ok(_) => return,
        Err(e) => {
            warn!("Enrichment fetch failed for {}: {}", id, e);
            return;
        }
    };
    let batch = EnrichmentBatch {
        entity_id: id,
        positions,
    };
    match tx.try_send(batch) {
        Ok(()) => {}
        Err(TrySendError::Full(batch)) => {
            warn!("Enrichment queue full, dropping batch for {}", batch.entity_id);
        }
        Err(TrySendError::Disconnected(_)) => {}
    }
}
