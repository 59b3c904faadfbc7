//! Track merging
//!
//!  Combines an ordered track with a batch of incoming samples. Secondary
//!  batches are de-duplicated against existing samples by temporal
//!  proximity; primary samples are always appended.

use crate::sample::{PositionSample, RawSample, SourceKind, Track};

/// Default de-duplication window for secondary feeds (milliseconds)
pub const DEDUP_WINDOW_MS: i64 = 30_000;

/// Merge `incoming` into `existing`, returning the new ordered track.
pub fn merge<I>(existing: Track, incoming: I, source: SourceKind, dedup_window_ms: i64) -> Track
where
    I: IntoIterator<Item = RawSample>,
{
    let accepted = accept(existing.samples(), incoming, source, dedup_window_ms);
    append(existing, accepted)
}

/// Validate, sort and (for secondary feeds) de-duplicate an incoming batch
/// against `existing`, which must be ordered by timestamp.
///
/// Secondary samples are also checked against samples accepted earlier in
/// the same batch, so one batch cannot introduce its own cluster.
pub fn accept<I>(
    existing: &[PositionSample],
    incoming: I,
    source: SourceKind,
    dedup_window_ms: i64,
) -> Vec<PositionSample>
where
    I: IntoIterator<Item = RawSample>,
{
    let mut batch: Vec<PositionSample> = incoming
        .into_iter()
        .filter_map(RawSample::into_sample)
        .collect();
    batch.sort_by_key(|s| s.timestamp);

    if source == SourceKind::Primary {
        return batch;
    }

    let mut accepted: Vec<PositionSample> = Vec::with_capacity(batch.len());
    for sample in batch {
        if has_close(existing, sample.timestamp, dedup_window_ms) {
            continue;
        }
        // accepted is ascending, so only its tail can be close
        if let Some(last) = accepted.last() {
            if (sample.timestamp - last.timestamp).abs() < dedup_window_ms {
                continue;
            }
        }
        accepted.push(sample);
    }
    accepted
}

/// Append already-accepted samples and restore timestamp order.
pub fn append(existing: Track, accepted: Vec<PositionSample>) -> Track {
    if accepted.is_empty() {
        return existing;
    }
    let mut samples = existing.into_samples();
    samples.extend(accepted);
    Track::from_samples(samples)
}

/// Whether any sample in the ordered slice lies strictly within `window`
/// of `timestamp`.
fn has_close(ordered: &[PositionSample], timestamp: i64, window: i64) -> bool {
    let lower = timestamp.saturating_sub(window);
    let idx = ordered.partition_point(|s| s.timestamp <= lower);
    ordered
        .get(idx)
        .is_some_and(|s| s.timestamp < timestamp.saturating_add(window))
}
