//! In-memory track map
//!
//!  The working set read by consumers: aircraft id -> latest snapshot and
//!  ordered track. Every mutation runs as one read-modify-write under the
//!  write lock, with no await point inside, so concurrent writers never see
//!  a half-applied update.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::aircraft::{AircraftSnapshot, PollResponse};
use crate::merge;
use crate::sample::{PositionSample, RawSample, SourceKind, Track};

/// Tracks whose last sample is older than this are dropped (milliseconds)
pub const MEMORY_STALE_MS: i64 = 5 * 60 * 1000;

/// Minimum spacing between two stale sweeps (milliseconds)
pub const MEMORY_SWEEP_EVERY_MS: i64 = 10 * 1000;

#[derive(Debug, Clone, Copy)]
pub struct TrackMapConfig {
    pub dedup_window_ms: i64,
    pub stale_after_ms: i64,
    pub sweep_every_ms: i64,
}

impl Default for TrackMapConfig {
    fn default() -> Self {
        Self {
            dedup_window_ms: merge::DEDUP_WINDOW_MS,
            stale_after_ms: MEMORY_STALE_MS,
            sweep_every_ms: MEMORY_SWEEP_EVERY_MS,
        }
    }
}

/// One aircraft in the working set
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackedAircraft {
    /// Latest poll snapshot; absent until the poll feed reports the aircraft
    #[serde(rename = "aircraft")]
    pub snapshot: Option<AircraftSnapshot>,
    #[serde(rename = "history")]
    pub track: Track,
}

#[derive(Debug, Default)]
struct MapState {
    tracks: HashMap<String, TrackedAircraft>,
    /// Ids returned by the latest successful poll
    active: Vec<String>,
    focus: Option<String>,
    last_sweep: Option<i64>,
}

pub struct TrackMap {
    state: RwLock<MapState>,
    config: TrackMapConfig,
}

impl TrackMap {
    pub fn new(config: TrackMapConfig) -> Self {
        Self {
            state: RwLock::new(MapState::default()),
            config,
        }
    }

    pub fn get(&self, id: &str) -> Option<TrackedAircraft> {
        self.state.read().tracks.get(id).cloned()
    }

    /// Latest poll's ids, plus the focused id when it is tracked but was
    /// missing from that poll
    pub fn active_ids(&self) -> Vec<String> {
        let state = self.state.read();
        active_ids_locked(&state)
    }

    /// Tracks for every active id
    pub fn snapshot(&self) -> BTreeMap<String, TrackedAircraft> {
        let state = self.state.read();
        active_ids_locked(&state)
            .into_iter()
            .filter_map(|id| state.tracks.get(&id).map(|t| (id, t.clone())))
            .collect()
    }

    pub fn set_focus(&self, id: Option<String>) {
        self.state.write().focus = id;
    }

    pub fn focus(&self) -> Option<String> {
        self.state.read().focus.clone()
    }

    pub fn len(&self) -> usize {
        self.state.read().tracks.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merge a batch into one aircraft's track and return the samples that
    /// were accepted.
    ///
    /// Primary batches create the track when missing. Secondary batches
    /// only enrich aircraft already in the map.
    pub fn upsert<I>(&self, id: &str, incoming: I, source: SourceKind, now: i64) -> Vec<PositionSample>
    where
        I: IntoIterator<Item = RawSample>,
    {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let window = self.config.dedup_window_ms;
        let accepted = match state.tracks.get_mut(id) {
            Some(entry) => merge_into(entry, incoming, source, window),
            None if source == SourceKind::Secondary => {
                debug!("Ignoring enrichment for untracked aircraft {}", id);
                return Vec::new();
            }
            None => {
                // a track exists only once it holds a sample
                let mut entry = TrackedAircraft::default();
                let accepted = merge_into(&mut entry, incoming, source, window);
                if !accepted.is_empty() {
                    state.tracks.insert(id.to_string(), entry);
                }
                accepted
            }
        };
        self.sweep_locked(state, now);
        accepted
    }

    /// Apply one poll response: replace the active set, seed unseen
    /// aircraft through `seed`, and append each reported position without
    /// de-duplication.
    ///
    /// Returns the accepted samples per aircraft for write-back.
    pub fn apply_poll<F>(&self, response: &PollResponse, seed: F, now: i64) -> HashMap<String, Vec<PositionSample>>
    where
        F: Fn(&str) -> Track,
    {
        // Seeds may hit disk; load them before taking the write lock
        let unseen: Vec<&str> = {
            let state = self.state.read();
            response
                .ac
                .iter()
                .filter(|ac| ac.position().is_some() && !state.tracks.contains_key(&ac.hex))
                .map(|ac| ac.hex.as_str())
                .collect()
        };
        let mut seeds: HashMap<&str, Track> = unseen.into_iter().map(|id| (id, seed(id))).collect();

        let mut state = self.state.write();
        state.active = response.ac.iter().map(|ac| ac.hex.clone()).collect();

        let mut written = HashMap::new();
        for ac in &response.ac {
            let Some(sample) = ac.sample_at(response.now) else {
                continue;
            };
            let entry = state
                .tracks
                .entry(ac.hex.clone())
                .or_insert_with(|| TrackedAircraft {
                    snapshot: None,
                    track: seeds.remove(ac.hex.as_str()).unwrap_or_default(),
                });
            entry.snapshot = Some(ac.clone());
            let accepted = merge_into(
                entry,
                [sample],
                SourceKind::Primary,
                self.config.dedup_window_ms,
            );
            written
                .entry(ac.hex.clone())
                .or_insert_with(Vec::new)
                .extend(accepted);
        }

        self.sweep_locked(&mut state, now);
        written
    }

    /// Drop stale tracks unless a sweep ran within the guard interval.
    /// Returns the dropped ids, or `None` when rate-limited.
    pub fn maybe_sweep(&self, now: i64) -> Option<Vec<String>> {
        let mut state = self.state.write();
        self.sweep_locked(&mut state, now)
    }

    fn sweep_locked(&self, state: &mut MapState, now: i64) -> Option<Vec<String>> {
        if let Some(last) = state.last_sweep {
            if now - last < self.config.sweep_every_ms {
                return None;
            }
        }
        state.last_sweep = Some(now);

        let cutoff = now - self.config.stale_after_ms;
        let stale: Vec<String> = state
            .tracks
            .iter()
            .filter(|(_, t)| t.track.last_timestamp().unwrap_or(0) < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            state.tracks.remove(id);
        }
        if !stale.is_empty() {
            debug!("Dropped {} stale tracks from memory", stale.len());
        }
        Some(stale)
    }
}

fn merge_into<I>(
    entry: &mut TrackedAircraft,
    incoming: I,
    source: SourceKind,
    dedup_window_ms: i64,
) -> Vec<PositionSample>
where
    I: IntoIterator<Item = RawSample>,
{
    let accepted = merge::accept(entry.track.samples(), incoming, source, dedup_window_ms);
    let track = std::mem::take(&mut entry.track);
    entry.track = merge::append(track, accepted.clone());
    accepted
}

fn active_ids_locked(state: &MapState) -> Vec<String> {
    let mut ids = state.active.clone();
    if let Some(focus) = &state.focus {
        if !state.active.contains(focus) && state.tracks.contains_key(focus) {
            ids.push(focus.clone());
        }
    }
    ids
}
