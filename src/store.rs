//! Durable track store
//!
//!  Persists one JSON record per aircraft plus a flat index record
//!  (aircraft id -> last sample timestamp) used for staleness scans.
//!  Malformed records read as absent.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::merge;
use crate::sample::{PositionSample, RawSample, SourceKind, Track};
use crate::storage::KeyValueStorage;

const TRACK_KEY_PREFIX: &str = "track:";
const INDEX_KEY: &str = "track-index";

type TrackIndex = BTreeMap<String, i64>;

fn track_key(id: &str) -> String {
    format!("{}{}", TRACK_KEY_PREFIX, id)
}

pub struct TrackStore {
    storage: Box<dyn KeyValueStorage>,
    dedup_window_ms: i64,
    /// Serializes index read-modify-write cycles
    write_lock: Mutex<()>,
}

impl TrackStore {
    pub fn new(storage: impl KeyValueStorage + 'static, dedup_window_ms: i64) -> Self {
        Self {
            storage: Box::new(storage),
            dedup_window_ms,
            write_lock: Mutex::new(()),
        }
    }

    /// Persisted track for `id`, or an empty track when missing or malformed
    pub fn get_track(&self, id: &str) -> Track {
        let raw = match self.storage.get(&track_key(id)) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Track::new(),
            Err(e) => {
                warn!("Failed to read track {}: {}", id, e);
                return Track::new();
            }
        };
        match serde_json::from_str::<Vec<PositionSample>>(&raw) {
            Ok(samples) => Track::from_samples(samples),
            Err(e) => {
                debug!("Ignoring malformed track {}: {}", id, e);
                Track::new()
            }
        }
    }

    /// Merge `samples` into the stored track and refresh its index row.
    ///
    /// Returns the stored track's last timestamp, or `None` when there is
    /// nothing stored for `id`.
    pub fn append_samples(
        &self,
        id: &str,
        samples: &[PositionSample],
        source: SourceKind,
    ) -> Result<Option<i64>, StoreError> {
        let _guard = self.write_lock.lock();

        let existing = self.get_track(id);
        let before = existing.len();
        let track = merge::merge(
            existing,
            samples.iter().copied().map(RawSample::from),
            source,
            self.dedup_window_ms,
        );
        let changed = track.len() != before;

        let Some(last) = track.last_timestamp() else {
            return Ok(None);
        };

        if changed {
            self.storage
                .set(&track_key(id), &serde_json::to_string(&track)?)?;
        }

        let (mut index, rebuilt) = self.load_index()?;
        if rebuilt || index.get(id) != Some(&last) {
            index.insert(id.to_string(), last);
            self.write_index(&index)?;
        }
        Ok(Some(last))
    }

    /// Batch form of [`append_samples`](Self::append_samples). Every entry is
    /// attempted; the first failure is returned.
    pub fn bulk_append(
        &self,
        batches: &HashMap<String, Vec<PositionSample>>,
        source: SourceKind,
    ) -> Result<(), StoreError> {
        let mut first_err = None;
        for (id, samples) in batches {
            if let Err(e) = self.append_samples(id, samples, source) {
                warn!("Failed to persist track {}: {}", id, e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Ids with a persisted track, in key order
    pub fn list_tracked_ids(&self) -> Vec<String> {
        self.read_index().into_keys().collect()
    }

    /// Delete every track whose indexed last sample is older than `cutoff`.
    /// A track exactly at the cutoff is kept. Returns the evicted ids.
    pub fn evict_older_than(&self, cutoff: i64) -> Result<Vec<String>, StoreError> {
        let _guard = self.write_lock.lock();

        let (mut index, _) = self.load_index()?;
        let stale: Vec<String> = index
            .iter()
            .filter(|&(_, &last)| last < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        if stale.is_empty() {
            return Ok(stale);
        }

        let mut evicted = Vec::with_capacity(stale.len());
        let mut result = Ok(());
        for id in stale {
            if let Err(e) = self.storage.delete(&track_key(&id)) {
                // keep the index row so the next sweep retries
                warn!("Failed to delete track {}: {}", id, e);
                result = Err(e);
                continue;
            }
            index.remove(&id);
            evicted.push(id);
        }

        self.write_index(&index)?;
        result?;
        Ok(evicted)
    }

    fn read_index(&self) -> TrackIndex {
        match self.load_index() {
            Ok((index, _)) => index,
            Err(e) => {
                warn!("Failed to read track index: {}", e);
                TrackIndex::new()
            }
        }
    }

    /// The index, and whether it had to be rebuilt because the stored row
    /// was missing or malformed
    fn load_index(&self) -> Result<(TrackIndex, bool), StoreError> {
        let Some(raw) = self.storage.get(INDEX_KEY)? else {
            return Ok((self.rebuild_index()?, true));
        };
        match serde_json::from_str(&raw) {
            Ok(index) => Ok((index, false)),
            Err(e) => {
                warn!("Rebuilding malformed track index: {}", e);
                Ok((self.rebuild_index()?, true))
            }
        }
    }

    /// Index rows derived from the track rows themselves. Unreadable tracks
    /// get the oldest possible timestamp so the next sweep removes them.
    fn rebuild_index(&self) -> Result<TrackIndex, StoreError> {
        let index = self
            .storage
            .keys()?
            .iter()
            .filter_map(|key| key.strip_prefix(TRACK_KEY_PREFIX))
            .map(|id| {
                let last = self.get_track(id).last_timestamp().unwrap_or(i64::MIN);
                (id.to_string(), last)
            })
            .collect();
        Ok(index)
    }

    fn write_index(&self, index: &TrackIndex) -> Result<(), StoreError> {
        self.storage.set(INDEX_KEY, &serde_json::to_string(index)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::DEDUP_WINDOW_MS;
    use crate::storage::MemoryStorage;

    fn at(t: i64) -> PositionSample {
        PositionSample::new(40.0, -111.0, None, t)
    }

    fn store() -> TrackStore {
        TrackStore::new(MemoryStorage::new(), DEDUP_WINDOW_MS)
    }

    /// Index rows must match the set of persisted track records
    fn assert_index_consistent(store: &TrackStore, candidates: &[&str]) {
        let indexed = store.list_tracked_ids();
        for id in candidates {
            let persisted = store.storage.get(&track_key(id)).unwrap().is_some();
            assert_eq!(
                persisted,
                indexed.iter().any(|i| i == id),
                "index out of sync for {}",
                id
            );
        }
    }

    #[test]
    fn test_get_track_missing_and_malformed() {
        let store = store();
        assert!(store.get_track("abc123").is_empty());

        store.storage.set(&track_key("abc123"), "{not json").unwrap();
        assert!(store.get_track("abc123").is_empty());

        store
            .storage
            .set(&track_key("abc123"), r#"[{"lat":"x","lon":1,"time":2}]"#)
            .unwrap();
        assert!(store.get_track("abc123").is_empty());
    }

    #[test]
    fn test_append_updates_track_and_index() {
        let store = store();
        let last = store
            .append_samples("abc123", &[at(2_000), at(1_000)], SourceKind::Primary)
            .unwrap();
        assert_eq!(last, Some(2_000));

        let last = store
            .append_samples("abc123", &[at(3_000)], SourceKind::Primary)
            .unwrap();
        assert_eq!(last, Some(3_000));

        let times: Vec<i64> = store
            .get_track("abc123")
            .samples()
            .iter()
            .map(|s| s.timestamp)
            .collect();
        assert_eq!(times, vec![1_000, 2_000, 3_000]);
        assert_eq!(store.list_tracked_ids(), vec!["abc123".to_string()]);
        assert_eq!(store.read_index().get("abc123"), Some(&3_000));
        assert_index_consistent(&store, &["abc123"]);
    }

    #[test]
    fn test_secondary_append_deduplicates() {
        let store = store();
        store
            .append_samples("abc123", &[at(0), at(80_000)], SourceKind::Primary)
            .unwrap();
        store
            .append_samples("abc123", &[at(40_000), at(79_000)], SourceKind::Secondary)
            .unwrap();
        let times: Vec<i64> = store
            .get_track("abc123")
            .samples()
            .iter()
            .map(|s| s.timestamp)
            .collect();
        assert_eq!(times, vec![0, 40_000, 80_000]);
    }

    #[test]
    fn test_append_nothing_writes_nothing() {
        let store = store();
        assert_eq!(store.append_samples("abc123", &[], SourceKind::Primary).unwrap(), None);
        assert!(store.list_tracked_ids().is_empty());
        assert!(store.storage.get(INDEX_KEY).unwrap().is_none());
        assert!(store.storage.get(&track_key("abc123")).unwrap().is_none());
    }

    #[test]
    fn test_bulk_append() {
        let store = store();
        let mut batches = HashMap::new();
        batches.insert("a1".to_string(), vec![at(1_000)]);
        batches.insert("b2".to_string(), vec![at(5_000), at(6_000)]);
        store.bulk_append(&batches, SourceKind::Primary).unwrap();

        assert_eq!(store.list_tracked_ids(), vec!["a1".to_string(), "b2".to_string()]);
        assert_eq!(store.get_track("b2").len(), 2);
        assert_index_consistent(&store, &["a1", "b2"]);
    }

    #[test]
    fn test_evict_boundary() {
        let store = store();
        let now = 1_000_000;
        let cutoff = now - 120_000;
        store
            .append_samples("at-cutoff", &[at(cutoff)], SourceKind::Primary)
            .unwrap();
        store
            .append_samples("just-older", &[at(cutoff - 1)], SourceKind::Primary)
            .unwrap();
        store
            .append_samples("fresh", &[at(now)], SourceKind::Primary)
            .unwrap();

        let evicted = store.evict_older_than(cutoff).unwrap();
        assert_eq!(evicted, vec!["just-older".to_string()]);
        assert_eq!(
            store.list_tracked_ids(),
            vec!["at-cutoff".to_string(), "fresh".to_string()]
        );
        assert!(store.get_track("just-older").is_empty());
        assert_index_consistent(&store, &["at-cutoff", "just-older", "fresh"]);
    }

    #[test]
    fn test_evict_with_nothing_stale_is_noop() {
        let store = store();
        store.append_samples("a1", &[at(10)], SourceKind::Primary).unwrap();
        assert!(store.evict_older_than(0).unwrap().is_empty());
        assert_eq!(store.list_tracked_ids(), vec!["a1".to_string()]);
    }

    #[test]
    fn test_malformed_index_reads_as_empty() {
        let store = store();
        store.storage.set(INDEX_KEY, "[1,2,3]").unwrap();
        assert!(store.list_tracked_ids().is_empty());

        // the next append writes a valid index
        store.append_samples("a1", &[at(10)], SourceKind::Primary).unwrap();
        assert_eq!(store.list_tracked_ids(), vec!["a1".to_string()]);
    }

    #[test]
    fn test_malformed_index_rebuilt_from_tracks() {
        let store = store();
        store.append_samples("a1", &[at(10)], SourceKind::Primary).unwrap();
        store.append_samples("b2", &[at(20)], SourceKind::Primary).unwrap();
        store.storage.set(&track_key("c3"), "{not json").unwrap();
        store.storage.set(INDEX_KEY, "{broken").unwrap();

        // appending to one aircraft keeps every other row indexed
        store.append_samples("b2", &[at(30)], SourceKind::Primary).unwrap();
        assert_eq!(store.read_index().get("a1"), Some(&10));
        assert_eq!(store.read_index().get("b2"), Some(&30));
        assert_index_consistent(&store, &["a1", "b2", "c3"]);

        // the unreadable row is swept with the stale ones
        let evicted = store.evict_older_than(15).unwrap();
        assert_eq!(evicted, vec!["a1".to_string(), "c3".to_string()]);
        assert_eq!(store.list_tracked_ids(), vec!["b2".to_string()]);
        assert_index_consistent(&store, &["a1", "b2", "c3"]);
    }

    #[test]
    fn test_index_row_restored_when_missing() {
        let store = store();
        store.append_samples("a1", &[at(10)], SourceKind::Primary).unwrap();
        store.storage.delete(INDEX_KEY).unwrap();

        // a re-append of known samples adds nothing but repairs the index
        store.append_samples("a1", &[at(10)], SourceKind::Secondary).unwrap();
        assert!(store.storage.get(INDEX_KEY).unwrap().is_some());
        assert_eq!(store.list_tracked_ids(), vec!["a1".to_string()]);
        assert_index_consistent(&store, &["a1"]);
    }
}
