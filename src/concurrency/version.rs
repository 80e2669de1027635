//! Before-images of committed writes.
//!
//! The index only holds the newest committed value of each key. When a commit
//! overwrites or deletes a key, the value it replaced is kept here, tagged
//! with the overwriting commit's timestamp, for as long as some snapshot
//! might still need it.

use crate::concurrency::timestamp::Timestamp;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};

/// The value a key had right before the commit at `commit_ts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeforeImage {
    pub commit_ts: Timestamp,
    /// None if the key did not exist.
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct VersionStore {
    /// key -> before-images, oldest commit first
    chains: RwLock<HashMap<Vec<u8>, VecDeque<BeforeImage>>>,
}

impl VersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records what `key` held before the commit at `commit_ts`. Commits
    /// must be recorded in timestamp order.
    pub fn record(&self, key: &[u8], commit_ts: Timestamp, previous: Option<Vec<u8>>) {
        let mut chains = self.chains.write();
        chains.entry(key.to_vec()).or_default().push_back(BeforeImage {
            commit_ts,
            value: previous,
        });
    }

    /// Value of `key` as of `read_ts`, if a commit after `read_ts` changed
    /// it. `None` means no such commit is recorded and the index value is
    /// still current for that snapshot.
    pub fn read_at(&self, key: &[u8], read_ts: Timestamp) -> Option<Option<Vec<u8>>> {
        let chains = self.chains.read();
        chains
            .get(key)?
            .iter()
            .find(|image| image.commit_ts > read_ts)
            .map(|image| image.value.clone())
    }

    /// Timestamp of the newest recorded commit that wrote `key`.
    pub fn latest_commit(&self, key: &[u8]) -> Option<Timestamp> {
        let chains = self.chains.read();
        chains.get(key)?.back().map(|image| image.commit_ts)
    }

    /// Drops before-images no snapshot can reach: those committed at or
    /// before the oldest live snapshot, or all of them if there is none.
    pub fn prune(&self, oldest_snapshot: Option<Timestamp>) {
        let mut chains = self.chains.write();
        let Some(oldest) = oldest_snapshot else {
            chains.clear();
            return;
        };

        chains.retain(|_, images| {
            while images.front().is_some_and(|image| image.commit_ts <= oldest) {
                images.pop_front();
            }
            !images.is_empty()
        });
    }

    /// Total number of retained before-images.
    pub fn version_count(&self) -> usize {
        self.chains.read().values().map(VecDeque::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_at_picks_value_as_of_snapshot() {
        let store = VersionStore::new();
        // k was absent, then "a" committed at 5, then "b" committed at 8
        store.record(b"k", Timestamp::new(5), None);
        store.record(b"k", Timestamp::new(8), Some(b"a".to_vec()));

        assert_eq!(store.read_at(b"k", Timestamp::new(4)), Some(None));
        assert_eq!(store.read_at(b"k", Timestamp::new(5)), Some(Some(b"a".to_vec())));
        assert_eq!(store.read_at(b"k", Timestamp::new(7)), Some(Some(b"a".to_vec())));
        // Snapshot newer than every recorded commit reads the index
        assert_eq!(store.read_at(b"k", Timestamp::new(8)), None);
        assert_eq!(store.read_at(b"other", Timestamp::new(1)), None);
    }

    #[test]
    fn test_latest_commit() {
        let store = VersionStore::new();
        assert_eq!(store.latest_commit(b"k"), None);

        store.record(b"k", Timestamp::new(3), None);
        store.record(b"k", Timestamp::new(9), Some(b"x".to_vec()));
        assert_eq!(store.latest_commit(b"k"), Some(Timestamp::new(9)));
    }

    #[test]
    fn test_prune() {
        let store = VersionStore::new();
        store.record(b"a", Timestamp::new(2), None);
        store.record(b"a", Timestamp::new(6), Some(b"1".to_vec()));
        store.record(b"b", Timestamp::new(3), None);
        assert_eq!(store.version_count(), 3);

        store.prune(Some(Timestamp::new(4)));
        assert_eq!(store.version_count(), 1);
        assert_eq!(store.read_at(b"a", Timestamp::new(4)), Some(Some(b"1".to_vec())));

        store.prune(None);
        assert_eq!(store.version_count(), 0);
    }
}
