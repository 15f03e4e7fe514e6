//! In-memory write cache.
//!
//! The cache buffers recently written values per composite key until they
//! are persisted to a TSM file. Writers and readers run concurrently: the
//! key map and each entry are guarded by their own `RwLock`, so a scan sees a
//! consistent, possibly slightly stale, view of every entry it visits.

use crate::error::Result;
use crate::stats::ScanStats;
use crate::tsm::{TimeRange, Timestamp};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

/// Read-side view of one cached key.
pub trait CacheEntry {
    /// Number of values currently buffered.
    fn value_count(&self) -> u64;

    /// Returns true if any buffered timestamp falls in `(start, end]`.
    fn contains(&self, start: i64, end: i64) -> bool;
}

/// A provider of cache entries.
pub trait CacheSource: Send + Sync {
    /// Calls `visit` for every entry, stopping at the first error.
    ///
    /// # Errors
    ///
    /// Returns the first error produced by `visit` or by the source itself.
    fn for_each_entry(
        &self,
        visit: &mut dyn FnMut(&[u8], &dyn CacheEntry) -> Result<()>,
    ) -> Result<()>;
}

/// Values buffered for one key, ordered by timestamp.
#[derive(Debug, Default)]
pub struct Entry {
    values: RwLock<BTreeMap<Timestamp, f64>>,
}

impl Entry {
    /// Creates an empty entry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites values.
    pub fn write(&self, points: &[(Timestamp, f64)]) {
        let mut values = self.values.write();
        for &(ts, value) in points {
            values.insert(ts, value);
        }
    }

    /// Smallest buffered timestamp.
    pub fn min_time(&self) -> Option<Timestamp> {
        self.values.read().keys().next().copied()
    }

    /// Largest buffered timestamp.
    pub fn max_time(&self) -> Option<Timestamp> {
        self.values.read().keys().next_back().copied()
    }

    /// Copies out the buffered values.
    pub fn values(&self) -> BTreeMap<Timestamp, f64> {
        self.values.read().clone()
    }
}

impl CacheEntry for Entry {
    fn value_count(&self) -> u64 {
        self.values.read().len() as u64
    }

    fn contains(&self, start: i64, end: i64) -> bool {
        if TimeRange::new(start, end).is_empty() {
            return false;
        }
        self.values
            .read()
            .range((Bound::Excluded(start), Bound::Included(end)))
            .next()
            .is_some()
    }
}

/// Concurrent map of composite key to buffered values.
#[derive(Debug, Default)]
pub struct Cache {
    store: RwLock<HashMap<Vec<u8>, Arc<Entry>>>,
}

impl Cache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers `points` for `key`, creating the entry if needed.
    pub fn write(&self, key: &[u8], points: &[(Timestamp, f64)]) {
        if points.is_empty() {
            return;
        }
        let existing = self.store.read().get(key).cloned();
        if let Some(entry) = existing {
            entry.write(points);
            return;
        }

        // New entries are filled before the map lock is released so scans
        // never observe an empty entry.
        let mut store = self.store.write();
        store
            .entry(key.to_vec())
            .or_insert_with(|| Arc::new(Entry::new()))
            .write(points);
    }

    /// Drops the entry for `key`, typically after it was persisted.
    pub fn remove(&self, key: &[u8]) -> Option<Arc<Entry>> {
        self.store.write().remove(key)
    }

    /// Returns the entry for `key`.
    pub fn get(&self, key: &[u8]) -> Option<Arc<Entry>> {
        self.store.read().get(key).cloned()
    }

    /// Number of cached keys.
    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    /// Returns true if no key is cached.
    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }

    /// Total number of buffered values across all keys.
    pub fn value_count(&self) -> u64 {
        self.store
            .read()
            .values()
            .map(|entry| entry.value_count())
            .sum()
    }

    /// Cost of a full scan of the cache, charged at the timestamp width.
    pub fn scan_cost(&self) -> ScanStats {
        ScanStats::for_timestamps(self.value_count())
    }

    /// Applies `f` to every entry.
    ///
    /// The key map is snapshotted first and the lock released, so `f` may
    /// run while writers add new keys. Keys added after the snapshot are not
    /// visited.
    pub fn apply_entry_fn<E, F>(&self, mut f: F) -> std::result::Result<(), E>
    where
        F: FnMut(&[u8], &Entry) -> std::result::Result<(), E>,
    {
        let entries: Vec<(Vec<u8>, Arc<Entry>)> = self
            .store
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        for (key, entry) in &entries {
            f(key, entry)?;
        }
        Ok(())
    }
}

impl CacheSource for Cache {
    fn for_each_entry(
        &self,
        visit: &mut dyn FnMut(&[u8], &dyn CacheEntry) -> Result<()>,
    ) -> Result<()> {
        self.apply_entry_fn(|key, entry| visit(key, entry))
    }
}
