//! Schema enumeration over TSM files and the write cache.
//!
//! A scan runs in two phases over a fixed namespace prefix and window:
//!
//! ```text
//! Init ─► ScanningSegments ─┬─► ScanningCache ─► Done
//!                           └─► Canceled
//! ```
//!
//! The segment phase checks the cancellation token before each segment. The
//! cache phase never checks it: the cache is small and fast to walk, so the
//! scan always finishes it once started. A canceled scan skips the cache and
//! returns what it has, together with the error.
//!
//! Names are deduplicated in a concurrent set. A name found in a segment is
//! never re-evaluated against later segments or the cache; it costs only the
//! prefix test and key decode.

use crate::cancel::CancellationToken;
use crate::error::{Result, TsmError};
use crate::key::{CompositeKey, NamespacePrefix};
use crate::stats::{AtomicScanStats, ScanStats};
use crate::tsm::cache::CacheSource;
use crate::tsm::engine::ScanMetrics;
use crate::tsm::segment::{Segment, SegmentSnapshot};
use crate::tsm::TimeRange;
use dashmap::DashSet;
use rayon::prelude::*;
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace, warn};
use xxhash_rust::xxh3::Xxh3Builder;

/// Sorted, deduplicated schema strings together with the cost of the scan
/// that produced them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringIterator {
    values: Vec<String>,
    next: usize,
    stats: ScanStats,
}

impl StringIterator {
    /// Creates an iterator over `values`, which must already be sorted.
    pub fn new(values: Vec<String>, stats: ScanStats) -> Self {
        Self {
            values,
            next: 0,
            stats,
        }
    }

    /// Statistics of the scan that produced this result.
    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    /// The values not yet consumed.
    pub fn as_slice(&self) -> &[String] {
        &self.values[self.next..]
    }

    /// Consumes the iterator, returning the remaining values.
    pub fn into_vec(mut self) -> Vec<String> {
        self.values.drain(..self.next);
        self.values
    }
}

impl Iterator for StringIterator {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let value = self.values.get_mut(self.next).map(std::mem::take)?;
        self.next += 1;
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.values.len() - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for StringIterator {}

/// Concurrent insert-if-absent set of discovered names.
#[derive(Debug)]
pub struct NameSet {
    names: DashSet<String, Xxh3Builder>,
}

impl Default for NameSet {
    fn default() -> Self {
        Self::new()
    }
}

impl NameSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self {
            names: DashSet::with_hasher(Xxh3Builder::new()),
        }
    }

    /// Returns true if `name` was already found.
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Inserts `name`, returning true if it was absent. The first writer wins.
    pub fn insert(&self, name: String) -> bool {
        self.names.insert(name)
    }

    /// Number of names found.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Returns true if nothing was found.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Consumes the set, returning its names in ascending byte order.
    pub fn into_sorted(self) -> Vec<String> {
        let mut names: Vec<String> = self.names.into_iter().collect();
        names.sort_unstable();
        names
    }
}

/// What a scan enumerates from each matching series key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    /// Distinct measurement names.
    MeasurementNames,
    /// Distinct tag keys of one measurement.
    TagKeys {
        /// Measurement whose series are considered.
        measurement: String,
    },
    /// Distinct values of one tag key within one measurement.
    TagValues {
        /// Measurement whose series are considered.
        measurement: String,
        /// Tag key whose values are collected.
        tag_key: String,
    },
}

impl Projection {
    /// Returns the strings `key` contributes, or `None` if the key is
    /// malformed.
    ///
    /// A well-formed key of another measurement, or one lacking the tag key,
    /// contributes nothing.
    pub fn project<'k>(&self, key: &'k [u8]) -> Option<Vec<Cow<'k, str>>> {
        let parsed = CompositeKey::parse(key)?;
        let name = parsed.measurement()?;

        match self {
            Projection::MeasurementNames => Some(vec![name]),
            Projection::TagKeys { measurement } => {
                if name != measurement.as_str() {
                    return Some(Vec::new());
                }
                let tags = parsed.tags()?;
                Some(tags.into_iter().map(|t| t.key).collect())
            }
            Projection::TagValues {
                measurement,
                tag_key,
            } => {
                if name != measurement.as_str() {
                    return Some(Vec::new());
                }
                let tags = parsed.tags()?;
                Some(
                    tags.into_iter()
                        .filter(|t| t.key == tag_key.as_str())
                        .map(|t| t.value)
                        .collect(),
                )
            }
        }
    }
}

/// Phase of a schema scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    /// Prefix derived, nothing scanned.
    Init,
    /// Visiting TSM files.
    ScanningSegments,
    /// Cancellation observed during the segment phase.
    Canceled,
    /// Walking the write cache.
    ScanningCache,
    /// All sources exhausted.
    Done,
}

/// A single schema scan over one segment snapshot and the cache.
pub struct SchemaScan<'a> {
    prefix: &'a NamespacePrefix,
    range: TimeRange,
    projection: &'a Projection,
    metrics: &'a ScanMetrics,
    found: NameSet,
    stats: AtomicScanStats,
    phase: ScanPhase,
}

impl<'a> SchemaScan<'a> {
    /// Prepares a scan of `prefix` over `range`.
    pub fn new(
        prefix: &'a NamespacePrefix,
        range: TimeRange,
        projection: &'a Projection,
        metrics: &'a ScanMetrics,
    ) -> Self {
        Self {
            prefix,
            range,
            projection,
            metrics,
            found: NameSet::new(),
            stats: AtomicScanStats::new(),
            phase: ScanPhase::Init,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> ScanPhase {
        self.phase
    }

    /// Runs both phases to completion or cancellation.
    ///
    /// # Errors
    ///
    /// Returns `TsmError::Canceled` carrying the partial result if `cancel`
    /// fires before every segment was visited, or the cache's error if
    /// enumerating it fails.
    pub fn run(
        mut self,
        segments: &SegmentSnapshot,
        cache: &dyn CacheSource,
        cancel: &CancellationToken,
        parallel: bool,
    ) -> Result<StringIterator> {
        self.transition(ScanPhase::ScanningSegments);
        let completed = if parallel {
            self.scan_segments_parallel(segments, cancel)
        } else {
            self.scan_segments(segments, cancel)
        };

        if !completed {
            self.transition(ScanPhase::Canceled);
            self.metrics.record_canceled();
            return Err(TsmError::Canceled {
                partial: self.finish(),
            });
        }

        self.transition(ScanPhase::ScanningCache);
        self.scan_cache(cache)?;
        self.transition(ScanPhase::Done);
        Ok(self.finish())
    }

    fn transition(&mut self, next: ScanPhase) {
        debug!("Schema scan {:?} -> {:?}", self.phase, next);
        self.phase = next;
    }

    /// Visits segments in snapshot order. Returns false if canceled.
    fn scan_segments(&self, segments: &SegmentSnapshot, cancel: &CancellationToken) -> bool {
        segments.for_each(|segment| {
            if cancel.is_canceled() {
                return false;
            }
            self.scan_segment(segment);
            true
        })
    }

    /// Visits segments on the rayon pool. Returns false if any worker
    /// observed cancellation.
    fn scan_segments_parallel(
        &self,
        segments: &SegmentSnapshot,
        cancel: &CancellationToken,
    ) -> bool {
        let canceled = AtomicBool::new(false);
        segments.as_slice().par_iter().for_each(|segment| {
            if cancel.is_canceled() {
                canceled.store(true, Ordering::Relaxed);
                return;
            }
            self.scan_segment(segment.as_ref());
        });
        !canceled.load(Ordering::Relaxed)
    }

    fn scan_segment(&self, segment: &dyn Segment) {
        let prefix = self.prefix.as_bytes();
        let TimeRange { start, end } = self.range;
        if !segment.overlaps_time_range(start, end)
            || !segment.overlaps_key_prefix_range(prefix, prefix)
        {
            return;
        }

        let mut cursor = segment.time_range_cursor(prefix, start, end);
        while cursor.advance() {
            let key = cursor.key();
            if !key.starts_with(prefix) {
                // end of org+bucket
                break;
            }
            let Some(pending) = self.pending_names(key) else {
                continue;
            };
            if pending.is_empty() {
                continue;
            }
            if cursor.has_data() {
                for name in pending {
                    self.found.insert(name);
                }
            }
        }

        if let Some(err) = cursor.error() {
            self.metrics.record_segment_error();
            warn!("Stopped scanning {} early: {}", segment.name(), err);
        }
        self.stats.add(cursor.stats());
    }

    fn scan_cache(&self, cache: &dyn CacheSource) -> Result<()> {
        let prefix = self.prefix.as_bytes();
        let TimeRange { start, end } = self.range;

        cache.for_each_entry(&mut |key, entry| {
            if !key.starts_with(prefix) {
                return Ok(());
            }
            let Some(pending) = self.pending_names(key) else {
                return Ok(());
            };
            if pending.is_empty() {
                return Ok(());
            }

            self.stats
                .add(ScanStats::for_timestamps(entry.value_count()));
            if entry.contains(start, end) {
                for name in pending {
                    self.found.insert(name);
                }
            }
            Ok(())
        })
    }

    /// Projects `key` and keeps the names not found yet. `None` for a
    /// malformed key, which is counted and skipped.
    fn pending_names(&self, key: &[u8]) -> Option<Vec<String>> {
        match self.projection.project(key) {
            Some(names) => Some(
                names
                    .into_iter()
                    .filter(|name| !self.found.contains(name))
                    .map(Cow::into_owned)
                    .collect(),
            ),
            None => {
                self.metrics.record_malformed_key();
                trace!("Skipping malformed key {:?}", String::from_utf8_lossy(key));
                None
            }
        }
    }

    fn finish(self) -> StringIterator {
        let stats = self.stats.load();
        let names = self.found.into_sorted();
        debug!(
            "Schema scan found {} names, scanned {} values / {} bytes",
            names.len(),
            stats.scanned_values,
            stats.scanned_bytes
        );
        StringIterator::new(names, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::make_composite_key;

    #[test]
    fn test_string_iterator() {
        let mut iter = StringIterator::new(
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
            ScanStats::new(3, 24),
        );
        assert_eq!(iter.len(), 3);
        assert_eq!(iter.next().as_deref(), Some("a"));
        assert_eq!(iter.as_slice(), &["b".to_string(), "c".to_string()]);
        assert_eq!(iter.stats(), ScanStats::new(3, 24));
        assert_eq!(iter.into_vec(), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_name_set_first_writer_wins() {
        let set = NameSet::new();
        assert!(set.insert("cpu".to_string()));
        assert!(!set.insert("cpu".to_string()));
        assert!(set.insert("disk".to_string()));
        assert!(set.contains("cpu"));
        assert!(!set.contains("mem"));
        assert_eq!(set.into_sorted(), vec!["cpu", "disk"]);
    }

    #[test]
    fn test_name_set_sorts_bytewise() {
        let set = NameSet::new();
        for name in ["b", "B", "a", "_", "ä"] {
            set.insert(name.to_string());
        }
        assert_eq!(set.into_sorted(), vec!["B", "_", "a", "b", "ä"]);
    }

    #[test]
    fn test_projections() {
        let prefix = NamespacePrefix::new(1, 2);
        let key = make_composite_key(&prefix, "cpu", &[("host", "a"), ("dc", "x")], "usage");
        let other = make_composite_key(&prefix, "mem", &[("host", "b")], "free");

        let names = Projection::MeasurementNames;
        assert_eq!(names.project(&key).unwrap(), vec!["cpu"]);

        let tag_keys = Projection::TagKeys {
            measurement: "cpu".to_string(),
        };
        assert_eq!(tag_keys.project(&key).unwrap(), vec!["dc", "host"]);
        assert!(tag_keys.project(&other).unwrap().is_empty());

        let tag_values = Projection::TagValues {
            measurement: "cpu".to_string(),
            tag_key: "host".to_string(),
        };
        assert_eq!(tag_values.project(&key).unwrap(), vec!["a"]);
        assert!(tag_values.project(&other).unwrap().is_empty());

        assert!(names.project(b"no separator here at all").is_none());
    }
}
