//! Segment-side collaborator traits.
//!
//! A scan never walks the live file set. It asks a [`SegmentSource`] for a
//! [`SegmentSnapshot`] once, at scan start, and visits only the segments in
//! that snapshot. Each handle is reference counted, so a segment replaced by
//! compaction while the scan runs stays readable until the snapshot drops.

use crate::error::TsmError;
use crate::stats::ScanStats;
use std::fmt;
use std::sync::Arc;

/// An immutable on-disk unit covering a time range and a sorted key set.
pub trait Segment: Send + Sync {
    /// Returns true if the segment may hold a timestamp in `(start, end]`.
    fn overlaps_time_range(&self, start: i64, end: i64) -> bool;

    /// Returns true if the segment's key range intersects the keys starting
    /// with any prefix in `[min, max]`.
    fn overlaps_key_prefix_range(&self, min: &[u8], max: &[u8]) -> bool;

    /// Opens a cursor positioned before the first key `>= prefix`.
    ///
    /// The cursor does not stop at the end of the prefix; callers break on
    /// the first key that no longer matches.
    fn time_range_cursor<'a>(
        &'a self,
        prefix: &[u8],
        start: i64,
        end: i64,
    ) -> Box<dyn SegmentCursor + 'a>;

    /// A short human readable name used in logs.
    fn name(&self) -> String {
        String::from("segment")
    }
}

/// Ordered cursor over the keys of one segment.
pub trait SegmentCursor {
    /// Moves to the next key. Returns false when exhausted or on error.
    fn advance(&mut self) -> bool;

    /// The current key. Only valid after `advance` returned true.
    fn key(&self) -> &[u8];

    /// Returns true if the current key has at least one value in the
    /// cursor's `(start, end]` window.
    fn has_data(&mut self) -> bool;

    /// Cost of the work done by this cursor so far.
    fn stats(&self) -> ScanStats;

    /// Error that ended the cursor early, if any.
    fn error(&self) -> Option<&TsmError> {
        None
    }
}

/// A provider of segment snapshots.
pub trait SegmentSource: Send + Sync {
    /// Takes a stable snapshot of the current segments.
    fn segments(&self) -> SegmentSnapshot;
}

/// An owned, immutable list of segment handles.
#[derive(Clone)]
pub struct SegmentSnapshot {
    segments: Arc<[Arc<dyn Segment>]>,
}

impl SegmentSnapshot {
    /// Creates a snapshot from segment handles.
    pub fn new(segments: Vec<Arc<dyn Segment>>) -> Self {
        Self {
            segments: segments.into(),
        }
    }

    /// Visits each segment until `visit` returns false.
    ///
    /// Returns false if iteration was stopped early.
    pub fn for_each<F>(&self, mut visit: F) -> bool
    where
        F: FnMut(&dyn Segment) -> bool,
    {
        for segment in self.segments.iter() {
            if !visit(segment.as_ref()) {
                return false;
            }
        }
        true
    }

    /// Returns the segment handles.
    pub fn as_slice(&self) -> &[Arc<dyn Segment>] {
        &self.segments
    }

    /// Number of segments in the snapshot.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Returns true if the snapshot holds no segments.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

impl Default for SegmentSnapshot {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl fmt::Debug for SegmentSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.segments.iter().map(|s| s.name()))
            .finish()
    }
}
