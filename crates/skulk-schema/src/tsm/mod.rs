//! TSM storage sources and the schema scan that merges them.
//!
//! - [`file`]: immutable TSM segment files
//! - [`file_store`]: the snapshot-able set of open TSM files
//! - [`cache`]: the in-memory write cache
//! - [`segment`]: the narrow traits the scan consumes
//! - [`schema`]: the merge and dedup scan
//! - [`engine`]: the public entry point and its configuration

pub mod cache;
pub mod engine;
pub mod file;
pub mod file_store;
pub mod schema;
pub mod segment;

pub use cache::{Cache, CacheEntry, CacheSource, Entry};
pub use engine::{Engine, EngineConfig, ScanMetrics};
pub use file::{TsmFileHandle, TsmReader, TsmWriter};
pub use file_store::FileStore;
pub use schema::StringIterator;
pub use segment::{Segment, SegmentCursor, SegmentSnapshot, SegmentSource};

/// Nanosecond timestamp.
pub type Timestamp = i64;

/// A query window, exclusive at `start` and inclusive at `end`.
///
/// A point at exactly `start` is outside the window; a point at exactly `end`
/// is inside. A window with `start >= end` is empty, which is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeRange {
    /// Exclusive lower bound.
    pub start: Timestamp,
    /// Inclusive upper bound.
    pub end: Timestamp,
}

impl TimeRange {
    /// Creates a new window `(start, end]`.
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Returns true if the window cannot contain any timestamp.
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Returns true if `ts` falls in `(start, end]`.
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts > self.start && ts <= self.end
    }

    /// Returns true if the closed span `[min, max]` has any timestamp in the
    /// window.
    pub fn overlaps(&self, min: Timestamp, max: Timestamp) -> bool {
        !self.is_empty() && min <= max && max > self.start && min <= self.end
    }

    /// Returns true if every timestamp of `[min, max]` is in the window.
    pub fn covers(&self, min: Timestamp, max: Timestamp) -> bool {
        min > self.start && max <= self.end
    }
}
