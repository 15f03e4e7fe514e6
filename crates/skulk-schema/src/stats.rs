//! Scan cost accounting.
//!
//! [`ScanStats`] records how many values and bytes a scan touched. Both TSM
//! cursors and the cache scanner report into it, and it is returned with
//! every schema result, including canceled ones.

use std::ops::{Add, AddAssign};
use std::sync::atomic::{AtomicU64, Ordering};

/// Width in bytes charged per timestamp.
pub const TIMESTAMP_SIZE: u64 = 8;

/// Values and bytes examined while scanning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ScanStats {
    /// Number of values decoded or counted.
    pub scanned_values: u64,
    /// Number of bytes those values account for.
    pub scanned_bytes: u64,
}

impl ScanStats {
    /// Creates stats with explicit counters.
    pub fn new(scanned_values: u64, scanned_bytes: u64) -> Self {
        Self {
            scanned_values,
            scanned_bytes,
        }
    }

    /// Stats for `count` values charged at the fixed timestamp width.
    pub fn for_timestamps(count: u64) -> Self {
        Self::new(count, count.saturating_mul(TIMESTAMP_SIZE))
    }

    /// Returns true if nothing was scanned.
    pub fn is_zero(&self) -> bool {
        self.scanned_values == 0 && self.scanned_bytes == 0
    }
}

impl Add for ScanStats {
    type Output = ScanStats;

    fn add(mut self, rhs: ScanStats) -> ScanStats {
        self += rhs;
        self
    }
}

impl AddAssign for ScanStats {
    fn add_assign(&mut self, rhs: ScanStats) {
        self.scanned_values = self.scanned_values.saturating_add(rhs.scanned_values);
        self.scanned_bytes = self.scanned_bytes.saturating_add(rhs.scanned_bytes);
    }
}

/// Thread-safe accumulator for [`ScanStats`].
///
/// Used when segments are visited concurrently.
#[derive(Debug, Default)]
pub struct AtomicScanStats {
    scanned_values: AtomicU64,
    scanned_bytes: AtomicU64,
}

impl AtomicScanStats {
    /// Creates an accumulator at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `stats` to the running total.
    pub fn add(&self, stats: ScanStats) {
        self.scanned_values
            .fetch_add(stats.scanned_values, Ordering::Relaxed);
        self.scanned_bytes
            .fetch_add(stats.scanned_bytes, Ordering::Relaxed);
    }

    /// Returns the current total.
    pub fn load(&self) -> ScanStats {
        ScanStats {
            scanned_values: self.scanned_values.load(Ordering::Relaxed),
            scanned_bytes: self.scanned_bytes.load(Ordering::Relaxed),
        }
    }
}
