//! Schema queries over a file store and a write cache.
//!
//! The engine owns shared handles to both sources and answers
//! measurement-name, tag-key and tag-value queries for one namespace over a
//! left-open window `(start, end]`. Each query takes a fresh segment
//! snapshot, so files swapped in by compaction only affect later queries.

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::key::Namespace;
use crate::tsm::cache::{Cache, CacheSource};
use crate::tsm::file_store::FileStore;
use crate::tsm::schema::{Projection, SchemaScan, StringIterator};
use crate::tsm::segment::SegmentSource;
use crate::tsm::TimeRange;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Default smallest snapshot scanned in parallel: 4 segments.
pub const DEFAULT_PARALLEL_MIN_SEGMENTS: usize = 4;

/// Configuration for the schema engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Visit segments on the rayon pool instead of one by one.
    ///
    /// Results are identical either way. Default: false.
    pub parallel_segment_scan: bool,

    /// Smallest snapshot for which the parallel path is taken.
    ///
    /// Smaller snapshots are scanned sequentially even when parallel scans
    /// are enabled. Default: 4.
    pub parallel_min_segments: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallel_segment_scan: false,
            parallel_min_segments: DEFAULT_PARALLEL_MIN_SEGMENTS,
        }
    }
}

impl EngineConfig {
    /// Enables or disables parallel segment scans.
    pub fn with_parallel_segment_scan(mut self, enabled: bool) -> Self {
        self.parallel_segment_scan = enabled;
        self
    }

    /// Sets the smallest snapshot scanned in parallel.
    pub fn with_parallel_min_segments(mut self, min: usize) -> Self {
        self.parallel_min_segments = min;
        self
    }
}

/// Counters describing scans run by an engine.
#[derive(Debug, Default)]
pub struct ScanMetrics {
    scans: AtomicU64,
    canceled_scans: AtomicU64,
    malformed_keys: AtomicU64,
    segment_errors: AtomicU64,
}

impl ScanMetrics {
    /// Number of scans started.
    pub fn scans(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }

    /// Number of scans that ended with a cancellation.
    pub fn canceled_scans(&self) -> u64 {
        self.canceled_scans.load(Ordering::Relaxed)
    }

    /// Number of keys skipped because they could not be parsed.
    pub fn malformed_keys(&self) -> u64 {
        self.malformed_keys.load(Ordering::Relaxed)
    }

    /// Number of segment cursors that stopped on an error.
    pub fn segment_errors(&self) -> u64 {
        self.segment_errors.load(Ordering::Relaxed)
    }

    pub(crate) fn record_scan(&self) {
        self.scans.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_canceled(&self) {
        self.canceled_scans.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed_key(&self) {
        self.malformed_keys.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_segment_error(&self) {
        self.segment_errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Schema query engine over a segment source and a cache source.
pub struct Engine<S = FileStore, C = Cache> {
    file_store: Arc<S>,
    cache: Arc<C>,
    config: EngineConfig,
    metrics: ScanMetrics,
}

impl Engine<FileStore, Cache> {
    /// Opens every TSM file in `dir` with an empty write cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read or a file fails
    /// validation.
    pub fn open(dir: &Path, config: EngineConfig) -> Result<Self> {
        let file_store = FileStore::open(dir)?;
        Ok(Self::new(
            Arc::new(file_store),
            Arc::new(Cache::new()),
            config,
        ))
    }
}

impl<S: SegmentSource, C: CacheSource> Engine<S, C> {
    /// Creates an engine over existing sources.
    pub fn new(file_store: Arc<S>, cache: Arc<C>, config: EngineConfig) -> Self {
        Self {
            file_store,
            cache,
            config,
            metrics: ScanMetrics::default(),
        }
    }

    /// The segment source.
    pub fn file_store(&self) -> &Arc<S> {
        &self.file_store
    }

    /// The cache source.
    pub fn cache(&self) -> &Arc<C> {
        &self.cache
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Scan counters.
    pub fn metrics(&self) -> &ScanMetrics {
        &self.metrics
    }

    /// Returns the distinct measurement names of `namespace` with at least
    /// one value in `(range.start, range.end]`, sorted by byte order.
    ///
    /// # Errors
    ///
    /// Returns `TsmError::Canceled` with the partial result if `cancel` fires
    /// during the segment phase, or the cache's error if enumerating it
    /// fails.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let engine = Engine::open(dir, EngineConfig::default())?;
    /// let names = engine.measurement_names(
    ///     &CancellationToken::new(),
    ///     Namespace::new(org, bucket),
    ///     TimeRange::new(0, now),
    /// )?;
    /// println!("{} values scanned", names.stats().scanned_values);
    /// for name in names {
    ///     println!("{}", name);
    /// }
    /// ```
    pub fn measurement_names(
        &self,
        cancel: &CancellationToken,
        namespace: Namespace,
        range: TimeRange,
    ) -> Result<StringIterator> {
        self.scan(cancel, namespace, range, Projection::MeasurementNames)
    }

    /// Returns the distinct tag keys of `measurement` within `namespace` and
    /// `(range.start, range.end]`, sorted by byte order.
    ///
    /// # Errors
    ///
    /// As for [`Engine::measurement_names`].
    pub fn measurement_tag_keys(
        &self,
        cancel: &CancellationToken,
        namespace: Namespace,
        measurement: &str,
        range: TimeRange,
    ) -> Result<StringIterator> {
        let projection = Projection::TagKeys {
            measurement: measurement.to_string(),
        };
        self.scan(cancel, namespace, range, projection)
    }

    /// Returns the distinct values of `tag_key` on series of `measurement`
    /// within `namespace` and `(range.start, range.end]`, sorted by byte
    /// order.
    ///
    /// # Errors
    ///
    /// As for [`Engine::measurement_names`].
    pub fn measurement_tag_values(
        &self,
        cancel: &CancellationToken,
        namespace: Namespace,
        measurement: &str,
        tag_key: &str,
        range: TimeRange,
    ) -> Result<StringIterator> {
        let projection = Projection::TagValues {
            measurement: measurement.to_string(),
            tag_key: tag_key.to_string(),
        };
        self.scan(cancel, namespace, range, projection)
    }

    fn scan(
        &self,
        cancel: &CancellationToken,
        namespace: Namespace,
        range: TimeRange,
        projection: Projection,
    ) -> Result<StringIterator> {
        let prefix = namespace.prefix();
        let segments = self.file_store.segments();
        let parallel = self.config.parallel_segment_scan
            && segments.len() >= self.config.parallel_min_segments;

        self.metrics.record_scan();
        debug!(
            "Schema scan {:?} for org {} bucket {} over ({}, {}] with {} segments{}",
            projection,
            namespace.org_id,
            namespace.bucket_id,
            range.start,
            range.end,
            segments.len(),
            if parallel { " in parallel" } else { "" }
        );

        SchemaScan::new(&prefix, range, &projection, &self.metrics).run(
            &segments,
            self.cache.as_ref(),
            cancel,
            parallel,
        )
    }
}
