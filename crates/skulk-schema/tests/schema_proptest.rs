//! Property-based tests for measurement name enumeration.
//!
//! Random segments and cache contents are scanned through the engine and the
//! result is compared with a brute-force model: every measurement of the
//! queried namespace with at least one timestamp in `(start, end]`, sorted.

use proptest::prelude::*;
use skulk_schema::key::make_composite_key;
use skulk_schema::{
    Cache, CancellationToken, Engine, EngineConfig, FileStore, Namespace, TimeRange, Timestamp,
    TsmReader, TsmWriter,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tempfile::TempDir;

const NAMESPACES: [Namespace; 2] = [
    Namespace {
        org_id: 1,
        bucket_id: 2,
    },
    Namespace {
        org_id: 0x2c20,
        bucket_id: 7,
    },
];

const MEASUREMENTS: [&str; 6] = ["cpu", "mem", "disk", "a b", "x,y", "Z"];

/// One series: namespace index, measurement, host tag and timestamps.
type Series = (usize, &'static str, u8, Vec<Timestamp>);

fn series_strategy() -> impl Strategy<Value = Series> {
    (
        0..NAMESPACES.len(),
        prop::sample::select(MEASUREMENTS.to_vec()),
        0u8..3,
        prop::collection::vec(0i64..50, 0..4),
    )
}

fn series_key(series: &Series) -> Vec<u8> {
    let (ns, measurement, host, _) = series;
    let host = host.to_string();
    make_composite_key(
        &NAMESPACES[*ns].prefix(),
        measurement,
        &[("host", host.as_str())],
        "value",
    )
}

/// Merges series with the same key; the writer requires unique sorted keys.
fn by_key(series: &[Series]) -> BTreeMap<Vec<u8>, BTreeMap<Timestamp, f64>> {
    let mut out: BTreeMap<Vec<u8>, BTreeMap<Timestamp, f64>> = BTreeMap::new();
    for s in series {
        let points = out.entry(series_key(s)).or_default();
        for &ts in &s.3 {
            points.insert(ts, 1.0);
        }
    }
    out
}

fn model(all: &[Series], ns: usize, range: TimeRange) -> Vec<String> {
    let names: BTreeSet<String> = all
        .iter()
        .filter(|s| s.0 == ns && s.3.iter().any(|&ts| range.contains(ts)))
        .map(|s| s.1.to_string())
        .collect();
    names.into_iter().collect()
}

fn build_engine(
    dir: &TempDir,
    segments: &[Vec<Series>],
    cached: &[Series],
    parallel: bool,
) -> Engine {
    let store = FileStore::new();
    for (i, segment) in segments.iter().enumerate() {
        let path = dir.path().join(format!("{:03}.tsm", i));
        let mut writer = TsmWriter::new(&path).unwrap();
        for (key, points) in by_key(segment) {
            writer.write(&key, &points).unwrap();
        }
        writer.finish().unwrap();
        store.add(TsmReader::open(&path).unwrap());
    }

    let cache = Cache::new();
    for s in cached {
        let points: Vec<(Timestamp, f64)> = s.3.iter().map(|&ts| (ts, 1.0)).collect();
        cache.write(&series_key(s), &points);
    }

    let config = EngineConfig::default()
        .with_parallel_segment_scan(parallel)
        .with_parallel_min_segments(1);
    Engine::new(Arc::new(store), Arc::new(cache), config)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// The engine returns exactly the model's names, in order.
    #[test]
    fn test_names_match_model(
        segments in prop::collection::vec(prop::collection::vec(series_strategy(), 0..8), 0..4),
        cached in prop::collection::vec(series_strategy(), 0..8),
        ns in 0..NAMESPACES.len(),
        start in -5i64..55,
        len in -5i64..55,
        parallel in any::<bool>(),
    ) {
        let dir = TempDir::new().unwrap();
        let engine = build_engine(&dir, &segments, &cached, parallel);
        let range = TimeRange::new(start, start + len);

        let result = engine
            .measurement_names(&CancellationToken::new(), NAMESPACES[ns], range)
            .unwrap();

        let all: Vec<Series> = segments.iter().flatten().chain(cached.iter()).cloned().collect();
        prop_assert_eq!(result.into_vec(), model(&all, ns, range));
        prop_assert_eq!(engine.metrics().malformed_keys(), 0);
    }

    /// Scanning the same state twice yields the same names and statistics.
    #[test]
    fn test_scan_is_repeatable(
        segments in prop::collection::vec(prop::collection::vec(series_strategy(), 0..8), 1..4),
        cached in prop::collection::vec(series_strategy(), 0..8),
        start in 0i64..50,
    ) {
        let dir = TempDir::new().unwrap();
        let engine = build_engine(&dir, &segments, &cached, false);
        let range = TimeRange::new(start, start + 10);

        let first = engine
            .measurement_names(&CancellationToken::new(), NAMESPACES[0], range)
            .unwrap();
        let second = engine
            .measurement_names(&CancellationToken::new(), NAMESPACES[0], range)
            .unwrap();
        prop_assert_eq!(first, second);
    }
}
