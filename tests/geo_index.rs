//! # Geo Index Scenarios
//!
//! Geohash projection and radius queries. The candidate set from
//! `geo:nearby` may include false positives near the rim; these tests
//! only assert that everything inside the radius is found and that
//! far-away records are excluded.

use pathidx::index::{DataIndex, IndexDefinition, IndexType, QueryValue};
use pathidx::path::PathInfo;
use pathidx::store::{MemoryStore, NodeValue};
use tempfile::tempdir;

fn landmark(lat: f64, long: f64) -> NodeValue {
    NodeValue::object([(
        "location".to_string(),
        NodeValue::object([
            ("lat".to_string(), NodeValue::Float(lat)),
            ("long".to_string(), NodeValue::Float(long)),
        ]),
    )])
}

fn landmarks_index(dir: &std::path::Path) -> DataIndex {
    DataIndex::new(
        dir,
        IndexDefinition {
            path: PathInfo::parse("landmarks").unwrap(),
            key: "location".to_string(),
            include_keys: Vec::new(),
            case_sensitive: false,
            locale: "en-us".to_string(),
            index_type: IndexType::Geo,
        },
    )
}

#[test]
fn nearby_finds_close_landmarks_and_skips_far_ones() {
    let dir = tempdir().unwrap();
    let mut store = MemoryStore::new();
    // Two points ~250m apart in Amsterdam, one ~16km away.
    store
        .set("landmarks/l1", landmark(52.359157, 4.884155))
        .unwrap();
    store
        .set("landmarks/l2", landmark(52.358407, 4.881152))
        .unwrap();
    store
        .set("landmarks/l3", landmark(52.500000, 4.900000))
        .unwrap();

    let index = landmarks_index(dir.path());
    index.build(&store).unwrap();

    let results = index
        .query(
            "geo:nearby",
            QueryValue::Nearby {
                lat: 52.359,
                long: 4.884,
                radius: 500.0,
            },
        )
        .unwrap();
    let mut paths: Vec<&str> = results.paths().collect();
    paths.sort_unstable();
    assert!(paths.contains(&"landmarks/l1"));
    assert!(paths.contains(&"landmarks/l2"));
    assert!(!paths.contains(&"landmarks/l3"));
}

#[test]
fn nearby_radius_scales_the_candidate_set() {
    let dir = tempdir().unwrap();
    let mut store = MemoryStore::new();
    store
        .set("landmarks/close", landmark(52.3600, 4.8840))
        .unwrap();
    store
        .set("landmarks/city", landmark(52.3700, 4.9000))
        .unwrap(); // ~1.6km away
    store
        .set("landmarks/faraway", landmark(48.8566, 2.3522))
        .unwrap(); // Paris

    let index = landmarks_index(dir.path());
    index.build(&store).unwrap();

    let tight = index
        .query(
            "geo:nearby",
            QueryValue::Nearby {
                lat: 52.3601,
                long: 4.8841,
                radius: 200.0,
            },
        )
        .unwrap();
    let paths: Vec<&str> = tight.paths().collect();
    assert!(paths.contains(&"landmarks/close"));
    assert!(!paths.contains(&"landmarks/faraway"));

    let wide = index
        .query(
            "geo:nearby",
            QueryValue::Nearby {
                lat: 52.3601,
                long: 4.8841,
                radius: 5000.0,
            },
        )
        .unwrap();
    let paths: Vec<&str> = wide.paths().collect();
    assert!(paths.contains(&"landmarks/close"));
    assert!(paths.contains(&"landmarks/city"));
    assert!(!paths.contains(&"landmarks/faraway"));
}

#[test]
fn records_without_coordinates_are_not_indexed() {
    let dir = tempdir().unwrap();
    let mut store = MemoryStore::new();
    store
        .set("landmarks/l1", landmark(52.36, 4.88))
        .unwrap();
    store
        .set(
            "landmarks/broken",
            NodeValue::object([("location".to_string(), NodeValue::String("here".into()))]),
        )
        .unwrap();

    let index = landmarks_index(dir.path());
    index.build(&store).unwrap();

    let results = index
        .query(
            "geo:nearby",
            QueryValue::Nearby {
                lat: 52.36,
                long: 4.88,
                radius: 1000.0,
            },
        )
        .unwrap();
    let paths: Vec<&str> = results.paths().collect();
    assert_eq!(paths, ["landmarks/l1"]);
}

#[test]
fn invalid_radius_is_rejected() {
    let dir = tempdir().unwrap();
    let mut store = MemoryStore::new();
    store.set("landmarks/l1", landmark(1.0, 1.0)).unwrap();
    let index = landmarks_index(dir.path());
    index.build(&store).unwrap();

    assert!(index
        .query(
            "geo:nearby",
            QueryValue::Nearby {
                lat: 1.0,
                long: 1.0,
                radius: -5.0,
            },
        )
        .is_err());
}
