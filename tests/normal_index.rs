//! # Normal Index Scenarios
//!
//! Range and comparison queries over a scalar field, wildcard paths with
//! include metadata, pagination, and cache coherence across mutations.

use pathidx::encoding::IndexKey;
use pathidx::index::{DataIndex, IndexDefinition, IndexType, QueryValue};
use pathidx::path::PathInfo;
use pathidx::store::{MemoryStore, NodeValue};
use tempfile::tempdir;

fn obj(pairs: &[(&str, NodeValue)]) -> NodeValue {
    NodeValue::object(pairs.iter().map(|(k, v)| (k.to_string(), v.clone())))
}

fn songs_index(dir: &std::path::Path) -> DataIndex {
    DataIndex::new(
        dir,
        IndexDefinition {
            path: PathInfo::parse("songs").unwrap(),
            key: "year".to_string(),
            include_keys: Vec::new(),
            case_sensitive: false,
            locale: "en-us".to_string(),
            index_type: IndexType::Normal,
        },
    )
}

fn songs_store() -> MemoryStore {
    let mut store = MemoryStore::new();
    store
        .set("songs/s1", obj(&[("year", NodeValue::Int(1999))]))
        .unwrap();
    store
        .set("songs/s2", obj(&[("year", NodeValue::Int(2005))]))
        .unwrap();
    store
        .set("songs/s3", obj(&[("year", NodeValue::Int(2010))]))
        .unwrap();
    store
}

#[test]
fn range_query_on_year() {
    let dir = tempdir().unwrap();
    let store = songs_store();
    let index = songs_index(dir.path());
    index.build(&store).unwrap();

    let results = index
        .query(
            "between",
            QueryValue::Range(IndexKey::Integer(2000), IndexKey::Integer(2009)),
        )
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results.results[0].path, "songs/s2");
    assert_eq!(results.results[0].value, IndexKey::Integer(2005));

    let results = index.query(">=", QueryValue::from(2005i64)).unwrap();
    let paths: Vec<&str> = results.paths().collect();
    assert_eq!(paths, ["songs/s2", "songs/s3"]);

    let results = index.query("!=", QueryValue::from(2005i64)).unwrap();
    let paths: Vec<&str> = results.paths().collect();
    assert_eq!(paths, ["songs/s1", "songs/s3"]);
}

#[test]
fn wildcard_path_with_include_metadata() {
    let dir = tempdir().unwrap();
    let mut store = MemoryStore::new();
    store
        .set(
            "users/u1/posts/p1",
            obj(&[("date", NodeValue::Int(100)), ("title", "A".into())]),
        )
        .unwrap();
    store
        .set(
            "users/u2/posts/p2",
            obj(&[("date", NodeValue::Int(200)), ("title", "B".into())]),
        )
        .unwrap();

    let index = DataIndex::new(
        dir.path(),
        IndexDefinition {
            path: PathInfo::parse("users/*/posts").unwrap(),
            key: "date".to_string(),
            include_keys: vec!["title".to_string()],
            case_sensitive: false,
            locale: "en-us".to_string(),
            index_type: IndexType::Normal,
        },
    );
    index.build(&store).unwrap();

    let results = index.query(">", QueryValue::from(150i64)).unwrap();
    assert_eq!(results.len(), 1);
    let hit = &results.results[0];
    assert_eq!(hit.key, "p2");
    assert_eq!(hit.path, "users/u2/posts/p2");
    assert_eq!(hit.value, IndexKey::Integer(200));
    assert_eq!(
        hit.metadata.get("title"),
        Some(&IndexKey::String("B".to_string()))
    );
}

#[test]
fn in_and_exists_operators() {
    let dir = tempdir().unwrap();
    let mut store = songs_store();
    // A song without a year: only `!exists` may find it.
    store
        .set("songs/s4", obj(&[("title", "untitled".into())]))
        .unwrap();

    let index = songs_index(dir.path());
    index.build(&store).unwrap();

    let results = index
        .query(
            "in",
            QueryValue::Keys(vec![IndexKey::Integer(1999), IndexKey::Integer(2010)]),
        )
        .unwrap();
    let paths: Vec<&str> = results.paths().collect();
    assert_eq!(paths, ["songs/s1", "songs/s3"]);

    let exists = index.query("exists", QueryValue::from(0i64)).unwrap();
    assert_eq!(exists.len(), 3);

    let missing = index.query("!exists", QueryValue::from(0i64)).unwrap();
    let paths: Vec<&str> = missing.paths().collect();
    assert_eq!(paths, ["songs/s4"]);
}

#[test]
fn unsupported_operator_is_rejected() {
    let dir = tempdir().unwrap();
    let index = songs_index(dir.path());
    index.build(&songs_store()).unwrap();

    let err = index
        .query("contains", QueryValue::from(1999i64))
        .unwrap_err();
    assert!(err.to_string().contains("not supported"));
}

#[test]
fn updates_keep_query_results_fresh() {
    let dir = tempdir().unwrap();
    let mut store = songs_store();
    let index = songs_index(dir.path());
    index.build(&store).unwrap();

    // Warm the cache.
    let before = index.query("==", QueryValue::from(2005i64)).unwrap();
    assert_eq!(before.len(), 1);

    // s2 moves to 2006; the cached result set must not survive.
    let new_value = obj(&[("year", NodeValue::Int(2006))]);
    let old_value = store.set("songs/s2", new_value.clone()).unwrap();
    index
        .handle_record_update("songs/s2", old_value.as_ref(), Some(&new_value))
        .unwrap();

    assert_eq!(index.query("==", QueryValue::from(2005i64)).unwrap().len(), 0);
    let results = index.query("==", QueryValue::from(2006i64)).unwrap();
    let paths: Vec<&str> = results.paths().collect();
    assert_eq!(paths, ["songs/s2"]);
}

#[test]
fn record_deletion_removes_index_entries() {
    let dir = tempdir().unwrap();
    let mut store = songs_store();
    let index = songs_index(dir.path());
    index.build(&store).unwrap();

    let old = store.remove("songs/s1").unwrap();
    index
        .handle_record_update("songs/s1", Some(&old), None)
        .unwrap();

    let results = index.query("==", QueryValue::from(1999i64)).unwrap();
    assert!(results.is_empty());
    assert_eq!(index.count(">=", QueryValue::from(0i64)).unwrap(), 2);
}

#[test]
fn take_paginates_in_key_order() {
    let dir = tempdir().unwrap();
    let mut store = MemoryStore::new();
    for i in 0..50 {
        store
            .set(
                &format!("songs/s{:02}", i),
                obj(&[("year", NodeValue::Int(1960 + i))]),
            )
            .unwrap();
    }
    let index = songs_index(dir.path());
    index.build(&store).unwrap();

    let page = index.take(10, 5, true).unwrap();
    let years: Vec<&IndexKey> = page.results.iter().map(|r| &r.value).collect();
    assert_eq!(
        years,
        vec![
            &IndexKey::Integer(1970),
            &IndexKey::Integer(1971),
            &IndexKey::Integer(1972),
            &IndexKey::Integer(1973),
            &IndexKey::Integer(1974),
        ]
    );

    let last = index.take(0, 2, false).unwrap();
    let years: Vec<&IndexKey> = last.results.iter().map(|r| &r.value).collect();
    assert_eq!(years, vec![&IndexKey::Integer(2009), &IndexKey::Integer(2008)]);
}

#[test]
fn case_insensitive_string_index_folds_queries() {
    let dir = tempdir().unwrap();
    let mut store = MemoryStore::new();
    store
        .set("songs/s1", obj(&[("artist", "Queen".into())]))
        .unwrap();
    store
        .set("songs/s2", obj(&[("artist", "queens of noise".into())]))
        .unwrap();

    let index = DataIndex::new(
        dir.path(),
        IndexDefinition {
            path: PathInfo::parse("songs").unwrap(),
            key: "artist".to_string(),
            include_keys: Vec::new(),
            case_sensitive: false,
            locale: "en-us".to_string(),
            index_type: IndexType::Normal,
        },
    );
    index.build(&store).unwrap();

    let results = index
        .query("==", QueryValue::Key(IndexKey::String("QUEEN".into())))
        .unwrap();
    let paths: Vec<&str> = results.paths().collect();
    assert_eq!(paths, ["songs/s1"]);

    let results = index.query("like", QueryValue::Text("QuEen*".into())).unwrap();
    assert_eq!(results.len(), 2);
}
