//! # FullText Index Scenarios
//!
//! Word and phrase queries with positional matching, OR alternatives,
//! per-word globs, complements, and position-sensitive updates.

use pathidx::index::{DataIndex, IndexDefinition, IndexType, QueryValue};
use pathidx::path::PathInfo;
use pathidx::store::{MemoryStore, NodeValue};
use tempfile::tempdir;

fn message(text: &str) -> NodeValue {
    NodeValue::object([("text".to_string(), NodeValue::String(text.to_string()))])
}

fn messages_index(dir: &std::path::Path) -> DataIndex {
    DataIndex::new(
        dir,
        IndexDefinition {
            path: PathInfo::parse("messages").unwrap(),
            key: "text".to_string(),
            include_keys: Vec::new(),
            case_sensitive: false,
            locale: "en-us".to_string(),
            index_type: IndexType::FullText,
        },
    )
}

fn search(index: &DataIndex, query: &str) -> Vec<String> {
    let mut paths: Vec<String> = index
        .query("fulltext:contains", QueryValue::Text(query.to_string()))
        .unwrap()
        .paths()
        .map(str::to_string)
        .collect();
    paths.sort();
    paths.dedup();
    paths
}

#[test]
fn word_queries_require_every_word() {
    let dir = tempdir().unwrap();
    let mut store = MemoryStore::new();
    store.set("messages/m1", message("the quick brown fox")).unwrap();
    store.set("messages/m2", message("the lazy brown dog")).unwrap();

    let index = messages_index(dir.path());
    index.build(&store).unwrap();

    assert_eq!(search(&index, "brown"), ["messages/m1", "messages/m2"]);
    assert_eq!(search(&index, "quick brown"), ["messages/m1"]);
    assert!(search(&index, "quick lazy").is_empty());
}

#[test]
fn phrase_requires_consecutive_positions() {
    let dir = tempdir().unwrap();
    let mut store = MemoryStore::new();
    store.set("messages/m1", message("hello dear world")).unwrap();
    // Both words present, never adjacent in this order.
    store.set("messages/m2", message("dear world hello")).unwrap();

    let index = messages_index(dir.path());
    index.build(&store).unwrap();

    assert_eq!(
        search(&index, "hello dear"),
        ["messages/m1", "messages/m2"],
        "bag-of-words must match both"
    );
    assert_eq!(search(&index, "\"hello dear\""), ["messages/m1"]);
    assert_eq!(search(&index, "\"dear world hello\""), ["messages/m2"]);
}

#[test]
fn or_unions_and_wildcards() {
    let dir = tempdir().unwrap();
    let mut store = MemoryStore::new();
    store.set("messages/m1", message("cows eat grass")).unwrap();
    store.set("messages/m2", message("horses eat hay")).unwrap();
    store.set("messages/m3", message("code eats coffee")).unwrap();

    let index = messages_index(dir.path());
    index.build(&store).unwrap();

    assert_eq!(
        search(&index, "grass OR hay"),
        ["messages/m1", "messages/m2"]
    );
    assert_eq!(search(&index, "co*"), ["messages/m1", "messages/m3"]);
    assert_eq!(search(&index, "h?y"), ["messages/m2"]);
}

#[test]
fn not_contains_is_the_complement() {
    let dir = tempdir().unwrap();
    let mut store = MemoryStore::new();
    store.set("messages/m1", message("good morning")).unwrap();
    store.set("messages/m2", message("good night")).unwrap();

    let index = messages_index(dir.path());
    index.build(&store).unwrap();

    let results = index
        .query("fulltext:!contains", QueryValue::Text("night".to_string()))
        .unwrap();
    let paths: Vec<&str> = results.paths().collect();
    assert_eq!(paths, ["messages/m1"]);
}

#[test]
fn update_with_changed_word_positions() {
    let dir = tempdir().unwrap();
    let mut store = MemoryStore::new();
    store.set("messages/m1", message("world hello")).unwrap();

    let index = messages_index(dir.path());
    index.build(&store).unwrap();
    assert!(search(&index, "\"hello world\"").is_empty());

    // Same words, swapped order: the phrase must match only after the
    // update.
    let new_value = message("hello world");
    let old_value = store.set("messages/m1", new_value.clone()).unwrap();
    index
        .handle_record_update("messages/m1", old_value.as_ref(), Some(&new_value))
        .unwrap();

    assert_eq!(search(&index, "\"hello world\""), ["messages/m1"]);
    assert!(search(&index, "\"world hello\"").is_empty());
}

#[test]
fn empty_query_is_invalid() {
    let dir = tempdir().unwrap();
    let mut store = MemoryStore::new();
    store.set("messages/m1", message("anything")).unwrap();
    let index = messages_index(dir.path());
    index.build(&store).unwrap();

    assert!(index
        .query("fulltext:contains", QueryValue::Text("  ".to_string()))
        .is_err());
}
