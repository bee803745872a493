//! # FullText Index
//!
//! Tokenizes a string field into latin words (`[\w']+`) and stores one
//! tree entry per distinct word, with the word's positions in the
//! tokenized text as `_occurs_` metadata. Positions make phrase queries
//! answerable from the index alone: a phrase matches when its words occur
//! at strictly consecutive positions.
//!
//! ## Query Grammar
//!
//! ```text
//! fulltext:contains  word1 word2          both words required
//! fulltext:contains  "hello dear"         phrase, consecutive positions
//! fulltext:contains  a OR b OR "c d"      union of alternatives
//! fulltext:contains  wild*card wo?d       per-word glob via tree like
//! fulltext:!contains ...                  complement
//! ```
//!
//! Within one alternative every term must match. Terms are evaluated in
//! ascending candidate-count order so the running intersection stays as
//! small as possible.

use hashbrown::{HashMap, HashSet};

use eyre::Result;
use regex::Regex;
use std::sync::OnceLock;

use super::{IndexDefinition, IndexStrategy, IndexType, ProjectedEntry};
use crate::btree::{BinaryBTree, EntryValue, SearchOptions, TreeEntry, TreeQuery, TreeSearchResult};
use crate::encoding::IndexKey;
use crate::error::IndexError;
use crate::index::query::QueryValue;
use crate::store::NodeValue;

pub struct FullTextIndex;

/// Metadata key carrying a word's positions, e.g. `"0,4,17"`.
pub const OCCURS_KEY: &str = "_occurs_";

fn word_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\w']+").expect("word regex"))
}

/// Splits text into the indexed word sequence, case-folded unless the
/// index is case sensitive.
pub fn tokenize(def: &IndexDefinition, text: &str) -> Vec<String> {
    word_regex()
        .find_iter(text)
        .map(|m| {
            if def.case_sensitive {
                m.as_str().to_string()
            } else {
                m.as_str().to_lowercase()
            }
        })
        .collect()
}

fn word_positions(words: &[String]) -> Vec<(String, Vec<u32>)> {
    let mut order: Vec<String> = Vec::new();
    let mut map: HashMap<&str, Vec<u32>> = HashMap::new();
    for (i, word) in words.iter().enumerate() {
        if !map.contains_key(word.as_str()) {
            order.push(word.clone());
        }
        map.entry(word.as_str()).or_default().push(i as u32);
    }
    order
        .into_iter()
        .map(|w| {
            let positions = map.remove(w.as_str()).unwrap_or_default();
            (w, positions)
        })
        .collect()
}

fn join_positions(positions: &[u32]) -> String {
    positions
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_positions(value: &IndexKey) -> Vec<u32> {
    match value {
        IndexKey::String(s) => s
            .split(',')
            .filter_map(|part| part.trim().parse::<u32>().ok())
            .collect(),
        _ => Vec::new(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Term {
    Word(String),
    Wildcard(String),
    Phrase(Vec<String>),
}

/// Parses query text into OR-alternatives of required terms.
fn parse_query(def: &IndexDefinition, text: &str) -> Result<Vec<Vec<Term>>> {
    let mut alternatives: Vec<Vec<Term>> = Vec::new();
    let mut current: Vec<Term> = Vec::new();
    let mut chars = text.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '"' {
            chars.next();
            let mut phrase = String::new();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                phrase.push(c);
            }
            let words = tokenize(def, &phrase);
            match words.len() {
                0 => {}
                1 => current.push(Term::Word(words.into_iter().next().unwrap())),
                _ => current.push(Term::Phrase(words)),
            }
            continue;
        }
        let mut token = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() {
                break;
            }
            token.push(c);
            chars.next();
        }
        if token == "OR" {
            if !current.is_empty() {
                alternatives.push(std::mem::take(&mut current));
            }
            continue;
        }
        if token.contains('*') || token.contains('?') {
            let folded = if def.case_sensitive {
                token
            } else {
                token.to_lowercase()
            };
            current.push(Term::Wildcard(folded));
        } else {
            for word in tokenize(def, &token) {
                current.push(Term::Word(word));
            }
        }
    }
    if !current.is_empty() {
        alternatives.push(current);
    }
    if alternatives.is_empty() {
        return Err(IndexError::InvalidArgument(format!(
            "fulltext query {:?} contains no words",
            text
        ))
        .into());
    }
    Ok(alternatives)
}

/// Per-record match info for one word (or wildcard union of words).
#[derive(Debug, Clone)]
struct WordMatches {
    /// record pointer -> positions of the word in that record's text
    records: HashMap<Vec<u8>, Vec<u32>>,
    /// record pointer -> (entry key, value) kept for result assembly
    samples: HashMap<Vec<u8>, (IndexKey, EntryValue)>,
}

fn collect_matches(
    result: TreeSearchResult,
    occurs_at: usize,
) -> WordMatches {
    let mut records: HashMap<Vec<u8>, Vec<u32>> = HashMap::new();
    let mut samples = HashMap::new();
    for entry in result.entries {
        for value in entry.values {
            let positions = value
                .metadata
                .get(occurs_at)
                .map(parse_positions)
                .unwrap_or_default();
            let rp = value.record_pointer.clone();
            records.entry(rp.clone()).or_default().extend(positions);
            samples
                .entry(rp)
                .or_insert_with(|| (entry.key.clone(), value));
        }
    }
    WordMatches { records, samples }
}

impl FullTextIndex {
    fn word_search(
        &self,
        tree: &mut BinaryBTree,
        occurs_at: usize,
        word: &str,
    ) -> Result<WordMatches> {
        let result = tree.search(
            &TreeQuery::Equal(IndexKey::String(word.to_string())),
            &SearchOptions::default(),
        )?;
        Ok(collect_matches(result, occurs_at))
    }

    fn wildcard_search(
        &self,
        tree: &mut BinaryBTree,
        occurs_at: usize,
        pattern: &str,
    ) -> Result<WordMatches> {
        let result = tree.search(
            &TreeQuery::Like(pattern.to_string()),
            &SearchOptions::default(),
        )?;
        Ok(collect_matches(result, occurs_at))
    }

    /// Record pointers matching one alternative, with a sample entry per
    /// record for result assembly.
    fn eval_alternative(
        &self,
        tree: &mut BinaryBTree,
        occurs_at: usize,
        terms: &[Term],
    ) -> Result<WordMatches> {
        // Phrases need every word's positions; fetch matches per phrase
        // word and per standalone term.
        let mut phrases: Vec<Vec<WordMatches>> = Vec::new();
        let mut units: Vec<WordMatches> = Vec::new();
        for term in terms {
            match term {
                Term::Word(w) => units.push(self.word_search(tree, occurs_at, w)?),
                Term::Wildcard(p) => units.push(self.wildcard_search(tree, occurs_at, p)?),
                Term::Phrase(words) => {
                    let mut parts = Vec::with_capacity(words.len());
                    for w in words {
                        parts.push(self.word_search(tree, occurs_at, w)?);
                    }
                    phrases.push(parts);
                }
            }
        }

        // Reduce each phrase to the records where its words run at
        // strictly consecutive positions.
        for parts in &phrases {
            let mut reduced = WordMatches {
                records: HashMap::new(),
                samples: HashMap::new(),
            };
            let first = &parts[0];
            for (rp, first_positions) in &first.records {
                let full_run = first_positions.iter().any(|p| {
                    parts.iter().enumerate().all(|(i, part)| {
                        part.records
                            .get(rp)
                            .map(|pos| pos.contains(&(p + i as u32)))
                            .unwrap_or(false)
                    })
                });
                if full_run {
                    reduced.records.insert(rp.clone(), first_positions.clone());
                    if let Some(sample) = first.samples.get(rp) {
                        reduced.samples.insert(rp.clone(), sample.clone());
                    }
                }
            }
            units.push(reduced);
        }

        // Intersect, smallest candidate set first.
        units.sort_by_key(|u| u.records.len());
        let mut iter = units.into_iter();
        let Some(mut acc) = iter.next() else {
            return Err(IndexError::InvalidArgument("empty fulltext alternative".to_string()).into());
        };
        for unit in iter {
            acc.records.retain(|rp, _| unit.records.contains_key(rp));
            acc.samples.retain(|rp, _| acc.records.contains_key(rp));
            if acc.records.is_empty() {
                break;
            }
        }
        Ok(acc)
    }

    fn contains(
        &self,
        def: &IndexDefinition,
        tree: &mut BinaryBTree,
        occurs_at: usize,
        text: &str,
    ) -> Result<WordMatches> {
        let alternatives = parse_query(def, text)?;
        let mut merged = WordMatches {
            records: HashMap::new(),
            samples: HashMap::new(),
        };
        for terms in &alternatives {
            let matched = self.eval_alternative(tree, occurs_at, terms)?;
            for (rp, positions) in matched.records {
                if let Some(sample) = matched.samples.get(&rp) {
                    merged.samples.entry(rp.clone()).or_insert(sample.clone());
                }
                merged.records.entry(rp).or_insert(positions);
            }
        }
        Ok(merged)
    }
}

fn to_result(matches: WordMatches, filter: Option<HashSet<Vec<u8>>>) -> TreeSearchResult {
    let mut entries: Vec<TreeEntry> = Vec::new();
    for (rp, (key, value)) in matches.samples {
        if let Some(filter) = &filter {
            if !filter.contains(&rp) {
                continue;
            }
        }
        entries.push(TreeEntry {
            key,
            values: vec![value],
        });
    }
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    TreeSearchResult { entries }
}

impl IndexStrategy for FullTextIndex {
    fn index_type(&self) -> IndexType {
        IndexType::FullText
    }

    fn extra_metadata_keys(&self) -> &'static [&'static str] {
        &[OCCURS_KEY]
    }

    fn valid_operators(&self) -> &'static [&'static str] {
        &["fulltext:contains", "fulltext:!contains"]
    }

    fn project(
        &self,
        def: &IndexDefinition,
        _child_key: &str,
        value: &NodeValue,
    ) -> Result<Vec<ProjectedEntry>> {
        let Some(NodeValue::String(text)) = value.get(&def.key) else {
            return Ok(Vec::new());
        };
        let words = tokenize(def, text);
        Ok(word_positions(&words)
            .into_iter()
            .map(|(word, positions)| ProjectedEntry {
                key: IndexKey::String(word),
                extra: vec![IndexKey::String(join_positions(&positions))],
            })
            .collect())
    }

    fn query(
        &self,
        def: &IndexDefinition,
        tree: &mut BinaryBTree,
        op: &str,
        value: &QueryValue,
        filter: Option<HashSet<Vec<u8>>>,
    ) -> Result<TreeSearchResult> {
        let QueryValue::Text(text) = value else {
            return Err(IndexError::InvalidArgument(
                "fulltext operators expect query text".to_string(),
            )
            .into());
        };
        let occurs_at = def.include_keys.len();
        match op {
            "fulltext:contains" => {
                let matches = self.contains(def, tree, occurs_at, text)?;
                Ok(to_result(matches, filter))
            }
            "fulltext:!contains" => {
                let matching = self.contains(def, tree, occurs_at, text)?;
                let all = tree.search(&TreeQuery::Exists, &SearchOptions::default())?;
                let mut complement = collect_matches(all, occurs_at);
                complement
                    .samples
                    .retain(|rp, _| !matching.records.contains_key(rp));
                complement
                    .records
                    .retain(|rp, _| complement.samples.contains_key(rp));
                Ok(to_result(complement, filter))
            }
            other => Err(IndexError::InvalidArgument(format!(
                "operator {:?} is not supported by a fulltext index",
                other
            ))
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::PathInfo;

    fn def() -> IndexDefinition {
        IndexDefinition {
            path: PathInfo::parse("messages").unwrap(),
            key: "text".to_string(),
            include_keys: Vec::new(),
            case_sensitive: false,
            locale: "en-us".to_string(),
            index_type: IndexType::FullText,
        }
    }

    #[test]
    fn tokenizer_lowercases_and_keeps_apostrophes() {
        let words = tokenize(&def(), "Don't Panic, really!");
        assert_eq!(words, ["don't", "panic", "really"]);
    }

    #[test]
    fn projection_records_word_positions() {
        let value = NodeValue::object([(
            "text".to_string(),
            NodeValue::String("hello dear world hello".to_string()),
        )]);
        let entries = FullTextIndex.project(&def(), "m1", &value).unwrap();
        assert_eq!(entries.len(), 3);

        let hello = entries
            .iter()
            .find(|e| e.key == IndexKey::String("hello".to_string()))
            .unwrap();
        assert_eq!(hello.extra, vec![IndexKey::String("0,3".to_string())]);
    }

    #[test]
    fn query_parser_handles_phrases_or_and_wildcards() {
        let alts = parse_query(&def(), "cow* OR \"hello dear world\" OR milk sugar").unwrap();
        assert_eq!(alts.len(), 3);
        assert_eq!(alts[0], vec![Term::Wildcard("cow*".to_string())]);
        assert_eq!(
            alts[1],
            vec![Term::Phrase(vec![
                "hello".to_string(),
                "dear".to_string(),
                "world".to_string()
            ])]
        );
        assert_eq!(
            alts[2],
            vec![
                Term::Word("milk".to_string()),
                Term::Word("sugar".to_string())
            ]
        );
    }

    #[test]
    fn empty_query_is_invalid() {
        let err = parse_query(&def(), "  ").unwrap_err();
        assert!(matches!(
            IndexError::from_report(&err),
            Some(IndexError::InvalidArgument(_))
        ));
    }
}
