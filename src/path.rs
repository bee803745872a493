//! # Wildcard Paths
//!
//! Index paths address collections in the hierarchical store and may
//! contain `*` segments: `users/*/posts` indexes every user's posts
//! collection. [`PathInfo`] parses such a path once and answers the
//! questions the rest of the engine asks of it: how many wildcards, does a
//! concrete path match, and what does the path look like with bindings
//! substituted back in.

use eyre::{ensure, Result};
use smallvec::SmallVec;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Literal(String),
    Wildcard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathInfo {
    source: String,
    segments: Vec<PathSegment>,
}

impl PathInfo {
    pub fn parse(path: &str) -> Result<Self> {
        let trimmed = path.trim_matches('/');
        let mut segments = Vec::new();
        if !trimmed.is_empty() {
            for seg in trimmed.split('/') {
                ensure!(!seg.is_empty(), "empty segment in path {:?}", path);
                if seg == "*" {
                    segments.push(PathSegment::Wildcard);
                } else {
                    ensure!(
                        !seg.contains('*'),
                        "wildcard must be a whole segment in path {:?}",
                        path
                    );
                    segments.push(PathSegment::Literal(seg.to_string()));
                }
            }
        }
        Ok(Self {
            source: trimmed.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn wildcard_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, PathSegment::Wildcard))
            .count()
    }

    /// Substitutes wildcard bindings, in order, into the path. Bindings
    /// beyond the wildcard count are ignored; missing bindings leave the
    /// `*` in place.
    pub fn expand(&self, bindings: &[String]) -> String {
        let mut out = String::with_capacity(self.source.len());
        let mut next = 0;
        for (i, seg) in self.segments.iter().enumerate() {
            if i > 0 {
                out.push('/');
            }
            match seg {
                PathSegment::Literal(s) => out.push_str(s),
                PathSegment::Wildcard => match bindings.get(next) {
                    Some(b) => {
                        out.push_str(b);
                        next += 1;
                    }
                    None => out.push('*'),
                },
            }
        }
        out
    }

    /// Matches a concrete *record* path (index path plus one trailing key
    /// segment), returning the wildcard bindings and the record key.
    pub fn match_record_path(&self, path: &str) -> Option<(SmallVec<[String; 2]>, String)> {
        let trimmed = path.trim_matches('/');
        let parts: Vec<&str> = if trimmed.is_empty() {
            Vec::new()
        } else {
            trimmed.split('/').collect()
        };
        if parts.len() != self.segments.len() + 1 {
            return None;
        }
        let mut bindings = SmallVec::new();
        for (seg, part) in self.segments.iter().zip(parts.iter()) {
            match seg {
                PathSegment::Literal(s) => {
                    if s != part {
                        return None;
                    }
                }
                PathSegment::Wildcard => bindings.push((*part).to_string()),
            }
        }
        Some((bindings, parts[self.segments.len()].to_string()))
    }
}

impl std::fmt::Display for PathInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}
