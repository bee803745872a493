//! # pathidx - Secondary Index Engine for Hierarchical Data
//!
//! pathidx is the secondary-indexing subsystem of a schemaless realtime
//! database: persistent on-disk B+trees that accelerate filtered and
//! sorted queries over deeply nested, path-addressed JSON-like data.
//! This crate prioritizes:
//!
//! - **Bounded memory**: datasets larger than RAM build through an
//!   external merge sort; queries stream the leaf chain
//! - **One tree, four indexes**: normal, array, fulltext and geo indexes
//!   are projections onto the same binary tree format
//! - **In-place maintenance**: updates rewrite single leaves; only when
//!   in-place growth is exhausted does the tree rebuild wholesale
//!
//! ## Quick Start
//!
//! ```ignore
//! use pathidx::index::{DataIndex, IndexDefinition, IndexType, QueryValue};
//! use pathidx::path::PathInfo;
//!
//! let index = DataIndex::new(dir, IndexDefinition {
//!     path: PathInfo::parse("users/*/posts")?,
//!     key: "date".to_string(),
//!     include_keys: vec!["title".to_string()],
//!     case_sensitive: false,
//!     locale: "en-us".to_string(),
//!     index_type: IndexType::Normal,
//! });
//!
//! index.build(&store)?;
//! let results = index.query(">=", QueryValue::from(1_700_000_000_000i64))?;
//! for hit in &results.results {
//!     println!("{} -> {:?}", hit.path, hit.metadata.get("title"));
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │   Query Front-End (ops, cache, locks)    │
//! ├──────────────────────────────────────────┤
//! │  Index Types: normal │ array │ ft │ geo  │
//! ├──────────────────────────────────────────┤
//! │   Envelope Header │ Build Pipeline       │
//! ├──────────────────────────────────────────┤
//! │        Binary B+Tree (tree region)       │
//! ├──────────────────────────────────────────┤
//! │   Key/Pointer Codec │ Buffered File I/O  │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! One file per index, envelope first, tree region block-aligned after
//! it. Builds stage through sibling scratch files and commit by rename:
//!
//! ```text
//! database_dir/
//! ├── users-#-posts-date.idx          # live index
//! ├── users-#-posts-date.idx.build    # stage A raw records
//! ├── users-#-posts-date.idx.build.0  # stage B sorted runs
//! ├── users-#-posts-date.idx.build.merge
//! └── users-#-posts-date.idx.tmp      # stage D staging, renamed on commit
//! ```
//!
//! ## Module Overview
//!
//! - [`io`]: chunk-buffered reader, append/patch writer
//! - [`encoding`]: typed key codec, total key order, record pointers
//! - [`btree`]: the on-disk tree: search, mutate, bulk build, rebuild
//! - [`index`]: envelope, index types, query cache, locking
//! - [`build`]: external merge-sort build pipeline
//! - [`store`]: the primary-store trait this crate consumes
//! - [`path`]: wildcard path parsing and matching

#[macro_use]
mod macros;

pub mod btree;
pub mod build;
pub mod config;
pub mod encoding;
pub mod error;
pub mod index;
pub mod io;
pub mod path;
pub mod store;

pub use error::IndexError;
pub use index::{DataIndex, IndexDefinition, IndexQueryResult, IndexQueryResults, IndexType, QueryValue};
pub use store::{MemoryStore, NodeStore, NodeValue};
