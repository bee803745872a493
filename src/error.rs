//! # Error Taxonomy
//!
//! Most fallible paths in pathidx return `eyre::Result` and attach context
//! with `wrap_err`. The handful of conditions that callers must be able to
//! *recognize* (not just display) are typed here and recovered from an eyre
//! report with [`IndexError::from_report`].
//!
//! ## Recoverable kinds
//!
//! - [`IndexError::Eof`] terminates run readers in the merge stage of the
//!   build pipeline. It never escapes a public API.
//! - [`IndexError::TreeFull`] is raised by the tree when in-place growth
//!   fails; the index layer catches it and rebuilds the whole tree.
//! - [`IndexError::UnsupportedFormat`] surfaces to the caller, who is
//!   expected to rebuild the index from the primary store.
//!
//! Everything else surfaces as-is.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("unsupported index file format: {0}")]
    UnsupportedFormat(String),

    #[error("tree node cannot grow in place")]
    TreeFull,

    #[error("duplicate key in unique tree")]
    DuplicateKey,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unexpected end of file at offset {0}")]
    Eof(u64),

    #[error("record not found: {0}")]
    NotFound(String),
}

impl IndexError {
    /// Extracts a typed index error from an eyre report, if the root cause
    /// is one.
    pub fn from_report(report: &eyre::Report) -> Option<&IndexError> {
        report.downcast_ref::<IndexError>()
    }

    pub fn is_eof(report: &eyre::Report) -> bool {
        matches!(Self::from_report(report), Some(IndexError::Eof(_)))
    }

    pub fn is_tree_full(report: &eyre::Report) -> bool {
        matches!(Self::from_report(report), Some(IndexError::TreeFull))
    }
}
