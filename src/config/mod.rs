//! # Configuration Module
//!
//! Centralizes the tunable constants of the index engine. Constants with
//! interdependencies live next to each other and the relationships are
//! documented and enforced with compile-time assertions.
//!
//! On-disk format widths (1-byte entry counts, 6-byte node pointers) are
//! *not* configuration; they are fixed by the file format and live in the
//! modules that read and write those bytes.

pub mod constants;
pub use constants::*;
