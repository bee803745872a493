//! # Buffered Binary I/O
//!
//! The index engine never maps files into memory; every tree read goes
//! through a chunk-buffered random-access reader and every build streams
//! through an append-mostly writer that supports absolute patching.
//!
//! - [`BinaryReader`]: sequential and random reads over a file with an
//!   internal chunk buffer (default 512 KiB). Reading past the end fails
//!   with a typed `Eof` error so the build pipeline can use it as a
//!   run-termination signal.
//! - [`BinaryWriter`]: the sink trait driven by the tree builder. A build
//!   reserves header space, streams the tree, then patches the header
//!   fields it could not know up front.
//! - [`FileWriter`] / [`BufferWriter`]: the two sink implementations, one
//!   over a file descriptor and one over a growable byte buffer.
//!
//! All multi-byte integers on disk are big-endian.

mod reader;
mod writer;

pub use reader::BinaryReader;
pub use writer::{BinaryWriter, BufferWriter, FileWriter};
