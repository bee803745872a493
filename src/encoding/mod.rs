//! # Key and Pointer Encoding
//!
//! Everything stored inside a tree node is either an indexed key or a
//! record pointer, and both have a compact typed byte encoding:
//!
//! - [`key`]: the scalar key codec (type tag + payload) and the total key
//!   order shared by leaf sorting, tree search, and the external sort.
//! - [`pointer`]: the record-pointer codec: wildcard bindings plus child
//!   key, enough to reconstruct the absolute path of the indexed record.

pub mod key;
pub mod pointer;

pub use key::IndexKey;
pub use pointer::RecordPointer;
