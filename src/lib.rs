#![warn(missing_docs)]
#![doc = include_str!("../README.md")]

/// A key-value map over the offset-indexed Robin Hood table.
///
/// This module provides a `HashMap` that wraps the `HashTable` and owns a
/// configurable hasher, plus the `CountMap` alias used for k-mer counting.
pub mod hash_map;

pub mod hash_table;

pub mod hll;

pub mod reducer;

pub use hash_map::CountMap;
pub use hash_map::HashMap;
pub use hash_table::AllocError;
pub use hash_table::HashTable;
pub use hll::HyperLogLog;
pub use reducer::DiscardReducer;
pub use reducer::PlusReducer;
pub use reducer::Reducer;
pub use reducer::ReplaceReducer;
