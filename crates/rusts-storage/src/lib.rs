//! RusTs Storage - storage collaborators of the leaf query engine
//!
//! This crate provides:
//! - Database / shard traits: shard lookup, metadata and series index
//! - Data family traits: time-bounded filtering and slot loading
//! - In-memory reference storage

pub mod error;
pub mod family;
pub mod memory;
pub mod shard;

pub use error::{Result, StorageError};
pub use family::{DataFamily, FilterResultSet, LoadSink, SlotPoint};
pub use memory::{MemoryDatabase, MemoryFamily, MemoryResultSet, MemoryShard};
pub use shard::{Database, Shard};
