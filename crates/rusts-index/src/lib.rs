//! RusTs Index - tag filtering and series lookup for the leaf query engine
//!
//! This crate provides:
//! - Tag filter expressions and their canonical rewrite
//! - Collaborator traits for metadata, series filtering and grouping
//! - TagSearch / SeriesSearch: condition tree -> series id bitmap
//! - In-memory reference backends built on Roaring bitmaps

pub mod error;
pub mod expr;
pub mod memory;
pub mod metadata;
pub mod series_search;
pub mod tag_search;

pub use error::{IndexError, Result};
pub use expr::{like_match, BinaryOp, TagFilter};
pub use memory::{MemoryGroupingContext, MemoryIndex, MemoryMetadata};
pub use metadata::{decode_group_key, group_key, GroupingContext, MetadataStore, SeriesFilter};
pub use series_search::SeriesSearch;
pub use tag_search::{TagFilterResult, TagFilterResults, TagSearch};
