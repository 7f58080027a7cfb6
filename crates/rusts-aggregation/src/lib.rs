//! RusTs Aggregation - down-sampling and grouping aggregation
//!
//! This crate provides:
//! - Per-field aggregation specs
//! - The query time window and its buckets
//! - Series down-sampling from storage slots
//! - The grouping aggregator shared by a query's tasks

pub mod aggregator;
pub mod downsample;
pub mod error;
pub mod spec;
pub mod window;

pub use aggregator::{FieldResult, GroupResult, GroupingAggregator};
pub use downsample::{Points, SeriesDownSampler, SeriesFields};
pub use error::{AggregationError, Result};
pub use spec::AggregatorSpec;
pub use window::TimeWindow;
