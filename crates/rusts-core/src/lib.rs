//! RusTs Core - Core types for the leaf query engine
//!
//! This crate provides the fundamental data types shared by the engine:
//! - Identifier aliases (`MetricId`, `TagKeyId`, `SeriesId`, ...)
//! - `TimeRange`: half-open millisecond time ranges
//! - `FieldType` / `FunctionType`: field kinds and aggregate functions
//! - `PoolConfig`: sizing of the per-stage worker pools

pub mod error;
pub mod parallel;
pub mod types;

pub use error::{CoreError, Result};
pub use parallel::PoolConfig;
pub use types::*;
