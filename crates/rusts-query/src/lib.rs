//! RusTs Query - leaf-tier storage query engine
//!
//! This crate provides the part of a distributed query that runs on the
//! storage node holding the data:
//! - Query planning: metric, group-by and field resolution
//! - Tag filtering and per-shard series search
//! - Staged execution on three worker pools (filtering, grouping, scanner)
//! - Down-sampling and grouping aggregation of the loaded data
//! - Response dispatch to one or more downstream receivers

pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod flow;
pub mod plan;
pub mod pool;
pub mod rpc;
pub mod stats;
pub mod stmt;
pub mod task;
pub mod track;

pub use config::LeafConfig;
pub use context::{ExecuteContext, QueryContext, ShardExecuteContext};
pub use error::{QueryError, Result};
pub use executor::StorageExecutor;
pub use flow::StorageQueryFlow;
pub use plan::QueryPlan;
pub use pool::{ExecutePools, Stage};
pub use rpc::{
    FieldSeries, MemoryStreamFactory, ResponseStream, StreamFactory, TaskRequest, TaskResponse,
    TimeSeries, TimeSeriesList, NULL_TAG_VALUE, TAG_SEPARATOR,
};
pub use stats::{ExplainStats, SegmentStats, ShardStats, StatsRecorder};
pub use stmt::{Expr, Query, QueryBuilder, SelectItem};
pub use task::QueryTask;
pub use track::GroupingExecuteTrack;
