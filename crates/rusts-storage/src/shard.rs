//! Database and shard collaborators

use crate::family::DataFamily;
use rusts_core::{ShardId, TimeRange};
use rusts_index::{MetadataStore, SeriesFilter};
use std::sync::Arc;

/// Horizontal partition of a database
pub trait Shard: Send + Sync {
    fn id(&self) -> ShardId;

    /// Inverted index of the shard's series
    fn series_filter(&self) -> &dyn SeriesFilter;

    /// Families at `interval` overlapping `time_range`, ordered by family time
    fn families(&self, interval: i64, time_range: &TimeRange) -> Vec<Arc<dyn DataFamily>>;
}

/// A database: shared metadata plus its shards
pub trait Database: Send + Sync {
    fn name(&self) -> &str;

    fn metadata(&self) -> Arc<dyn MetadataStore>;

    fn shard(&self, shard_id: ShardId) -> Option<Arc<dyn Shard>>;

    fn shard_count(&self) -> usize;
}
