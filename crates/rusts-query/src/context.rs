//! Query execution contexts
//!
//! `QueryContext` carries cancellation and deadline for one query.
//! `ExecuteContext` is the per-query state built during planning and read
//! by every task afterwards. `ShardExecuteContext` is the state of one
//! shard moving from filtering to grouping.

use crate::error::{QueryError, Result};
use crate::stats::StatsRecorder;
use crate::stmt::Query;
use parking_lot::Mutex;
use roaring::RoaringBitmap;
use rusts_aggregation::{AggregatorSpec, TimeWindow};
use rusts_core::{FieldMeta, MetricId, SeriesId, ShardId, TagKeyId, TagKeyMeta, Timestamp};
use rusts_index::{GroupingContext, TagFilterResults};
use rusts_storage::{Database, FilterResultSet, Shard};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Cancellation and deadline of one query
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl QueryContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share cancellation with a caller-owned token
    pub fn with_token(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The reason the query must stop, if any
    pub fn err(&self) -> Option<QueryError> {
        if self.cancel.is_cancelled() {
            return Some(QueryError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(QueryError::DeadlineExceeded),
            _ => None,
        }
    }
}

/// Per-query state shared by every task of a leaf query
pub struct ExecuteContext {
    pub task_id: String,
    pub query: Query,
    pub shard_ids: Vec<ShardId>,
    /// Resolved in `prepare`, in request order
    pub shards: Vec<Arc<dyn Shard>>,
    pub metric_id: MetricId,
    /// Selected fields, sorted by field id
    pub fields: Vec<FieldMeta>,
    pub down_sampling_specs: Vec<AggregatorSpec>,
    pub aggregator_specs: Vec<AggregatorSpec>,
    pub group_by: Vec<TagKeyMeta>,
    /// Tag value ids seen while grouping, one slot per group-by key
    pub group_by_tag_value_ids: Vec<Mutex<RoaringBitmap>>,
    pub tag_filter_results: Option<TagFilterResults>,
    pub stats: Option<Arc<StatsRecorder>>,
}

impl ExecuteContext {
    pub fn new(
        task_id: impl Into<String>,
        query: Query,
        shard_ids: Vec<ShardId>,
        stats: Option<Arc<StatsRecorder>>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            query,
            shard_ids,
            shards: Vec::new(),
            metric_id: 0,
            fields: Vec::new(),
            down_sampling_specs: Vec::new(),
            aggregator_specs: Vec::new(),
            group_by: Vec::new(),
            group_by_tag_value_ids: Vec::new(),
            tag_filter_results: None,
            stats,
        }
    }

    /// Validate the request and resolve its shards
    pub fn prepare(&mut self, database: &dyn Database) -> Result<()> {
        if self.shard_ids.is_empty() {
            return Err(QueryError::NoShards("no shard id in request".to_string()));
        }
        if database.shard_count() == 0 {
            return Err(QueryError::NoShards(format!(
                "database '{}' has no shard",
                database.name()
            )));
        }
        self.query.validate()?;

        let mut shards = Vec::with_capacity(self.shard_ids.len());
        let mut missing = Vec::new();
        for shard_id in &self.shard_ids {
            match database.shard(*shard_id) {
                Some(shard) => shards.push(shard),
                None => missing.push(*shard_id),
            }
        }
        if !missing.is_empty() {
            return Err(QueryError::ShardNotFound(missing));
        }
        self.shards = shards;
        Ok(())
    }

    pub fn is_grouped(&self) -> bool {
        !self.group_by.is_empty()
    }

    pub fn group_by_tag_key_ids(&self) -> Vec<TagKeyId> {
        self.group_by.iter().map(|meta| meta.id).collect()
    }

    pub fn field_ids(&self) -> Vec<rusts_core::FieldId> {
        self.fields.iter().map(|field| field.id).collect()
    }

    /// Time window of the query at its storage interval
    pub fn window(&self) -> Result<TimeWindow> {
        Ok(TimeWindow::new(
            self.query.time_range,
            self.query.interval,
            self.query.storage_interval,
        )?)
    }

    pub fn stats(&self) -> Option<&Arc<StatsRecorder>> {
        self.stats.as_ref()
    }
}

/// Bits of a series id that select its batch
const HIGH_KEY_SHIFT: u32 = 16;

/// Filtering and grouping state of one shard
pub struct ShardExecuteContext {
    pub shard: Arc<dyn Shard>,
    pub series_ids: RoaringBitmap,
    /// Filter result sets keyed by family time
    pub time_segments: BTreeMap<Timestamp, Vec<Arc<dyn FilterResultSet>>>,
    pub grouping_context: Option<Arc<dyn GroupingContext>>,
}

impl ShardExecuteContext {
    pub fn new(shard: Arc<dyn Shard>) -> Self {
        Self {
            shard,
            series_ids: RoaringBitmap::new(),
            time_segments: BTreeMap::new(),
            grouping_context: None,
        }
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard.id()
    }

    /// Series ids split by their high 16 bits, ascending
    pub fn batches(&self) -> Vec<Vec<SeriesId>> {
        let mut batches: Vec<Vec<SeriesId>> = Vec::new();
        let mut current_high = None;
        for series_id in &self.series_ids {
            let high = series_id >> HIGH_KEY_SHIFT;
            if current_high != Some(high) {
                batches.push(Vec::new());
                current_high = Some(high);
            }
            if let Some(batch) = batches.last_mut() {
                batch.push(series_id);
            }
        }
        batches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusts_storage::{MemoryDatabase, MemoryShard};

    fn database(shards: &[ShardId]) -> MemoryDatabase {
        let db = MemoryDatabase::new("db");
        for id in shards {
            db.add_shard(MemoryShard::new(*id, 10_000, 3_600_000).unwrap());
        }
        db
    }

    fn context(shard_ids: Vec<ShardId>) -> ExecuteContext {
        let query = Query::builder("cpu").select_field("usage").build().unwrap();
        ExecuteContext::new("task-1", query, shard_ids, None)
    }

    #[test]
    fn test_prepare_resolves_shards() {
        let db = database(&[1, 2, 3]);
        let mut ctx = context(vec![3, 1]);
        ctx.prepare(&db).unwrap();
        let ids: Vec<ShardId> = ctx.shards.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec![3, 1]);
    }

    #[test]
    fn test_prepare_errors() {
        let db = database(&[1]);
        assert!(matches!(context(vec![]).prepare(&db), Err(QueryError::NoShards(_))));
        assert!(matches!(context(vec![1]).prepare(&database(&[])), Err(QueryError::NoShards(_))));
        match context(vec![1, 7, 8]).prepare(&db) {
            Err(QueryError::ShardNotFound(missing)) => assert_eq!(missing, vec![7, 8]),
            other => panic!("unexpected {:?}", other.err()),
        }
    }

    #[test]
    fn test_query_context() {
        let ctx = QueryContext::new();
        assert!(ctx.err().is_none());
        ctx.cancel();
        assert!(matches!(ctx.err(), Some(QueryError::Cancelled)));

        let expired = QueryContext::new().with_deadline(Instant::now() - Duration::from_millis(1));
        assert!(matches!(expired.err(), Some(QueryError::DeadlineExceeded)));

        let token = CancellationToken::new();
        let shared = QueryContext::with_token(token.clone()).with_timeout(Duration::from_secs(60));
        assert!(shared.err().is_none());
        token.cancel();
        assert!(matches!(shared.err(), Some(QueryError::Cancelled)));
    }

    #[test]
    fn test_high_key_batches() {
        let shard: Arc<dyn Shard> = Arc::new(MemoryShard::new(1, 10_000, 3_600_000).unwrap());
        let mut ctx = ShardExecuteContext::new(shard);
        ctx.series_ids = [1u32, 2, 65_535, 65_536, 70_000, 200_000].into_iter().collect();

        let batches = ctx.batches();
        assert_eq!(batches, vec![vec![1, 2, 65_535], vec![65_536, 70_000], vec![200_000]]);
        assert_eq!(ctx.shard_id(), 1);
    }
}
