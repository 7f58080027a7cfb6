//! Query tasks
//!
//! Every pipeline step is a [`QueryTask`]. When a query asks for an
//! explanation, [`run_task`] wraps the task in a [`TrackedTask`] that times
//! it and records the cost; otherwise the task runs bare.

use crate::context::{ExecuteContext, ShardExecuteContext};
use crate::error::Result;
use crate::flow::StorageQueryFlow;
use crate::plan::QueryPlan;
use crate::stats::StatsRecorder;
use roaring::RoaringBitmap;
use rusts_aggregation::SeriesDownSampler;
use rusts_core::{SeriesId, ShardId, TagKeyId, TagValueId, SERIES_ID_WITHOUT_TAGS};
use rusts_index::{
    decode_group_key, GroupingContext, MetadataStore, SeriesSearch, TagFilterResults, TagSearch,
};
use rusts_storage::FilterResultSet;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Series ids of one group, keyed by group key bytes
pub type Groups = HashMap<Vec<u8>, Vec<SeriesId>>;

/// One step of a leaf query
pub trait QueryTask {
    fn run(&mut self) -> Result<()>;

    fn before_run(&mut self) {}

    fn after_run(&mut self) {}

    /// Write the measured cost into the explain stats
    fn record_cost(&self, _stats: &StatsRecorder, _cost: Duration) {}
}

/// Times the wrapped task and records its cost after it ran
pub struct TrackedTask<'a, T: QueryTask + ?Sized> {
    task: &'a mut T,
    stats: &'a StatsRecorder,
    started: Option<Instant>,
}

impl<'a, T: QueryTask + ?Sized> TrackedTask<'a, T> {
    pub fn new(task: &'a mut T, stats: &'a StatsRecorder) -> Self {
        Self {
            task,
            stats,
            started: None,
        }
    }
}

impl<T: QueryTask + ?Sized> QueryTask for TrackedTask<'_, T> {
    fn run(&mut self) -> Result<()> {
        self.task.run()
    }

    fn before_run(&mut self) {
        self.started = Some(Instant::now());
        self.task.before_run();
    }

    fn after_run(&mut self) {
        self.task.after_run();
        if let Some(started) = self.started.take() {
            self.task.record_cost(self.stats, started.elapsed());
        }
    }
}

/// Run a task, tracked when `stats` is present
pub fn run_task<T: QueryTask + ?Sized>(
    task: &mut T,
    stats: Option<&Arc<StatsRecorder>>,
) -> Result<()> {
    match stats {
        Some(stats) => {
            let mut tracked = TrackedTask::new(task, stats);
            tracked.before_run();
            let result = tracked.run();
            tracked.after_run();
            result
        }
        None => task.run(),
    }
}

pub struct PlanTask<'a> {
    ctx: Option<&'a mut ExecuteContext>,
    metadata: &'a dyn MetadataStore,
}

impl<'a> PlanTask<'a> {
    pub fn new(ctx: &'a mut ExecuteContext, metadata: &'a dyn MetadataStore) -> Self {
        Self {
            ctx: Some(ctx),
            metadata,
        }
    }
}

impl QueryTask for PlanTask<'_> {
    fn run(&mut self) -> Result<()> {
        match self.ctx.take() {
            Some(ctx) => QueryPlan::new(ctx, self.metadata).plan(),
            None => Ok(()),
        }
    }

    fn record_cost(&self, stats: &StatsRecorder, cost: Duration) {
        stats.record_plan(cost);
    }
}

/// Resolves the condition's predicates to tag value ids
pub struct TagFilterTask<'a> {
    ctx: &'a ExecuteContext,
    metadata: &'a dyn MetadataStore,
    results: TagFilterResults,
}

impl<'a> TagFilterTask<'a> {
    pub fn new(ctx: &'a ExecuteContext, metadata: &'a dyn MetadataStore) -> Self {
        Self {
            ctx,
            metadata,
            results: TagFilterResults::new(),
        }
    }

    pub fn into_results(self) -> TagFilterResults {
        self.results
    }
}

impl QueryTask for TagFilterTask<'_> {
    fn run(&mut self) -> Result<()> {
        let query = &self.ctx.query;
        self.results = TagSearch::new(
            &query.namespace,
            &query.metric_name,
            query.condition.as_ref(),
            self.metadata,
        )
        .filter()?;
        Ok(())
    }

    fn record_cost(&self, stats: &StatsRecorder, cost: Duration) {
        stats.record_tag_filter(cost);
    }
}

/// Finds the shard's series matching the condition
pub struct SeriesIdsSearchTask<'a> {
    ctx: &'a ExecuteContext,
    shard: &'a mut ShardExecuteContext,
}

impl<'a> SeriesIdsSearchTask<'a> {
    pub fn new(ctx: &'a ExecuteContext, shard: &'a mut ShardExecuteContext) -> Self {
        Self { ctx, shard }
    }
}

impl QueryTask for SeriesIdsSearchTask<'_> {
    fn run(&mut self) -> Result<()> {
        let shard = Arc::clone(&self.shard.shard);
        let filter = shard.series_filter();
        let query = &self.ctx.query;

        let series_ids = if query.has_condition() {
            SeriesSearch::new(
                filter,
                self.ctx.metric_id,
                query.condition.as_ref(),
                self.ctx.tag_filter_results.as_ref(),
            )
            .search()?
        } else {
            let mut series_ids = match filter.series_ids_for_metric(self.ctx.metric_id) {
                Ok(series_ids) => series_ids,
                Err(err) if err.is_not_found() => RoaringBitmap::new(),
                Err(err) => return Err(err.into()),
            };
            // the tag-less series cannot be grouped by any tag
            if !self.ctx.is_grouped() {
                series_ids.insert(SERIES_ID_WITHOUT_TAGS);
            }
            series_ids
        };
        self.shard.series_ids = series_ids;
        Ok(())
    }

    fn record_cost(&self, stats: &StatsRecorder, cost: Duration) {
        stats.record_series_filter(self.shard.shard_id(), cost, self.shard.series_ids.len());
    }
}

/// Filters the shard's data families down to the found series
pub struct FamilyFilterTask<'a> {
    ctx: &'a ExecuteContext,
    shard: &'a mut ShardExecuteContext,
}

impl<'a> FamilyFilterTask<'a> {
    pub fn new(ctx: &'a ExecuteContext, shard: &'a mut ShardExecuteContext) -> Self {
        Self { ctx, shard }
    }
}

impl QueryTask for FamilyFilterTask<'_> {
    fn run(&mut self) -> Result<()> {
        let query = &self.ctx.query;
        let field_ids = self.ctx.field_ids();
        let families = self
            .shard
            .shard
            .families(query.storage_interval, &query.time_range);

        let mut series_ids = RoaringBitmap::new();
        let mut time_segments: BTreeMap<_, Vec<Arc<dyn FilterResultSet>>> = BTreeMap::new();
        for family in families {
            let result_sets =
                match family.filter(self.ctx.metric_id, &self.shard.series_ids, &field_ids) {
                    Ok(result_sets) => result_sets,
                    Err(err) if err.is_not_found() => {
                        debug!("Skipping family {}: {}", family.family_time(), err);
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                };
            for result_set in result_sets {
                series_ids |= result_set.series_ids();
                time_segments
                    .entry(result_set.family_time())
                    .or_default()
                    .push(result_set);
            }
        }

        self.shard.series_ids = series_ids;
        self.shard.time_segments = time_segments;
        Ok(())
    }

    fn record_cost(&self, stats: &StatsRecorder, cost: Duration) {
        stats.record_family_filter(self.shard.shard_id(), cost);
    }
}

/// Resolves the grouping context of a grouped query's shard
pub struct GroupingContextFindTask<'a> {
    ctx: &'a ExecuteContext,
    shard: &'a mut ShardExecuteContext,
}

impl<'a> GroupingContextFindTask<'a> {
    pub fn new(ctx: &'a ExecuteContext, shard: &'a mut ShardExecuteContext) -> Self {
        Self { ctx, shard }
    }
}

impl QueryTask for GroupingContextFindTask<'_> {
    fn run(&mut self) -> Result<()> {
        if !self.ctx.is_grouped() {
            return Ok(());
        }
        let tag_key_ids = self.ctx.group_by_tag_key_ids();
        let found = self
            .shard
            .shard
            .series_filter()
            .grouping_context(&tag_key_ids, &self.shard.series_ids);
        match found {
            Ok(grouping_context) => self.shard.grouping_context = Some(grouping_context),
            Err(err) if err.is_not_found() => {
                debug!("No grouping context on shard {}: {}", self.shard.shard_id(), err);
                self.shard.series_ids.clear();
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    fn record_cost(&self, stats: &StatsRecorder, cost: Duration) {
        stats.record_grouping_context(self.shard.shard_id(), cost);
    }
}

/// Splits one batch of series into groups
pub struct BuildGroupTask<'a> {
    ctx: &'a ExecuteContext,
    shard_id: ShardId,
    grouping_context: Option<&'a dyn GroupingContext>,
    series_ids: &'a [SeriesId],
    groups: Groups,
}

impl<'a> BuildGroupTask<'a> {
    pub fn new(
        ctx: &'a ExecuteContext,
        shard_id: ShardId,
        grouping_context: Option<&'a dyn GroupingContext>,
        series_ids: &'a [SeriesId],
    ) -> Self {
        Self {
            ctx,
            shard_id,
            grouping_context,
            series_ids,
            groups: Groups::new(),
        }
    }

    pub fn into_groups(self) -> Groups {
        self.groups
    }

    fn collect_tag_value_ids(&self) {
        let slots = &self.ctx.group_by_tag_value_ids;
        let mut found = vec![RoaringBitmap::new(); slots.len()];
        for key in self.groups.keys() {
            for (index, id) in decode_group_key(key).into_iter().enumerate() {
                if let Some(ids) = found.get_mut(index) {
                    ids.insert(id);
                }
            }
        }
        for (slot, ids) in slots.iter().zip(found) {
            if !ids.is_empty() {
                *slot.lock() |= ids;
            }
        }
    }
}

impl QueryTask for BuildGroupTask<'_> {
    fn run(&mut self) -> Result<()> {
        match self.grouping_context {
            Some(grouping_context) if self.ctx.is_grouped() => {
                self.groups = grouping_context.build_group(self.series_ids)?;
                self.collect_tag_value_ids();
            }
            _ => {
                if !self.series_ids.is_empty() {
                    self.groups.insert(Vec::new(), self.series_ids.to_vec());
                }
            }
        }
        Ok(())
    }

    fn record_cost(&self, stats: &StatsRecorder, cost: Duration) {
        stats.record_build_group(self.shard_id, cost);
    }
}

/// Loads one time segment of grouped series and reduces it into the flow
pub struct DataLoadTask<'a> {
    ctx: &'a ExecuteContext,
    flow: &'a StorageQueryFlow,
    shard_id: ShardId,
    segment: &'a dyn FilterResultSet,
    groups: &'a Groups,
}

impl<'a> DataLoadTask<'a> {
    pub fn new(
        ctx: &'a ExecuteContext,
        flow: &'a StorageQueryFlow,
        shard_id: ShardId,
        segment: &'a dyn FilterResultSet,
        groups: &'a Groups,
    ) -> Self {
        Self {
            ctx,
            flow,
            shard_id,
            segment,
            groups,
        }
    }
}

impl QueryTask for DataLoadTask<'_> {
    fn run(&mut self) -> Result<()> {
        let mut group_of: HashMap<SeriesId, &[u8]> = HashMap::new();
        for (group_key, series_ids) in self.groups {
            for series_id in series_ids {
                group_of.insert(*series_id, group_key.as_slice());
            }
        }
        let mut series_ids: Vec<SeriesId> = group_of.keys().copied().collect();
        series_ids.sort_unstable();

        let window = self.ctx.window()?;
        let field_ids = self.ctx.field_ids();
        let family_time = self.segment.family_time();
        let mut sampler = SeriesDownSampler::new(&window, &self.ctx.down_sampling_specs);
        self.segment.load(&series_ids, &field_ids, &mut |series_id, field_id, points| {
            for point in points {
                sampler.accept(series_id, field_id, family_time, point.slot, point.value);
            }
        })?;

        for (series_id, fields) in sampler.into_series() {
            if let Some(group_key) = group_of.get(&series_id) {
                self.flow.reduce(group_key, &fields);
            }
        }
        Ok(())
    }

    fn record_cost(&self, stats: &StatsRecorder, cost: Duration) {
        stats.record_data_load(self.shard_id, &self.segment.identifier(), cost);
    }
}

/// Resolves display strings of one group-by tag key
pub struct CollectTagValuesTask<'a> {
    metadata: &'a dyn MetadataStore,
    tag_key_id: TagKeyId,
    tag_value_ids: &'a RoaringBitmap,
    values: Option<HashMap<TagValueId, String>>,
}

impl<'a> CollectTagValuesTask<'a> {
    pub fn new(
        metadata: &'a dyn MetadataStore,
        tag_key_id: TagKeyId,
        tag_value_ids: &'a RoaringBitmap,
    ) -> Self {
        Self {
            metadata,
            tag_key_id,
            tag_value_ids,
            values: None,
        }
    }

    pub fn into_values(self) -> Option<HashMap<TagValueId, String>> {
        self.values
    }
}

impl QueryTask for CollectTagValuesTask<'_> {
    fn run(&mut self) -> Result<()> {
        match self
            .metadata
            .collect_tag_values(self.tag_key_id, self.tag_value_ids)
        {
            Ok(values) => self.values = Some(values),
            Err(err) if err.is_not_found() => self.values = None,
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    fn record_cost(&self, stats: &StatsRecorder, cost: Duration) {
        stats.record_collect_tag_values(cost);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueryError;
    use crate::stmt::Query;
    use parking_lot::Mutex;
    use rusts_core::{FieldType, TagKeyMeta};
    use rusts_index::{group_key, MemoryMetadata};
    use rusts_storage::{MemoryShard, Shard};

    struct CountingTask {
        runs: usize,
        hooks: Vec<&'static str>,
        fail: bool,
    }

    impl QueryTask for CountingTask {
        fn run(&mut self) -> Result<()> {
            self.runs += 1;
            self.hooks.push("run");
            if self.fail {
                return Err(QueryError::InvalidQuery("fail".to_string()));
            }
            Ok(())
        }

        fn before_run(&mut self) {
            self.hooks.push("before");
        }

        fn after_run(&mut self) {
            self.hooks.push("after");
        }

        fn record_cost(&self, stats: &StatsRecorder, cost: Duration) {
            stats.record_plan(cost.max(Duration::from_nanos(1)));
        }
    }

    fn counting(fail: bool) -> CountingTask {
        CountingTask {
            runs: 0,
            hooks: Vec::new(),
            fail,
        }
    }

    #[test]
    fn test_untracked_task_skips_hooks() {
        let mut task = counting(false);
        run_task(&mut task, None).unwrap();
        assert_eq!(task.runs, 1);
        assert_eq!(task.hooks, vec!["run"]);
    }

    #[test]
    fn test_tracked_task_records_cost_even_on_error() {
        let stats = Arc::new(StatsRecorder::new("leaf"));
        let mut task = counting(true);
        assert!(run_task(&mut task, Some(&stats)).is_err());
        assert_eq!(task.hooks, vec!["before", "run", "after"]);
        assert!(stats.snapshot().plan_cost > 0);
    }

    fn shard() -> Arc<MemoryShard> {
        let shard = MemoryShard::new(1, 10_000, 3_600_000).unwrap();
        shard.index().index_series(1, 1, &[(1, 1)]);
        shard.index().index_series(2, 1, &[(1, 2)]);
        Arc::new(shard)
    }

    fn context(group_by: bool) -> ExecuteContext {
        let mut builder = Query::builder("cpu").time_range(0, 60_000).select_field("usage");
        if group_by {
            builder = builder.group_by_tags(["host"]);
        }
        let mut ctx = ExecuteContext::new("t", builder.build().unwrap(), vec![1], None);
        ctx.metric_id = 1;
        if group_by {
            ctx.group_by = vec![TagKeyMeta::new(1, "host")];
            ctx.group_by_tag_value_ids = vec![Mutex::new(RoaringBitmap::new())];
        }
        ctx
    }

    #[test]
    fn test_series_search_without_condition() {
        let shard: Arc<dyn Shard> = shard();

        let ctx = context(false);
        let mut shard_ctx = ShardExecuteContext::new(Arc::clone(&shard));
        run_task(&mut SeriesIdsSearchTask::new(&ctx, &mut shard_ctx), None).unwrap();
        assert_eq!(shard_ctx.series_ids.iter().collect::<Vec<_>>(), vec![0, 1, 2]);

        let ctx = context(true);
        let mut shard_ctx = ShardExecuteContext::new(shard);
        run_task(&mut SeriesIdsSearchTask::new(&ctx, &mut shard_ctx), None).unwrap();
        assert_eq!(shard_ctx.series_ids.iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_series_search_unknown_metric_is_empty_for_grouped() {
        let shard: Arc<dyn Shard> = shard();
        let mut ctx = context(true);
        ctx.metric_id = 42;
        let mut shard_ctx = ShardExecuteContext::new(shard);
        run_task(&mut SeriesIdsSearchTask::new(&ctx, &mut shard_ctx), None).unwrap();
        assert!(shard_ctx.series_ids.is_empty());
    }

    #[test]
    fn test_build_group_without_grouping() {
        let ctx = context(false);
        let series_ids = [0, 1, 2];
        let mut task = BuildGroupTask::new(&ctx, 1, None, &series_ids);
        run_task(&mut task, None).unwrap();
        let groups = task.into_groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[&Vec::new()], vec![0, 1, 2]);
    }

    #[test]
    fn test_build_group_collects_tag_value_ids() {
        let shard = shard();
        let ctx = context(true);
        let series_ids: RoaringBitmap = [1u32, 2].into_iter().collect();
        let grouping = shard
            .series_filter()
            .grouping_context(&[1], &series_ids)
            .unwrap();

        let batch = [1, 2];
        let mut task = BuildGroupTask::new(&ctx, 1, Some(grouping.as_ref()), &batch);
        run_task(&mut task, None).unwrap();
        let groups = task.into_groups();
        assert_eq!(groups[&group_key(&[1])], vec![1]);
        assert_eq!(groups[&group_key(&[2])], vec![2]);
        assert_eq!(
            ctx.group_by_tag_value_ids[0].lock().iter().collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn test_collect_tag_values() {
        let metadata = MemoryMetadata::new();
        metadata.register_field("ns", "cpu", "usage", FieldType::Sum);
        let host = metadata.register_tag_key("ns", "cpu", "host");
        let h1 = metadata.register_tag_value(host, "h1");
        metadata.register_tag_value(host, "h2");

        let ids: RoaringBitmap = [h1].into_iter().collect();
        let stats = Arc::new(StatsRecorder::new("leaf"));
        let mut task = CollectTagValuesTask::new(&metadata, host, &ids);
        run_task(&mut task, Some(&stats)).unwrap();
        let values = task.into_values().unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[&h1], "h1");
    }
}
