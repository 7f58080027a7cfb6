//! Storage executor
//!
//! Entry point of a leaf query. Planning and tag filtering run on the
//! caller's thread; everything per shard runs on the stage pools, driven
//! through the query's [`StorageQueryFlow`].

use crate::config::LeafConfig;
use crate::context::{ExecuteContext, QueryContext, ShardExecuteContext};
use crate::error::Result;
use crate::flow::StorageQueryFlow;
use crate::pool::{ExecutePools, Stage};
use crate::rpc::{StreamFactory, TaskRequest};
use crate::stats::StatsRecorder;
use crate::task::{
    run_task, BuildGroupTask, DataLoadTask, FamilyFilterTask, GroupingContextFindTask, PlanTask,
    SeriesIdsSearchTask, TagFilterTask,
};
use crate::track::GroupingExecuteTrack;
use rusts_core::SeriesId;
use rusts_storage::{Database, Shard};
use std::sync::Arc;
use tracing::{debug, info};

/// Executes leaf tasks against one database
pub struct StorageExecutor {
    database: Arc<dyn Database>,
    pools: Arc<ExecutePools>,
    streams: Arc<dyn StreamFactory>,
    config: LeafConfig,
}

impl StorageExecutor {
    pub fn new(
        database: Arc<dyn Database>,
        pools: Arc<ExecutePools>,
        streams: Arc<dyn StreamFactory>,
        config: LeafConfig,
    ) -> Self {
        Self {
            database,
            pools,
            streams,
            config,
        }
    }

    /// Build the stage pools from the configuration
    pub fn with_config(
        database: Arc<dyn Database>,
        streams: Arc<dyn StreamFactory>,
        config: LeafConfig,
    ) -> Result<Self> {
        config.validate()?;
        let pools = Arc::new(ExecutePools::new(&config.pools)?);
        Ok(Self::new(database, pools, streams, config))
    }

    pub fn config(&self) -> &LeafConfig {
        &self.config
    }

    /// Execute a leaf task.
    ///
    /// Returns right away; the outcome, result or error, reaches the
    /// request's receivers through the response streams.
    pub fn execute(&self, request: TaskRequest, query_ctx: QueryContext) {
        let query_ctx = match (query_ctx.deadline(), self.config.query_timeout()) {
            (None, Some(timeout)) => query_ctx.with_timeout(timeout),
            _ => query_ctx,
        };
        let TaskRequest {
            task_id,
            query,
            shard_ids,
            receivers,
        } = request;
        info!(
            "Executing task {} on {} shards of database {}",
            task_id,
            shard_ids.len(),
            self.database.name()
        );

        let stats = query
            .explain
            .then(|| Arc::new(StatsRecorder::new(self.config.node.clone())));
        let flow = StorageQueryFlow::new(
            task_id.clone(),
            receivers,
            query_ctx,
            Arc::clone(&self.pools),
            Arc::clone(&self.streams),
            &self.config,
            stats.clone(),
        );
        let mut ctx = ExecuteContext::new(task_id, query, shard_ids, stats);

        match self.plan(&mut ctx) {
            Ok(true) => {}
            Ok(false) => {
                debug!("Task {} matched no series", ctx.task_id);
                flow.describe(&ctx);
                flow.complete(Ok(()));
                return;
            }
            Err(err) => {
                flow.complete(Err(err));
                return;
            }
        }

        let ctx = Arc::new(ctx);
        if let Err(err) = flow.prepare(&ctx) {
            flow.complete(Err(err));
            return;
        }

        let track = GroupingExecuteTrack::new(
            Arc::clone(&flow),
            Arc::clone(&ctx),
            self.database.metadata(),
        );
        // the fan-out is a tracked task itself, so nothing completes before
        // every shard is submitted
        let launcher = Arc::clone(&track);
        track.submit(Stage::Filtering, move || {
            for shard in &ctx.shards {
                let (track, ctx, shard) =
                    (Arc::clone(&launcher), Arc::clone(&ctx), Arc::clone(shard));
                launcher.submit(Stage::Filtering, move || filter_shard(track, ctx, shard));
            }
            Ok(())
        });
    }

    /// Validate, plan and filter tags; `false` when no series can match
    fn plan(&self, ctx: &mut ExecuteContext) -> Result<bool> {
        ctx.prepare(self.database.as_ref())?;

        let metadata = self.database.metadata();
        let stats = ctx.stats.clone();
        run_task(&mut PlanTask::new(ctx, metadata.as_ref()), stats.as_ref())?;

        if !ctx.query.has_condition() {
            return Ok(true);
        }
        let mut task = TagFilterTask::new(ctx, metadata.as_ref());
        match run_task(&mut task, stats.as_ref()) {
            Ok(()) => {}
            Err(err) if err.is_not_found() => return Ok(false),
            Err(err) => return Err(err),
        }
        let results = task.into_results();
        if results.is_empty() {
            return Ok(false);
        }
        ctx.tag_filter_results = Some(results);
        Ok(true)
    }
}

/// Filtering stage of one shard: series search, then family filter
fn filter_shard(
    track: Arc<GroupingExecuteTrack>,
    ctx: Arc<ExecuteContext>,
    shard: Arc<dyn Shard>,
) -> Result<()> {
    let mut shard_ctx = ShardExecuteContext::new(shard);

    run_task(&mut SeriesIdsSearchTask::new(&ctx, &mut shard_ctx), ctx.stats())?;
    if shard_ctx.series_ids.is_empty() {
        debug!("Shard {} has no matching series", shard_ctx.shard_id());
        return Ok(());
    }

    run_task(&mut FamilyFilterTask::new(&ctx, &mut shard_ctx), ctx.stats())?;
    if shard_ctx.series_ids.is_empty() || shard_ctx.time_segments.is_empty() {
        debug!("Shard {} has no data in range", shard_ctx.shard_id());
        return Ok(());
    }

    let next = Arc::clone(&track);
    track.submit(Stage::Grouping, move || group_shard(next, ctx, shard_ctx));
    Ok(())
}

/// Grouping stage of one shard: one build-group task per high-key batch
fn group_shard(
    track: Arc<GroupingExecuteTrack>,
    ctx: Arc<ExecuteContext>,
    mut shard_ctx: ShardExecuteContext,
) -> Result<()> {
    run_task(&mut GroupingContextFindTask::new(&ctx, &mut shard_ctx), ctx.stats())?;
    if shard_ctx.series_ids.is_empty() {
        return Ok(());
    }

    let shard_ctx = Arc::new(shard_ctx);
    for batch in shard_ctx.batches() {
        let (next, ctx, shard_ctx) = (Arc::clone(&track), Arc::clone(&ctx), Arc::clone(&shard_ctx));
        track.submit(Stage::Grouping, move || build_group(next, ctx, shard_ctx, batch));
    }
    Ok(())
}

/// Group one batch, then load it from every time segment
fn build_group(
    track: Arc<GroupingExecuteTrack>,
    ctx: Arc<ExecuteContext>,
    shard_ctx: Arc<ShardExecuteContext>,
    batch: Vec<SeriesId>,
) -> Result<()> {
    let shard_id = shard_ctx.shard_id();
    let grouping = shard_ctx.grouping_context.as_deref();
    let mut task = BuildGroupTask::new(&ctx, shard_id, grouping, &batch);
    run_task(&mut task, ctx.stats())?;
    let groups = Arc::new(task.into_groups());
    if groups.is_empty() {
        return Ok(());
    }

    let flow = track.flow();
    for segment in shard_ctx.time_segments.values().flatten() {
        let (load_flow, ctx, segment, groups) =
            (Arc::clone(flow), Arc::clone(&ctx), Arc::clone(segment), Arc::clone(&groups));
        flow.submit(Stage::Scanner, move || {
            let mut task = DataLoadTask::new(&ctx, &load_flow, shard_id, segment.as_ref(), &groups);
            run_task(&mut task, ctx.stats())
        });
    }
    Ok(())
}
