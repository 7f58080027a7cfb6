//! Storage query flow
//!
//! Owns the lifecycle of one leaf query: tasks are submitted to the stage
//! pools through the flow, which tracks them as pending. Whoever finishes
//! the last pending task completes the flow, exactly once, and sends the
//! aggregated result (or the first error) to every receiver.

use crate::config::LeafConfig;
use crate::context::{ExecuteContext, QueryContext};
use crate::error::{QueryError, Result};
use crate::pool::{run_guarded, ExecutePools, Stage};
use crate::rpc::{
    partition, FieldSeries, StreamFactory, TaskResponse, TimeSeries, TimeSeriesList,
    NULL_TAG_VALUE, TAG_SEPARATOR,
};
use crate::stats::StatsRecorder;
use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use rusts_aggregation::{GroupingAggregator, SeriesFields};
use rusts_core::TagValueId;
use rusts_index::decode_group_key;
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Wake, Waker};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// One-shot latch released when every tag value slot is resolved.
///
/// Also a waker: registered on the query's cancellation token, a cancel
/// interrupts a pending wait.
struct Signal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

#[derive(Default)]
struct SignalState {
    fired: bool,
    interrupted: bool,
}

impl Signal {
    fn new() -> Self {
        Self {
            state: Mutex::new(SignalState::default()),
            cond: Condvar::new(),
        }
    }

    /// Returns false if the signal had already fired
    fn fire(&self) -> bool {
        let mut state = self.state.lock();
        if state.fired {
            return false;
        }
        state.fired = true;
        self.cond.notify_all();
        true
    }

    fn is_fired(&self) -> bool {
        self.state.lock().fired
    }

    /// Blocks until fired, interrupted or `deadline`; true once fired
    fn wait(&self, deadline: Option<Instant>) -> bool {
        let mut state = self.state.lock();
        while !state.fired && !state.interrupted {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
        state.interrupted = false;
        state.fired
    }
}

impl Wake for Signal {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.interrupted = true;
        self.cond.notify_all();
    }
}

struct FlowState {
    /// Running tasks by task id
    pending: HashMap<u64, Stage>,
    /// Taken on completion; `None` before prepare
    aggregator: Option<GroupingAggregator>,
    prepared: bool,
    group_by: Vec<String>,
    fields: Vec<String>,
    tag_values: Vec<Option<HashMap<TagValueId, String>>>,
    resolved: Vec<bool>,
    remaining: usize,
    /// Group key bytes -> tag string
    tag_cache: LruCache<Vec<u8>, String>,
    error: Option<String>,
}

/// Execution flow of one leaf query
pub struct StorageQueryFlow {
    task_id: String,
    node: String,
    receivers: Vec<String>,
    query_ctx: QueryContext,
    pools: Arc<ExecutePools>,
    streams: Arc<dyn StreamFactory>,
    stats: Option<Arc<StatsRecorder>>,
    completed: AtomicBool,
    task_seq: AtomicU64,
    signal: Arc<Signal>,
    state: Mutex<FlowState>,
}

impl StorageQueryFlow {
    pub fn new(
        task_id: impl Into<String>,
        receivers: Vec<String>,
        query_ctx: QueryContext,
        pools: Arc<ExecutePools>,
        streams: Arc<dyn StreamFactory>,
        config: &LeafConfig,
        stats: Option<Arc<StatsRecorder>>,
    ) -> Arc<Self> {
        let capacity =
            NonZeroUsize::new(config.tag_value_cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Arc::new(Self {
            task_id: task_id.into(),
            node: config.node.clone(),
            receivers,
            query_ctx,
            pools,
            streams,
            stats,
            completed: AtomicBool::new(false),
            task_seq: AtomicU64::new(0),
            signal: Arc::new(Signal::new()),
            state: Mutex::new(FlowState {
                pending: HashMap::new(),
                aggregator: None,
                prepared: false,
                group_by: Vec::new(),
                fields: Vec::new(),
                tag_values: Vec::new(),
                resolved: Vec::new(),
                remaining: 0,
                tag_cache: LruCache::new(capacity),
                error: None,
            }),
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn query_context(&self) -> &QueryContext {
        &self.query_ctx
    }

    /// Record the result columns of a planned query; a flow completed
    /// without `prepare` still answers with them
    pub fn describe(&self, ctx: &ExecuteContext) {
        let mut state = self.state.lock();
        state.group_by = ctx.group_by.iter().map(|key| key.key.clone()).collect();
        state.fields = ctx.fields.iter().map(|field| field.name.clone()).collect();
    }

    /// Build the aggregator and the tag value slots of a planned query
    pub fn prepare(&self, ctx: &ExecuteContext) -> Result<()> {
        let aggregator = GroupingAggregator::new(ctx.window()?, ctx.aggregator_specs.clone())?;
        let slots = ctx.group_by.len();
        self.describe(ctx);
        {
            let mut state = self.state.lock();
            state.aggregator = Some(aggregator);
            state.prepared = true;
            state.tag_values = vec![None; slots];
            state.resolved = vec![false; slots];
            state.remaining = slots;
        }
        if slots == 0 {
            self.signal.fire();
        }
        Ok(())
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Whether every tag value slot has been resolved
    pub fn tag_values_resolved(&self) -> bool {
        self.signal.is_fired()
    }

    /// Tasks submitted and not finished yet
    pub fn pending_tasks(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Failure recorded while completing, if any
    pub fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    /// Run `task` on the stage's pool as a pending task of this flow.
    ///
    /// Does nothing once the flow is completed. A cancelled query completes
    /// the flow instead of submitting.
    pub fn submit<F>(self: &Arc<Self>, stage: Stage, task: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        if self.is_completed() {
            debug!("Flow {} completed, dropping {} task", self.task_id, stage);
            return;
        }
        if let Some(err) = self.query_ctx.err() {
            self.complete(Err(err));
            return;
        }

        let task_id = self.task_seq.fetch_add(1, Ordering::Relaxed);
        self.state.lock().pending.insert(task_id, stage);

        let flow = Arc::clone(self);
        self.pools.spawn(stage, move || {
            let result = if flow.is_completed() {
                Ok(())
            } else if let Some(err) = flow.query_ctx.err() {
                Err(err)
            } else {
                run_guarded(task)
            };
            if let Err(err) = result {
                if let QueryError::TaskPanic(ref message) = err {
                    error!("Task {} of flow {} panicked: {}", stage, flow.task_id, message);
                }
                flow.complete(Err(err));
            }
            flow.complete_task(task_id);
        });
    }

    /// Merge one down-sampled series into its group
    pub fn reduce(&self, group_key: &[u8], series: &SeriesFields) {
        if self.is_completed() {
            warn!("Flow {} completed, dropping reduce", self.task_id);
            return;
        }
        let mut state = self.state.lock();
        match state.aggregator.as_mut() {
            Some(aggregator) => aggregator.aggregate(group_key, series),
            None => warn!("Flow {} has no aggregator, dropping reduce", self.task_id),
        }
    }

    /// Resolve the tag value slot `index`; `None` when nothing was found
    pub fn receive_tag_values(&self, index: usize, values: Option<HashMap<TagValueId, String>>) {
        let all_resolved = {
            let mut state = self.state.lock();
            match state.resolved.get(index) {
                Some(false) => {}
                Some(true) => {
                    warn!("Tag values of slot {} received twice", index);
                    return;
                }
                None => {
                    warn!("Tag values for unknown slot {}", index);
                    return;
                }
            }
            state.resolved[index] = true;
            state.tag_values[index] = values;
            state.remaining -= 1;
            state.remaining == 0
        };
        if all_resolved {
            self.signal.fire();
        }
    }

    /// Mark a task finished; the last one completes the flow
    pub fn complete_task(&self, task_id: u64) {
        let drained = {
            let mut state = self.state.lock();
            state.pending.remove(&task_id);
            state.pending.is_empty()
        };
        if let Some(err) = self.query_ctx.err() {
            self.complete(Err(err));
        } else if drained {
            self.complete(Ok(()));
        }
    }

    /// Complete the flow and answer every receiver; later calls are no-ops
    pub fn complete(&self, result: Result<()>) {
        if self
            .completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let outcome = result
            .and_then(|_| self.wait_tag_values())
            .and_then(|_| self.result_responses());
        let sent = match outcome {
            Ok(responses) => {
                info!("Flow {} completed", self.task_id);
                self.send_response(responses)
            }
            Err(err) => {
                warn!("Flow {} failed: {}", self.task_id, err);
                self.record_error(&err);
                let responses = self.receivers.iter().map(|_| self.error_response(&err)).collect();
                self.send_response(responses)
            }
        };
        if let Err(err) = sent {
            error!("Flow {} could not send response: {}", self.task_id, err);
            self.record_error(&err);
        }
    }

    fn wait_tag_values(&self) -> Result<()> {
        let grouped = {
            let state = self.state.lock();
            state.prepared && !state.group_by.is_empty()
        };
        if !grouped {
            return Ok(());
        }

        let waker = Waker::from(Arc::clone(&self.signal));
        let mut cancelled = pin!(self.query_ctx.token().cancelled());
        if cancelled.as_mut().poll(&mut Context::from_waker(&waker)).is_ready() {
            return Err(QueryError::Cancelled);
        }
        // the pending future keeps the waker registered until we return
        let deadline = self.query_ctx.deadline();
        loop {
            if self.signal.wait(deadline) {
                return Ok(());
            }
            if let Some(err) = self.query_ctx.err() {
                return Err(err);
            }
        }
    }

    fn result_responses(&self) -> Result<Vec<TaskResponse>> {
        let list = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let groups = state
                .aggregator
                .take()
                .map(GroupingAggregator::into_result_set)
                .unwrap_or_default();

            let mut series = Vec::with_capacity(groups.len());
            for group in groups {
                let cached = state.tag_cache.get(&group.group_key).cloned();
                let tags = match cached {
                    Some(tags) => tags,
                    None => {
                        let tags = render_tags(&group.group_key, &state.tag_values);
                        state.tag_cache.put(group.group_key.clone(), tags.clone());
                        tags
                    }
                };
                let fields = group
                    .fields
                    .into_iter()
                    .map(|field| FieldSeries {
                        name: field.field_name,
                        function: field.function,
                        points: field.points,
                    })
                    .collect();
                series.push(TimeSeries { tags, fields });
            }
            TimeSeriesList {
                group_by: state.group_by.clone(),
                fields: state.fields.clone(),
                series,
            }
        };

        let parts = partition(list.series, self.receivers.len());
        let mut responses = Vec::with_capacity(parts.len());
        for series in parts.into_iter().take(self.receivers.len()) {
            let payload = TimeSeriesList {
                group_by: list.group_by.clone(),
                fields: list.fields.clone(),
                series,
            }
            .encode()?;
            responses.push(TaskResponse {
                task_id: self.task_id.clone(),
                completed: true,
                payload: Some(payload),
                stats: self.stats.as_ref().map(|stats| stats.snapshot()),
                error_msg: None,
                send_node: self.node.clone(),
            });
        }
        Ok(responses)
    }

    fn error_response(&self, err: &QueryError) -> TaskResponse {
        TaskResponse {
            task_id: self.task_id.clone(),
            completed: true,
            payload: None,
            stats: self.stats.as_ref().map(|stats| stats.snapshot()),
            error_msg: Some(err.to_string()),
            send_node: self.node.clone(),
        }
    }

    /// Send one response per receiver, or nothing if any stream is missing
    fn send_response(&self, responses: Vec<TaskResponse>) -> Result<()> {
        if self.receivers.is_empty() {
            warn!("Flow {} has no receiver", self.task_id);
            return Ok(());
        }
        let mut streams = Vec::with_capacity(self.receivers.len());
        for receiver in &self.receivers {
            match self.streams.stream(receiver) {
                Some(stream) => streams.push(stream),
                None => return Err(QueryError::NoSendStream(receiver.clone())),
            }
        }
        let sends = streams.into_iter().zip(responses).zip(&self.receivers);
        for ((stream, response), receiver) in sends {
            if let Err(err) = stream.send(response) {
                error!(
                    "Failed to send response of flow {} to {}: {}",
                    self.task_id, receiver, err
                );
            }
        }
        Ok(())
    }

    fn record_error(&self, err: &QueryError) {
        let mut state = self.state.lock();
        if state.error.is_none() {
            state.error = Some(err.to_string());
        }
    }
}

/// Tag string of a group key: resolved values in group-by order
fn render_tags(group_key: &[u8], tag_values: &[Option<HashMap<TagValueId, String>>]) -> String {
    if group_key.is_empty() {
        return String::new();
    }
    let mut tags = String::new();
    for (index, id) in decode_group_key(group_key).into_iter().enumerate() {
        if index > 0 {
            tags.push(TAG_SEPARATOR);
        }
        let value = tag_values
            .get(index)
            .and_then(Option::as_ref)
            .and_then(|values| values.get(&id));
        tags.push_str(value.map(String::as_str).unwrap_or(NULL_TAG_VALUE));
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::MemoryStreamFactory;
    use crate::stmt::Query;
    use rusts_aggregation::{AggregatorSpec, SeriesDownSampler};
    use rusts_core::{FieldMeta, FieldType, FunctionType, PoolConfig, TagKeyMeta};
    use rusts_index::group_key;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn pools() -> Arc<ExecutePools> {
        let config = PoolConfig::new()
            .with_filtering_workers(2)
            .with_grouping_workers(2)
            .with_scanner_workers(2);
        Arc::new(ExecutePools::new(&config).unwrap())
    }

    fn flow_with(
        receivers: &[&str],
        factory: &MemoryStreamFactory,
        query_ctx: QueryContext,
    ) -> Arc<StorageQueryFlow> {
        StorageQueryFlow::new(
            "task-1",
            receivers.iter().map(|r| r.to_string()).collect(),
            query_ctx,
            pools(),
            Arc::new(factory.clone()),
            &LeafConfig::default(),
            None,
        )
    }

    fn context(group_by: &[&str]) -> ExecuteContext {
        let query = Query::builder("cpu")
            .time_range(0, 30_000)
            .select_field("usage")
            .build()
            .unwrap();
        let mut ctx = ExecuteContext::new("task-1", query, vec![1], None);
        let field = FieldMeta::new(1, "usage", FieldType::Sum);
        let mut spec = AggregatorSpec::new(&field);
        spec.add_function(FunctionType::Sum).unwrap();
        ctx.fields = vec![field];
        ctx.aggregator_specs = vec![spec.clone()];
        ctx.down_sampling_specs = vec![spec];
        ctx.group_by = group_by
            .iter()
            .enumerate()
            .map(|(i, key)| TagKeyMeta::new(i as u32 + 1, *key))
            .collect();
        ctx
    }

    fn series(ctx: &ExecuteContext, value: f64) -> SeriesFields {
        let window = ctx.window().unwrap();
        let mut sampler = SeriesDownSampler::new(&window, &ctx.down_sampling_specs);
        sampler.accept(1, 1, 0, 0, value);
        sampler.into_series().remove(&1).unwrap()
    }

    fn wait(factory: &MemoryStreamFactory, count: usize) {
        assert_eq!(factory.wait_for(count, Duration::from_secs(5)), count);
    }

    /// An error completes the flow before its task is marked finished
    fn wait_drained(flow: &StorageQueryFlow) {
        let started = Instant::now();
        while flow.pending_tasks() > 0 {
            assert!(started.elapsed() < Duration::from_secs(5), "tasks still pending");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_prepare_slots_and_signal() {
        let factory = MemoryStreamFactory::new(["root"]);

        let flow = flow_with(&["root"], &factory, QueryContext::new());
        flow.prepare(&context(&[])).unwrap();
        assert!(flow.tag_values_resolved());

        let flow = flow_with(&["root"], &factory, QueryContext::new());
        flow.prepare(&context(&["host", "path", "zone"])).unwrap();
        assert_eq!(flow.state.lock().tag_values.len(), 3);
        assert!(!flow.tag_values_resolved());

        let handles: Vec<_> = (0..3)
            .map(|index| {
                let flow = Arc::clone(&flow);
                thread::spawn(move || flow.receive_tag_values(index, None))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(flow.tag_values_resolved());
        assert!(!flow.signal.fire());

        // a late duplicate leaves the count alone
        flow.receive_tag_values(0, None);
        assert_eq!(flow.state.lock().remaining, 0);
    }

    #[test]
    fn test_complete_fires_once() {
        let factory = MemoryStreamFactory::new(["root"]);
        let flow = flow_with(&["root"], &factory, QueryContext::new());
        let ctx = context(&[]);
        flow.prepare(&ctx).unwrap();
        flow.reduce(&[], &series(&ctx, 2.0));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let flow = Arc::clone(&flow);
                thread::spawn(move || {
                    if i % 2 == 0 {
                        flow.complete(Ok(()));
                    } else {
                        flow.complete(Err(QueryError::Cancelled));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(flow.is_completed());
        wait(&factory, 1);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(factory.total(), 1);
    }

    #[test]
    fn test_reduce_after_complete_is_dropped() {
        let factory = MemoryStreamFactory::new(["root"]);
        let flow = flow_with(&["root"], &factory, QueryContext::new());
        let ctx = context(&[]);
        flow.prepare(&ctx).unwrap();
        flow.reduce(&[], &series(&ctx, 1.0));
        flow.complete(Ok(()));
        flow.reduce(&[], &series(&ctx, 5.0));

        let list = factory.responses("root")[0].series_list().unwrap().unwrap();
        assert_eq!(list.series.len(), 1);
        assert_eq!(list.series[0].tags, "");
        assert_eq!(list.series[0].fields[0].points, vec![(0, 1.0)]);
    }

    #[test]
    fn test_submit_tracks_pending_and_completes() {
        let factory = MemoryStreamFactory::new(["root"]);
        let flow = flow_with(&["root"], &factory, QueryContext::new());
        let ctx = context(&[]);
        flow.prepare(&ctx).unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        let inner_flow = Arc::clone(&flow);
        let inner_runs = Arc::clone(&runs);
        flow.submit(Stage::Filtering, move || {
            inner_runs.fetch_add(1, Ordering::SeqCst);
            let runs = Arc::clone(&inner_runs);
            inner_flow.submit(Stage::Scanner, move || {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            Ok(())
        });

        wait(&factory, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(flow.is_completed());
        assert_eq!(flow.pending_tasks(), 0);
        assert!(!factory.responses("root")[0].is_error());

        // rejected after completion
        let late = Arc::clone(&runs);
        flow.submit(Stage::Filtering, move || {
            late.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        thread::sleep(Duration::from_millis(20));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_task_error_and_panic_complete_flow() {
        let factory = MemoryStreamFactory::new(["root"]);
        let flow = flow_with(&["root"], &factory, QueryContext::new());
        flow.submit(Stage::Grouping, || Err(QueryError::InvalidQuery("bad".to_string())));
        wait(&factory, 1);
        let response = &factory.responses("root")[0];
        assert!(response.error_msg.as_deref().unwrap_or_default().contains("bad"));
        assert!(response.payload.is_none());

        let factory = MemoryStreamFactory::new(["root"]);
        let flow = flow_with(&["root"], &factory, QueryContext::new());
        flow.submit(Stage::Scanner, || panic!("scanner blew up"));
        wait(&factory, 1);
        let response = &factory.responses("root")[0];
        assert!(response.error_msg.as_deref().unwrap_or_default().contains("scanner blew up"));
        wait_drained(&flow);
    }

    #[test]
    fn test_submit_after_cancel_completes_with_error() {
        let factory = MemoryStreamFactory::new(["root"]);
        let query_ctx = QueryContext::new();
        let flow = flow_with(&["root"], &factory, query_ctx.clone());
        query_ctx.cancel();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        flow.submit(Stage::Filtering, move || {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        wait(&factory, 1);
        assert!(!ran.load(Ordering::SeqCst));
        let response = &factory.responses("root")[0];
        assert_eq!(response.error_msg.as_deref(), Some("Query cancelled"));
    }

    #[test]
    fn test_grouped_completion_waits_for_tag_values() {
        let factory = MemoryStreamFactory::new(["root"]);
        let flow = flow_with(&["root"], &factory, QueryContext::new());
        let ctx = context(&["host"]);
        flow.prepare(&ctx).unwrap();
        flow.reduce(&group_key(&[1]), &series(&ctx, 1.0));
        flow.reduce(&group_key(&[2]), &series(&ctx, 2.0));

        let completer = Arc::clone(&flow);
        let handle = thread::spawn(move || completer.complete(Ok(())));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(factory.total(), 0);

        let mut values = HashMap::new();
        values.insert(1, "h1".to_string());
        flow.receive_tag_values(0, Some(values));
        handle.join().unwrap();

        let list = factory.responses("root")[0].series_list().unwrap().unwrap();
        assert_eq!(list.group_by, vec!["host"]);
        assert_eq!(list.fields, vec!["usage"]);
        let tags: Vec<&str> = list.series.iter().map(|s| s.tags.as_str()).collect();
        assert_eq!(tags, vec!["h1", NULL_TAG_VALUE]);
    }

    #[test]
    fn test_grouped_wait_observes_cancellation() {
        let factory = MemoryStreamFactory::new(["root"]);
        let query_ctx = QueryContext::new();
        let flow = flow_with(&["root"], &factory, query_ctx.clone());
        flow.prepare(&context(&["host"])).unwrap();

        let completer = Arc::clone(&flow);
        let handle = thread::spawn(move || completer.complete(Ok(())));
        thread::sleep(Duration::from_millis(20));
        query_ctx.cancel();
        handle.join().unwrap();

        let response = &factory.responses("root")[0];
        assert_eq!(response.error_msg.as_deref(), Some("Query cancelled"));
    }

    #[test]
    fn test_grouped_wait_bounded_by_deadline() {
        let factory = MemoryStreamFactory::new(["root"]);
        let query_ctx = QueryContext::new().with_timeout(Duration::from_millis(30));
        let flow = flow_with(&["root"], &factory, query_ctx);
        flow.prepare(&context(&["host"])).unwrap();

        let started = Instant::now();
        flow.complete(Ok(()));
        assert!(started.elapsed() < Duration::from_secs(5));

        let response = &factory.responses("root")[0];
        assert_eq!(response.error_msg.as_deref(), Some("Query deadline exceeded"));
    }

    #[test]
    fn test_signal_woken_by_cancellation() {
        let signal = Arc::new(Signal::new());
        let token = CancellationToken::new();
        let waker = Waker::from(Arc::clone(&signal));
        let mut cancelled = pin!(token.cancelled());
        assert!(cancelled
            .as_mut()
            .poll(&mut Context::from_waker(&waker))
            .is_pending());

        let canceller = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });
        assert!(!signal.wait(None));
        handle.join().unwrap();

        signal.fire();
        assert!(signal.wait(None));
    }

    #[test]
    fn test_missing_stream_sends_nothing() {
        let factory = MemoryStreamFactory::new(["a"]);
        let flow = flow_with(&["a", "b"], &factory, QueryContext::new());
        flow.prepare(&context(&[])).unwrap();
        flow.complete(Ok(()));

        assert_eq!(factory.total(), 0);
        assert!(flow.error().unwrap_or_default().contains("b"));
    }

    #[test]
    fn test_fan_out_every_receiver_answered() {
        let factory = MemoryStreamFactory::new(["a", "b", "c"]);
        let flow = flow_with(&["a", "b", "c"], &factory, QueryContext::new());
        let ctx = context(&["host"]);
        flow.prepare(&ctx).unwrap();
        let mut values = HashMap::new();
        for id in 1..=6u32 {
            flow.reduce(&group_key(&[id]), &series(&ctx, id as f64));
            values.insert(id, format!("h{}", id));
        }
        flow.receive_tag_values(0, Some(values));
        flow.complete(Ok(()));

        let mut total = 0;
        for (index, receiver) in ["a", "b", "c"].into_iter().enumerate() {
            let responses = factory.responses(receiver);
            assert_eq!(responses.len(), 1);
            let list = responses[0].series_list().unwrap().unwrap();
            for item in &list.series {
                assert_eq!(crate::rpc::receiver_index(&item.tags, 3), index);
            }
            total += list.series.len();
        }
        assert_eq!(total, 6);
    }

    #[test]
    fn test_render_tags() {
        let mut host = HashMap::new();
        host.insert(1, "h1".to_string());
        let slots = vec![Some(host), None];
        assert_eq!(render_tags(&group_key(&[1, 7]), &slots), format!("h1{}null", TAG_SEPARATOR));
        assert_eq!(render_tags(&[], &slots), "");
    }
}
