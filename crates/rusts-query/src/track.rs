//! Grouping execute track
//!
//! Counts the tasks that may still add group-by tag value ids. When the
//! count drops to zero the ids are final, and the track starts collecting
//! their display strings, once per flow.

use crate::context::ExecuteContext;
use crate::error::Result;
use crate::flow::StorageQueryFlow;
use crate::pool::{run_guarded, Stage};
use crate::task::{run_task, CollectTagValuesTask};
use rusts_index::MetadataStore;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

pub struct GroupingExecuteTrack {
    flow: Arc<StorageQueryFlow>,
    ctx: Arc<ExecuteContext>,
    metadata: Arc<dyn MetadataStore>,
    pending: AtomicUsize,
    collected: AtomicBool,
}

impl GroupingExecuteTrack {
    pub fn new(
        flow: Arc<StorageQueryFlow>,
        ctx: Arc<ExecuteContext>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            flow,
            ctx,
            metadata,
            pending: AtomicUsize::new(0),
            collected: AtomicBool::new(false),
        })
    }

    pub fn flow(&self) -> &Arc<StorageQueryFlow> {
        &self.flow
    }

    pub fn is_collected(&self) -> bool {
        self.collected.load(Ordering::Acquire)
    }

    /// Submit `task` through the flow, counted by this track
    pub fn submit<F>(self: &Arc<Self>, stage: Stage, task: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.pending.fetch_add(1, Ordering::AcqRel);
        let track = Arc::clone(self);
        self.flow.submit(stage, move || {
            let result = run_guarded(task);
            track.done();
            result
        });
    }

    fn done(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if self
            .collected
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.collect_tag_values();
        }
    }

    fn collect_tag_values(&self) {
        for (index, tag_key) in self.ctx.group_by.iter().enumerate() {
            let tag_value_ids = match self.ctx.group_by_tag_value_ids.get(index) {
                Some(slot) => slot.lock().clone(),
                None => Default::default(),
            };
            if tag_value_ids.is_empty() {
                debug!("No tag values to collect for {}", tag_key.key);
                self.flow.receive_tag_values(index, None);
                continue;
            }

            let flow = Arc::clone(&self.flow);
            let metadata = Arc::clone(&self.metadata);
            let stats = self.ctx.stats.clone();
            let tag_key_id = tag_key.id;
            self.flow.submit(Stage::Scanner, move || {
                let mut task =
                    CollectTagValuesTask::new(metadata.as_ref(), tag_key_id, &tag_value_ids);
                run_task(&mut task, stats.as_ref())?;
                flow.receive_tag_values(index, task.into_values());
                Ok(())
            });
        }
    }
}
