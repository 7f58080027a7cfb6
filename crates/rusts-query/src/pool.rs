//! Stage worker pools
//!
//! Uses rayon thread pools, one per pipeline stage. Pools are built once per
//! database and shared by all of its queries.

use crate::error::{QueryError, Result};
use rayon::{ThreadPool, ThreadPoolBuilder};
use rusts_core::PoolConfig;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Pipeline stage of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Series search and family filtering
    Filtering,
    /// Grouping context and build group
    Grouping,
    /// Data load and tag value collection
    Scanner,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Filtering, Stage::Grouping, Stage::Scanner];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Filtering => "filtering",
            Stage::Grouping => "grouping",
            Stage::Scanner => "scanner",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The three stage pools
pub struct ExecutePools {
    filtering: ThreadPool,
    grouping: ThreadPool,
    scanner: ThreadPool,
}

impl ExecutePools {
    pub fn new(config: &PoolConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| QueryError::Config(e.to_string()))?;
        Ok(Self {
            filtering: build_pool(Stage::Filtering, config.effective_filtering_workers())?,
            grouping: build_pool(Stage::Grouping, config.effective_grouping_workers())?,
            scanner: build_pool(Stage::Scanner, config.effective_scanner_workers())?,
        })
    }

    pub fn pool(&self, stage: Stage) -> &ThreadPool {
        match stage {
            Stage::Filtering => &self.filtering,
            Stage::Grouping => &self.grouping,
            Stage::Scanner => &self.scanner,
        }
    }

    /// Number of worker threads of a stage
    pub fn workers(&self, stage: Stage) -> usize {
        self.pool(stage).current_num_threads()
    }

    /// Run `task` on the stage's pool without waiting for it
    pub fn spawn<F>(&self, stage: Stage, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool(stage).spawn(task);
    }
}

fn build_pool(stage: Stage, workers: usize) -> Result<ThreadPool> {
    ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(move |i| format!("leaf-{}-{}", stage.name(), i))
        .build()
        .map_err(|e| QueryError::Config(format!("failed to build {} pool: {}", stage, e)))
}

/// Run `task`, turning a panic into [`QueryError::TaskPanic`]
pub fn run_guarded<T>(task: impl FnOnce() -> Result<T>) -> Result<T> {
    match catch_unwind(AssertUnwindSafe(task)) {
        Ok(result) => result,
        Err(payload) => Err(QueryError::TaskPanic(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
