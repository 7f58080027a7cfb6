//! Stage pool configuration.
//!
//! A leaf query runs in three pipeline stages (filtering, grouping and
//! scanning), each backed by its own bounded worker pool. The pools are
//! shared by every query of a database.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};

/// Worker counts for the three stage pools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Workers for series-id search and family filtering.
    /// Set to 0 to use the number of CPU cores.
    /// Default: 0 (CPU cores)
    pub filtering_workers: usize,

    /// Workers for grouping-context resolution and group building.
    /// Default: 0 (CPU cores)
    pub grouping_workers: usize,

    /// Workers for data loading and tag value collection.
    /// Default: 0 (CPU cores)
    pub scanner_workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            filtering_workers: 0,
            grouping_workers: 0,
            scanner_workers: 0,
        }
    }
}

impl PoolConfig {
    /// Creates a new PoolConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Effective filtering pool size.
    pub fn effective_filtering_workers(&self) -> usize {
        effective(self.filtering_workers)
    }

    /// Effective grouping pool size.
    pub fn effective_grouping_workers(&self) -> usize {
        effective(self.grouping_workers)
    }

    /// Effective scanner pool size.
    pub fn effective_scanner_workers(&self) -> usize {
        effective(self.scanner_workers)
    }

    /// Creates a configuration with a single worker per stage.
    pub fn sequential() -> Self {
        Self {
            filtering_workers: 1,
            grouping_workers: 1,
            scanner_workers: 1,
        }
    }

    /// Builder method to set filtering workers.
    pub fn with_filtering_workers(mut self, workers: usize) -> Self {
        self.filtering_workers = workers;
        self
    }

    /// Builder method to set grouping workers.
    pub fn with_grouping_workers(mut self, workers: usize) -> Self {
        self.grouping_workers = workers;
        self
    }

    /// Builder method to set scanner workers.
    pub fn with_scanner_workers(mut self, workers: usize) -> Self {
        self.scanner_workers = workers;
        self
    }

    /// Rejects worker counts no machine can honour.
    pub fn validate(&self) -> Result<()> {
        const MAX_WORKERS: usize = 4096;
        for (stage, workers) in [
            ("filtering", self.filtering_workers),
            ("grouping", self.grouping_workers),
            ("scanner", self.scanner_workers),
        ] {
            if workers > MAX_WORKERS {
                return Err(CoreError::InvalidConfig(format!(
                    "{} workers {} exceeds limit {}",
                    stage, workers, MAX_WORKERS
                )));
            }
        }
        Ok(())
    }
}

fn effective(workers: usize) -> usize {
    if workers == 0 {
        num_cpus::get()
    } else {
        workers
    }
}
