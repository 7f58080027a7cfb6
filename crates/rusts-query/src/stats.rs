//! Explain statistics
//!
//! Only built when the query asks for an explanation; tasks write into it
//! through the tracking decorator in `task`.

use parking_lot::Mutex;
use rusts_core::ShardId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Load cost of one filtered segment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentStats {
    pub load_cost: u64,
    pub load_count: u64,
}

/// Costs of one shard, in nanoseconds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardStats {
    pub series_filter_cost: u64,
    pub series_count: u64,
    pub family_filter_cost: u64,
    pub grouping_context_cost: u64,
    pub build_group_cost: u64,
    pub build_group_count: u64,
    /// Keyed by filter result set identifier
    pub segments: BTreeMap<String, SegmentStats>,
}

/// Costs of one leaf query, in nanoseconds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplainStats {
    pub node: String,
    pub total_cost: u64,
    pub plan_cost: u64,
    pub tag_filter_cost: u64,
    pub collect_tag_values_cost: u64,
    pub shards: BTreeMap<ShardId, ShardStats>,
}

/// Thread-safe sink for task costs
pub struct StatsRecorder {
    started: Instant,
    stats: Mutex<ExplainStats>,
}

fn nanos(cost: Duration) -> u64 {
    u64::try_from(cost.as_nanos()).unwrap_or(u64::MAX)
}

impl StatsRecorder {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            started: Instant::now(),
            stats: Mutex::new(ExplainStats {
                node: node.into(),
                ..Default::default()
            }),
        }
    }

    pub fn record_plan(&self, cost: Duration) {
        self.stats.lock().plan_cost += nanos(cost);
    }

    pub fn record_tag_filter(&self, cost: Duration) {
        self.stats.lock().tag_filter_cost += nanos(cost);
    }

    pub fn record_collect_tag_values(&self, cost: Duration) {
        self.stats.lock().collect_tag_values_cost += nanos(cost);
    }

    pub fn record_series_filter(&self, shard_id: ShardId, cost: Duration, series_count: u64) {
        self.with_shard(shard_id, |shard| {
            shard.series_filter_cost += nanos(cost);
            shard.series_count += series_count;
        });
    }

    pub fn record_family_filter(&self, shard_id: ShardId, cost: Duration) {
        self.with_shard(shard_id, |shard| shard.family_filter_cost += nanos(cost));
    }

    pub fn record_grouping_context(&self, shard_id: ShardId, cost: Duration) {
        self.with_shard(shard_id, |shard| shard.grouping_context_cost += nanos(cost));
    }

    pub fn record_build_group(&self, shard_id: ShardId, cost: Duration) {
        self.with_shard(shard_id, |shard| {
            shard.build_group_cost += nanos(cost);
            shard.build_group_count += 1;
        });
    }

    pub fn record_data_load(&self, shard_id: ShardId, segment: &str, cost: Duration) {
        self.with_shard(shard_id, |shard| {
            let segment = shard.segments.entry(segment.to_string()).or_default();
            segment.load_cost += nanos(cost);
            segment.load_count += 1;
        });
    }

    /// Current statistics with the total cost measured up to now
    pub fn snapshot(&self) -> ExplainStats {
        let mut stats = self.stats.lock().clone();
        stats.total_cost = nanos(self.started.elapsed());
        stats
    }

    fn with_shard(&self, shard_id: ShardId, f: impl FnOnce(&mut ShardStats)) {
        let mut stats = self.stats.lock();
        f(stats.shards.entry(shard_id).or_default());
    }
}
