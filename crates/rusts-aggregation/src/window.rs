//! Query time window

use crate::error::{AggregationError, Result};
use rusts_core::{TimeRange, Timestamp};

/// Time window of a query: the aligned range and its bucket interval.
///
/// A query interval of 0 (or finer than storage) falls back to the storage
/// interval. Buckets are `[start + i * interval, start + (i + 1) * interval)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    time_range: TimeRange,
    interval: i64,
    storage_interval: i64,
    ratio: i64,
}

impl TimeWindow {
    pub fn new(time_range: TimeRange, interval: i64, storage_interval: i64) -> Result<Self> {
        if storage_interval <= 0 {
            return Err(AggregationError::InvalidWindow(format!(
                "storage interval must be positive, got {}",
                storage_interval
            )));
        }
        if interval < 0 {
            return Err(AggregationError::InvalidWindow(format!(
                "interval must not be negative, got {}",
                interval
            )));
        }
        if time_range.is_empty() {
            return Err(AggregationError::InvalidWindow(format!(
                "empty time range [{}, {})",
                time_range.start, time_range.end
            )));
        }

        let ratio = (interval / storage_interval).max(1);
        let interval = storage_interval * ratio;
        Ok(Self {
            time_range: time_range.align(interval),
            interval,
            storage_interval,
            ratio,
        })
    }

    /// Aligned query range
    pub fn time_range(&self) -> TimeRange {
        self.time_range
    }

    /// Bucket width in milliseconds
    pub fn interval(&self) -> i64 {
        self.interval
    }

    pub fn storage_interval(&self) -> i64 {
        self.storage_interval
    }

    /// Storage slots per bucket
    pub fn ratio(&self) -> i64 {
        self.ratio
    }

    /// Number of buckets in the window, saturating for unbounded ranges
    pub fn point_count(&self) -> usize {
        let width = i128::from(self.time_range.end) - i128::from(self.time_range.start);
        usize::try_from(width / i128::from(self.interval)).unwrap_or(usize::MAX)
    }

    /// Bucket index of `ts`, or `None` outside the window
    pub fn bucket(&self, ts: Timestamp) -> Option<usize> {
        if !self.time_range.contains(ts) {
            return None;
        }
        let offset = i128::from(ts) - i128::from(self.time_range.start);
        usize::try_from(offset / i128::from(self.interval)).ok()
    }

    /// Start timestamp of bucket `index`
    pub fn bucket_start(&self, index: usize) -> Timestamp {
        let offset = (index as i64).saturating_mul(self.interval);
        self.time_range.start.saturating_add(offset)
    }

    /// Timestamp of storage slot `slot` in a family starting at `family_time`
    pub fn slot_time(&self, family_time: Timestamp, slot: u16) -> Timestamp {
        family_time.saturating_add(i64::from(slot).saturating_mul(self.storage_interval))
    }
}
