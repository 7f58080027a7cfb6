//! Data family collaborators
//!
//! A data family holds the points of one shard for one time span
//! (`family_time` .. `family_time + duration`) at one storage interval.
//! Points are addressed by slot: `ts = family_time + slot * interval`.

use crate::error::Result;
use roaring::RoaringBitmap;
use rusts_core::{FieldId, MetricId, SeriesId, TimeRange, Timestamp};
use std::sync::Arc;

/// One stored value at a slot of its family
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotPoint {
    pub slot: u16,
    pub value: f64,
}

impl SlotPoint {
    pub fn new(slot: u16, value: f64) -> Self {
        Self { slot, value }
    }
}

/// Receives the decoded points of one series and field
pub type LoadSink<'a> = dyn FnMut(SeriesId, FieldId, &[SlotPoint]) + 'a;

/// Time-bounded slice of a shard's data
pub trait DataFamily: Send + Sync {
    /// Start of the family's time span
    fn family_time(&self) -> Timestamp;

    /// Storage interval of the family's slots
    fn interval(&self) -> i64;

    fn time_range(&self) -> TimeRange;

    /// Result sets of the given series holding any of `field_ids`
    fn filter(
        &self,
        metric_id: MetricId,
        series_ids: &RoaringBitmap,
        field_ids: &[FieldId],
    ) -> Result<Vec<Arc<dyn FilterResultSet>>>;
}

/// Filtered view of a family, ready to load
pub trait FilterResultSet: Send + Sync {
    /// Stable name of the filtered segment, used in explain stats
    fn identifier(&self) -> String;

    fn family_time(&self) -> Timestamp;

    /// Series with data in this result set
    fn series_ids(&self) -> RoaringBitmap;

    /// Stream the points of `series_ids` x `field_ids` into `sink`
    fn load(
        &self,
        series_ids: &[SeriesId],
        field_ids: &[FieldId],
        sink: &mut LoadSink<'_>,
    ) -> Result<()>;
}
