//! Series down-sampling
//!
//! Storage hands out raw slot points per series and field; they are folded
//! into the query's buckets with every function planned for the field.

use crate::spec::AggregatorSpec;
use crate::window::TimeWindow;
use rusts_core::{FieldId, FunctionType, SeriesId, Timestamp};
use std::collections::BTreeMap;

/// Bucket index -> value
pub type Points = BTreeMap<usize, f64>;

/// Down-sampled points of one series (or one group), laid out as
/// `[spec][function]` in the order of the aggregator specs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesFields {
    fields: Vec<Vec<Points>>,
}

impl SeriesFields {
    pub fn new(specs: &[AggregatorSpec]) -> Self {
        Self {
            fields: specs
                .iter()
                .map(|spec| vec![Points::new(); spec.functions().len()])
                .collect(),
        }
    }

    /// Whether no point was recorded for any field
    pub fn is_empty(&self) -> bool {
        self.fields.iter().flatten().all(|points| points.is_empty())
    }

    pub fn points(&self, spec_index: usize, function_index: usize) -> Option<&Points> {
        self.fields.get(spec_index)?.get(function_index)
    }

    /// Merge a single value into a bucket
    pub fn merge_value(
        &mut self,
        spec_index: usize,
        function_index: usize,
        function: FunctionType,
        bucket: usize,
        value: f64,
    ) {
        if let Some(points) = self
            .fields
            .get_mut(spec_index)
            .and_then(|functions| functions.get_mut(function_index))
        {
            let current = points.get(&bucket).copied();
            points.insert(bucket, function.merge(current, value));
        }
    }

    /// Merge every point of `other` using each field's functions
    pub fn merge(&mut self, specs: &[AggregatorSpec], other: &SeriesFields) {
        for (spec_index, spec) in specs.iter().enumerate() {
            for (function_index, function) in spec.functions().iter().enumerate() {
                let Some(points) = other.points(spec_index, function_index) else {
                    continue;
                };
                for (&bucket, &value) in points {
                    self.merge_value(spec_index, function_index, *function, bucket, value);
                }
            }
        }
    }
}

/// Collects slot points of a batch of series into per-series buckets
pub struct SeriesDownSampler<'a> {
    window: &'a TimeWindow,
    specs: &'a [AggregatorSpec],
    series: BTreeMap<SeriesId, SeriesFields>,
}

impl<'a> SeriesDownSampler<'a> {
    /// `specs` must be sorted by field id
    pub fn new(window: &'a TimeWindow, specs: &'a [AggregatorSpec]) -> Self {
        Self {
            window,
            specs,
            series: BTreeMap::new(),
        }
    }

    /// Fold one slot value; returns false if the point was ignored
    pub fn accept(
        &mut self,
        series_id: SeriesId,
        field_id: FieldId,
        family_time: Timestamp,
        slot: u16,
        value: f64,
    ) -> bool {
        let specs = self.specs;
        let Ok(spec_index) = specs.binary_search_by_key(&field_id, |spec| spec.field_id) else {
            return false;
        };
        let Some(bucket) = self.window.bucket(self.window.slot_time(family_time, slot)) else {
            return false;
        };

        let spec = &specs[spec_index];
        let fields = self
            .series
            .entry(series_id)
            .or_insert_with(|| SeriesFields::new(specs));
        for (function_index, function) in spec.functions().iter().enumerate() {
            let value = match function {
                FunctionType::Count => 1.0,
                _ => value,
            };
            fields.merge_value(spec_index, function_index, *function, bucket, value);
        }
        true
    }

    /// Series that received at least one point
    pub fn into_series(self) -> BTreeMap<SeriesId, SeriesFields> {
        self.series
    }
}
