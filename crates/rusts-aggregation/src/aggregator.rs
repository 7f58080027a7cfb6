//! Grouping aggregator
//!
//! Shared by every task of a query; down-sampled series are merged into
//! their group under the caller's lock.

use crate::downsample::SeriesFields;
use crate::error::{AggregationError, Result};
use crate::spec::AggregatorSpec;
use crate::window::TimeWindow;
use rusts_core::{FieldId, FunctionType, Timestamp};
use std::collections::HashMap;

/// Points of one field under one function
#[derive(Debug, Clone, PartialEq)]
pub struct FieldResult {
    pub field_id: FieldId,
    pub field_name: String,
    pub function: FunctionType,
    /// (bucket start, value), ascending by time
    pub points: Vec<(Timestamp, f64)>,
}

/// Aggregated fields of one group
#[derive(Debug, Clone, PartialEq)]
pub struct GroupResult {
    /// Raw group key bytes; empty when the query is not grouped
    pub group_key: Vec<u8>,
    pub fields: Vec<FieldResult>,
}

/// Merges down-sampled series into groups keyed by group key bytes
pub struct GroupingAggregator {
    window: TimeWindow,
    specs: Vec<AggregatorSpec>,
    groups: HashMap<Vec<u8>, SeriesFields>,
}

impl GroupingAggregator {
    pub fn new(window: TimeWindow, specs: Vec<AggregatorSpec>) -> Result<Self> {
        if specs.is_empty() {
            return Err(AggregationError::InvalidDefinition("no field to aggregate".to_string()));
        }
        if specs.windows(2).any(|pair| pair[0].field_id >= pair[1].field_id) {
            return Err(AggregationError::InvalidDefinition(
                "aggregator specs must be sorted by field id".to_string(),
            ));
        }
        Ok(Self {
            window,
            specs,
            groups: HashMap::new(),
        })
    }

    pub fn window(&self) -> &TimeWindow {
        &self.window
    }

    pub fn specs(&self) -> &[AggregatorSpec] {
        &self.specs
    }

    /// Merge one series into its group
    pub fn aggregate(&mut self, group_key: &[u8], series: &SeriesFields) {
        if series.is_empty() {
            return;
        }
        match self.groups.get_mut(group_key) {
            Some(group) => group.merge(&self.specs, series),
            None => {
                let mut group = SeriesFields::new(&self.specs);
                group.merge(&self.specs, series);
                self.groups.insert(group_key.to_vec(), group);
            }
        }
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Groups sorted by key; fields follow spec order, empty ones are left out
    pub fn into_result_set(self) -> Vec<GroupResult> {
        let mut groups: Vec<(Vec<u8>, SeriesFields)> = self.groups.into_iter().collect();
        groups.sort_by(|a, b| a.0.cmp(&b.0));

        let mut results = Vec::with_capacity(groups.len());
        for (group_key, fields) in groups {
            let mut field_results = Vec::new();
            for (spec_index, spec) in self.specs.iter().enumerate() {
                for (function_index, function) in spec.functions().iter().enumerate() {
                    let Some(points) = fields.points(spec_index, function_index) else {
                        continue;
                    };
                    if points.is_empty() {
                        continue;
                    }
                    field_results.push(FieldResult {
                        field_id: spec.field_id,
                        field_name: spec.field_name.clone(),
                        function: *function,
                        points: points
                            .iter()
                            .map(|(&bucket, &value)| (self.window.bucket_start(bucket), value))
                            .collect(),
                    });
                }
            }
            if !field_results.is_empty() {
                results.push(GroupResult {
                    group_key,
                    fields: field_results,
                });
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downsample::SeriesDownSampler;
    use rusts_core::{FieldMeta, FieldType, TimeRange};

    fn window() -> TimeWindow {
        TimeWindow::new(TimeRange::new(0, 40_000), 0, 10_000).unwrap()
    }

    fn spec(id: FieldId, name: &str, functions: &[FunctionType]) -> AggregatorSpec {
        let mut spec = AggregatorSpec::new(&FieldMeta::new(id, name, FieldType::Sum));
        for f in functions {
            spec.add_function(*f).unwrap();
        }
        spec
    }

    #[test]
    fn test_rejects_bad_specs() {
        assert!(GroupingAggregator::new(window(), vec![]).is_err());
        let unsorted = vec![spec(2, "b", &[FunctionType::Sum]), spec(1, "a", &[FunctionType::Sum])];
        assert!(GroupingAggregator::new(window(), unsorted).is_err());
    }

    #[test]
    fn test_groups_merge_across_series() {
        let window = window();
        let specs = vec![spec(1, "usage", &[FunctionType::Sum, FunctionType::Max])];
        let mut sampler = SeriesDownSampler::new(&window, &specs);
        sampler.accept(1, 1, 0, 0, 1.0);
        sampler.accept(2, 1, 0, 0, 3.0);
        sampler.accept(3, 1, 0, 2, 5.0);
        let series = sampler.into_series();

        let mut aggregator = GroupingAggregator::new(window, specs.clone()).unwrap();
        aggregator.aggregate(b"a", &series[&1]);
        aggregator.aggregate(b"a", &series[&2]);
        aggregator.aggregate(b"b", &series[&3]);
        aggregator.aggregate(b"c", &SeriesFields::new(&specs));
        assert_eq!(aggregator.group_count(), 2);

        let results = aggregator.into_result_set();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].group_key, b"a".to_vec());
        assert_eq!(results[0].fields.len(), 2);
        assert_eq!(results[0].fields[0].function, FunctionType::Sum);
        assert_eq!(results[0].fields[0].points, vec![(0, 4.0)]);
        assert_eq!(results[0].fields[1].function, FunctionType::Max);
        assert_eq!(results[0].fields[1].points, vec![(0, 3.0)]);
        assert_eq!(results[1].fields[0].points, vec![(20_000, 5.0)]);
    }

    #[test]
    fn test_field_order_follows_specs() {
        let window = window();
        let specs = vec![spec(1, "a", &[FunctionType::Sum]), spec(2, "b", &[FunctionType::Sum])];
        let mut sampler = SeriesDownSampler::new(&window, &specs);
        sampler.accept(1, 2, 0, 0, 1.0);
        sampler.accept(1, 1, 0, 0, 2.0);

        let series = sampler.into_series();

        let mut aggregator = GroupingAggregator::new(window, specs).unwrap();
        for fields in series.values() {
            aggregator.aggregate(&[], fields);
        }
        let results = aggregator.into_result_set();
        let names: Vec<&str> = results[0].fields.iter().map(|f| f.field_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
