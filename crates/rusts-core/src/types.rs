//! Core data types shared by the leaf query engine

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Unix epoch timestamp in milliseconds
pub type Timestamp = i64;

/// Metric identifier assigned by the metadata backend
pub type MetricId = u32;

/// Tag key identifier, unique within a metric
pub type TagKeyId = u32;

/// Tag value identifier, unique within a tag key
pub type TagValueId = u32;

/// Series identifier, unique within a shard (roaring bitmap domain)
pub type SeriesId = u32;

/// Field identifier, unique within a metric
pub type FieldId = u16;

/// Shard identifier, unique within a database
pub type ShardId = i32;

/// Series id reserved for the single tag-less series of a metric
pub const SERIES_ID_WITHOUT_TAGS: SeriesId = 0;

/// Name prefix of histogram bucket fields
pub const HISTOGRAM_BUCKET_PREFIX: &str = "__bucket_";

/// A tag is a key-value pair used for series identification
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    /// Create a new tag
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Validate the tag
    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(CoreError::EmptyTagKey);
        }
        Ok(())
    }
}

impl PartialOrd for Tag {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Tag {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.key.cmp(&other.key) {
            Ordering::Equal => self.value.cmp(&other.value),
            other => other,
        }
    }
}

/// Aggregation / down-sampling functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FunctionType {
    Sum,
    Count,
    Min,
    Max,
    Last,
    First,
    /// Histogram quantile, planned as `Sum` over the bucket fields
    Quantile,
}

impl FunctionType {
    /// Parse from a function name (case-insensitive)
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sum" => Ok(FunctionType::Sum),
            "count" => Ok(FunctionType::Count),
            "min" => Ok(FunctionType::Min),
            "max" => Ok(FunctionType::Max),
            "last" => Ok(FunctionType::Last),
            "first" => Ok(FunctionType::First),
            "quantile" => Ok(FunctionType::Quantile),
            _ => Err(CoreError::UnknownFunction(s.to_string())),
        }
    }

    /// Lower-case function name
    pub fn name(&self) -> &'static str {
        match self {
            FunctionType::Sum => "sum",
            FunctionType::Count => "count",
            FunctionType::Min => "min",
            FunctionType::Max => "max",
            FunctionType::Last => "last",
            FunctionType::First => "first",
            FunctionType::Quantile => "quantile",
        }
    }

    /// Merge `value` into an accumulated slot.
    ///
    /// `Count` accumulates counts, so merging partial counts adds them.
    pub fn merge(&self, current: Option<f64>, value: f64) -> f64 {
        match current {
            None => value,
            Some(current) => match self {
                FunctionType::Sum | FunctionType::Count | FunctionType::Quantile => current + value,
                FunctionType::Min => current.min(value),
                FunctionType::Max => current.max(value),
                FunctionType::Last => value,
                FunctionType::First => current,
            },
        }
    }
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Field types; each type fixes how raw samples may be down-sampled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Sum,
    Min,
    Max,
    Last,
    First,
    Histogram,
}

impl FieldType {
    /// Function applied when a field is selected without an enclosing call
    pub fn default_function(&self) -> FunctionType {
        match self {
            FieldType::Sum | FieldType::Histogram => FunctionType::Sum,
            FieldType::Min => FunctionType::Min,
            FieldType::Max => FunctionType::Max,
            FieldType::Last => FunctionType::Last,
            FieldType::First => FunctionType::First,
        }
    }

    /// Whether `function` is a valid down-sampling function for this type
    pub fn supports(&self, function: FunctionType) -> bool {
        use FunctionType as F;
        match self {
            FieldType::Sum => matches!(function, F::Sum | F::Count | F::Min | F::Max),
            FieldType::Min => matches!(function, F::Min | F::Count),
            FieldType::Max => matches!(function, F::Max | F::Count),
            FieldType::Last | FieldType::First => matches!(
                function,
                F::Last | F::First | F::Sum | F::Min | F::Max | F::Count
            ),
            FieldType::Histogram => matches!(function, F::Sum),
        }
    }
}

/// Field metadata
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldMeta {
    pub id: FieldId,
    pub name: String,
    pub field_type: FieldType,
}

impl FieldMeta {
    /// Create new field metadata
    pub fn new(id: FieldId, name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            id,
            name: name.into(),
            field_type,
        }
    }

    /// Whether this is a histogram bucket field
    pub fn is_histogram_bucket(&self) -> bool {
        self.field_type == FieldType::Histogram && self.name.starts_with(HISTOGRAM_BUCKET_PREFIX)
    }
}

/// Tag key metadata
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TagKeyMeta {
    pub id: TagKeyId,
    pub key: String,
}

impl TagKeyMeta {
    pub fn new(id: TagKeyId, key: impl Into<String>) -> Self {
        Self { id, key: key.into() }
    }
}

/// Time range for queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: Timestamp,
    /// End timestamp (exclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Check if a timestamp falls within this range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Check if this range overlaps with another
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Get the duration of this range in milliseconds
    pub fn duration(&self) -> i64 {
        self.end.saturating_sub(self.start)
    }

    /// Whether the range holds no timestamp at all
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Align start down and end up to a multiple of `interval`
    pub fn align(&self, interval: i64) -> TimeRange {
        if interval <= 0 {
            return *self;
        }
        let start = self.start.div_euclid(interval).saturating_mul(interval);
        let end = match self.end.rem_euclid(interval) {
            0 => self.end,
            rem => self.end.saturating_add(interval - rem),
        };
        TimeRange { start, end }
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        Self {
            start: i64::MIN,
            end: i64::MAX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_ordering() {
        let mut tags = vec![
            Tag::new("region", "us-west"),
            Tag::new("host", "server02"),
            Tag::new("host", "server01"),
        ];
        tags.sort();

        assert_eq!(tags[0], Tag::new("host", "server01"));
        assert_eq!(tags[1], Tag::new("host", "server02"));
        assert_eq!(tags[2], Tag::new("region", "us-west"));
        assert!(Tag::new("", "v").validate().is_err());
    }

    #[test]
    fn test_time_range() {
        let range = TimeRange::new(1000, 2000);
        assert!(range.contains(1000));
        assert!(range.contains(1999));
        assert!(!range.contains(2000));
        assert!(range.overlaps(&TimeRange::new(1500, 2500)));
        assert!(!range.overlaps(&TimeRange::new(2000, 3000)));
        assert_eq!(range.duration(), 1000);
        assert!(TimeRange::new(5, 5).is_empty());
    }

    #[test]
    fn test_time_range_align() {
        let range = TimeRange::new(1_050, 2_010).align(100);
        assert_eq!(range, TimeRange::new(1_000, 2_100));

        let aligned = TimeRange::new(1_000, 2_000).align(100);
        assert_eq!(aligned, TimeRange::new(1_000, 2_000));

        let negative = TimeRange::new(-150, -50).align(100);
        assert_eq!(negative, TimeRange::new(-200, 0));
    }

    #[test]
    fn test_function_parse() {
        assert_eq!(FunctionType::parse("SUM").unwrap(), FunctionType::Sum);
        assert_eq!(FunctionType::parse("quantile").unwrap(), FunctionType::Quantile);
        assert!(FunctionType::parse("median").is_err());
        assert_eq!(FunctionType::Max.to_string(), "max");
    }

    #[test]
    fn test_function_merge() {
        assert_eq!(FunctionType::Sum.merge(None, 2.0), 2.0);
        assert_eq!(FunctionType::Sum.merge(Some(1.0), 2.0), 3.0);
        assert_eq!(FunctionType::Count.merge(Some(3.0), 2.0), 5.0);
        assert_eq!(FunctionType::Min.merge(Some(1.0), 2.0), 1.0);
        assert_eq!(FunctionType::Max.merge(Some(1.0), 2.0), 2.0);
        assert_eq!(FunctionType::Last.merge(Some(1.0), 2.0), 2.0);
        assert_eq!(FunctionType::First.merge(Some(1.0), 2.0), 1.0);
    }

    #[test]
    fn test_field_type_functions() {
        assert_eq!(FieldType::Sum.default_function(), FunctionType::Sum);
        assert_eq!(FieldType::Histogram.default_function(), FunctionType::Sum);
        assert_eq!(FieldType::Last.default_function(), FunctionType::Last);

        assert!(FieldType::Sum.supports(FunctionType::Max));
        assert!(!FieldType::Sum.supports(FunctionType::Last));
        assert!(!FieldType::Min.supports(FunctionType::Max));
        assert!(!FieldType::Histogram.supports(FunctionType::Min));
        assert!(!FieldType::Histogram.supports(FunctionType::Quantile));
    }

    #[test]
    fn test_histogram_bucket_detection() {
        assert!(FieldMeta::new(1, "__bucket_10", FieldType::Histogram).is_histogram_bucket());
        assert!(!FieldMeta::new(2, "__bucket_10", FieldType::Sum).is_histogram_bucket());
        assert!(!FieldMeta::new(3, "count", FieldType::Histogram).is_histogram_bucket());
    }

    #[test]
    fn test_field_meta_serialization() {
        let meta = FieldMeta::new(7, "usage", FieldType::Sum);
        let encoded = bincode::serialize(&meta).unwrap();
        let decoded: FieldMeta = bincode::deserialize(&encoded).unwrap();
        assert_eq!(meta, decoded);
    }
}
