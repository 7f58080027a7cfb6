//! Metadata and series index collaborators
//!
//! The leaf executor never owns an index; it talks to these traits. The
//! metadata store is shared by a database, the series filter and grouping
//! context belong to a shard.

use crate::error::Result;
use crate::expr::TagFilter;
use roaring::RoaringBitmap;
use rusts_core::{FieldMeta, MetricId, SeriesId, TagKeyId, TagValueId};
use std::collections::HashMap;
use std::sync::Arc;

/// Resolves names to ids and tag predicates to tag value ids.
pub trait MetadataStore: Send + Sync {
    /// Metric id for `namespace` + `metric_name`
    fn metric_id(&self, namespace: &str, metric_name: &str) -> Result<MetricId>;

    /// Tag key id of `tag_key` under the metric
    fn tag_key_id(&self, namespace: &str, metric_name: &str, tag_key: &str) -> Result<TagKeyId>;

    /// Field metadata of `field_name` under the metric
    fn field(&self, namespace: &str, metric_name: &str, field_name: &str) -> Result<FieldMeta>;

    /// All fields of the metric
    fn fields(&self, namespace: &str, metric_name: &str) -> Result<Vec<FieldMeta>>;

    /// Tag value ids of `tag_key_id` matching the leaf predicate `filter`
    fn find_tag_value_ids(&self, tag_key_id: TagKeyId, filter: &TagFilter) -> Result<RoaringBitmap>;

    /// Display strings for the given tag value ids
    fn collect_tag_values(
        &self,
        tag_key_id: TagKeyId,
        tag_value_ids: &RoaringBitmap,
    ) -> Result<HashMap<TagValueId, String>>;
}

/// Series id lookups against a shard's inverted index.
pub trait SeriesFilter: Send + Sync {
    /// Series carrying any of `tag_value_ids` for the tag key
    fn series_ids_by_tag_value_ids(
        &self,
        tag_key_id: TagKeyId,
        tag_value_ids: &RoaringBitmap,
    ) -> Result<RoaringBitmap>;

    /// Every series carrying the tag key
    fn series_ids_for_tag(&self, tag_key_id: TagKeyId) -> Result<RoaringBitmap>;

    /// Every series of the metric with at least one tag
    fn series_ids_for_metric(&self, metric_id: MetricId) -> Result<RoaringBitmap>;

    /// Grouping context over `series_ids` for the group-by tag keys
    fn grouping_context(
        &self,
        tag_key_ids: &[TagKeyId],
        series_ids: &RoaringBitmap,
    ) -> Result<Arc<dyn GroupingContext>>;
}

/// Groups series by their tag value ids.
pub trait GroupingContext: Send + Sync {
    /// Splits `series_ids` into groups keyed by [`group_key`] bytes.
    ///
    /// Series lacking any of the group-by tag keys are left out.
    fn build_group(&self, series_ids: &[SeriesId]) -> Result<HashMap<Vec<u8>, Vec<SeriesId>>>;
}

/// Group key bytes: big-endian tag value ids in group-by order
pub fn group_key(tag_value_ids: &[TagValueId]) -> Vec<u8> {
    let mut key = Vec::with_capacity(tag_value_ids.len() * 4);
    for id in tag_value_ids {
        key.extend_from_slice(&id.to_be_bytes());
    }
    key
}

/// Inverse of [`group_key`]; trailing partial ids are ignored
pub fn decode_group_key(key: &[u8]) -> Vec<TagValueId> {
    key.chunks_exact(4)
        .map(|chunk| TagValueId::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_key_layout() {
        let key = group_key(&[1, 256]);
        assert_eq!(key, vec![0, 0, 0, 1, 0, 0, 1, 0]);
        assert_eq!(decode_group_key(&key), vec![1, 256]);
        assert!(group_key(&[]).is_empty());
        assert_eq!(decode_group_key(&[0, 0, 0, 7, 9]), vec![7]);
    }
}
