//! In-memory metadata store and series index
//!
//! Reference backends for the collaborator traits. Ids are assigned on
//! first registration; tag value -> series postings are kept in Roaring
//! bitmaps, one per tag value, plus one per tag key and one per metric.

use crate::error::{IndexError, Result};
use crate::expr::{like_match, TagFilter};
use crate::metadata::{group_key, GroupingContext, MetadataStore, SeriesFilter};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use roaring::RoaringBitmap;
use rusts_core::{
    FieldId, FieldMeta, FieldType, MetricId, SeriesId, Tag, TagKeyId, TagValueId,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Compiled tag filter patterns, shared by every index instance
static REGEX_CACHE: Lazy<RwLock<HashMap<String, Regex>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

fn get_or_compile_regex(pattern: &str) -> Result<Regex> {
    {
        let cache = REGEX_CACHE.read();
        if let Some(re) = cache.get(pattern) {
            return Ok(re.clone());
        }
    }

    let re = Regex::new(pattern)
        .map_err(|e| IndexError::InvalidFilter(format!("invalid regex '{}': {}", pattern, e)))?;
    REGEX_CACHE.write().insert(pattern.to_string(), re.clone());
    Ok(re)
}

#[derive(Default)]
struct MetricEntry {
    tag_keys: HashMap<String, TagKeyId>,
    fields: Vec<FieldMeta>,
}

#[derive(Default)]
struct TagValues {
    by_value: HashMap<String, TagValueId>,
    by_id: HashMap<TagValueId, String>,
}

/// Metadata store keeping metrics, tag keys, fields and tag values in memory
pub struct MemoryMetadata {
    /// "namespace/metric" -> metric id
    metric_ids: DashMap<String, MetricId>,
    metrics: DashMap<MetricId, MetricEntry>,
    tag_values: DashMap<TagKeyId, TagValues>,
    next_metric_id: AtomicU32,
    next_tag_key_id: AtomicU32,
}

impl MemoryMetadata {
    pub fn new() -> Self {
        Self {
            metric_ids: DashMap::new(),
            metrics: DashMap::new(),
            tag_values: DashMap::new(),
            next_metric_id: AtomicU32::new(1),
            next_tag_key_id: AtomicU32::new(1),
        }
    }

    /// Get or assign the metric id
    pub fn register_metric(&self, namespace: &str, metric_name: &str) -> MetricId {
        *self
            .metric_ids
            .entry(metric_key(namespace, metric_name))
            .or_insert_with(|| {
                let id = self.next_metric_id.fetch_add(1, Ordering::Relaxed);
                self.metrics.insert(id, MetricEntry::default());
                id
            })
    }

    /// Get or assign a field; ids are assigned in registration order from 1.
    ///
    /// Re-registering a known field returns its existing metadata.
    pub fn register_field(
        &self,
        namespace: &str,
        metric_name: &str,
        field_name: &str,
        field_type: FieldType,
    ) -> FieldMeta {
        let metric_id = self.register_metric(namespace, metric_name);
        let mut entry = self.metrics.entry(metric_id).or_default();
        if let Some(existing) = entry.fields.iter().find(|f| f.name == field_name) {
            return existing.clone();
        }
        let meta = FieldMeta::new(entry.fields.len() as FieldId + 1, field_name, field_type);
        entry.fields.push(meta.clone());
        meta
    }

    /// Get or assign the tag key id
    pub fn register_tag_key(&self, namespace: &str, metric_name: &str, tag_key: &str) -> TagKeyId {
        let metric_id = self.register_metric(namespace, metric_name);
        let mut entry = self.metrics.entry(metric_id).or_default();
        if let Some(id) = entry.tag_keys.get(tag_key) {
            return *id;
        }
        let id = self.next_tag_key_id.fetch_add(1, Ordering::Relaxed);
        entry.tag_keys.insert(tag_key.to_string(), id);
        id
    }

    /// Get or assign the tag value id; ids are assigned per tag key from 1
    pub fn register_tag_value(&self, tag_key_id: TagKeyId, value: &str) -> TagValueId {
        let mut values = self.tag_values.entry(tag_key_id).or_default();
        if let Some(id) = values.by_value.get(value) {
            return *id;
        }
        let id = values.by_value.len() as TagValueId + 1;
        values.by_value.insert(value.to_string(), id);
        values.by_id.insert(id, value.to_string());
        id
    }

    fn lookup_metric(&self, namespace: &str, metric_name: &str) -> Result<MetricId> {
        self.metric_ids
            .get(&metric_key(namespace, metric_name))
            .map(|id| *id)
            .ok_or_else(|| IndexError::MetricNotFound(metric_key(namespace, metric_name)))
    }
}

impl Default for MemoryMetadata {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataStore for MemoryMetadata {
    fn metric_id(&self, namespace: &str, metric_name: &str) -> Result<MetricId> {
        self.lookup_metric(namespace, metric_name)
    }

    fn tag_key_id(&self, namespace: &str, metric_name: &str, tag_key: &str) -> Result<TagKeyId> {
        let metric_id = self.lookup_metric(namespace, metric_name)?;
        self.metrics
            .get(&metric_id)
            .and_then(|entry| entry.tag_keys.get(tag_key).copied())
            .ok_or_else(|| IndexError::TagKeyNotFound(format!("{}.{}", metric_name, tag_key)))
    }

    fn field(&self, namespace: &str, metric_name: &str, field_name: &str) -> Result<FieldMeta> {
        let metric_id = self.lookup_metric(namespace, metric_name)?;
        self.metrics
            .get(&metric_id)
            .and_then(|entry| entry.fields.iter().find(|f| f.name == field_name).cloned())
            .ok_or_else(|| IndexError::FieldNotFound(format!("{}.{}", metric_name, field_name)))
    }

    fn fields(&self, namespace: &str, metric_name: &str) -> Result<Vec<FieldMeta>> {
        let metric_id = self.lookup_metric(namespace, metric_name)?;
        Ok(self
            .metrics
            .get(&metric_id)
            .map(|entry| entry.fields.clone())
            .unwrap_or_default())
    }

    fn find_tag_value_ids(
        &self,
        tag_key_id: TagKeyId,
        filter: &TagFilter,
    ) -> Result<RoaringBitmap> {
        let Some(values) = self.tag_values.get(&tag_key_id) else {
            return Ok(RoaringBitmap::new());
        };
        let leaf = filter
            .leaf()
            .ok_or_else(|| IndexError::InvalidFilter(format!("not a tag predicate: {}", filter)))?;

        let mut ids = RoaringBitmap::new();
        match leaf {
            TagFilter::Equals { value, .. } => {
                if let Some(id) = values.by_value.get(value) {
                    ids.insert(*id);
                }
            }
            TagFilter::In { values: wanted, .. } => {
                ids.extend(wanted.iter().filter_map(|v| values.by_value.get(v).copied()));
            }
            TagFilter::Like { pattern, .. } => {
                ids.extend(
                    values
                        .by_value
                        .iter()
                        .filter(|(value, _)| like_match(pattern, value))
                        .map(|(_, id)| *id),
                );
            }
            TagFilter::Regex { pattern, .. } => {
                let re = get_or_compile_regex(pattern)?;
                ids.extend(
                    values
                        .by_value
                        .iter()
                        .filter(|(value, _)| re.is_match(value))
                        .map(|(_, id)| *id),
                );
            }
            // leaf() only yields leaf predicates
            _ => {}
        }
        Ok(ids)
    }

    fn collect_tag_values(
        &self,
        tag_key_id: TagKeyId,
        tag_value_ids: &RoaringBitmap,
    ) -> Result<HashMap<TagValueId, String>> {
        let values = self
            .tag_values
            .get(&tag_key_id)
            .ok_or_else(|| IndexError::TagKeyNotFound(tag_key_id.to_string()))?;
        Ok(tag_value_ids
            .iter()
            .filter_map(|id| values.by_id.get(&id).map(|v| (id, v.clone())))
            .collect())
    }
}

fn metric_key(namespace: &str, metric_name: &str) -> String {
    format!("{}/{}", namespace, metric_name)
}

/// Per-shard inverted index: tag value -> series postings
pub struct MemoryIndex {
    /// Series -> tag values, for grouping
    series: DashMap<SeriesId, HashMap<TagKeyId, TagValueId>>,
    /// (tag key, tag value) -> series bitmap
    postings: DashMap<(TagKeyId, TagValueId), RoaringBitmap>,
    /// Tag key -> every series carrying it
    tag_series: DashMap<TagKeyId, RoaringBitmap>,
    /// Metric -> every tagged series of it
    metric_series: DashMap<MetricId, RoaringBitmap>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self {
            series: DashMap::new(),
            postings: DashMap::new(),
            tag_series: DashMap::new(),
            metric_series: DashMap::new(),
        }
    }

    /// Index a series by already assigned tag ids.
    ///
    /// A series without tags is only known to the storage layer; it is not
    /// part of the metric's tagged series set.
    pub fn index_series(
        &self,
        series_id: SeriesId,
        metric_id: MetricId,
        tags: &[(TagKeyId, TagValueId)],
    ) {
        if tags.is_empty() {
            return;
        }
        for &(tag_key_id, tag_value_id) in tags {
            self.postings
                .entry((tag_key_id, tag_value_id))
                .or_insert_with(RoaringBitmap::new)
                .insert(series_id);
            self.tag_series
                .entry(tag_key_id)
                .or_insert_with(RoaringBitmap::new)
                .insert(series_id);
        }
        self.metric_series
            .entry(metric_id)
            .or_insert_with(RoaringBitmap::new)
            .insert(series_id);
        self.series
            .entry(series_id)
            .or_default()
            .extend(tags.iter().copied());
    }

    /// Index a series by tag strings, assigning ids through `metadata`
    pub fn index_tags(
        &self,
        metadata: &MemoryMetadata,
        namespace: &str,
        metric_name: &str,
        series_id: SeriesId,
        tags: &[Tag],
    ) {
        let metric_id = metadata.register_metric(namespace, metric_name);
        let ids: Vec<(TagKeyId, TagValueId)> = tags
            .iter()
            .map(|tag| {
                let tag_key_id = metadata.register_tag_key(namespace, metric_name, &tag.key);
                (tag_key_id, metadata.register_tag_value(tag_key_id, &tag.value))
            })
            .collect();
        self.index_series(series_id, metric_id, &ids);
    }

    /// Number of tagged series
    pub fn series_count(&self) -> usize {
        self.series.len()
    }
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SeriesFilter for MemoryIndex {
    fn series_ids_by_tag_value_ids(
        &self,
        tag_key_id: TagKeyId,
        tag_value_ids: &RoaringBitmap,
    ) -> Result<RoaringBitmap> {
        let mut result = RoaringBitmap::new();
        for tag_value_id in tag_value_ids {
            if let Some(bitmap) = self.postings.get(&(tag_key_id, tag_value_id)) {
                result |= bitmap.value();
            }
        }
        Ok(result)
    }

    fn series_ids_for_tag(&self, tag_key_id: TagKeyId) -> Result<RoaringBitmap> {
        self.tag_series
            .get(&tag_key_id)
            .map(|bitmap| bitmap.value().clone())
            .ok_or_else(|| IndexError::TagKeyNotFound(tag_key_id.to_string()))
    }

    fn series_ids_for_metric(&self, metric_id: MetricId) -> Result<RoaringBitmap> {
        self.metric_series
            .get(&metric_id)
            .map(|bitmap| bitmap.value().clone())
            .ok_or_else(|| IndexError::SeriesNotFound(format!("metric {}", metric_id)))
    }

    fn grouping_context(
        &self,
        tag_key_ids: &[TagKeyId],
        series_ids: &RoaringBitmap,
    ) -> Result<Arc<dyn GroupingContext>> {
        let mut series_tags = HashMap::with_capacity(series_ids.len() as usize);
        for series_id in series_ids {
            let Some(tags) = self.series.get(&series_id) else {
                continue;
            };
            let values: Option<Vec<TagValueId>> =
                tag_key_ids.iter().map(|key| tags.get(key).copied()).collect();
            if let Some(values) = values {
                series_tags.insert(series_id, values);
            }
        }
        Ok(Arc::new(MemoryGroupingContext { series_tags }))
    }
}

/// Snapshot of group-by tag values for the series of one shard
pub struct MemoryGroupingContext {
    /// Only series carrying every group-by key
    series_tags: HashMap<SeriesId, Vec<TagValueId>>,
}

impl GroupingContext for MemoryGroupingContext {
    fn build_group(&self, series_ids: &[SeriesId]) -> Result<HashMap<Vec<u8>, Vec<SeriesId>>> {
        let mut groups: HashMap<Vec<u8>, Vec<SeriesId>> = HashMap::new();
        for series_id in series_ids {
            if let Some(values) = self.series_tags.get(series_id) {
                groups.entry(group_key(values)).or_default().push(*series_id);
            }
        }
        Ok(groups)
    }
}
