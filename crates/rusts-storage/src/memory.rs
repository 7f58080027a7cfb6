//! In-memory database, shards and data families
//!
//! Reference storage for embedding the leaf engine and for tests. Each
//! shard owns its series index; families are created on first write and
//! keyed by their aligned start time.

use crate::error::{Result, StorageError};
use crate::family::{DataFamily, FilterResultSet, LoadSink, SlotPoint};
use crate::shard::{Database, Shard};
use dashmap::DashMap;
use parking_lot::RwLock;
use roaring::RoaringBitmap;
use rusts_core::{FieldId, MetricId, SeriesId, ShardId, TimeRange, Timestamp};
use rusts_index::{MemoryIndex, MemoryMetadata, MetadataStore, SeriesFilter};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

type FieldSlots = BTreeMap<FieldId, BTreeMap<u16, f64>>;

/// Database holding shards in memory, sharing one metadata store
pub struct MemoryDatabase {
    name: String,
    metadata: Arc<MemoryMetadata>,
    shards: DashMap<ShardId, Arc<MemoryShard>>,
}

impl MemoryDatabase {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_metadata(name, Arc::new(MemoryMetadata::new()))
    }

    pub fn with_metadata(name: impl Into<String>, metadata: Arc<MemoryMetadata>) -> Self {
        Self {
            name: name.into(),
            metadata,
            shards: DashMap::new(),
        }
    }

    /// Concrete metadata store, for registering metrics, fields and tags
    pub fn memory_metadata(&self) -> &Arc<MemoryMetadata> {
        &self.metadata
    }

    /// Add a shard, replacing any shard with the same id
    pub fn add_shard(&self, shard: MemoryShard) -> Arc<MemoryShard> {
        let shard = Arc::new(shard);
        self.shards.insert(shard.id, Arc::clone(&shard));
        shard
    }

    pub fn memory_shard(&self, shard_id: ShardId) -> Option<Arc<MemoryShard>> {
        self.shards.get(&shard_id).map(|s| Arc::clone(s.value()))
    }
}

impl Database for MemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn metadata(&self) -> Arc<dyn MetadataStore> {
        self.metadata.clone()
    }

    fn shard(&self, shard_id: ShardId) -> Option<Arc<dyn Shard>> {
        self.shards
            .get(&shard_id)
            .map(|s| Arc::clone(s.value()) as Arc<dyn Shard>)
    }

    fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

/// Shard with a single storage interval
pub struct MemoryShard {
    id: ShardId,
    interval: i64,
    family_duration: i64,
    index: MemoryIndex,
    families: RwLock<BTreeMap<Timestamp, Arc<MemoryFamily>>>,
}

impl MemoryShard {
    /// `family_duration` must be a positive multiple of `interval` holding
    /// at most `u16::MAX + 1` slots
    pub fn new(id: ShardId, interval: i64, family_duration: i64) -> Result<Self> {
        if interval <= 0 || family_duration <= 0 || family_duration % interval != 0 {
            return Err(StorageError::InvalidData(format!(
                "family duration {} is not a positive multiple of interval {}",
                family_duration, interval
            )));
        }
        if family_duration / interval > i64::from(u16::MAX) + 1 {
            return Err(StorageError::InvalidData(format!(
                "family duration {} holds too many slots at interval {}",
                family_duration, interval
            )));
        }
        Ok(Self {
            id,
            interval,
            family_duration,
            index: MemoryIndex::new(),
            families: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn index(&self) -> &MemoryIndex {
        &self.index
    }

    pub fn interval(&self) -> i64 {
        self.interval
    }

    /// Store one value; a later write to the same slot replaces it
    pub fn write(
        &self,
        metric_id: MetricId,
        series_id: SeriesId,
        field_id: FieldId,
        ts: Timestamp,
        value: f64,
    ) -> Result<()> {
        let family_time = ts - ts.rem_euclid(self.family_duration);
        let slot = u16::try_from((ts - family_time) / self.interval)
            .map_err(|_| StorageError::InvalidData(format!("timestamp {} out of slot range", ts)))?;

        let family = {
            let mut families = self.families.write();
            Arc::clone(families.entry(family_time).or_insert_with(|| {
                debug!("Creating family {} for shard {}", family_time, self.id);
                Arc::new(MemoryFamily::new(
                    self.id,
                    family_time,
                    self.interval,
                    self.family_duration,
                ))
            }))
        };
        family.write(metric_id, series_id, field_id, slot, value);
        Ok(())
    }

    pub fn family_count(&self) -> usize {
        self.families.read().len()
    }
}

impl Shard for MemoryShard {
    fn id(&self) -> ShardId {
        self.id
    }

    fn series_filter(&self) -> &dyn SeriesFilter {
        &self.index
    }

    fn families(&self, interval: i64, time_range: &TimeRange) -> Vec<Arc<dyn DataFamily>> {
        if interval != self.interval {
            return Vec::new();
        }
        self.families
            .read()
            .values()
            .filter(|family| family.time_range().overlaps(time_range))
            .map(|family| Arc::clone(family) as Arc<dyn DataFamily>)
            .collect()
    }
}

/// One time span of a shard's data
pub struct MemoryFamily {
    shard_id: ShardId,
    family_time: Timestamp,
    interval: i64,
    duration: i64,
    data: RwLock<HashMap<MetricId, BTreeMap<SeriesId, FieldSlots>>>,
}

impl MemoryFamily {
    fn new(shard_id: ShardId, family_time: Timestamp, interval: i64, duration: i64) -> Self {
        Self {
            shard_id,
            family_time,
            interval,
            duration,
            data: RwLock::new(HashMap::new()),
        }
    }

    fn write(
        &self,
        metric_id: MetricId,
        series_id: SeriesId,
        field_id: FieldId,
        slot: u16,
        value: f64,
    ) {
        self.data
            .write()
            .entry(metric_id)
            .or_default()
            .entry(series_id)
            .or_default()
            .entry(field_id)
            .or_default()
            .insert(slot, value);
    }
}

impl DataFamily for MemoryFamily {
    fn family_time(&self) -> Timestamp {
        self.family_time
    }

    fn interval(&self) -> i64 {
        self.interval
    }

    fn time_range(&self) -> TimeRange {
        TimeRange::new(self.family_time, self.family_time.saturating_add(self.duration))
    }

    fn filter(
        &self,
        metric_id: MetricId,
        series_ids: &RoaringBitmap,
        field_ids: &[FieldId],
    ) -> Result<Vec<Arc<dyn FilterResultSet>>> {
        let data = self.data.read();
        let metric = data.get(&metric_id).ok_or_else(|| {
            StorageError::MetricNotFound(format!(
                "metric {} in family {}",
                metric_id, self.family_time
            ))
        })?;

        let mut snapshot = BTreeMap::new();
        for series_id in series_ids {
            let Some(fields) = metric.get(&series_id) else {
                continue;
            };
            let loaded: BTreeMap<FieldId, Vec<SlotPoint>> = field_ids
                .iter()
                .filter_map(|field_id| {
                    fields.get(field_id).map(|slots| {
                        let points = slots
                            .iter()
                            .map(|(&slot, &value)| SlotPoint::new(slot, value));
                        (*field_id, points.collect())
                    })
                })
                .collect();
            if !loaded.is_empty() {
                snapshot.insert(series_id, loaded);
            }
        }

        if snapshot.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![Arc::new(MemoryResultSet {
            identifier: format!("shard-{}/family-{}", self.shard_id, self.family_time),
            family_time: self.family_time,
            data: snapshot,
        })])
    }
}

/// Snapshot of the filtered series of a family
pub struct MemoryResultSet {
    identifier: String,
    family_time: Timestamp,
    data: BTreeMap<SeriesId, BTreeMap<FieldId, Vec<SlotPoint>>>,
}

impl FilterResultSet for MemoryResultSet {
    fn identifier(&self) -> String {
        self.identifier.clone()
    }

    fn family_time(&self) -> Timestamp {
        self.family_time
    }

    fn series_ids(&self) -> RoaringBitmap {
        self.data.keys().copied().collect()
    }

    fn load(
        &self,
        series_ids: &[SeriesId],
        field_ids: &[FieldId],
        sink: &mut LoadSink<'_>,
    ) -> Result<()> {
        for series_id in series_ids {
            let Some(fields) = self.data.get(series_id) else {
                continue;
            };
            for field_id in field_ids {
                if let Some(points) = fields.get(field_id) {
                    sink(*series_id, *field_id, points);
                }
            }
        }
        Ok(())
    }
}
