//! Leaf task request and response envelope
//!
//! The leaf receives a `TaskRequest`, and answers every receiver named in
//! it with exactly one `TaskResponse`. Results travel as a bincode-encoded
//! `TimeSeriesList` in the payload.

use crate::error::Result;
use crate::stats::ExplainStats;
use crate::stmt::Query;
use fxhash::FxHasher;
use parking_lot::{Condvar, Mutex};
use rusts_core::{FunctionType, ShardId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Separator between tag values in a series' tag string
pub const TAG_SEPARATOR: char = '\u{1f}';

/// Rendering of a tag value id that could not be resolved
pub const NULL_TAG_VALUE: &str = "null";

/// Leaf part of a distributed query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: String,
    pub query: Query,
    pub shard_ids: Vec<ShardId>,
    /// Downstream nodes waiting for the result
    pub receivers: Vec<String>,
}

impl TaskRequest {
    pub fn new(task_id: impl Into<String>, query: Query, shard_ids: Vec<ShardId>) -> Self {
        Self {
            task_id: task_id.into(),
            query,
            shard_ids,
            receivers: Vec::new(),
        }
    }

    pub fn with_receivers<I, S>(mut self, receivers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.receivers = receivers.into_iter().map(Into::into).collect();
        self
    }
}

/// Answer sent to one receiver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub task_id: String,
    pub completed: bool,
    /// Encoded [`TimeSeriesList`]; absent on error
    pub payload: Option<Vec<u8>>,
    pub stats: Option<ExplainStats>,
    pub error_msg: Option<String>,
    pub send_node: String,
}

impl TaskResponse {
    pub fn is_error(&self) -> bool {
        self.error_msg.is_some()
    }

    /// Decode the payload; an error response decodes to `None`
    pub fn series_list(&self) -> Result<Option<TimeSeriesList>> {
        self.payload
            .as_deref()
            .map(TimeSeriesList::decode)
            .transpose()
    }
}

/// Points of one field under one function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSeries {
    pub name: String,
    pub function: FunctionType,
    pub points: Vec<(Timestamp, f64)>,
}

/// One result series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Tag values joined by [`TAG_SEPARATOR`], empty when not grouped
    pub tags: String,
    pub fields: Vec<FieldSeries>,
}

impl TimeSeries {
    /// Tag values in group-by order
    pub fn tag_values(&self) -> Vec<&str> {
        if self.tags.is_empty() {
            return Vec::new();
        }
        self.tags.split(TAG_SEPARATOR).collect()
    }

    pub fn field(&self, name: &str, function: FunctionType) -> Option<&FieldSeries> {
        self.fields
            .iter()
            .find(|field| field.name == name && field.function == function)
    }
}

/// Payload of a successful response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesList {
    pub group_by: Vec<String>,
    pub fields: Vec<String>,
    pub series: Vec<TimeSeries>,
}

impl TimeSeriesList {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Receiver of a series, stable for a given tag string
pub fn receiver_index(tags: &str, receivers: usize) -> usize {
    if receivers <= 1 {
        return 0;
    }
    let mut hasher = FxHasher::default();
    tags.hash(&mut hasher);
    (hasher.finish() % receivers as u64) as usize
}

/// Split series across `receivers` by their tag string
pub fn partition(series: Vec<TimeSeries>, receivers: usize) -> Vec<Vec<TimeSeries>> {
    let mut parts: Vec<Vec<TimeSeries>> = (0..receivers.max(1)).map(|_| Vec::new()).collect();
    if receivers <= 1 {
        parts[0] = series;
        return parts;
    }
    for item in series {
        let index = receiver_index(&item.tags, receivers);
        parts[index].push(item);
    }
    parts
}

/// Outbound stream to one receiver
pub trait ResponseStream: Send + Sync {
    fn send(&self, response: TaskResponse) -> Result<()>;
}

/// Looks up the stream of a receiver
pub trait StreamFactory: Send + Sync {
    fn stream(&self, receiver: &str) -> Option<Arc<dyn ResponseStream>>;
}

#[derive(Default)]
struct Mailbox {
    responses: HashMap<String, Vec<TaskResponse>>,
    total: usize,
}

/// In-process stream factory that keeps what it was sent
#[derive(Clone)]
pub struct MemoryStreamFactory {
    receivers: Vec<String>,
    mailbox: Arc<Mutex<Mailbox>>,
    arrived: Arc<Condvar>,
}

impl MemoryStreamFactory {
    /// Factory knowing only the given receivers
    pub fn new<I, S>(receivers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            receivers: receivers.into_iter().map(Into::into).collect(),
            mailbox: Arc::new(Mutex::new(Mailbox::default())),
            arrived: Arc::new(Condvar::new()),
        }
    }

    pub fn responses(&self, receiver: &str) -> Vec<TaskResponse> {
        self.mailbox
            .lock()
            .responses
            .get(receiver)
            .cloned()
            .unwrap_or_default()
    }

    /// Responses received so far, over all receivers
    pub fn total(&self) -> usize {
        self.mailbox.lock().total
    }

    /// Wait until at least `count` responses arrived; returns the total seen
    pub fn wait_for(&self, count: usize, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut mailbox = self.mailbox.lock();
        while mailbox.total < count {
            if self.arrived.wait_until(&mut mailbox, deadline).timed_out() {
                break;
            }
        }
        mailbox.total
    }
}

struct MemoryStream {
    receiver: String,
    mailbox: Arc<Mutex<Mailbox>>,
    arrived: Arc<Condvar>,
}

impl ResponseStream for MemoryStream {
    fn send(&self, response: TaskResponse) -> Result<()> {
        let mut mailbox = self.mailbox.lock();
        mailbox
            .responses
            .entry(self.receiver.clone())
            .or_default()
            .push(response);
        mailbox.total += 1;
        self.arrived.notify_all();
        Ok(())
    }
}

impl StreamFactory for MemoryStreamFactory {
    fn stream(&self, receiver: &str) -> Option<Arc<dyn ResponseStream>> {
        if !self.receivers.iter().any(|known| known == receiver) {
            return None;
        }
        Some(Arc::new(MemoryStream {
            receiver: receiver.to_string(),
            mailbox: Arc::clone(&self.mailbox),
            arrived: Arc::clone(&self.arrived),
        }))
    }
}
