use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one shard of the monitored change feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(String);

impl PartitionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PartitionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier of a worker process taking part in the consumer group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(String);

impl HostId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random host id, used when none is configured.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HostId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Cursor into one partition's change stream.
///
/// Holds the LSN of the last consumed record; reading from a token yields the
/// records with a strictly greater LSN.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ContinuationToken(u64);

impl ContinuationToken {
    pub const BEGINNING: ContinuationToken = ContinuationToken(0);

    pub fn new(lsn: u64) -> Self {
        Self(lsn)
    }

    pub fn lsn(&self) -> u64 {
        self.0
    }

    pub fn is_beginning(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Half-open range of partition keys covered by a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub min_inclusive: String,
    pub max_exclusive: String,
}

impl KeyRange {
    pub fn new(min_inclusive: impl Into<String>, max_exclusive: impl Into<String>) -> Self {
        Self {
            min_inclusive: min_inclusive.into(),
            max_exclusive: max_exclusive.into(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        key >= self.min_inclusive.as_str()
            && (self.max_exclusive.is_empty() || key < self.max_exclusive.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub id: PartitionId,
    pub range: KeyRange,
    /// Partitions this one was split or merged from.
    #[serde(default)]
    pub parents: Vec<PartitionId>,
}

impl Partition {
    pub fn new(id: impl Into<PartitionId>, range: KeyRange) -> Self {
        Self {
            id: id.into(),
            range,
            parents: Vec::new(),
        }
    }

    pub fn with_parents(mut self, parents: Vec<PartitionId>) -> Self {
        self.parents = parents;
        self
    }
}

/// One item mutation carrying the full current state of the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: String,
    pub lsn: u64,
    pub timestamp: DateTime<Utc>,
    pub document: serde_json::Value,
}

/// Ordered changes of a single partition, delivered together.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub partition: PartitionId,
    pub records: Vec<ChangeRecord>,
    /// Token to persist once every record of the batch has been handled.
    pub continuation: ContinuationToken,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn documents(&self) -> impl Iterator<Item = &serde_json::Value> {
        self.records.iter().map(|record| &record.document)
    }
}
