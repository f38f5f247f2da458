use crate::core::{
    ChangeRecord, ContinuationToken, FeedError, KeyRange, Partition, PartitionId, Result,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

/// One page of a partition's change stream.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedPage {
    pub records: Vec<ChangeRecord>,
    /// Token positioned after the last returned record, or the requested
    /// token when the page is empty.
    pub continuation: ContinuationToken,
}

/// Upstream change-feed read API.
///
/// Reads must be idempotent: the same partition and token return the same
/// records for as long as the partition exists.
#[async_trait]
pub trait ChangeFeedSource: Send + Sync {
    async fn partitions(&self) -> Result<Vec<Partition>>;

    /// Errors: `TransientRead` (retry later), `PartitionGone` (re-discover).
    async fn read_changes(
        &self,
        partition: &PartitionId,
        from: &ContinuationToken,
        max_items: usize,
    ) -> Result<FeedPage>;

    /// Token positioned at the current end of the partition.
    async fn latest_token(&self, partition: &PartitionId) -> Result<ContinuationToken>;
}

#[derive(Debug, Clone)]
struct PartitionLog {
    partition: Partition,
    records: Vec<ChangeRecord>,
    gone: bool,
}

#[derive(Debug, Default)]
struct FeedState {
    logs: BTreeMap<PartitionId, PartitionLog>,
    /// Feed-wide LSN so tokens stay comparable across splits.
    last_lsn: u64,
    failing_reads: HashMap<PartitionId, usize>,
}

/// An in-process change feed with hash-range partitions.
///
/// Documents are routed to the partition whose range covers their `id`.
#[derive(Clone, Default)]
pub struct InMemoryChangeFeed {
    state: Arc<Mutex<FeedState>>,
}

impl InMemoryChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// A feed of `count` partitions named `"0"`..`"count-1"` with evenly
    /// split two-hex-digit key ranges.
    pub async fn with_partitions(count: usize) -> Self {
        let feed = Self::new();
        let count = count.max(1);
        for index in 0..count {
            let min = if index == 0 {
                String::new()
            } else {
                format!("{:02X}", index * 256 / count)
            };
            let max = if index + 1 == count {
                String::new()
            } else {
                format!("{:02X}", (index + 1) * 256 / count)
            };
            feed.add_partition(Partition::new(index.to_string(), KeyRange::new(min, max)))
                .await;
        }
        feed
    }

    pub async fn add_partition(&self, partition: Partition) {
        let mut state = self.state.lock().await;
        state.logs.insert(
            partition.id.clone(),
            PartitionLog {
                partition,
                records: Vec::new(),
                gone: false,
            },
        );
    }

    /// Appends a change of `document` to the partition covering its id.
    pub async fn upsert(&self, document: serde_json::Value) -> Result<ChangeRecord> {
        let id = document_id(&document)?;
        let mut state = self.state.lock().await;
        let target = state
            .logs
            .values()
            .find(|log| !log.gone && log.partition.range.contains(&routing_key(&id)))
            .map(|log| log.partition.id.clone())
            .ok_or_else(|| FeedError::PartitionGone(format!("no live partition covers '{}'", id)))?;
        Self::append(&mut state, &target, id, document)
    }

    /// Appends a change directly to `partition`.
    pub async fn upsert_into(
        &self,
        partition: &PartitionId,
        document: serde_json::Value,
    ) -> Result<ChangeRecord> {
        let id = document_id(&document)?;
        let mut state = self.state.lock().await;
        Self::append(&mut state, partition, id, document)
    }

    /// Retires `partition` and replaces it with two children splitting its
    /// range at `split_key`. Reads of the parent fail with `PartitionGone`.
    pub async fn split(
        &self,
        partition: &PartitionId,
        split_key: &str,
        children: [PartitionId; 2],
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let parent = state
            .logs
            .get_mut(partition)
            .filter(|log| !log.gone)
            .ok_or_else(|| FeedError::PartitionGone(partition.to_string()))?;
        parent.gone = true;
        let range = parent.partition.range.clone();
        let history = parent.records.clone();

        let [left, right] = children;
        let halves = [
            (left, KeyRange::new(range.min_inclusive.clone(), split_key)),
            (right, KeyRange::new(split_key, range.max_exclusive.clone())),
        ];
        for (id, range) in halves {
            // children carry the parent's history so inherited tokens resume exactly
            let records = history
                .iter()
                .filter(|record| range.contains(&routing_key(&record.id)))
                .cloned()
                .collect();
            state.logs.insert(
                id.clone(),
                PartitionLog {
                    partition: Partition::new(id, range).with_parents(vec![partition.clone()]),
                    records,
                    gone: false,
                },
            );
        }
        Ok(())
    }

    /// Retires `parents` and replaces them with one `child` covering their
    /// combined range. The child holds both histories in LSN order.
    pub async fn merge(&self, parents: [PartitionId; 2], child: PartitionId) -> Result<()> {
        let mut state = self.state.lock().await;
        for parent in &parents {
            if !state.logs.get(parent).is_some_and(|log| !log.gone) {
                return Err(FeedError::PartitionGone(parent.to_string()));
            }
        }

        let mut min_inclusive: Option<String> = None;
        let mut max_exclusive: Option<String> = None;
        let mut records = Vec::new();
        for parent in &parents {
            if let Some(log) = state.logs.get_mut(parent) {
                log.gone = true;
                let range = &log.partition.range;
                if min_inclusive.as_ref().is_none_or(|min| range.min_inclusive < *min) {
                    min_inclusive = Some(range.min_inclusive.clone());
                }
                // an empty upper bound is unbounded
                if max_exclusive.as_ref().is_none_or(|max| {
                    !max.is_empty() && (range.max_exclusive.is_empty() || range.max_exclusive > *max)
                }) {
                    max_exclusive = Some(range.max_exclusive.clone());
                }
                records.extend(log.records.iter().cloned());
            }
        }
        records.sort_by_key(|record: &ChangeRecord| record.lsn);

        let range = KeyRange::new(
            min_inclusive.unwrap_or_default(),
            max_exclusive.unwrap_or_default(),
        );
        state.logs.insert(
            child.clone(),
            PartitionLog {
                partition: Partition::new(child, range).with_parents(parents.to_vec()),
                records,
                gone: false,
            },
        );
        Ok(())
    }

    /// Makes the next `count` reads of `partition` fail transiently.
    pub async fn fail_next_reads(&self, partition: &PartitionId, count: usize) {
        let mut state = self.state.lock().await;
        state.failing_reads.insert(partition.clone(), count);
    }

    fn append(
        state: &mut FeedState,
        partition: &PartitionId,
        id: String,
        document: serde_json::Value,
    ) -> Result<ChangeRecord> {
        let lsn = state.last_lsn + 1;
        let log = state
            .logs
            .get_mut(partition)
            .filter(|log| !log.gone)
            .ok_or_else(|| FeedError::PartitionGone(partition.to_string()))?;
        let record = ChangeRecord {
            id,
            lsn,
            timestamp: Utc::now(),
            document,
        };
        log.records.push(record.clone());
        state.last_lsn = lsn;
        Ok(record)
    }
}

#[async_trait]
impl ChangeFeedSource for InMemoryChangeFeed {
    async fn partitions(&self) -> Result<Vec<Partition>> {
        let state = self.state.lock().await;
        Ok(state
            .logs
            .values()
            .filter(|log| !log.gone)
            .map(|log| log.partition.clone())
            .collect())
    }

    async fn read_changes(
        &self,
        partition: &PartitionId,
        from: &ContinuationToken,
        max_items: usize,
    ) -> Result<FeedPage> {
        let mut state = self.state.lock().await;
        if let Some(remaining) = state.failing_reads.get_mut(partition) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(FeedError::TransientRead(format!(
                    "injected read failure on partition '{}'",
                    partition
                )));
            }
        }

        let log = state
            .logs
            .get(partition)
            .ok_or_else(|| FeedError::PartitionGone(partition.to_string()))?;
        if log.gone {
            return Err(FeedError::PartitionGone(partition.to_string()));
        }

        let records: Vec<ChangeRecord> = log
            .records
            .iter()
            .filter(|record| record.lsn > from.lsn())
            .take(max_items.max(1))
            .cloned()
            .collect();
        let continuation = records
            .last()
            .map(|record| ContinuationToken::new(record.lsn))
            .unwrap_or(*from);
        Ok(FeedPage {
            records,
            continuation,
        })
    }

    async fn latest_token(&self, partition: &PartitionId) -> Result<ContinuationToken> {
        let state = self.state.lock().await;
        let log = state
            .logs
            .get(partition)
            .filter(|log| !log.gone)
            .ok_or_else(|| FeedError::PartitionGone(partition.to_string()))?;
        Ok(log
            .records
            .last()
            .map(|record| ContinuationToken::new(record.lsn))
            .unwrap_or(ContinuationToken::new(state.last_lsn)))
    }
}

fn document_id(document: &serde_json::Value) -> Result<String> {
    match document.get("id") {
        Some(serde_json::Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        _ => Err(FeedError::Serialization(
            "change documents need a non-empty string 'id'".to_string(),
        )),
    }
}

/// Two hex digits of a stable hash of the document id.
fn routing_key(id: &str) -> String {
    // FNV-1a; stable across processes unlike the std hasher
    let mut hash: u32 = 0x811c_9dc5;
    for byte in id.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    format!("{:02X}", hash & 0xFF)
}
