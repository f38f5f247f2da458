use super::{ContainerClient, expect_json};
use crate::core::{ChangeRecord, ContinuationToken, FeedError, KeyRange, Partition, PartitionId, Result};
use crate::feed::{ChangeFeedSource, FeedPage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePartitionKeyRange {
    id: String,
    #[serde(default)]
    min_inclusive: String,
    #[serde(default)]
    max_exclusive: String,
    #[serde(default)]
    parents: Vec<String>,
}

impl From<WirePartitionKeyRange> for Partition {
    fn from(wire: WirePartitionKeyRange) -> Self {
        Partition::new(wire.id, KeyRange::new(wire.min_inclusive, wire.max_exclusive))
            .with_parents(wire.parents.into_iter().map(PartitionId::from).collect())
    }
}

#[derive(Debug, Deserialize)]
struct WirePartitionKeyRanges {
    #[serde(rename = "PartitionKeyRanges", default)]
    ranges: Vec<WirePartitionKeyRange>,
}

#[derive(Debug, Deserialize)]
struct WireChanges {
    #[serde(rename = "Documents", default)]
    documents: Vec<Value>,
    #[serde(default)]
    continuation: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRangeInfo {
    #[serde(default)]
    latest_lsn: u64,
}

/// Change feed of the monitored container, read per partition key range.
#[derive(Debug, Clone)]
pub struct GatewayChangeFeed {
    container: ContainerClient,
}

impl GatewayChangeFeed {
    pub fn new(container: ContainerClient) -> Self {
        Self { container }
    }
}

#[async_trait]
impl ChangeFeedSource for GatewayChangeFeed {
    async fn partitions(&self) -> Result<Vec<Partition>> {
        let response = self.container.get(&["pkranges"]).send().await?;
        let wire: WirePartitionKeyRanges =
            expect_json(response, &self.container.context("list partition key ranges")).await?;
        Ok(wire.ranges.into_iter().map(Partition::from).collect())
    }

    async fn read_changes(
        &self,
        partition: &PartitionId,
        from: &ContinuationToken,
        max_items: usize,
    ) -> Result<FeedPage> {
        let response = self
            .container
            .get(&["pkranges", partition.as_str(), "changes"])
            .query(&[
                ("continuation", from.lsn().to_string()),
                ("maxItemCount", max_items.to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(FeedPage {
                records: Vec::new(),
                continuation: *from,
            });
        }
        if status == StatusCode::GONE {
            return Err(FeedError::PartitionGone(partition.to_string()));
        }

        let context = self.container.context(&format!("read changes of '{}'", partition));
        let wire: WireChanges = expect_json(response, &context).await?;
        page_from_wire(wire, from)
    }

    async fn latest_token(&self, partition: &PartitionId) -> Result<ContinuationToken> {
        let response = self
            .container
            .get(&["pkranges", partition.as_str()])
            .send()
            .await?;
        if response.status() == StatusCode::GONE {
            return Err(FeedError::PartitionGone(partition.to_string()));
        }
        let info: WireRangeInfo =
            expect_json(response, &self.container.context("read partition key range")).await?;
        Ok(ContinuationToken::new(info.latest_lsn))
    }
}

fn page_from_wire(wire: WireChanges, from: &ContinuationToken) -> Result<FeedPage> {
    let mut records = wire
        .documents
        .into_iter()
        .map(record_from_document)
        .collect::<Result<Vec<_>>>()?;
    records.sort_by_key(|record| record.lsn);
    records.retain(|record| record.lsn > from.lsn());

    let continuation = match records.last() {
        Some(record) => ContinuationToken::new(record.lsn),
        None => ContinuationToken::new(wire.continuation.unwrap_or(0).max(from.lsn())),
    };
    Ok(FeedPage {
        records,
        continuation,
    })
}

/// Builds a record from a feed document carrying `id`, `_lsn` and `_ts`.
fn record_from_document(document: Value) -> Result<ChangeRecord> {
    let id = document
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| FeedError::Serialization("change document without 'id'".to_string()))?
        .to_string();
    let lsn = document.get("_lsn").and_then(Value::as_u64).ok_or_else(|| {
        FeedError::Serialization(format!("change document '{}' without '_lsn'", id))
    })?;
    let timestamp = document
        .get("_ts")
        .and_then(Value::as_i64)
        .and_then(|seconds| DateTime::<Utc>::from_timestamp(seconds, 0))
        .unwrap_or_else(Utc::now);

    Ok(ChangeRecord {
        id,
        lsn,
        timestamp,
        document,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_partition_key_ranges() {
        let wire: WirePartitionKeyRanges = serde_json::from_value(json!({
            "PartitionKeyRanges": [
                {"id": "1", "minInclusive": "", "maxExclusive": "80", "parents": ["0"]},
                {"id": "2", "minInclusive": "80", "maxExclusive": "FF"}
            ]
        }))
        .unwrap();
        let partitions: Vec<Partition> = wire.ranges.into_iter().map(Partition::from).collect();

        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[0].parents, vec![PartitionId::from("0")]);
        assert!(partitions[1].parents.is_empty());
        assert!(partitions[1].range.contains("A0"));
    }

    #[test]
    fn page_continuation_follows_the_last_record() {
        let wire: WireChanges = serde_json::from_value(json!({
            "Documents": [
                {"id": "b", "_lsn": 7, "_ts": 1_700_000_000},
                {"id": "a", "_lsn": 5, "_ts": 1_700_000_000}
            ]
        }))
        .unwrap();

        let page = page_from_wire(wire, &ContinuationToken::new(4)).unwrap();
        let ids: Vec<&str> = page.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(page.continuation, ContinuationToken::new(7));
        assert_eq!(page.records[0].timestamp.timestamp(), 1_700_000_000);
    }

    #[test]
    fn records_at_or_before_the_token_are_dropped() {
        let wire: WireChanges = serde_json::from_value(json!({
            "Documents": [{"id": "a", "_lsn": 3}],
            "continuation": 9
        }))
        .unwrap();

        let page = page_from_wire(wire, &ContinuationToken::new(3)).unwrap();
        assert!(page.records.is_empty());
        assert_eq!(page.continuation, ContinuationToken::new(9));
    }

    #[test]
    fn documents_need_an_lsn() {
        let err = record_from_document(json!({"id": "a"})).unwrap_err();
        assert!(matches!(err, FeedError::Serialization(_)));
    }
}
