use super::source::ChangeFeedSource;
use crate::config::ProcessorOptions;
use crate::core::{Batch, ContinuationToken, PartitionId, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Batch(Batch),
    Empty,
}

/// Polls single partitions of a change feed.
///
/// Stateless between calls: the caller owns the continuation token, so
/// re-polling with an unchanged token redelivers the same batch.
pub struct FeedReader {
    source: Arc<dyn ChangeFeedSource>,
    max_items: usize,
    poll_delay: Duration,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl FeedReader {
    pub fn new(source: Arc<dyn ChangeFeedSource>, options: &ProcessorOptions) -> Self {
        Self {
            source,
            max_items: options.max_items_per_batch,
            poll_delay: options.feed_poll_delay,
            initial_backoff: options.retry_initial_backoff,
            max_backoff: options.retry_max_backoff,
        }
    }

    pub fn source(&self) -> &Arc<dyn ChangeFeedSource> {
        &self.source
    }

    /// Delay before polling a partition that had nothing new.
    pub fn poll_delay(&self) -> Duration {
        self.poll_delay
    }

    pub async fn poll(
        &self,
        partition: &PartitionId,
        token: &ContinuationToken,
    ) -> Result<PollOutcome> {
        let page = self
            .source
            .read_changes(partition, token, self.max_items)
            .await?;

        if page.records.is_empty() {
            trace!(%partition, %token, "no new changes");
            return Ok(PollOutcome::Empty);
        }

        Ok(PollOutcome::Batch(Batch {
            partition: partition.clone(),
            records: page.records,
            continuation: page.continuation,
        }))
    }

    /// Delay before the `attempt`-th retry (1-based) of a failed read:
    /// exponential from the initial backoff, capped at the maximum.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::InMemoryChangeFeed;
    use serde_json::json;

    async fn reader_over(feed: &InMemoryChangeFeed, options: ProcessorOptions) -> FeedReader {
        FeedReader::new(Arc::new(feed.clone()), &options)
    }

    #[tokio::test]
    async fn poll_yields_batches_then_empty() {
        let feed = InMemoryChangeFeed::with_partitions(1).await;
        feed.upsert(json!({"id": "a"})).await.unwrap();
        feed.upsert(json!({"id": "b"})).await.unwrap();
        let reader = reader_over(&feed, ProcessorOptions::default()).await;

        let partition = PartitionId::from("0");
        let PollOutcome::Batch(batch) = reader
            .poll(&partition, &ContinuationToken::BEGINNING)
            .await
            .unwrap()
        else {
            panic!("expected a batch");
        };
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.partition, partition);
        assert_eq!(batch.continuation, ContinuationToken::new(2));

        let next = reader.poll(&partition, &batch.continuation).await.unwrap();
        assert_eq!(next, PollOutcome::Empty);
    }

    #[tokio::test]
    async fn batches_respect_max_items() {
        let feed = InMemoryChangeFeed::with_partitions(1).await;
        for n in 0..7 {
            feed.upsert(json!({"id": format!("d{n}")})).await.unwrap();
        }
        let reader = reader_over(&feed, ProcessorOptions::default().max_items_per_batch(3)).await;

        let PollOutcome::Batch(batch) = reader
            .poll(&"0".into(), &ContinuationToken::BEGINNING)
            .await
            .unwrap()
        else {
            panic!("expected a batch");
        };
        assert_eq!(batch.len(), 3);
        let ids: Vec<_> = batch.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["d0", "d1", "d2"]);
    }

    #[tokio::test]
    async fn backoff_doubles_up_to_the_cap() {
        let feed = InMemoryChangeFeed::new();
        let options = ProcessorOptions::default()
            .retry_backoff(Duration::from_millis(100), Duration::from_millis(1000));
        let reader = reader_over(&feed, options).await;

        assert_eq!(reader.backoff_for(1), Duration::from_millis(100));
        assert_eq!(reader.backoff_for(2), Duration::from_millis(200));
        assert_eq!(reader.backoff_for(4), Duration::from_millis(800));
        assert_eq!(reader.backoff_for(5), Duration::from_millis(1000));
        assert_eq!(reader.backoff_for(60), Duration::from_millis(1000));
    }
}
