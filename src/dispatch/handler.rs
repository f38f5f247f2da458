use super::sink::DocumentSink;
use crate::core::{Batch, FeedError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// User code invoked with every batch of changes.
///
/// Delivery is at-least-once: a batch whose handling failed is delivered
/// again, so implementations must be idempotent.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn handle(&self, batch: &Batch) -> Result<()>;
}

/// Plain function handler, see [`handler_fn`].
pub type HandlerFn = Arc<dyn Fn(&Batch) -> Result<()> + Send + Sync>;

struct FnHandler {
    f: HandlerFn,
}

#[async_trait]
impl ChangeHandler for FnHandler {
    async fn handle(&self, batch: &Batch) -> Result<()> {
        (self.f)(batch)
    }
}

/// Wraps a synchronous closure as a `ChangeHandler`.
pub fn handler_fn<F>(f: F) -> Arc<dyn ChangeHandler>
where
    F: Fn(&Batch) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler { f: Arc::new(f) })
}

/// Copies every changed document into an output container.
///
/// Each document gets its own write result; any failure fails the whole
/// batch so its token is not checkpointed and the batch is delivered again.
/// Documents that were written before the failure are simply upserted
/// again on redelivery.
pub struct CopyToContainerHandler {
    sink: Arc<dyn DocumentSink>,
}

impl CopyToContainerHandler {
    pub fn new(sink: Arc<dyn DocumentSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl ChangeHandler for CopyToContainerHandler {
    async fn handle(&self, batch: &Batch) -> Result<()> {
        let mut failed = Vec::new();
        for record in &batch.records {
            match self.sink.write(&record.document).await {
                Ok(()) => debug!(
                    partition = %batch.partition,
                    id = %record.id,
                    lsn = record.lsn,
                    container = self.sink.name(),
                    "document copied"
                ),
                Err(err) => {
                    warn!(
                        partition = %batch.partition,
                        id = %record.id,
                        lsn = record.lsn,
                        container = self.sink.name(),
                        error = %err,
                        "document not copied"
                    );
                    failed.push(record.id.clone());
                }
            }
        }

        if failed.is_empty() {
            return Ok(());
        }

        Err(FeedError::HandlerFailed(format!(
            "{} of {} documents from partition {} were not written to {}: {}",
            failed.len(),
            batch.len(),
            batch.partition,
            self.sink.name(),
            failed.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ChangeRecord, ContinuationToken};
    use crate::dispatch::InMemoryContainer;
    use chrono::Utc;
    use serde_json::json;

    fn batch(documents: Vec<serde_json::Value>) -> Batch {
        let records: Vec<ChangeRecord> = documents
            .into_iter()
            .enumerate()
            .map(|(i, document)| ChangeRecord {
                id: document
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                lsn: i as u64 + 1,
                timestamp: Utc::now(),
                document,
            })
            .collect();
        let continuation = ContinuationToken::new(records.len() as u64);
        Batch {
            partition: "0".into(),
            records,
            continuation,
        }
    }

    #[tokio::test]
    async fn copy_handler_writes_every_document() {
        let output = InMemoryContainer::new("copy");
        let handler = CopyToContainerHandler::new(Arc::new(output.clone()));

        handler
            .handle(&batch(vec![json!({"id": "a"}), json!({"id": "b"})]))
            .await
            .unwrap();
        assert_eq!(output.len().await, 2);
    }

    #[tokio::test]
    async fn copy_handler_fails_batch_but_writes_the_rest() {
        let output = InMemoryContainer::new("copy");
        let handler = CopyToContainerHandler::new(Arc::new(output.clone()));

        let err = handler
            .handle(&batch(vec![
                json!({"id": "a"}),
                json!({"no_id": true}),
                json!({"id": "c"}),
            ]))
            .await
            .unwrap_err();

        assert!(matches!(err, FeedError::HandlerFailed(_)));
        assert!(err.to_string().contains("1 of 3"));
        assert_eq!(output.len().await, 2);
    }

    #[tokio::test]
    async fn closures_become_handlers() {
        let handler = handler_fn(|batch| {
            if batch.len() > 1 {
                Err(FeedError::HandlerFailed("too big".into()))
            } else {
                Ok(())
            }
        });

        assert!(handler.handle(&batch(vec![json!({"id": "a"})])).await.is_ok());
        assert!(
            handler
                .handle(&batch(vec![json!({"id": "a"}), json!({"id": "b"})]))
                .await
                .is_err()
        );
    }
}
