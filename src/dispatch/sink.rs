use crate::core::{FeedError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// Destination of copied documents.
///
/// `write` upserts by the document's `id`, so redelivered batches overwrite
/// instead of duplicating.
#[async_trait]
pub trait DocumentSink: Send + Sync {
    fn name(&self) -> &str;

    async fn write(&self, document: &Value) -> Result<()>;
}

/// An in-process output container.
#[derive(Clone)]
pub struct InMemoryContainer {
    name: String,
    documents: Arc<Mutex<BTreeMap<String, Value>>>,
    writes: Arc<AtomicUsize>,
}

impl InMemoryContainer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            documents: Arc::new(Mutex::new(BTreeMap::new())),
            writes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn get(&self, id: &str) -> Option<Value> {
        self.documents.lock().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.documents.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.lock().await.is_empty()
    }

    /// Successful writes, counting overwrites.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentSink for InMemoryContainer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, document: &Value) -> Result<()> {
        let id = document
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                FeedError::HandlerFailed(format!(
                    "document without a string 'id' cannot be written to '{}'",
                    self.name
                ))
            })?;
        self.documents
            .lock()
            .await
            .insert(id.to_string(), document.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn writes_upsert_by_id() {
        let container = InMemoryContainer::new("out");
        container.write(&json!({"id": "a", "v": 1})).await.unwrap();
        container.write(&json!({"id": "a", "v": 2})).await.unwrap();

        assert_eq!(container.len().await, 1);
        assert_eq!(container.write_count(), 2);
        assert_eq!(container.get("a").await.unwrap()["v"], 2);
    }

    #[tokio::test]
    async fn documents_without_id_are_rejected() {
        let container = InMemoryContainer::new("out");
        assert!(container.write(&json!({"v": 1})).await.is_err());
        assert!(container.is_empty().await);
    }
}
