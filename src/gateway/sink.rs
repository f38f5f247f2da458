use super::ContainerClient;
use crate::core::Result;
use crate::dispatch::DocumentSink;
use async_trait::async_trait;
use serde_json::Value;

/// Gateway-assigned properties, dropped from copies.
const SYSTEM_PROPERTIES: &[&str] = &["_rid", "_self", "_etag", "_attachments", "_ts", "_lsn"];

/// Output container written through gateway upserts.
#[derive(Debug, Clone)]
pub struct ContainerSink {
    container: ContainerClient,
}

impl ContainerSink {
    pub fn new(container: ContainerClient) -> Self {
        Self { container }
    }
}

#[async_trait]
impl DocumentSink for ContainerSink {
    fn name(&self) -> &str {
        self.container.name()
    }

    async fn write(&self, document: &Value) -> Result<()> {
        self.container
            .upsert_document(&strip_system_properties(document))
            .await?;
        Ok(())
    }
}

fn strip_system_properties(document: &Value) -> Value {
    let mut copy = document.clone();
    if let Some(fields) = copy.as_object_mut() {
        for property in SYSTEM_PROPERTIES {
            fields.remove(*property);
        }
    }
    copy
}
