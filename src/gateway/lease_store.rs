use super::ContainerClient;
use crate::core::{FeedError, HostId, PartitionId, Result};
use crate::lease::{HostPresence, Lease, LeaseStore};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Serialize, Deserialize)]
struct LeaseDocument {
    id: String,
    #[serde(flatten)]
    lease: Lease,
}

#[derive(Debug, Serialize, Deserialize)]
struct HostDocument {
    id: String,
    #[serde(flatten)]
    presence: HostPresence,
}

/// Leases kept as documents of a lease container.
///
/// Lease documents are named `<prefix>..<partition>` and host heartbeats
/// `<prefix>.host.<host>`, so processors with different prefixes can share
/// one container. Compare-and-swap relies on the gateway's `If-Match`
/// check against the stored `_etag`.
#[derive(Debug, Clone)]
pub struct GatewayLeaseStore {
    container: ContainerClient,
    prefix: String,
}

impl GatewayLeaseStore {
    pub fn new(container: ContainerClient, prefix: impl Into<String>) -> Self {
        Self {
            container,
            prefix: prefix.into(),
        }
    }

    fn lease_id(&self, partition: &PartitionId) -> String {
        format!("{}{}", self.lease_prefix(), partition)
    }

    fn lease_prefix(&self) -> String {
        format!("{}..", self.prefix)
    }

    fn host_id(&self, host: &HostId) -> String {
        format!("{}{}", self.host_prefix(), host)
    }

    fn host_prefix(&self) -> String {
        format!("{}.host.", self.prefix)
    }

    fn lease_document(&self, mut lease: Lease) -> Result<Value> {
        lease.etag.clear();
        let document = LeaseDocument {
            id: self.lease_id(&lease.partition_id),
            lease,
        };
        Ok(serde_json::to_value(document)?)
    }
}

fn lease_from_value(value: Value) -> Result<Lease> {
    let document: LeaseDocument = serde_json::from_value(value)?;
    Ok(document.lease)
}

fn starts_with_id(document: &Value, prefix: &str) -> bool {
    document
        .get("id")
        .and_then(Value::as_str)
        .is_some_and(|id| id.starts_with(prefix))
}

#[async_trait]
impl LeaseStore for GatewayLeaseStore {
    async fn list_leases(&self) -> Result<Vec<Lease>> {
        let prefix = self.lease_prefix();
        let documents = self.container.list_documents().await?;
        let mut leases = Vec::new();
        for document in documents.into_iter().filter(|doc| starts_with_id(doc, &prefix)) {
            match lease_from_value(document) {
                Ok(lease) => leases.push(lease),
                Err(err) => debug!(error = %err, "skipping malformed lease document"),
            }
        }
        leases.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
        Ok(leases)
    }

    async fn get_lease(&self, partition: &PartitionId) -> Result<Option<Lease>> {
        match self
            .container
            .read_document::<Value>(&self.lease_id(partition))
            .await?
        {
            Some(value) => lease_from_value(value).map(Some),
            None => Ok(None),
        }
    }

    async fn create_lease(&self, lease: Lease) -> Result<Option<Lease>> {
        let document = self.lease_document(lease)?;
        match self.container.create_document(&document).await? {
            Some(created) => lease_from_value(created).map(Some),
            None => Ok(None),
        }
    }

    async fn compare_and_swap(&self, expected: &Lease, next: Lease) -> Result<Lease> {
        if expected.etag.is_empty() {
            return Err(FeedError::PreconditionFailed(format!(
                "lease for partition '{}' has no etag",
                expected.partition_id
            )));
        }
        if expected.partition_id != next.partition_id {
            return Err(FeedError::PreconditionFailed(format!(
                "cannot swap lease of '{}' for lease of '{}'",
                expected.partition_id, next.partition_id
            )));
        }

        let id = self.lease_id(&expected.partition_id);
        let document = self.lease_document(next)?;
        let replaced = self
            .container
            .replace_document(&id, &document, &expected.etag)
            .await?;
        lease_from_value(replaced)
    }

    async fn delete_lease(&self, partition: &PartitionId) -> Result<bool> {
        self.container
            .delete_document(&self.lease_id(partition))
            .await
    }

    async fn heartbeat_host(&self, presence: HostPresence) -> Result<()> {
        let document = HostDocument {
            id: self.host_id(&presence.host_id),
            presence,
        };
        self.container
            .upsert_document(&serde_json::to_value(document)?)
            .await?;
        Ok(())
    }

    async fn list_hosts(&self) -> Result<Vec<HostPresence>> {
        let prefix = self.host_prefix();
        let documents = self.container.list_documents().await?;
        let mut hosts = Vec::new();
        for document in documents.into_iter().filter(|doc| starts_with_id(doc, &prefix)) {
            match serde_json::from_value::<HostDocument>(document) {
                Ok(host) => hosts.push(host.presence),
                Err(err) => debug!(error = %err, "skipping malformed host document"),
            }
        }
        Ok(hosts)
    }

    async fn remove_host(&self, host: &HostId) -> Result<bool> {
        self.container.delete_document(&self.host_id(host)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ContinuationToken;
    use crate::gateway::DocumentClient;
    use chrono::Utc;
    use serde_json::json;

    fn store(prefix: &str) -> GatewayLeaseStore {
        let client = DocumentClient::new("http://localhost:8081", "key", "db").unwrap();
        GatewayLeaseStore::new(client.container("leases"), prefix)
    }

    #[test]
    fn lease_documents_are_prefixed() {
        let store = store("orders");
        let lease = Lease::new("7".into(), "host-a".into(), ContinuationToken::new(3), Utc::now());
        let document = store.lease_document(lease.clone()).unwrap();

        assert_eq!(document["id"], json!("orders..7"));
        assert_eq!(document["partitionId"], json!("7"));
        assert_eq!(document["continuation"], json!(3));
        assert!(document.get("_etag").is_none());
        assert_eq!(lease_from_value(document).unwrap(), lease);
    }

    #[test]
    fn stored_etag_is_read_back() {
        let lease = lease_from_value(json!({
            "id": "orders..7",
            "partitionId": "7",
            "owner": null,
            "continuation": 12,
            "epoch": 4,
            "lastRenewed": "2024-01-01T00:00:00Z",
            "_etag": "\"0000002a\"",
            "_rid": "abc"
        }))
        .unwrap();
        assert_eq!(lease.etag, "\"0000002a\"");
        assert_eq!(lease.epoch, 4);
        assert!(lease.owner.is_none());
    }

    #[test]
    fn host_and_lease_ids_do_not_overlap() {
        let store = store("orders");
        let host = json!({"id": "orders.host.a"});
        let lease = json!({"id": "orders..0"});
        assert!(starts_with_id(&host, &store.host_prefix()));
        assert!(!starts_with_id(&host, &store.lease_prefix()));
        assert!(starts_with_id(&lease, &store.lease_prefix()));
        assert!(!starts_with_id(&json!({"id": "other..0"}), &store.lease_prefix()));
    }
}
