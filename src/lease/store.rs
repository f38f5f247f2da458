use super::{HostPresence, Lease};
use crate::core::{FeedError, HostId, PartitionId, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// Persisted lease records keyed by partition id.
///
/// The store is the single source of truth for ownership. Every mutation of
/// an existing record goes through `compare_and_swap`.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn list_leases(&self) -> Result<Vec<Lease>>;

    async fn get_lease(&self, partition: &PartitionId) -> Result<Option<Lease>>;

    /// Inserts the lease unless one already exists for its partition.
    ///
    /// Returns the stored lease (with its etag) when inserted, `None` when
    /// another record was already present.
    async fn create_lease(&self, lease: Lease) -> Result<Option<Lease>>;

    /// Replaces the stored lease with `next` if its epoch and etag still match
    /// `expected`. Fails with `PreconditionFailed` otherwise.
    async fn compare_and_swap(&self, expected: &Lease, next: Lease) -> Result<Lease>;

    /// Returns true if a record was removed.
    async fn delete_lease(&self, partition: &PartitionId) -> Result<bool>;

    async fn heartbeat_host(&self, presence: HostPresence) -> Result<()>;

    async fn list_hosts(&self) -> Result<Vec<HostPresence>>;

    /// Drops the heartbeat of a host leaving the group. Returns true if one
    /// was stored.
    async fn remove_host(&self, host: &HostId) -> Result<bool>;
}

/// An in-process `LeaseStore`.
///
/// Shared clones see the same records, so several supervisors in one process
/// can compete for the same partitions exactly as separate hosts would.
#[derive(Clone, Default)]
pub struct InMemoryLeaseStore {
    leases: Arc<Mutex<BTreeMap<PartitionId, Lease>>>,
    hosts: Arc<Mutex<HashMap<HostId, HostPresence>>>,
    next_etag: Arc<AtomicU64>,
    failing_writes: Arc<AtomicUsize>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` writes fail with a store error.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn fresh_etag(&self) -> String {
        let value = self.next_etag.fetch_add(1, Ordering::SeqCst) + 1;
        format!("\"{:08x}\"", value)
    }

    fn check_write(&self) -> Result<()> {
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();
        if injected {
            return Err(FeedError::Store("injected lease store failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn list_leases(&self) -> Result<Vec<Lease>> {
        let leases = self.leases.lock().await;
        Ok(leases.values().cloned().collect())
    }

    async fn get_lease(&self, partition: &PartitionId) -> Result<Option<Lease>> {
        let leases = self.leases.lock().await;
        Ok(leases.get(partition).cloned())
    }

    async fn create_lease(&self, mut lease: Lease) -> Result<Option<Lease>> {
        self.check_write()?;
        let mut leases = self.leases.lock().await;
        if leases.contains_key(&lease.partition_id) {
            return Ok(None);
        }
        lease.etag = self.fresh_etag();
        leases.insert(lease.partition_id.clone(), lease.clone());
        Ok(Some(lease))
    }

    async fn compare_and_swap(&self, expected: &Lease, mut next: Lease) -> Result<Lease> {
        self.check_write()?;
        if next.partition_id != expected.partition_id {
            return Err(FeedError::Store(format!(
                "compare_and_swap cannot move lease '{}' to partition '{}'",
                expected.partition_id, next.partition_id
            )));
        }

        let mut leases = self.leases.lock().await;
        let current = leases.get(&expected.partition_id).ok_or_else(|| {
            FeedError::PreconditionFailed(format!(
                "lease for partition '{}' does not exist",
                expected.partition_id
            ))
        })?;

        if current.epoch != expected.epoch || current.etag != expected.etag {
            return Err(FeedError::PreconditionFailed(format!(
                "lease for partition '{}' changed: expected epoch {} etag {}, found epoch {} etag {}",
                expected.partition_id, expected.epoch, expected.etag, current.epoch, current.etag
            )));
        }

        next.etag = self.fresh_etag();
        leases.insert(next.partition_id.clone(), next.clone());
        Ok(next)
    }

    async fn delete_lease(&self, partition: &PartitionId) -> Result<bool> {
        self.check_write()?;
        let mut leases = self.leases.lock().await;
        Ok(leases.remove(partition).is_some())
    }

    async fn heartbeat_host(&self, presence: HostPresence) -> Result<()> {
        let mut hosts = self.hosts.lock().await;
        hosts.insert(presence.host_id.clone(), presence);
        Ok(())
    }

    async fn list_hosts(&self) -> Result<Vec<HostPresence>> {
        let hosts = self.hosts.lock().await;
        Ok(hosts.values().cloned().collect())
    }

    async fn remove_host(&self, host: &HostId) -> Result<bool> {
        let mut hosts = self.hosts.lock().await;
        Ok(hosts.remove(host).is_some())
    }
}
