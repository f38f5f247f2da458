//! Partition leases: the persisted ownership record of every partition and
//! the manager that acquires, renews, checkpoints and releases them.

pub mod manager;
pub mod store;

use crate::core::{ContinuationToken, HostId, PartitionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub use manager::LeaseManager;
pub use store::{InMemoryLeaseStore, LeaseStore};

/// The local copy of an owned lease, shared by a partition's worker and the
/// supervisor's renewal round.
pub type SharedLease = Arc<tokio::sync::Mutex<Lease>>;

/// Ownership grant of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub partition_id: PartitionId,
    /// `None` once released; such a lease is free to acquire.
    #[serde(default)]
    pub owner: Option<HostId>,
    pub continuation: ContinuationToken,
    /// Incremented on every ownership change.
    pub epoch: u64,
    pub last_renewed: DateTime<Utc>,
    /// Store-assigned concurrency token, replaced on every write.
    #[serde(rename = "_etag", default, skip_serializing_if = "String::is_empty")]
    pub etag: String,
}

impl Lease {
    pub fn new(
        partition_id: PartitionId,
        owner: HostId,
        continuation: ContinuationToken,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            partition_id,
            owner: Some(owner),
            continuation,
            epoch: 0,
            last_renewed: now,
            etag: String::new(),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let elapsed = now.signed_duration_since(self.last_renewed);
        match elapsed.to_std() {
            Ok(elapsed) => elapsed > ttl,
            // last_renewed in the future: clock skew, not expired
            Err(_) => false,
        }
    }

    /// Unowned or expired, so any host may take it over.
    pub fn is_available_at(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.owner.is_none() || self.is_expired_at(now, ttl)
    }

    pub fn is_held_by(&self, host: &HostId, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.owner.as_ref() == Some(host) && !self.is_expired_at(now, ttl)
    }

    /// Same owner at the same epoch: nobody took this lease over in between.
    pub fn same_ownership(&self, other: &Lease) -> bool {
        self.partition_id == other.partition_id
            && self.owner == other.owner
            && self.epoch == other.epoch
    }
}

/// Liveness record written by every host on each renewal round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostPresence {
    pub host_id: HostId,
    pub last_seen: DateTime<Utc>,
}

impl HostPresence {
    pub fn new(host_id: HostId, last_seen: DateTime<Utc>) -> Self {
        Self { host_id, last_seen }
    }

    pub fn is_alive_at(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match now.signed_duration_since(self.last_seen).to_std() {
            Ok(elapsed) => elapsed <= ttl,
            Err(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_expires_strictly_after_ttl() {
        let now = Utc::now();
        let lease = Lease::new("0".into(), "host-a".into(), ContinuationToken::BEGINNING, now);
        let ttl = Duration::from_secs(10);

        assert!(!lease.is_expired_at(now + chrono::Duration::seconds(10), ttl));
        assert!(lease.is_expired_at(now + chrono::Duration::seconds(11), ttl));
        assert!(lease.is_held_by(&"host-a".into(), now, ttl));
        assert!(!lease.is_held_by(&"host-b".into(), now, ttl));
    }

    #[test]
    fn released_lease_is_available() {
        let now = Utc::now();
        let mut lease = Lease::new("0".into(), "host-a".into(), ContinuationToken::BEGINNING, now);
        assert!(!lease.is_available_at(now, Duration::from_secs(60)));
        lease.owner = None;
        assert!(lease.is_available_at(now, Duration::from_secs(60)));
    }

    #[test]
    fn lease_serializes_with_camel_case_fields() {
        let now = Utc::now();
        let lease = Lease::new("7".into(), "host-a".into(), ContinuationToken::new(42), now);
        let json = serde_json::to_value(&lease).unwrap();
        assert_eq!(json["partitionId"], "7");
        assert_eq!(json["owner"], "host-a");
        assert_eq!(json["continuation"], 42);
        assert!(json.get("_etag").is_none());
    }
}
