/// Lease ownership tests
///
/// Takeover after expiry, fencing of the previous owner and the
/// single-owner guarantee under interleaved operations of several hosts.
/// Run with: cargo test --test lease_tests

use changefeed_processor::{
    ContinuationToken, FeedError, HostId, InMemoryLeaseStore, Lease, LeaseManager, LeaseStore,
    ManualClock, PartitionId,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const TTL: Duration = Duration::from_secs(10);

fn manager(store: &InMemoryLeaseStore, clock: &ManualClock) -> LeaseManager {
    LeaseManager::new(Arc::new(store.clone()), Arc::new(clock.clone()), TTL)
}

#[tokio::test]
async fn expired_lease_moves_to_the_next_host_and_fences_the_old_one() {
    let store = InMemoryLeaseStore::new();
    let clock = ManualClock::default();
    let leases = manager(&store, &clock);
    let partition = PartitionId::from("0");

    let held_by_a = leases.acquire(&partition, &"host-a".into()).await.unwrap();
    assert_eq!(held_by_a.epoch, 0);
    let held_by_a = leases
        .checkpoint(&held_by_a, ContinuationToken::new(17))
        .await
        .unwrap();

    clock.advance(TTL + Duration::from_secs(1));
    let held_by_b = leases.acquire(&partition, &"host-b".into()).await.unwrap();
    assert_eq!(held_by_b.epoch, 1);
    assert_eq!(held_by_b.owner, Some("host-b".into()));
    assert_eq!(held_by_b.continuation, ContinuationToken::new(17));

    let renew = leases.renew(&held_by_a).await.unwrap_err();
    assert!(matches!(renew, FeedError::LeaseLost { .. }));

    let checkpoint = leases
        .checkpoint(&held_by_a, ContinuationToken::new(30))
        .await
        .unwrap_err();
    assert!(checkpoint.is_lease_loss());

    // a late release from the fenced host must not free host-b's lease
    leases.release(&held_by_a).await.unwrap();
    let stored = store.get_lease(&partition).await.unwrap().unwrap();
    assert_eq!(stored.owner, Some("host-b".into()));
    assert_eq!(stored.continuation, ContinuationToken::new(17));
}

#[tokio::test]
async fn live_lease_cannot_be_taken() {
    let store = InMemoryLeaseStore::new();
    let clock = ManualClock::default();
    let leases = manager(&store, &clock);
    let partition = PartitionId::from("0");

    leases.acquire(&partition, &"host-a".into()).await.unwrap();
    clock.advance(TTL);

    let err = leases
        .acquire(&partition, &"host-b".into())
        .await
        .unwrap_err();
    assert!(matches!(err, FeedError::AlreadyOwned { ref owner, .. } if owner == "host-a"));
}

#[tokio::test]
async fn released_lease_is_taken_without_waiting() {
    let store = InMemoryLeaseStore::new();
    let clock = ManualClock::default();
    let leases = manager(&store, &clock);
    let partition = PartitionId::from("0");

    let lease = leases.acquire(&partition, &"host-a".into()).await.unwrap();
    leases.release(&lease).await.unwrap();

    let taken = leases.acquire(&partition, &"host-b".into()).await.unwrap();
    assert_eq!(taken.epoch, 1);
    assert!(leases.verify(&taken).await.is_ok());
}

/// Deterministic linear congruential generator
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: u64) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (self.0 >> 33) % bound
    }
}

#[tokio::test]
async fn interleaved_hosts_never_share_a_partition() {
    let store = InMemoryLeaseStore::new();
    let clock = ManualClock::default();
    let leases = manager(&store, &clock);
    let hosts: Vec<HostId> = ["host-a", "host-b", "host-c"]
        .iter()
        .map(|id| HostId::from(*id))
        .collect();
    let partitions: Vec<PartitionId> = (0..3).map(|n| PartitionId::from(n.to_string())).collect();

    let mut held: HashMap<(usize, usize), Lease> = HashMap::new();
    let mut last_epoch: HashMap<usize, u64> = HashMap::new();
    let mut rng = Lcg(42);

    for _ in 0..2_000 {
        let h = rng.next(hosts.len() as u64) as usize;
        let p = rng.next(partitions.len() as u64) as usize;

        match rng.next(5) {
            0 => {
                if let Ok(lease) = leases.acquire(&partitions[p], &hosts[h]).await {
                    if let Some(previous) = last_epoch.get(&p) {
                        assert!(lease.epoch >= *previous);
                    }
                    last_epoch.insert(p, lease.epoch);
                    held.insert((h, p), lease);
                }
            }
            1 => {
                if let Some(lease) = held.get(&(h, p)).cloned() {
                    match leases.renew(&lease).await {
                        Ok(renewed) => {
                            held.insert((h, p), renewed);
                        }
                        Err(err) => {
                            assert!(err.is_lease_loss(), "unexpected renew error: {err}");
                            held.remove(&(h, p));
                        }
                    }
                }
            }
            2 => {
                if let Some(lease) = held.remove(&(h, p)) {
                    leases.release(&lease).await.unwrap();
                }
            }
            3 => {
                if let Some(lease) = held.get(&(h, p)).cloned() {
                    let next = ContinuationToken::new(lease.continuation.lsn() + 1);
                    match leases.checkpoint(&lease, next).await {
                        Ok(updated) => {
                            held.insert((h, p), updated);
                        }
                        Err(err) => {
                            assert!(err.is_lease_loss(), "unexpected checkpoint error: {err}");
                            held.remove(&(h, p));
                        }
                    }
                }
            }
            _ => clock.advance(Duration::from_secs(rng.next(6))),
        }

        for partition in &partitions {
            let mut verified = 0;
            for (h, _) in hosts.iter().enumerate() {
                let index = partitions.iter().position(|p| p == partition).unwrap();
                if let Some(lease) = held.get(&(h, index)) {
                    if leases.verify(lease).await.is_ok() {
                        verified += 1;
                    }
                }
            }
            assert!(verified <= 1, "partition {partition} verified by {verified} hosts");
        }
    }
}
