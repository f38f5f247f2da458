//! Equal-share partition ownership.
//!
//! Every host derives its own target from the same inputs (partition count
//! and the sorted set of live hosts), so the targets add up to the partition
//! count without any coordination beyond the lease store.

use crate::core::{HostId, PartitionId};

/// Number of partitions `host` should own.
///
/// Hosts are ordered by id; each gets `floor(P / N)` and the first
/// `P mod N` get one more. `host` counts as live even when absent from
/// `hosts` (its own heartbeat may not be visible yet).
pub fn target_share(partition_count: usize, hosts: &[HostId], host: &HostId) -> usize {
    let mut live: Vec<&HostId> = hosts.iter().collect();
    if !live.contains(&host) {
        live.push(host);
    }
    live.sort();
    live.dedup();

    let base = partition_count / live.len();
    let remainder = partition_count % live.len();
    let rank = live.iter().position(|candidate| *candidate == host).unwrap_or(0);
    base + usize::from(rank < remainder)
}

/// What one host should do in a balancing round.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BalancePlan {
    /// Owned partitions to hand back voluntarily.
    pub release: Vec<PartitionId>,
    /// How many available partitions to take.
    pub acquire: usize,
}

pub fn plan(target: usize, owned: &[PartitionId]) -> BalancePlan {
    if owned.len() > target {
        let mut sorted = owned.to_vec();
        sorted.sort();
        return BalancePlan {
            release: sorted.split_off(target),
            acquire: 0,
        };
    }

    BalancePlan {
        release: Vec::new(),
        acquire: target - owned.len(),
    }
}
