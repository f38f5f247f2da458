//! Per-host partition ownership: discovery, balancing, renewal and the
//! workers that run owned partitions.

pub mod balancer;
pub mod state;
pub mod worker;

use crate::config::ProcessorOptions;
use crate::core::{ContinuationToken, FeedError, HostId, Partition, PartitionId, Result};
use crate::dispatch::ChangeDispatcher;
use crate::feed::FeedReader;
use crate::lease::{Lease, LeaseManager, SharedLease};
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

pub use balancer::{BalancePlan, target_share};
pub use state::PartitionState;
pub use worker::{PartitionWorker, WorkerExit};

#[derive(Default)]
struct PartitionSlot {
    state: PartitionState,
    lease: Option<SharedLease>,
    worker: Option<PartitionWorker>,
}

/// Owns this host's share of partitions.
///
/// Each acquisition round discovers partitions, adopts splits, then releases
/// or acquires leases until the host holds its equal share. Renewal rounds
/// keep held leases alive and tear down partitions whose lease was lost.
pub struct PartitionSupervisor {
    host: HostId,
    options: Arc<ProcessorOptions>,
    leases: Arc<LeaseManager>,
    reader: Arc<FeedReader>,
    dispatcher: Arc<ChangeDispatcher>,
    slots: BTreeMap<PartitionId, PartitionSlot>,
    exits_tx: mpsc::UnboundedSender<(PartitionId, WorkerExit)>,
    exits_rx: Option<mpsc::UnboundedReceiver<(PartitionId, WorkerExit)>>,
}

impl PartitionSupervisor {
    pub fn new(
        host: HostId,
        options: Arc<ProcessorOptions>,
        leases: Arc<LeaseManager>,
        reader: Arc<FeedReader>,
        dispatcher: Arc<ChangeDispatcher>,
    ) -> Self {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        Self {
            host,
            options,
            leases,
            reader,
            dispatcher,
            slots: BTreeMap::new(),
            exits_tx,
            exits_rx: Some(exits_rx),
        }
    }

    pub fn host(&self) -> &HostId {
        &self.host
    }

    pub fn owned_partitions(&self) -> Vec<PartitionId> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.state.is_owned())
            .map(|(partition, _)| partition.clone())
            .collect()
    }

    pub fn partition_state(&self, partition: &PartitionId) -> PartitionState {
        self.slots
            .get(partition)
            .map(|slot| slot.state)
            .unwrap_or_default()
    }

    /// Announces this host and renews every held lease.
    pub async fn renew_owned(&mut self) -> Result<()> {
        self.leases.heartbeat(&self.host).await?;

        for partition in self.owned_partitions() {
            let Some(shared) = self.slots.get(&partition).and_then(|slot| slot.lease.clone())
            else {
                continue;
            };
            self.transition(&partition, PartitionState::Renewing);

            let renewed = {
                let mut guard = shared.lock().await;
                let result = self.leases.renew(&guard).await;
                result.map(|lease| *guard = lease)
            };

            match renewed {
                Ok(()) => self.transition(&partition, PartitionState::Owned),
                Err(err) if err.is_lease_loss() => {
                    warn!(%partition, host = %self.host, error = %err, "lease lost during renewal");
                    self.transition(&partition, PartitionState::LeaseLost);
                    self.stop_worker(&partition).await;
                    self.forget(&partition);
                }
                Err(err) => {
                    // The worker fences itself if renewals keep failing past the TTL.
                    warn!(%partition, host = %self.host, error = %err, "lease renewal failed");
                    self.transition(&partition, PartitionState::Owned);
                }
            }
        }
        Ok(())
    }

    /// Collects workers that ended on their own and settles their leases.
    pub async fn reap_workers(&mut self) -> Vec<(PartitionId, WorkerExit)> {
        let finished: Vec<PartitionId> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.worker.as_ref().is_some_and(|w| w.is_finished()))
            .map(|(partition, _)| partition.clone())
            .collect();

        let mut exits = Vec::with_capacity(finished.len());
        for partition in finished {
            let Some(worker) = self.slots.get_mut(&partition).and_then(|s| s.worker.take()) else {
                continue;
            };
            let exit = match worker.join().await {
                Ok(exit) => exit,
                Err(err) => {
                    warn!(%partition, error = %err, "partition worker failed");
                    WorkerExit::Stopped
                }
            };

            match exit {
                WorkerExit::LeaseLost => {
                    self.transition(&partition, PartitionState::LeaseLost);
                    self.forget(&partition);
                }
                WorkerExit::PartitionGone | WorkerExit::Stopped => {
                    self.release_lease(&partition).await;
                    self.forget(&partition);
                }
            }
            exits.push((partition, exit));
        }
        exits
    }

    /// One acquisition round.
    pub async fn balance(&mut self) -> Result<()> {
        self.reap_workers().await;
        self.leases.heartbeat(&self.host).await?;

        let partitions = self.reader.source().partitions().await?;
        let existing = self.adopt_topology(&partitions).await?;

        let hosts = self.leases.active_hosts().await?;
        let target = target_share(partitions.len(), &hosts, &self.host);
        let owned = self.owned_partitions();
        let plan = balancer::plan(target, &owned);
        debug!(
            host = %self.host,
            partitions = partitions.len(),
            hosts = hosts.len(),
            target,
            owned = owned.len(),
            "balancing"
        );

        for partition in &plan.release {
            info!(%partition, host = %self.host, target, "releasing partition above share");
            self.stop_worker(partition).await;
            self.release_lease(partition).await;
            self.forget(partition);
        }

        let now = self.leases.now();
        let ttl = self.leases.ttl();
        let mut wanted = plan.acquire;
        for partition in &partitions {
            if wanted == 0 {
                break;
            }
            if self.partition_state(&partition.id).is_owned() || plan.release.contains(&partition.id)
            {
                continue;
            }
            if let Some(lease) = existing.get(&partition.id) {
                // a live lease of ours with no worker survives a restart under the same host id
                let ours = lease.owner.as_ref() == Some(&self.host);
                if !ours && !lease.is_available_at(now, ttl) {
                    continue;
                }
            }
            if self.try_acquire(partition, &existing).await? {
                wanted -= 1;
            }
        }
        Ok(())
    }

    /// Runs acquisition and renewal rounds until `stop` fires, then releases
    /// everything this host holds.
    pub async fn run(mut self, mut stop: oneshot::Receiver<()>) -> Result<()> {
        let Some(mut exits) = self.exits_rx.take() else {
            return Err(FeedError::Worker("partition supervisor is already running".to_string()));
        };

        info!(host = %self.host, "partition supervisor started");
        if let Err(err) = self.balance().await {
            warn!(host = %self.host, error = %err, "initial acquisition round failed");
        }

        let start = Instant::now();
        let mut renew = interval_at(
            start + self.options.lease_renew_interval,
            self.options.lease_renew_interval,
        );
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut acquire = interval_at(
            start + self.options.lease_acquire_interval,
            self.options.lease_acquire_interval,
        );
        acquire.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = renew.tick() => {
                    if let Err(err) = self.renew_owned().await {
                        warn!(host = %self.host, error = %err, "renewal round failed");
                    }
                }
                _ = acquire.tick() => {
                    if let Err(err) = self.balance().await {
                        warn!(host = %self.host, error = %err, "acquisition round failed");
                    }
                }
                Some((partition, exit)) = exits.recv() => {
                    debug!(%partition, ?exit, "partition worker exited");
                    self.reap_workers().await;
                    if exit == WorkerExit::PartitionGone {
                        if let Err(err) = self.balance().await {
                            warn!(host = %self.host, error = %err, "acquisition after split failed");
                        }
                    }
                }
            }
        }

        self.shutdown().await;
        info!(host = %self.host, "partition supervisor stopped");
        Ok(())
    }

    /// Stops every worker, releases every lease this host holds and withdraws
    /// its heartbeat.
    pub async fn shutdown(&mut self) {
        let owned = self.owned_partitions();

        let workers: Vec<PartitionWorker> = owned
            .iter()
            .filter_map(|partition| {
                self.slots
                    .get_mut(partition)
                    .and_then(|slot| slot.worker.take())
            })
            .collect();
        let stopped = join_all(workers.into_iter().map(|worker| {
            let partition = worker.partition().clone();
            async move { (partition, worker.stop().await) }
        }))
        .await;
        for (partition, outcome) in stopped {
            if let Err(err) = outcome {
                warn!(%partition, error = %err, "partition worker did not stop cleanly");
            }
        }

        let mut held = Vec::with_capacity(owned.len());
        for partition in &owned {
            if let Some(shared) = self.slots.get(partition).and_then(|slot| slot.lease.clone()) {
                held.push(shared.lock().await.clone());
            }
        }
        let released = join_all(held.iter().map(|lease| self.leases.release(lease))).await;
        for (lease, outcome) in held.iter().zip(released) {
            if let Err(err) = outcome {
                warn!(partition = %lease.partition_id, error = %err, "lease release failed, it will expire instead");
            }
        }

        for partition in &owned {
            self.forget(partition);
        }
        if let Err(err) = self.leases.leave(&self.host).await {
            warn!(host = %self.host, error = %err, "heartbeat not withdrawn, it will expire instead");
        }
        info!(host = %self.host, partitions = owned.len(), "supervisor shut down");
    }

    async fn try_acquire(
        &mut self,
        partition: &Partition,
        existing: &HashMap<PartitionId, Lease>,
    ) -> Result<bool> {
        let initial = match existing.get(&partition.id) {
            Some(lease) => lease.continuation,
            None => self.initial_token(partition, existing).await?,
        };

        self.transition(&partition.id, PartitionState::Acquiring);
        match self.leases.acquire_from(&partition.id, &self.host, initial).await {
            Ok(lease) => {
                info!(
                    partition = %partition.id,
                    host = %self.host,
                    epoch = lease.epoch,
                    continuation = %lease.continuation,
                    "partition acquired"
                );
                let shared = Arc::new(Mutex::new(lease));
                let worker = PartitionWorker::spawn(
                    partition.id.clone(),
                    shared.clone(),
                    self.reader.clone(),
                    self.dispatcher.clone(),
                    Some(self.exits_tx.clone()),
                );
                let slot = self.slots.entry(partition.id.clone()).or_default();
                slot.lease = Some(shared);
                slot.worker = Some(worker);
                self.transition(&partition.id, PartitionState::Owned);
                Ok(true)
            }
            Err(FeedError::AlreadyOwned { owner, .. }) => {
                debug!(partition = %partition.id, %owner, "partition taken by another host");
                self.forget(&partition.id);
                Ok(false)
            }
            Err(err) if err.is_retryable() => {
                warn!(partition = %partition.id, error = %err, "lease acquisition failed");
                self.forget(&partition.id);
                Ok(false)
            }
            Err(err) => {
                self.forget(&partition.id);
                Err(err)
            }
        }
    }

    /// Where a partition without a lease starts reading: at the lowest
    /// checkpoint of its parents when it came from a split or merge,
    /// otherwise per `start_from_beginning`.
    async fn initial_token(
        &self,
        partition: &Partition,
        existing: &HashMap<PartitionId, Lease>,
    ) -> Result<ContinuationToken> {
        let inherited = partition
            .parents
            .iter()
            .filter_map(|parent| existing.get(parent))
            .map(|lease| lease.continuation)
            .min();
        if let Some(token) = inherited {
            return Ok(token);
        }
        if self.options.start_from_beginning {
            Ok(ContinuationToken::BEGINNING)
        } else {
            self.reader.source().latest_token(&partition.id).await
        }
    }

    /// Creates unowned leases for split or merged children and deletes the
    /// leases of retired parents once every child has one. A child starts at
    /// the lowest parent checkpoint, since LSNs are feed-wide and a merged
    /// child interleaves both parents' histories. Returns the resulting
    /// leases by partition.
    async fn adopt_topology(
        &self,
        partitions: &[Partition],
    ) -> Result<HashMap<PartitionId, Lease>> {
        let mut existing: HashMap<PartitionId, Lease> = self
            .leases
            .leases()
            .await?
            .into_iter()
            .map(|lease| (lease.partition_id.clone(), lease))
            .collect();

        for partition in partitions {
            if partition.parents.is_empty() || existing.contains_key(&partition.id) {
                continue;
            }
            let Some(token) = partition
                .parents
                .iter()
                .filter_map(|parent| existing.get(parent))
                .map(|lease| lease.continuation)
                .min()
            else {
                continue;
            };

            let mut child = Lease::new(
                partition.id.clone(),
                self.host.clone(),
                token,
                self.leases.now(),
            );
            child.owner = None;
            if let Some(created) = self.leases.store().create_lease(child).await? {
                info!(
                    partition = %partition.id,
                    parents = ?partition.parents,
                    continuation = %token,
                    "lease created for split child"
                );
                existing.insert(created.partition_id.clone(), created);
            }
        }

        let now = self.leases.now();
        let ttl = self.leases.ttl();
        let retired: Vec<PartitionId> = existing
            .values()
            .filter(|lease| partitions.iter().all(|p| p.id != lease.partition_id))
            .filter(|lease| lease.is_available_at(now, ttl))
            .filter(|lease| {
                let mut children = partitions
                    .iter()
                    .filter(|p| p.parents.contains(&lease.partition_id))
                    .peekable();
                children.peek().is_some() && children.all(|child| existing.contains_key(&child.id))
            })
            .map(|lease| lease.partition_id.clone())
            .collect();

        for partition in retired {
            if self.leases.store().delete_lease(&partition).await? {
                info!(%partition, "lease of retired partition deleted");
            }
            existing.remove(&partition);
        }
        Ok(existing)
    }

    async fn stop_worker(&mut self, partition: &PartitionId) {
        let Some(worker) = self.slots.get_mut(partition).and_then(|slot| slot.worker.take()) else {
            return;
        };
        if let Err(err) = worker.stop().await {
            warn!(%partition, error = %err, "partition worker did not stop cleanly");
        }
    }

    async fn release_lease(&mut self, partition: &PartitionId) {
        let Some(shared) = self.slots.get(partition).and_then(|slot| slot.lease.clone()) else {
            return;
        };
        let lease = shared.lock().await.clone();
        if let Err(err) = self.leases.release(&lease).await {
            warn!(%partition, error = %err, "lease release failed, it will expire instead");
        }
    }

    /// Drops local state of a partition no longer held.
    fn forget(&mut self, partition: &PartitionId) {
        if let Some(slot) = self.slots.get(partition) {
            if slot.state != PartitionState::Unowned {
                self.transition(partition, PartitionState::Unowned);
            }
        }
        self.slots.remove(partition);
    }

    fn transition(&mut self, partition: &PartitionId, next: PartitionState) {
        let slot = self.slots.entry(partition.clone()).or_default();
        if !slot.state.can_transition_to(next) {
            warn!(%partition, from = %slot.state, to = %next, "unexpected partition state change");
        }
        slot.state = next;
    }
}
