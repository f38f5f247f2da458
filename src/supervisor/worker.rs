use crate::core::{FeedError, PartitionId, Result};
use crate::dispatch::ChangeDispatcher;
use crate::feed::{FeedReader, PollOutcome};
use crate::lease::SharedLease;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Why a partition worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Stopped,
    LeaseLost,
    PartitionGone,
}

pub type WorkerExitSender = mpsc::UnboundedSender<(PartitionId, WorkerExit)>;

/// Background read-deliver-checkpoint loop of one owned partition.
pub struct PartitionWorker {
    partition: PartitionId,
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<WorkerExit>>,
}

impl PartitionWorker {
    pub fn spawn(
        partition: PartitionId,
        lease: SharedLease,
        reader: Arc<FeedReader>,
        dispatcher: Arc<ChangeDispatcher>,
        exits: Option<WorkerExitSender>,
    ) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let worker_partition = partition.clone();

        let join_handle = tokio::spawn(async move {
            let exit = run_partition(&worker_partition, lease, reader, dispatcher, stop_rx).await;
            if let Some(exits) = exits {
                let _ = exits.send((worker_partition, exit));
            }
            exit
        });

        Self {
            partition,
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }

    pub fn partition(&self) -> &PartitionId {
        &self.partition
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(true)
    }

    /// Asks the loop to stop and waits for it. A batch already handed to the
    /// handler is finished and checkpointed first.
    pub async fn stop(mut self) -> Result<WorkerExit> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        self.join().await
    }

    /// Waits for the loop to end on its own.
    pub async fn join(mut self) -> Result<WorkerExit> {
        match self.join_handle.take() {
            Some(join_handle) => join_handle.await.map_err(|err| {
                FeedError::Worker(format!("partition '{}' worker join: {}", self.partition, err))
            }),
            None => Ok(WorkerExit::Stopped),
        }
    }
}

impl Drop for PartitionWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

async fn run_partition(
    partition: &PartitionId,
    lease: SharedLease,
    reader: Arc<FeedReader>,
    dispatcher: Arc<ChangeDispatcher>,
    mut stop_rx: oneshot::Receiver<()>,
) -> WorkerExit {
    let mut failures: u32 = 0;
    info!(%partition, "partition worker started");

    loop {
        let token = lease.lock().await.continuation;
        let polled = tokio::select! {
            _ = &mut stop_rx => return WorkerExit::Stopped,
            polled = reader.poll(partition, &token) => polled,
        };

        let delay = match polled {
            Ok(PollOutcome::Empty) => {
                failures = 0;
                reader.poll_delay()
            }
            Ok(PollOutcome::Batch(batch)) => {
                if !matches!(stop_rx.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
                    return WorkerExit::Stopped;
                }
                match dispatcher.dispatch(&lease, &batch).await {
                    Ok(_) => {
                        failures = 0;
                        continue;
                    }
                    Err(err) if err.is_lease_loss() => {
                        info!(%partition, error = %err, "partition worker lost its lease");
                        return WorkerExit::LeaseLost;
                    }
                    Err(err) => {
                        failures = failures.saturating_add(1);
                        let delay = reader.backoff_for(failures);
                        warn!(%partition, error = %err, attempt = failures, ?delay, "batch not delivered, retrying");
                        delay
                    }
                }
            }
            Err(FeedError::PartitionGone(_)) => {
                info!(%partition, "partition is gone, worker exiting");
                return WorkerExit::PartitionGone;
            }
            Err(err) if err.is_lease_loss() => return WorkerExit::LeaseLost,
            Err(err) => {
                failures = failures.saturating_add(1);
                let delay = reader.backoff_for(failures);
                debug!(%partition, error = %err, attempt = failures, ?delay, "feed read failed");
                delay
            }
        };

        tokio::select! {
            _ = &mut stop_rx => return WorkerExit::Stopped,
            _ = sleep(delay) => {}
        }
    }
}
