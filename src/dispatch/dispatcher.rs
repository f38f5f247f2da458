use super::handler::ChangeHandler;
use crate::core::{Batch, ContinuationToken, FeedError, Result};
use crate::lease::{LeaseManager, SharedLease};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error};

/// Dispatcher counters
#[derive(Debug, Default)]
pub struct DispatchStats {
    batches_delivered: AtomicU64,
    batches_failed: AtomicU64,
    records_delivered: AtomicU64,
    checkpoints: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchStatsSnapshot {
    pub batches_delivered: u64,
    pub batches_failed: u64,
    pub records_delivered: u64,
    pub checkpoints: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            batches_delivered: self.batches_delivered.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            records_delivered: self.records_delivered.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
        }
    }
}

/// Hands batches to the handler and checkpoints the ones it accepted.
pub struct ChangeDispatcher {
    handler: Arc<dyn ChangeHandler>,
    leases: Arc<LeaseManager>,
    stats: Arc<DispatchStats>,
}

impl ChangeDispatcher {
    pub fn new(handler: Arc<dyn ChangeHandler>, leases: Arc<LeaseManager>) -> Self {
        Self {
            handler,
            leases,
            stats: Arc::new(DispatchStats::default()),
        }
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }

    /// Delivers `batch` under `lease` and returns the checkpointed token.
    ///
    /// Ownership is verified before and after the handler runs; a lease lost
    /// in between means the batch is not checkpointed here and the new owner
    /// redelivers it. On handler failure the token stays where it was, so
    /// the next poll returns the same batch.
    pub async fn dispatch(&self, lease: &SharedLease, batch: &Batch) -> Result<ContinuationToken> {
        let held = lease.lock().await.clone();
        self.leases.verify(&held).await?;

        if let Err(err) = self.handler.handle(batch).await {
            self.stats.batches_failed.fetch_add(1, Ordering::Relaxed);
            error!(
                partition = %batch.partition,
                records = batch.len(),
                continuation = %held.continuation,
                error = %err,
                "handler failed, batch will be redelivered"
            );
            return Err(match err {
                FeedError::HandlerFailed(_) => err,
                other => FeedError::HandlerFailed(other.to_string()),
            });
        }
        self.stats.batches_delivered.fetch_add(1, Ordering::Relaxed);
        self.stats
            .records_delivered
            .fetch_add(batch.len() as u64, Ordering::Relaxed);

        let mut guard = lease.lock().await;
        self.leases.verify(&guard).await?;
        let updated = self.leases.checkpoint(&guard, batch.continuation).await?;
        *guard = updated;
        self.stats.checkpoints.fetch_add(1, Ordering::Relaxed);
        debug!(
            partition = %batch.partition,
            records = batch.len(),
            continuation = %batch.continuation,
            "batch checkpointed"
        );
        Ok(batch.continuation)
    }
}
