use crate::config::ProcessorOptions;
use crate::core::{Clock, FeedError, HostId, Result, SystemClock};
use crate::dispatch::{ChangeDispatcher, ChangeHandler, DispatchStatsSnapshot};
use crate::feed::{ChangeFeedSource, FeedReader};
use crate::lease::{LeaseManager, LeaseStore};
use crate::supervisor::PartitionSupervisor;
use std::sync::Arc;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Assembles a [`ChangeFeedProcessor`]
///
/// ```
/// use changefeed_processor::{
///     ChangeFeedProcessorBuilder, InMemoryChangeFeed, InMemoryLeaseStore, handler_fn,
/// };
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let processor = ChangeFeedProcessorBuilder::new()
///     .host_name("host-a")
///     .lease_store(Arc::new(InMemoryLeaseStore::new()))
///     .feed_source(Arc::new(InMemoryChangeFeed::with_partitions(2).await))
///     .handler(handler_fn(|batch| {
///         println!("{} changes from {}", batch.len(), batch.partition);
///         Ok(())
///     }))
///     .build()
///     .unwrap();
///
/// processor.start().await.unwrap();
/// assert!(processor.is_started().await);
/// processor.stop().await.unwrap();
/// # });
/// ```
pub struct ChangeFeedProcessorBuilder {
    host: Option<HostId>,
    lease_store: Option<Arc<dyn LeaseStore>>,
    feed_source: Option<Arc<dyn ChangeFeedSource>>,
    handler: Option<Arc<dyn ChangeHandler>>,
    options: ProcessorOptions,
    clock: Arc<dyn Clock>,
}

impl Default for ChangeFeedProcessorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeFeedProcessorBuilder {
    pub fn new() -> Self {
        Self {
            host: None,
            lease_store: None,
            feed_source: None,
            handler: None,
            options: ProcessorOptions::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Identity of this host in the lease store. A random one is generated
    /// when none is given.
    pub fn host_name(mut self, host: impl Into<HostId>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn lease_store(mut self, store: Arc<dyn LeaseStore>) -> Self {
        self.lease_store = Some(store);
        self
    }

    pub fn feed_source(mut self, source: Arc<dyn ChangeFeedSource>) -> Self {
        self.feed_source = Some(source);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn ChangeHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn options(mut self, options: ProcessorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<ChangeFeedProcessor> {
        self.options.validate()?;
        let store = self
            .lease_store
            .ok_or_else(|| FeedError::Config("a lease store is required".to_string()))?;
        let source = self
            .feed_source
            .ok_or_else(|| FeedError::Config("a change feed source is required".to_string()))?;
        let handler = self
            .handler
            .ok_or_else(|| FeedError::Config("a change handler is required".to_string()))?;
        let host = self.host.unwrap_or_else(HostId::generate);

        let leases = Arc::new(LeaseManager::new(store, self.clock, self.options.lease_ttl));
        let reader = Arc::new(FeedReader::new(source, &self.options));
        let dispatcher = Arc::new(ChangeDispatcher::new(handler, leases.clone()));

        Ok(ChangeFeedProcessor {
            host,
            options: Arc::new(self.options),
            leases,
            reader,
            dispatcher,
            running: Mutex::new(None),
        })
    }
}

struct RunningSupervisor {
    stop_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<Result<()>>,
}

/// One host of a change-feed consumer group.
///
/// `start` spawns the partition supervisor in the background; `stop` waits
/// for in-flight batches and releases every lease this host holds.
pub struct ChangeFeedProcessor {
    host: HostId,
    options: Arc<ProcessorOptions>,
    leases: Arc<LeaseManager>,
    reader: Arc<FeedReader>,
    dispatcher: Arc<ChangeDispatcher>,
    running: Mutex<Option<RunningSupervisor>>,
}

impl ChangeFeedProcessor {
    pub fn host(&self) -> &HostId {
        &self.host
    }

    pub fn options(&self) -> &ProcessorOptions {
        &self.options
    }

    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.dispatcher.stats()
    }

    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running
            .as_ref()
            .is_some_and(|current| !current.join_handle.is_finished())
        {
            return Ok(());
        }

        let supervisor = PartitionSupervisor::new(
            self.host.clone(),
            self.options.clone(),
            self.leases.clone(),
            self.reader.clone(),
            self.dispatcher.clone(),
        );
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let join_handle = tokio::spawn(supervisor.run(stop_rx));

        info!(host = %self.host, "change feed processor started");
        *running = Some(RunningSupervisor {
            stop_tx,
            join_handle,
        });
        Ok(())
    }

    pub async fn is_started(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|current| !current.join_handle.is_finished())
    }

    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        let _ = running.stop_tx.send(());

        let result = running
            .join_handle
            .await
            .map_err(|err| FeedError::Worker(format!("supervisor join: {}", err)))?;
        match &result {
            Ok(()) => info!(host = %self.host, "change feed processor stopped"),
            Err(err) => warn!(host = %self.host, error = %err, "change feed processor stopped with error"),
        }
        result
    }
}

impl Drop for ChangeFeedProcessor {
    fn drop(&mut self) {
        // The supervisor still releases its leases if the runtime outlives us.
        if let Some(running) = self.running.get_mut().take() {
            let _ = running.stop_tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::handler_fn;
    use crate::feed::InMemoryChangeFeed;
    use crate::lease::InMemoryLeaseStore;
    use std::time::Duration;

    fn options() -> ProcessorOptions {
        ProcessorOptions::new()
            .feed_poll_delay(Duration::from_millis(5))
            .lease_ttl(Duration::from_secs(5))
            .lease_renew_interval(Duration::from_secs(1))
            .lease_acquire_interval(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn build_requires_every_collaborator() {
        let err = ChangeFeedProcessorBuilder::new()
            .lease_store(Arc::new(InMemoryLeaseStore::new()))
            .handler(handler_fn(|_| Ok(())))
            .build()
            .err()
            .unwrap();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("change feed source"));
    }

    #[tokio::test]
    async fn build_rejects_invalid_options() {
        let err = ChangeFeedProcessorBuilder::new()
            .lease_store(Arc::new(InMemoryLeaseStore::new()))
            .feed_source(Arc::new(InMemoryChangeFeed::new()))
            .handler(handler_fn(|_| Ok(())))
            .options(ProcessorOptions::new().max_items_per_batch(0))
            .build()
            .err()
            .unwrap();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn stop_releases_held_leases() {
        let store = InMemoryLeaseStore::new();
        let processor = ChangeFeedProcessorBuilder::new()
            .host_name("host-a")
            .lease_store(Arc::new(store.clone()))
            .feed_source(Arc::new(InMemoryChangeFeed::with_partitions(3).await))
            .handler(handler_fn(|_| Ok(())))
            .options(options())
            .build()
            .unwrap();

        processor.start().await.unwrap();
        processor.start().await.unwrap();
        assert!(processor.is_started().await);

        for _ in 0..100 {
            let held = store
                .list_leases()
                .await
                .unwrap()
                .iter()
                .filter(|lease| lease.owner.is_some())
                .count();
            if held == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        processor.stop().await.unwrap();
        assert!(!processor.is_started().await);
        let leases = store.list_leases().await.unwrap();
        assert_eq!(leases.len(), 3);
        assert!(leases.iter().all(|lease| lease.owner.is_none()));
    }
}
