// ============================================================================
// Change Feed Processor Library
// ============================================================================

//! A lease-partitioned change-feed consumer group.
//!
//! Hosts sharing one lease store divide the partitions of a change feed
//! between them: each partition is read by exactly one live host, which
//! hands batches to a [`ChangeHandler`] and checkpoints the continuation
//! token only after the handler succeeded. Delivery is at-least-once.
//!
//! ```
//! use changefeed_processor::{
//!     ChangeFeedProcessorBuilder, InMemoryChangeFeed, InMemoryContainer, InMemoryLeaseStore,
//!     CopyToContainerHandler,
//! };
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let feed = InMemoryChangeFeed::with_partitions(4).await;
//! let output = InMemoryContainer::new("orders-copy");
//!
//! let processor = ChangeFeedProcessorBuilder::new()
//!     .host_name("host-a")
//!     .lease_store(Arc::new(InMemoryLeaseStore::new()))
//!     .feed_source(Arc::new(feed.clone()))
//!     .handler(Arc::new(CopyToContainerHandler::new(Arc::new(output.clone()))))
//!     .build()?;
//!
//! processor.start().await?;
//! feed.upsert(serde_json::json!({"id": "order-1", "total": 42})).await?;
//! processor.stop().await?;
//! # Ok::<(), changefeed_processor::FeedError>(())
//! # }).unwrap();
//! ```

pub mod app;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod feed;
pub mod gateway;
pub mod lease;
pub mod processor;
pub mod supervisor;

pub use app::ProcessorContext;
pub use config::{ConsumerConfig, ProcessorOptions};
pub use crate::core::{
    Batch, ChangeRecord, Clock, ContinuationToken, FeedError, HostId, KeyRange, ManualClock,
    Partition, PartitionId, Result, SystemClock,
};
pub use dispatch::{
    ChangeDispatcher, ChangeHandler, CopyToContainerHandler, DispatchStatsSnapshot, DocumentSink,
    InMemoryContainer, handler_fn,
};
pub use feed::{ChangeFeedSource, FeedPage, FeedReader, InMemoryChangeFeed, PollOutcome};
pub use lease::{HostPresence, InMemoryLeaseStore, Lease, LeaseManager, LeaseStore, SharedLease};
pub use processor::{ChangeFeedProcessor, ChangeFeedProcessorBuilder};
pub use supervisor::{PartitionState, PartitionSupervisor, WorkerExit};
