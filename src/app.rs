use crate::config::ConsumerConfig;
use crate::core::{Result, SystemClock};
use crate::dispatch::CopyToContainerHandler;
use crate::gateway::{ContainerSink, DocumentClient, GatewayChangeFeed, GatewayLeaseStore};
use crate::lease::LeaseManager;
use crate::processor::{ChangeFeedProcessor, ChangeFeedProcessorBuilder};
use std::sync::Arc;

/// Partition key path of the lease container.
pub const LEASE_PARTITION_KEY_PATH: &str = "/id";

/// The gateway adapters of one configured consumer.
pub struct ProcessorContext {
    config: ConsumerConfig,
    client: DocumentClient,
    lease_store: Arc<GatewayLeaseStore>,
}

impl ProcessorContext {
    pub fn new(config: ConsumerConfig) -> Result<Self> {
        config.validate()?;
        config.options.validate()?;
        let client = DocumentClient::from_config(&config)?;
        let lease_store = Arc::new(GatewayLeaseStore::new(
            client.container(config.lease_container.clone()),
            config.options.lease_prefix.clone(),
        ));
        Ok(Self {
            config,
            client,
            lease_store,
        })
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Creates the lease container if it does not exist yet.
    pub async fn bootstrap(&self) -> Result<()> {
        self.client
            .create_container_if_not_exists(&self.config.lease_container, LEASE_PARTITION_KEY_PATH)
            .await?;
        Ok(())
    }

    /// Lease manager over the lease container, for administrative commands.
    pub fn lease_manager(&self) -> LeaseManager {
        LeaseManager::new(
            self.lease_store.clone(),
            Arc::new(SystemClock),
            self.config.options.lease_ttl,
        )
    }

    /// A processor copying every change of the monitored container into the
    /// output container.
    pub fn copy_processor(&self) -> Result<ChangeFeedProcessor> {
        let monitored = self.client.container(self.config.monitored_container.clone());
        let output = self.client.container(self.config.output_container.clone());
        let feed = GatewayChangeFeed::new(monitored);
        let sink = ContainerSink::new(output);

        ChangeFeedProcessorBuilder::new()
            .host_name(self.config.host_id.clone())
            .lease_store(self.lease_store.clone())
            .feed_source(Arc::new(feed))
            .handler(Arc::new(CopyToContainerHandler::new(Arc::new(sink))))
            .options(self.config.options.clone())
            .build()
    }
}
