//! HTTP adapters for the document database gateway: the change feed of the
//! monitored container, the lease container and the output container.

pub mod change_feed;
pub mod lease_store;
pub mod sink;

use crate::config::ConsumerConfig;
use crate::core::{FeedError, Result};
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, info};

pub use change_feed::GatewayChangeFeed;
pub use lease_store::GatewayLeaseStore;
pub use sink::ContainerSink;

pub const UPSERT_HEADER: &str = "x-ms-documentdb-is-upsert";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Database-scoped gateway client
#[derive(Debug, Clone)]
pub struct DocumentClient {
    http: reqwest::Client,
    collections: Url,
    access_key: String,
}

impl DocumentClient {
    pub fn new(endpoint: &str, access_key: &str, database: &str) -> Result<Self> {
        let base = format!(
            "{}/dbs/{}/colls",
            endpoint.trim_end_matches('/'),
            database
        );
        let collections = Url::parse(&base)
            .map_err(|err| FeedError::Config(format!("invalid gateway endpoint '{}': {}", endpoint, err)))?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| FeedError::Config(format!("http client build failed: {}", err)))?;

        Ok(Self {
            http,
            collections,
            access_key: access_key.to_string(),
        })
    }

    pub fn from_config(config: &ConsumerConfig) -> Result<Self> {
        Self::new(&config.endpoint, &config.access_key, &config.database_name)
    }

    pub fn container(&self, name: impl Into<String>) -> ContainerClient {
        ContainerClient {
            client: self.clone(),
            name: name.into(),
        }
    }

    /// Creates `name` partitioned on `partition_key_path`. Returns `false`
    /// when it already existed.
    pub async fn create_container_if_not_exists(
        &self,
        name: &str,
        partition_key_path: &str,
    ) -> Result<bool> {
        let body = json!({
            "id": name,
            "partitionKey": { "paths": [partition_key_path] },
        });
        let response = self
            .request(Method::POST, self.collections.clone())
            .json(&body)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {
                info!(container = name, "container created");
                Ok(true)
            }
            StatusCode::CONFLICT => {
                debug!(container = name, "container already exists");
                Ok(false)
            }
            status => Err(status_error(status, &format!("create container '{}'", name), response).await),
        }
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.collections.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .header(reqwest::header::AUTHORIZATION, &self.access_key)
    }
}

#[derive(Debug, Deserialize)]
struct DocumentList {
    #[serde(rename = "Documents", default)]
    documents: Vec<Value>,
}

/// Document operations on one container
#[derive(Debug, Clone)]
pub struct ContainerClient {
    client: DocumentClient,
    name: String,
}

impl ContainerClient {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn list_documents(&self) -> Result<Vec<Value>> {
        let response = self
            .client
            .request(Method::GET, self.url(&["docs"]))
            .send()
            .await?;
        let list: DocumentList = expect_json(response, &self.context("list documents")).await?;
        Ok(list.documents)
    }

    pub async fn read_document<T: DeserializeOwned>(&self, id: &str) -> Result<Option<T>> {
        let response = self
            .client
            .request(Method::GET, self.url(&["docs", id]))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        expect_json(response, &self.context("read document")).await.map(Some)
    }

    /// Inserts `document`; `None` when a document with its id exists.
    pub async fn create_document(&self, document: &Value) -> Result<Option<Value>> {
        let response = self
            .client
            .request(Method::POST, self.url(&["docs"]))
            .json(document)
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(None);
        }
        expect_json(response, &self.context("create document")).await.map(Some)
    }

    pub async fn upsert_document(&self, document: &Value) -> Result<Value> {
        let response = self
            .client
            .request(Method::POST, self.url(&["docs"]))
            .header(UPSERT_HEADER, "true")
            .json(document)
            .send()
            .await?;
        expect_json(response, &self.context("upsert document")).await
    }

    /// Replaces the document only if its current `_etag` is `etag`. A
    /// missing document fails the precondition too.
    pub async fn replace_document(&self, id: &str, document: &Value, etag: &str) -> Result<Value> {
        let response = self
            .client
            .request(Method::PUT, self.url(&["docs", id]))
            .header(reqwest::header::IF_MATCH, etag)
            .json(document)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(FeedError::PreconditionFailed(format!(
                "document '{}' no longer exists in '{}'",
                id, self.name
            )));
        }
        expect_json(response, &self.context("replace document")).await
    }

    pub async fn delete_document(&self, id: &str) -> Result<bool> {
        let response = self
            .client
            .request(Method::DELETE, self.url(&["docs", id]))
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(status_error(status, &self.context("delete document"), response).await),
        }
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut path = vec![self.name.as_str()];
        path.extend_from_slice(segments);
        self.client.url(&path)
    }

    fn get(&self, segments: &[&str]) -> RequestBuilder {
        self.client.request(Method::GET, self.url(segments))
    }

    fn context(&self, operation: &str) -> String {
        format!("{} in '{}'", operation, self.name)
    }
}

async fn expect_json<T: DeserializeOwned>(response: Response, context: &str) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        return Err(status_error(status, context, response).await);
    }
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes)
        .map_err(|err| FeedError::Serialization(format!("{}: {}", context, err)))
}

async fn status_error(status: StatusCode, context: &str, response: Response) -> FeedError {
    let body = response.text().await.unwrap_or_default();
    classify_status(status, &format!("{} returned {}: {}", context, status, body.trim()))
}

/// Maps a failed gateway status onto the error taxonomy.
pub(crate) fn classify_status(status: StatusCode, message: &str) -> FeedError {
    match status {
        StatusCode::GONE => FeedError::PartitionGone(message.to_string()),
        StatusCode::PRECONDITION_FAILED => FeedError::PreconditionFailed(message.to_string()),
        StatusCode::TOO_MANY_REQUESTS => FeedError::TransientRead(message.to_string()),
        status if status.is_server_error() => FeedError::TransientRead(message.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FeedError::Config(message.to_string()),
        _ => FeedError::Gateway(message.to_string()),
    }
}
