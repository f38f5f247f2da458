use super::options::ProcessorOptions;
use crate::core::{FeedError, HostId, Result};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

pub const ENDPOINT_ENV: &str = "COSMOSDB_ENDPOINT";
pub const ACCESS_KEY_ENV: &str = "COSMOSDB_ACCESS_KEY";
pub const DATABASE_NAME_ENV: &str = "COSMOSDB_DATABASE_NAME";
pub const MONITORED_CONTAINER_ENV: &str = "COSMOSDB_MONITORED_CONTAINER_NAME";
pub const LEASE_CONTAINER_ENV: &str = "COSMOSDB_LEASE_CONTAINER_NAME";
pub const OUTPUT_CONTAINER_ENV: &str = "COSMOSDB_OUTPUT_CONTAINER_NAME";

/// Pod name under Kubernetes; a random UUID is generated when it is unset
/// or blank.
pub const HOST_NAME_ENV: &str = "HOSTNAME";

pub const LEASE_PREFIX_ENV: &str = "CFP_LEASE_PREFIX";
pub const POLL_DELAY_ENV: &str = "CFP_FEED_POLL_DELAY_MS";
pub const LEASE_TTL_ENV: &str = "CFP_LEASE_TTL_MS";
pub const LEASE_RENEW_INTERVAL_ENV: &str = "CFP_LEASE_RENEW_INTERVAL_MS";
pub const LEASE_ACQUIRE_INTERVAL_ENV: &str = "CFP_LEASE_ACQUIRE_INTERVAL_MS";
pub const MAX_ITEMS_ENV: &str = "CFP_MAX_ITEMS_PER_BATCH";
pub const START_FROM_BEGINNING_ENV: &str = "CFP_START_FROM_BEGINNING";

const REQUIRED_VARS: [&str; 6] = [
    ENDPOINT_ENV,
    ACCESS_KEY_ENV,
    DATABASE_NAME_ENV,
    MONITORED_CONTAINER_ENV,
    LEASE_CONTAINER_ENV,
    OUTPUT_CONTAINER_ENV,
];

/// Process configuration of the consumer
///
/// Loaded once at startup and handed to constructors; nothing reads the
/// environment after this point.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub endpoint: String,
    pub access_key: String,
    pub database_name: String,
    pub monitored_container: String,
    pub lease_container: String,
    pub output_container: String,
    pub host_id: HostId,
    /// Whether `host_id` was generated because none was configured
    pub host_id_generated: bool,
    pub options: ProcessorOptions,
}

impl ConsumerConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    /// Load from an explicit variable map
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        for name in REQUIRED_VARS {
            if !vars.contains_key(name) {
                return Err(FeedError::Config(format!(
                    "Missing environment variable {}",
                    name
                )));
            }
        }

        let required = |name: &str| vars.get(name).cloned().unwrap_or_default();

        let (host_id, host_id_generated) = match vars.get(HOST_NAME_ENV) {
            Some(name) if !name.trim().is_empty() => (HostId::new(name.trim()), false),
            _ => (HostId::generate(), true),
        };

        let mut options = ProcessorOptions::default();
        if let Some(prefix) = vars.get(LEASE_PREFIX_ENV) {
            options.lease_prefix = prefix.clone();
        }
        if let Some(delay) = parse_millis(vars, POLL_DELAY_ENV)? {
            options.feed_poll_delay = delay;
        }
        if let Some(ttl) = parse_millis(vars, LEASE_TTL_ENV)? {
            options.lease_ttl = ttl;
        }
        if let Some(interval) = parse_millis(vars, LEASE_RENEW_INTERVAL_ENV)? {
            options.lease_renew_interval = interval;
        }
        if let Some(interval) = parse_millis(vars, LEASE_ACQUIRE_INTERVAL_ENV)? {
            options.lease_acquire_interval = interval;
        }
        if let Some(raw) = vars.get(MAX_ITEMS_ENV) {
            options.max_items_per_batch = raw.trim().parse().map_err(|_| {
                FeedError::Config(format!("{} must be a positive integer, got '{}'", MAX_ITEMS_ENV, raw))
            })?;
        }
        if let Some(raw) = vars.get(START_FROM_BEGINNING_ENV) {
            options.start_from_beginning = parse_bool(START_FROM_BEGINNING_ENV, raw)?;
        }

        let config = Self {
            endpoint: required(ENDPOINT_ENV),
            access_key: required(ACCESS_KEY_ENV),
            database_name: required(DATABASE_NAME_ENV),
            monitored_container: required(MONITORED_CONTAINER_ENV),
            lease_container: required(LEASE_CONTAINER_ENV),
            output_container: required(OUTPUT_CONTAINER_ENV),
            host_id,
            host_id_generated,
            options,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let named = [
            (ENDPOINT_ENV, &self.endpoint),
            (ACCESS_KEY_ENV, &self.access_key),
            (DATABASE_NAME_ENV, &self.database_name),
            (MONITORED_CONTAINER_ENV, &self.monitored_container),
            (LEASE_CONTAINER_ENV, &self.lease_container),
            (OUTPUT_CONTAINER_ENV, &self.output_container),
        ];
        for (name, value) in named {
            if value.trim().is_empty() {
                return Err(FeedError::Config(format!(
                    "Environment variable {} cannot be empty",
                    name
                )));
            }
        }

        if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            return Err(FeedError::Config(format!(
                "{} must be an http(s) URL, got '{}'",
                ENDPOINT_ENV, self.endpoint
            )));
        }

        if self.monitored_container == self.lease_container
            || self.monitored_container == self.output_container
        {
            return Err(FeedError::Config(
                "monitored container must differ from the lease and output containers".to_string(),
            ));
        }

        self.options.validate()
    }
}

impl fmt::Display for ConsumerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (key ***) db={} monitored={} lease={} output={} host={}",
            self.endpoint,
            self.database_name,
            self.monitored_container,
            self.lease_container,
            self.output_container,
            self.host_id
        )
    }
}

fn parse_millis(vars: &HashMap<String, String>, name: &str) -> Result<Option<Duration>> {
    let Some(raw) = vars.get(name) else {
        return Ok(None);
    };
    let millis: u64 = raw.trim().parse().map_err(|_| {
        FeedError::Config(format!("{} must be a number of milliseconds, got '{}'", name, raw))
    })?;
    Ok(Some(Duration::from_millis(millis)))
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(FeedError::Config(format!(
            "{} must be true or false, got '{}'",
            name, raw
        ))),
    }
}
