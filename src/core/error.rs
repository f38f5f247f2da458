use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Partition '{partition}' is already owned by host '{owner}'")]
    AlreadyOwned { partition: String, owner: String },

    #[error("Lease for partition '{partition}' expired before it could be renewed")]
    LeaseExpired { partition: String },

    #[error("Lease for partition '{partition}' was lost")]
    LeaseLost { partition: String },

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Transient read error: {0}")]
    TransientRead(String),

    #[error("Partition '{0}' is gone")]
    PartitionGone(String),

    #[error("Handler failed: {0}")]
    HandlerFailed(String),

    #[error("Lease store error: {0}")]
    Store(String),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Worker error: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, FeedError>;

impl FeedError {
    /// Only configuration problems stop the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// True when the caller no longer owns the partition it was working on.
    pub fn is_lease_loss(&self) -> bool {
        matches!(self, Self::LeaseLost { .. } | Self::LeaseExpired { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientRead(_) | Self::Store(_) | Self::Gateway(_)
        )
    }

    pub(crate) fn lease_lost(partition: impl ToString) -> Self {
        Self::LeaseLost {
            partition: partition.to_string(),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for FeedError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Self::TransientRead(err.to_string())
        } else {
            Self::Gateway(err.to_string())
        }
    }
}
