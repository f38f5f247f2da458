pub mod env;
pub mod options;

pub use env::ConsumerConfig;
pub use options::{DEFAULT_LEASE_PREFIX, ProcessorOptions};
