//! Default constants for Streamline transaction configuration
//!
//! These constants define the default values used throughout the configuration
//! system when no explicit value is provided.

/// Default data directory
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Default log level
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default address this broker is known by in the cluster
pub const DEFAULT_BROKER_ADDRESS: &str = "localhost:7676";

/// Default transaction log enabled state
pub const DEFAULT_LOG_ENABLED: bool = true;

/// Default consecutive rollbacks before dead-lettering (0 = disabled)
pub const DEFAULT_MAX_CONSECUTIVE_ROLLBACKS: i32 = 0;

/// Default limit of distinct consumed messages per transaction
pub const DEFAULT_MAX_CONSUMED_PER_TRANSACTION: usize =
    crate::transaction::registry::DEFAULT_MAX_CONSUMED_PER_TRANSACTION;

/// Default timeout for calls to remote brokers in milliseconds
pub const DEFAULT_REMOTE_TIMEOUT_MS: u64 = 30_000;

/// Default number of resolved transactions remembered for replay detection
pub const DEFAULT_RESOLVED_CACHE_LIMIT: usize =
    crate::transaction::registry::DEFAULT_RESOLVED_CACHE_LIMIT;

/// Default interval of the resolved-transaction reaper in milliseconds
pub const DEFAULT_REAP_INTERVAL_MS: u64 = 60_000;

/// Default dead-letter destination
pub const DEFAULT_DEAD_LETTER_DESTINATION: &str = crate::dlq::DEFAULT_DEAD_LETTER_DESTINATION;

/// Default number of requests executing at once across all connections
pub const DEFAULT_WORKER_POOL_SIZE: usize = 16;

/// Default number of queued requests per connection
pub const DEFAULT_CONNECTION_QUEUE_DEPTH: usize = 64;
