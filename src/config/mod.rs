//! Configuration module for Streamline transactions
//!
//! This module is organized into submodules:
//! - `defaults` - Default constants and values
//! - `args` - CLI argument definitions
//! - `file` - TOML configuration file
//! - `merge` - CLI/file precedence

mod args;
mod defaults;
pub mod file;
mod merge;

pub use args::{CliArgs, Command};
pub use defaults::*;
pub use file::ConfigFile;
pub use merge::merge_config_with_args;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::dlq::DlqConfig;
use crate::error::{Result, StreamlineError};
use crate::message::BrokerAddress;

/// Runtime configuration of the transaction engine.
///
/// # Configuration Sources
///
/// Configuration is loaded from multiple sources with this precedence:
/// 1. **CLI arguments** (highest priority), including `STREAMLINE_TXN_*`
///    environment variables
/// 2. **Config file** - TOML configuration file
/// 3. **Built-in defaults** (lowest priority)
///
/// # Example
///
/// ```rust,ignore
/// use streamline_txn::config::TransactionConfig;
///
/// let config = TransactionConfig::default()
///     .with_data_dir("/var/lib/streamline")
///     .with_max_consecutive_rollbacks(5);
/// config.validate()?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Directory holding the transaction log
    pub data_dir: PathBuf,

    /// Persist transaction state; false keeps everything in memory
    pub log_enabled: bool,

    /// Address this broker is known by in the cluster
    pub broker_address: BrokerAddress,

    /// Consecutive rollbacks of a message per consumer before it is
    /// dead-lettered; 0 disables the limit
    pub max_consecutive_rollbacks: i32,

    /// Maximum distinct messages consumed in one transaction
    pub max_consumed_per_transaction: usize,

    /// Timeout for calls to remote brokers in milliseconds
    pub remote_timeout_ms: u64,

    /// Resolved transactions remembered to recognize replayed requests
    pub resolved_cache_limit: usize,

    /// Interval of the resolved-transaction reaper in milliseconds
    pub reap_interval_ms: u64,

    /// Destination receiving dead-lettered messages
    pub dead_letter_destination: String,

    /// Requests executing at once across all connections
    pub worker_pool_size: usize,

    /// Queued requests per connection
    pub connection_queue_depth: usize,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            log_enabled: DEFAULT_LOG_ENABLED,
            broker_address: BrokerAddress::new(DEFAULT_BROKER_ADDRESS),
            max_consecutive_rollbacks: DEFAULT_MAX_CONSECUTIVE_ROLLBACKS,
            max_consumed_per_transaction: DEFAULT_MAX_CONSUMED_PER_TRANSACTION,
            remote_timeout_ms: DEFAULT_REMOTE_TIMEOUT_MS,
            resolved_cache_limit: DEFAULT_RESOLVED_CACHE_LIMIT,
            reap_interval_ms: DEFAULT_REAP_INTERVAL_MS,
            dead_letter_destination: DEFAULT_DEAD_LETTER_DESTINATION.to_string(),
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            connection_queue_depth: DEFAULT_CONNECTION_QUEUE_DEPTH,
        }
    }
}

impl TransactionConfig {
    /// In-memory configuration (no transaction log)
    pub fn in_memory() -> Self {
        Self {
            log_enabled: false,
            ..Default::default()
        }
    }

    /// Build configuration from parsed (and merged) CLI arguments
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let config = Self {
            data_dir: args.data_dir.clone(),
            log_enabled: args.log_enabled,
            broker_address: BrokerAddress::new(args.broker_address.clone()),
            max_consecutive_rollbacks: args.max_consecutive_rollbacks,
            max_consumed_per_transaction: args.max_consumed_per_transaction,
            remote_timeout_ms: args.remote_timeout_ms,
            resolved_cache_limit: args.resolved_cache_limit,
            reap_interval_ms: args.reap_interval_ms,
            dead_letter_destination: args.dead_letter_destination.clone(),
            worker_pool_size: args.worker_pool_size,
            connection_queue_depth: args.connection_queue_depth,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self.log_enabled = true;
        self
    }

    pub fn with_broker_address(mut self, address: impl Into<String>) -> Self {
        self.broker_address = BrokerAddress::new(address);
        self
    }

    pub fn with_max_consecutive_rollbacks(mut self, max: i32) -> Self {
        self.max_consecutive_rollbacks = max;
        self
    }

    pub fn with_max_consumed_per_transaction(mut self, max: usize) -> Self {
        self.max_consumed_per_transaction = max;
        self
    }

    pub fn with_remote_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.remote_timeout_ms = timeout_ms;
        self
    }

    pub fn with_resolved_cache_limit(mut self, limit: usize) -> Self {
        self.resolved_cache_limit = limit;
        self
    }

    pub fn with_dead_letter_destination(mut self, destination: impl Into<String>) -> Self {
        self.dead_letter_destination = destination.into();
        self
    }

    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    /// Dead-letter routing derived from this configuration
    pub fn dlq(&self) -> DlqConfig {
        DlqConfig::enabled().with_destination(self.dead_letter_destination.clone())
    }

    /// Check settings that would make the engine unusable
    pub fn validate(&self) -> Result<()> {
        if self.broker_address.as_str().is_empty() {
            return Err(StreamlineError::config(
                "broker_address",
                "must not be empty",
            ));
        }
        if self.max_consecutive_rollbacks < 0 {
            return Err(StreamlineError::config(
                "max_consecutive_rollbacks",
                format!("must be >= 0, got {}", self.max_consecutive_rollbacks),
            ));
        }
        if self.max_consumed_per_transaction == 0 {
            return Err(StreamlineError::config(
                "max_consumed_per_transaction",
                "must be > 0",
            ));
        }
        if self.remote_timeout_ms == 0 {
            return Err(StreamlineError::config("remote_timeout_ms", "must be > 0"));
        }
        if self.reap_interval_ms == 0 {
            return Err(StreamlineError::config("reap_interval_ms", "must be > 0"));
        }
        if self.dead_letter_destination.is_empty() {
            return Err(StreamlineError::config(
                "dead_letter_destination",
                "must not be empty",
            ));
        }
        if self.worker_pool_size == 0 {
            return Err(StreamlineError::config("worker_pool_size", "must be > 0"));
        }
        if self.connection_queue_depth == 0 {
            return Err(StreamlineError::config(
                "connection_queue_depth",
                "must be > 0",
            ));
        }
        Ok(())
    }
}
