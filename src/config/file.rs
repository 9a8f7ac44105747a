//! Configuration file support for Streamline transactions
//!
//! This module provides TOML configuration file parsing; merging with CLI
//! arguments lives in `merge`.
//!
//! ## Priority Order
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. Command-line arguments
//! 2. Environment variables
//! 3. Configuration file
//! 4. Default values
//!
//! ## Example Configuration
//!
//! ```toml
//! # streamline-txn.toml
//!
//! [broker]
//! data_dir = "/var/lib/streamline"
//! address = "broker-a:7676"
//! log_level = "info"
//!
//! [transactions]
//! log_enabled = true
//! max_consecutive_rollbacks = 5
//! dead_letter_destination = "mq.sys.dmq"
//!
//! [cluster]
//! remote_timeout_ms = 30000
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, StreamlineError};

/// Name of the configuration file searched in default locations
pub const CONFIG_FILE_NAME: &str = "streamline-txn.toml";

/// Root configuration structure for TOML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub broker: BrokerSection,

    pub transactions: TransactionsSection,

    pub cluster: ClusterSection,

    pub workers: WorkersSection,
}

/// Broker identity and storage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSection {
    pub data_dir: Option<PathBuf>,

    pub address: Option<String>,

    pub log_level: Option<String>,
}

/// Transaction engine behavior
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionsSection {
    pub log_enabled: Option<bool>,

    pub max_consecutive_rollbacks: Option<i32>,

    pub max_consumed_per_transaction: Option<usize>,

    pub resolved_cache_limit: Option<usize>,

    pub reap_interval_ms: Option<u64>,

    pub dead_letter_destination: Option<String>,
}

/// Remote broker calls
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    pub remote_timeout_ms: Option<u64>,
}

/// Connection worker pool
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersSection {
    pub pool_size: Option<usize>,

    pub connection_queue_depth: Option<usize>,
}

impl ConfigFile {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            StreamlineError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        Self::parse(&contents)
            .map_err(|e| StreamlineError::Config(format!("Failed to parse config file {:?}: {}", path, e)))
    }

    /// Parse configuration from TOML text
    pub fn parse(contents: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Try to load configuration from default locations
    ///
    /// Searches in order:
    /// 1. ./streamline-txn.toml
    /// 2. /etc/streamline/streamline-txn.toml
    /// 3. ~/.config/streamline/streamline-txn.toml
    pub fn load_default() -> Option<Self> {
        let default_paths = [
            PathBuf::from(CONFIG_FILE_NAME),
            PathBuf::from("/etc/streamline").join(CONFIG_FILE_NAME),
            dirs::config_dir()
                .map(|p| p.join("streamline").join(CONFIG_FILE_NAME))
                .unwrap_or_default(),
        ];

        for path in default_paths.iter().filter(|p| !p.as_os_str().is_empty()) {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        tracing::info!("Loaded configuration from {:?}", path);
                        return Some(config);
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        None
    }

    /// Generate an example configuration file
    pub fn generate_example() -> String {
        r#"# Streamline Transaction Configuration File
# Copy to streamline-txn.toml and customize as needed
#
# Configuration priority (highest to lowest):
# 1. Command-line arguments
# 2. Environment variables (STREAMLINE_TXN_*)
# 3. This configuration file
# 4. Default values

[broker]
# Directory holding the transaction log
data_dir = "./data"

# Address this broker is known by in the cluster
address = "localhost:7676"

# Log level (trace, debug, info, warn, error)
log_level = "info"

[transactions]
# Persist transaction state for crash recovery
log_enabled = true

# Consecutive rollbacks of a message before it is dead-lettered (0 = never)
max_consecutive_rollbacks = 0

# Maximum distinct messages consumed in one transaction
max_consumed_per_transaction = 1000

# Resolved transactions remembered to recognize replayed requests
resolved_cache_limit = 500

# How often the resolved-transaction cache is purged (milliseconds)
reap_interval_ms = 60000

# Destination receiving dead-lettered messages
dead_letter_destination = "mq.sys.dmq"

[cluster]
# Timeout for prepare/commit/rollback calls to other brokers (milliseconds)
remote_timeout_ms = 30000

[workers]
# Requests executing at once across all connections
pool_size = 16

# Queued requests per connection
connection_queue_depth = 64
"#
        .to_string()
    }
}
