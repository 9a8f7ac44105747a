//! Command-line arguments for the Streamline transaction tool
//!
//! This module defines the CLI arguments structure using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use super::defaults::*;

/// Command-line arguments for the transaction log tool
#[derive(Parser, Debug, Clone)]
#[command(name = "streamline-txn")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Inspect, recover and compact the Streamline transaction log")]
pub struct CliArgs {
    /// Path to configuration file (TOML format)
    /// If not specified, looks for streamline-txn.toml in current directory,
    /// /etc/streamline/, or ~/.config/streamline/
    #[arg(short, long, env = "STREAMLINE_TXN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Generate example configuration file and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory holding the transaction log
    #[arg(long, env = "STREAMLINE_TXN_DATA_DIR", default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "STREAMLINE_TXN_LOG_LEVEL", default_value = DEFAULT_LOG_LEVEL)]
    pub log_level: String,

    /// Persist transaction state to the transaction log.
    /// Disabling the log removes crash recovery of prepared transactions.
    #[arg(long, env = "STREAMLINE_TXN_LOG_ENABLED", default_value_t = DEFAULT_LOG_ENABLED)]
    pub log_enabled: bool,

    /// Address this broker is known by in the cluster
    #[arg(long, env = "STREAMLINE_TXN_BROKER_ADDRESS", default_value = DEFAULT_BROKER_ADDRESS)]
    pub broker_address: String,

    /// Consecutive rollbacks of a message before it is dead-lettered (0 = never)
    #[arg(
        long,
        env = "STREAMLINE_TXN_MAX_CONSECUTIVE_ROLLBACKS",
        default_value_t = DEFAULT_MAX_CONSECUTIVE_ROLLBACKS
    )]
    pub max_consecutive_rollbacks: i32,

    /// Maximum distinct messages consumed in one transaction
    #[arg(
        long,
        env = "STREAMLINE_TXN_MAX_CONSUMED_PER_TRANSACTION",
        default_value_t = DEFAULT_MAX_CONSUMED_PER_TRANSACTION
    )]
    pub max_consumed_per_transaction: usize,

    /// Timeout for calls to remote brokers in milliseconds
    #[arg(long, env = "STREAMLINE_TXN_REMOTE_TIMEOUT_MS", default_value_t = DEFAULT_REMOTE_TIMEOUT_MS)]
    pub remote_timeout_ms: u64,

    /// Number of resolved transactions remembered to recognize replays
    #[arg(
        long,
        env = "STREAMLINE_TXN_RESOLVED_CACHE_LIMIT",
        default_value_t = DEFAULT_RESOLVED_CACHE_LIMIT
    )]
    pub resolved_cache_limit: usize,

    /// Interval of the resolved-transaction reaper in milliseconds
    #[arg(long, env = "STREAMLINE_TXN_REAP_INTERVAL_MS", default_value_t = DEFAULT_REAP_INTERVAL_MS)]
    pub reap_interval_ms: u64,

    /// Destination receiving dead-lettered messages
    #[arg(
        long,
        env = "STREAMLINE_TXN_DEAD_LETTER_DESTINATION",
        default_value = DEFAULT_DEAD_LETTER_DESTINATION
    )]
    pub dead_letter_destination: String,

    /// Requests executing at once across all connections
    #[arg(long, env = "STREAMLINE_TXN_WORKER_POOL_SIZE", default_value_t = DEFAULT_WORKER_POOL_SIZE)]
    pub worker_pool_size: usize,

    /// Queued requests per connection before senders wait
    #[arg(
        long,
        env = "STREAMLINE_TXN_CONNECTION_QUEUE_DEPTH",
        default_value_t = DEFAULT_CONNECTION_QUEUE_DEPTH
    )]
    pub connection_queue_depth: usize,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Operations on the transaction log
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List in-doubt and committed-but-unfinished transactions
    Recover,
    /// Print every entry of the transaction log
    Inspect,
    /// Snapshot unresolved transactions and truncate the log
    Compact,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = CliArgs::parse_from(["streamline-txn"]);
        assert_eq!(args.data_dir, PathBuf::from(DEFAULT_DATA_DIR));
        assert_eq!(args.max_consecutive_rollbacks, 0);
        assert_eq!(args.remote_timeout_ms, 30_000);
        assert_eq!(args.dead_letter_destination, "mq.sys.dmq");
        assert!(args.command.is_none());
    }

    #[test]
    fn test_subcommand_and_flags() {
        let args = CliArgs::parse_from([
            "streamline-txn",
            "--data-dir",
            "/tmp/txn",
            "--max-consecutive-rollbacks",
            "3",
            "recover",
        ]);
        assert_eq!(args.data_dir, PathBuf::from("/tmp/txn"));
        assert_eq!(args.max_consecutive_rollbacks, 3);
        assert_eq!(args.command, Some(Command::Recover));
    }
}
