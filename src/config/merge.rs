//! Configuration merging utilities
//!
//! This module provides functions to merge configuration from files
//! with command-line arguments, where CLI arguments take precedence.

use super::args::CliArgs;
use super::defaults::*;
use super::file::ConfigFile;

/// Merge configuration file values with CLI arguments.
/// CLI arguments take precedence over config file values.
/// Only applies config file values where CLI uses defaults.
pub fn merge_config_with_args(mut args: CliArgs, config: &ConfigFile) -> CliArgs {
    // Helper macro to apply config value if CLI is at default
    macro_rules! apply_if_default {
        ($field:ident, $config_val:expr, $default:expr) => {
            if let Some(val) = $config_val {
                if args.$field == $default {
                    args.$field = val;
                }
            }
        };
    }

    macro_rules! apply_if_default_string {
        ($field:ident, $config_val:expr, $default:expr) => {
            if let Some(ref val) = $config_val {
                if args.$field == $default {
                    args.$field = val.clone();
                }
            }
        };
    }

    // Broker section
    if let Some(ref path) = config.broker.data_dir {
        if args.data_dir == std::path::Path::new(DEFAULT_DATA_DIR) {
            args.data_dir = path.clone();
        }
    }
    apply_if_default_string!(broker_address, config.broker.address, DEFAULT_BROKER_ADDRESS);
    apply_if_default_string!(log_level, config.broker.log_level, DEFAULT_LOG_LEVEL);

    // Transactions section
    apply_if_default!(
        log_enabled,
        config.transactions.log_enabled,
        DEFAULT_LOG_ENABLED
    );
    apply_if_default!(
        max_consecutive_rollbacks,
        config.transactions.max_consecutive_rollbacks,
        DEFAULT_MAX_CONSECUTIVE_ROLLBACKS
    );
    apply_if_default!(
        max_consumed_per_transaction,
        config.transactions.max_consumed_per_transaction,
        DEFAULT_MAX_CONSUMED_PER_TRANSACTION
    );
    apply_if_default!(
        resolved_cache_limit,
        config.transactions.resolved_cache_limit,
        DEFAULT_RESOLVED_CACHE_LIMIT
    );
    apply_if_default!(
        reap_interval_ms,
        config.transactions.reap_interval_ms,
        DEFAULT_REAP_INTERVAL_MS
    );
    apply_if_default_string!(
        dead_letter_destination,
        config.transactions.dead_letter_destination,
        DEFAULT_DEAD_LETTER_DESTINATION
    );

    // Cluster section
    apply_if_default!(
        remote_timeout_ms,
        config.cluster.remote_timeout_ms,
        DEFAULT_REMOTE_TIMEOUT_MS
    );

    // Workers section
    apply_if_default!(
        worker_pool_size,
        config.workers.pool_size,
        DEFAULT_WORKER_POOL_SIZE
    );
    apply_if_default!(
        connection_queue_depth,
        config.workers.connection_queue_depth,
        DEFAULT_CONNECTION_QUEUE_DEPTH
    );

    args
}
