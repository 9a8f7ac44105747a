//! Streamline transaction log tool - entry point
//!
//! Offline operations on a broker's transaction log: list in-doubt
//! transactions, dump the log, and compact it.

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use streamline_txn::config::{merge_config_with_args, CliArgs, Command, ConfigFile};
use streamline_txn::error::{Result, StreamlineError};
use streamline_txn::transaction::{TransactionLog, TransactionRegistry};
use streamline_txn::TransactionConfig;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> ExitCode {
    if let Err(e) = run() {
        eprintln!("streamline-txn failed: {e}");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn run() -> Result<()> {
    let mut args = CliArgs::parse();

    if args.generate_config {
        println!("{}", ConfigFile::generate_example());
        return Ok(());
    }

    let config_file = if let Some(ref path) = args.config {
        match ConfigFile::load(path) {
            Ok(config) => {
                eprintln!("Loaded configuration from {:?}", path);
                Some(config)
            }
            Err(e) => {
                eprintln!("Error loading configuration file: {}", e);
                return Err(e);
            }
        }
    } else {
        ConfigFile::load_default()
    };

    // CLI takes precedence over the file
    if let Some(ref config) = config_file {
        args = merge_config_with_args(args, config);
    }

    let log_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(log_filter)
        .init();

    let config = match TransactionConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Err(e);
        }
    };
    if !config.log_enabled {
        return Err(StreamlineError::Config(
            "transaction log is disabled; nothing to operate on".to_string(),
        ));
    }

    let log = Arc::new(TransactionLog::new(&config.data_dir, true)?);
    info!(log_dir = %log.log_dir().display(), "Opened transaction log");

    match args.command.unwrap_or(Command::Recover) {
        Command::Recover => recover(log),
        Command::Inspect => inspect(&log),
        Command::Compact => compact(log),
    }
}

fn recover(log: Arc<TransactionLog>) -> Result<()> {
    let registry = TransactionRegistry::new(log);
    let report = registry.recover()?;

    println!("In-doubt transactions: {}", report.in_doubt.len());
    for id in &report.in_doubt {
        if let Some(state) = registry.get_state(*id) {
            let xid = state
                .xid
                .map(|x| x.to_string())
                .unwrap_or_else(|| "-".to_string());
            let brokers = registry
                .cluster_brokers(*id)
                .map(|b| b.len())
                .unwrap_or(0);
            println!("  {}  xid={}  cluster_brokers={}", id, xid, brokers);
        }
    }
    println!(
        "Committed, completed on next broker start: {}",
        report.committed.len()
    );
    for txn in &report.committed {
        println!(
            "  {}  sent={}  acks={}",
            txn.id(),
            txn.work().sent.len(),
            txn.work().acks.len()
        );
    }
    println!("Discarded: {}", report.discarded.len());
    Ok(())
}

fn inspect(log: &TransactionLog) -> Result<()> {
    let snapshot = log.load_snapshot()?;
    println!("# snapshot ({} transactions)", snapshot.len());
    for txn in &snapshot {
        println!("{}", serde_json::to_string(txn)?);
    }
    let entries = log.replay_log()?;
    println!("# log ({} entries)", entries.len());
    for entry in &entries {
        println!("{}", serde_json::to_string(entry)?);
    }
    Ok(())
}

fn compact(log: Arc<TransactionLog>) -> Result<()> {
    let registry = TransactionRegistry::new(log);
    let report = registry.recover()?;
    // prepared and committed entries are restored, so the snapshot keeps both
    let kept = registry.compact_log()?;
    info!(
        kept,
        discarded = report.discarded.len(),
        "Transaction log compacted"
    );
    println!("Compacted transaction log: {} transactions kept", kept);
    Ok(())
}
