//! Transaction log for crash recovery
//!
//! Persists transaction state transitions and prepared work so that
//! in-doubt transactions survive a broker restart. Uses an append-only
//! JSON-lines log with periodic snapshots. Appends are serialized by the
//! log-write lock and synced before returning.

use crate::error::{Result, StreamlineError};
use crate::transaction::state::{BaseTransaction, TransactionId, TransactionState, TransactionStatus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const LOG_DIR: &str = "__transaction_log";
const LOG_FILE: &str = "current.log";
const SNAPSHOT_FILE: &str = "snapshot.json";

/// Entry types in the transaction log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionLogEntry {
    /// Transaction created
    Started {
        id: TransactionId,
        state: TransactionState,
    },
    /// State written through without work
    StateChanged {
        id: TransactionId,
        status: TransactionStatus,
    },
    /// Prepared with its full work (two-phase)
    Prepared { transaction: BaseTransaction },
    /// Committed in one phase with its full work
    Committed { transaction: BaseTransaction },
    /// Outcome of a previously prepared transaction
    Completed {
        id: TransactionId,
        status: TransactionStatus,
    },
    /// Rolled back before prepare
    RolledBack { id: TransactionId },
    /// All bookkeeping released
    Removed { id: TransactionId },
    /// Snapshot marker (all state before this point is in the snapshot file)
    Snapshot { sequence: u64 },
}

impl TransactionLogEntry {
    pub fn transaction_id(&self) -> Option<TransactionId> {
        match self {
            TransactionLogEntry::Started { id, .. }
            | TransactionLogEntry::StateChanged { id, .. }
            | TransactionLogEntry::Completed { id, .. }
            | TransactionLogEntry::RolledBack { id }
            | TransactionLogEntry::Removed { id } => Some(*id),
            TransactionLogEntry::Prepared { transaction }
            | TransactionLogEntry::Committed { transaction } => Some(transaction.id()),
            TransactionLogEntry::Snapshot { .. } => None,
        }
    }
}

struct LogWriter {
    sequence: u64,
}

/// Append-only transaction log
pub struct TransactionLog {
    log_dir: PathBuf,
    /// Log-write lock; serializes appends, snapshots and truncation
    writer: Mutex<LogWriter>,
    enabled: bool,
}

impl TransactionLog {
    /// Open (or create) the transaction log under `data_dir`
    pub fn new(data_dir: &Path, enabled: bool) -> Result<Self> {
        let log_dir = data_dir.join(LOG_DIR);
        if enabled {
            fs::create_dir_all(&log_dir).map_err(|e| {
                StreamlineError::Storage(format!(
                    "Failed to create transaction log directory: {}",
                    e
                ))
            })?;
        }

        Ok(Self {
            log_dir,
            writer: Mutex::new(LogWriter { sequence: 0 }),
            enabled,
        })
    }

    /// A log that accepts and discards every append
    pub fn disabled() -> Self {
        Self {
            log_dir: PathBuf::new(),
            writer: Mutex::new(LogWriter { sequence: 0 }),
            enabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Append an entry and sync it to disk
    pub fn append(&self, entry: &TransactionLogEntry) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let json = serde_json::to_string(entry).map_err(|e| {
            StreamlineError::Storage(format!("Failed to serialize transaction log entry: {}", e))
        })?;
        let line = format!("{}\n", json);

        let mut writer = self.writer.lock();
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_dir.join(LOG_FILE))
            .and_then(|mut f| {
                f.write_all(line.as_bytes())?;
                f.sync_data()
            })
            .map_err(|e| {
                StreamlineError::Storage(format!("Failed to write transaction log: {}", e))
            })?;
        writer.sequence += 1;
        Ok(())
    }

    /// Number of entries appended since open or the last compaction
    pub fn sequence(&self) -> u64 {
        self.writer.lock().sequence
    }

    fn write_snapshot(&self, transactions: &[BaseTransaction]) -> Result<()> {
        let json = serde_json::to_string_pretty(transactions).map_err(|e| {
            StreamlineError::Storage(format!("Failed to serialize snapshot: {}", e))
        })?;

        let temp_file = self.log_dir.join(format!("{}.tmp", SNAPSHOT_FILE));
        fs::write(&temp_file, &json)
            .map_err(|e| StreamlineError::Storage(format!("Failed to write snapshot: {}", e)))?;
        fs::rename(&temp_file, self.log_dir.join(SNAPSHOT_FILE)).map_err(|e| {
            StreamlineError::Storage(format!("Failed to finalize snapshot: {}", e))
        })?;
        Ok(())
    }

    fn truncate(&self) -> Result<()> {
        let log_file = self.log_dir.join(LOG_FILE);
        if log_file.exists() {
            fs::write(&log_file, "").map_err(|e| {
                StreamlineError::Storage(format!("Failed to truncate transaction log: {}", e))
            })?;
        }
        Ok(())
    }

    /// Snapshot `transactions` and truncate the log in one step
    pub fn compact(&self, transactions: &[BaseTransaction]) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let mut writer = self.writer.lock();
        self.write_snapshot(transactions)?;
        self.truncate()?;
        let sequence = writer.sequence;
        writer.sequence = 0;
        info!(
            count = transactions.len(),
            compacted_entries = sequence,
            "Transaction log compacted"
        );
        Ok(())
    }

    /// Load transactions from the snapshot
    pub fn load_snapshot(&self) -> Result<Vec<BaseTransaction>> {
        if !self.enabled {
            return Ok(Vec::new());
        }

        let snapshot_file = self.log_dir.join(SNAPSHOT_FILE);
        if !snapshot_file.exists() {
            debug!("No transaction snapshot found, starting fresh");
            return Ok(Vec::new());
        }

        let json = fs::read_to_string(&snapshot_file)
            .map_err(|e| StreamlineError::Storage(format!("Failed to read snapshot: {}", e)))?;
        let transactions: Vec<BaseTransaction> = serde_json::from_str(&json)
            .map_err(|e| StreamlineError::Storage(format!("Failed to parse snapshot: {}", e)))?;

        info!(count = transactions.len(), "Loaded transactions from snapshot");
        Ok(transactions)
    }

    /// Replay log entries since the last snapshot
    pub fn replay_log(&self) -> Result<Vec<TransactionLogEntry>> {
        if !self.enabled {
            return Ok(Vec::new());
        }

        let log_file = self.log_dir.join(LOG_FILE);
        if !log_file.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&log_file).map_err(|e| {
            StreamlineError::Storage(format!("Failed to read transaction log: {}", e))
        })?;

        let mut entries = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TransactionLogEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!("Skipping corrupted transaction log entry: {}", e);
                }
            }
        }

        info!(count = entries.len(), "Replayed transaction log entries");
        Ok(entries)
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DestinationId, MessageId, MessageRef};
    use crate::transaction::state::TransactionWork;
    use tempfile::TempDir;

    fn prepared(id: u64) -> BaseTransaction {
        BaseTransaction::Local {
            id: TransactionId(id),
            state: TransactionState::local().with_status(TransactionStatus::Prepared),
            work: TransactionWork {
                sent: vec![MessageRef::new(MessageId(1), DestinationId::queue("q"))],
                ..TransactionWork::default()
            },
        }
    }

    #[test]
    fn test_append_and_replay() {
        let tmp = TempDir::new().unwrap();
        let log = TransactionLog::new(tmp.path(), true).unwrap();

        log.append(&TransactionLogEntry::Started {
            id: TransactionId(1),
            state: TransactionState::local(),
        })
        .unwrap();
        log.append(&TransactionLogEntry::Prepared {
            transaction: prepared(1),
        })
        .unwrap();
        log.append(&TransactionLogEntry::Completed {
            id: TransactionId(1),
            status: TransactionStatus::Committed,
        })
        .unwrap();

        let entries = log.replay_log().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(log.sequence(), 3);
        assert_eq!(entries[1].transaction_id(), Some(TransactionId(1)));
    }

    #[test]
    fn test_corrupted_lines_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let log = TransactionLog::new(tmp.path(), true).unwrap();
        log.append(&TransactionLogEntry::RolledBack { id: TransactionId(3) })
            .unwrap();

        let path = log.log_dir().join(LOG_FILE);
        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{not json\n").unwrap();
        drop(file);
        log.append(&TransactionLogEntry::Removed { id: TransactionId(3) })
            .unwrap();

        let entries = log.replay_log().unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_compact_snapshots_and_truncates() {
        let tmp = TempDir::new().unwrap();
        let log = TransactionLog::new(tmp.path(), true).unwrap();
        log.append(&TransactionLogEntry::Prepared {
            transaction: prepared(7),
        })
        .unwrap();

        log.compact(&[prepared(7)]).unwrap();

        assert!(log.replay_log().unwrap().is_empty());
        assert_eq!(log.sequence(), 0);
        let snapshot = log.load_snapshot().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id(), TransactionId(7));
    }

    #[test]
    fn test_disabled_log_discards() {
        let tmp = TempDir::new().unwrap();
        let log = TransactionLog::new(tmp.path(), false).unwrap();
        log.append(&TransactionLogEntry::RolledBack { id: TransactionId(1) })
            .unwrap();
        assert!(log.replay_log().unwrap().is_empty());
        assert!(!tmp.path().join(LOG_DIR).exists());

        let log = TransactionLog::disabled();
        assert!(log.load_snapshot().unwrap().is_empty());
    }
}
