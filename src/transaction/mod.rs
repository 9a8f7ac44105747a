//! Transactional delivery
//!
//! Groups sends and acknowledgments into atomic units that are committed
//! or rolled back together, including:
//!
//! - Local and XA transaction lifecycles (START, END, PREPARE, COMMIT, ROLLBACK)
//! - Durable logging of prepared work for crash recovery
//! - Two-phase commit with brokers that own some of the consumed messages
//! - Ordered redelivery on rollback with dead-letter escalation

mod commit;
pub mod log;
mod machine;
mod reaper;
mod redeliver;
pub mod registry;
mod rollback;
mod state;
pub mod xa;

pub use commit::{CommitCoordinator, CommitOutcome, PrepareOutcome};
pub use log::{TransactionLog, TransactionLogEntry};
pub use machine::{next_state, remote_next_state, TransitionError, TransitionErrorKind};
pub use reaper::{ResolvedReaper, ResolvedReaperConfig};
pub use redeliver::{RedeliverRequest, Redeliverer};
pub use registry::{AckInsert, RecoveryReport, ResolvedTransaction, TransactionRegistry};
pub use rollback::{RollbackCoordinator, RollbackOptions, RollbackOutcome};
pub(crate) use state::now_ms;
pub use state::{
    AutoRollback, BaseTransaction, ConsumedAck, Operation, RollbackReason, TransactionBroker,
    TransactionId, TransactionIdGenerator, TransactionState, TransactionStatus, TransactionWork,
};
pub use xa::{XaFlags, Xid};

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for transaction outcomes
#[derive(Debug, Default)]
pub struct TransactionStats {
    /// Transactions created
    pub started: AtomicU64,
    /// Transactions committed
    pub commits: AtomicU64,
    /// Transactions prepared with remote participants
    pub cluster_prepares: AtomicU64,
    /// Transactions rolled back
    pub rollbacks: AtomicU64,
    /// Messages redelivered after rollback
    pub redelivered: AtomicU64,
    /// Messages moved to the dead-letter destination
    pub dead_lettered: AtomicU64,
    /// Failed calls to remote brokers
    pub remote_failures: AtomicU64,
    /// Commits that completed with some acknowledgments failing
    pub incomplete_commits: AtomicU64,
}

/// Point-in-time copy of [`TransactionStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionStatsSnapshot {
    pub started: u64,
    pub commits: u64,
    pub cluster_prepares: u64,
    pub rollbacks: u64,
    pub redelivered: u64,
    pub dead_lettered: u64,
    pub remote_failures: u64,
    pub incomplete_commits: u64,
}

impl TransactionStats {
    pub fn record_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self, complete: bool) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        if !complete {
            self.incomplete_commits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_cluster_prepare(&self) {
        self.cluster_prepares.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_redelivered(&self, count: usize) {
        self.redelivered.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remote_failure(&self) {
        self.remote_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> TransactionStatsSnapshot {
        TransactionStatsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            cluster_prepares: self.cluster_prepares.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            redelivered: self.redelivered.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            remote_failures: self.remote_failures.load(Ordering::Relaxed),
            incomplete_commits: self.incomplete_commits.load(Ordering::Relaxed),
        }
    }
}
