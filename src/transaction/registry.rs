//! Registry of active transactions
//!
//! Holds every in-flight transaction keyed by [`TransactionId`] together
//! with its accumulated work: produced messages, consumed acknowledgments
//! (with their stored consumer identities) and the remote brokers that own
//! some of the consumed messages.
//!
//! # Concurrency
//!
//! Transactions live in a `DashMap`, so operations on one transaction never
//! block unrelated transactions. Shard guards are always dropped before the
//! transaction log is written.

use crate::error::{RemoteFailure, RemoteFailureKind, Result, StreamlineError};
use crate::message::{BrokerAddress, ConnectionId, ConsumerId, MessageId, MessageRef};
use crate::transaction::log::{TransactionLog, TransactionLogEntry};
use crate::transaction::state::{
    now_ms, BaseTransaction, ConsumedAck, TransactionBroker, TransactionId, TransactionState,
    TransactionStatus, TransactionWork,
};
use crate::transaction::xa::Xid;

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default limit of distinct consumed messages per transaction
pub const DEFAULT_MAX_CONSUMED_PER_TRANSACTION: usize = 1000;

/// Default number of resolved transactions remembered
pub const DEFAULT_RESOLVED_CACHE_LIMIT: usize = 500;

/// Result of recording a consumed acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckInsert {
    Inserted,
    /// The message/consumer pair was already recorded
    Duplicate,
}

/// A transaction that left the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTransaction {
    pub id: TransactionId,
    pub status: TransactionStatus,
    pub resolved_at_ms: i64,
}

/// Outcome of replaying the transaction log
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Prepared transactions restored into the registry
    pub in_doubt: Vec<TransactionId>,
    /// Committed transactions whose completion was never recorded, restored
    /// in COMMITTED for the commit coordinator to finish
    pub committed: Vec<BaseTransaction>,
    /// Unprepared transactions dropped by the crash
    pub discarded: Vec<TransactionId>,
    /// Highest transaction id seen in the log
    pub max_id: Option<TransactionId>,
}

#[derive(Debug, Clone)]
struct TransactionEntry {
    state: TransactionState,
    produced: Vec<MessageRef>,
    consumed: Vec<ConsumedAck>,
    remote: BTreeMap<BrokerAddress, Vec<ConsumedAck>>,
    ack_brokers: HashMap<MessageId, BrokerAddress>,
    cluster_brokers: Option<Vec<TransactionBroker>>,
}

impl TransactionEntry {
    fn new(state: TransactionState) -> Self {
        Self {
            state,
            produced: Vec::new(),
            consumed: Vec::new(),
            remote: BTreeMap::new(),
            ack_brokers: HashMap::new(),
            cluster_brokers: None,
        }
    }

    fn from_base(txn: BaseTransaction) -> Self {
        let (state, work, participants) = match txn {
            BaseTransaction::Local { state, work, .. } => (state, work, None),
            BaseTransaction::Cluster {
                state,
                work,
                participants,
                ..
            } => (state, work, Some(participants)),
        };
        let mut entry = Self::new(state);
        entry.produced = work.sent;
        entry.consumed = work.acks;
        entry.ack_brokers = work
            .remote
            .iter()
            .flat_map(|(broker, acks)| acks.iter().map(move |a| (a.message, broker.clone())))
            .collect();
        entry.remote = work.remote;
        entry.cluster_brokers = participants;
        entry
    }

    fn work(&self) -> TransactionWork {
        TransactionWork {
            sent: self.produced.clone(),
            acks: self.consumed.clone(),
            remote: self.remote.clone(),
        }
    }

    fn base(&self, id: TransactionId) -> BaseTransaction {
        match &self.cluster_brokers {
            Some(participants) => BaseTransaction::Cluster {
                id,
                state: self.state.clone(),
                work: self.work(),
                participants: participants.clone(),
            },
            None => BaseTransaction::Local {
                id,
                state: self.state.clone(),
                work: self.work(),
            },
        }
    }
}

/// Registry of active transactions
pub struct TransactionRegistry {
    transactions: DashMap<TransactionId, TransactionEntry>,
    xid_index: DashMap<Xid, TransactionId>,
    creator_index: DashMap<String, TransactionId>,
    resolved: Mutex<VecDeque<ResolvedTransaction>>,
    log: Arc<TransactionLog>,
    max_consumed: usize,
    resolved_limit: usize,
}

impl TransactionRegistry {
    pub fn new(log: Arc<TransactionLog>) -> Self {
        Self::with_limits(
            log,
            DEFAULT_MAX_CONSUMED_PER_TRANSACTION,
            DEFAULT_RESOLVED_CACHE_LIMIT,
        )
    }

    pub fn with_limits(log: Arc<TransactionLog>, max_consumed: usize, resolved_limit: usize) -> Self {
        Self {
            transactions: DashMap::new(),
            xid_index: DashMap::new(),
            creator_index: DashMap::new(),
            resolved: Mutex::new(VecDeque::new()),
            log,
            max_consumed,
            resolved_limit,
        }
    }

    /// A registry without durable logging
    pub fn in_memory() -> Self {
        Self::new(Arc::new(TransactionLog::disabled()))
    }

    pub fn log(&self) -> &Arc<TransactionLog> {
        &self.log
    }

    fn not_found(id: TransactionId) -> StreamlineError {
        StreamlineError::TransactionNotFound(id)
    }

    // ── Lifecycle ──

    /// Register a new transaction and log its creation
    pub fn create(&self, id: TransactionId, state: TransactionState) -> Result<()> {
        if self.transactions.contains_key(&id) {
            return Err(StreamlineError::DuplicateTransaction(id));
        }
        if let Some(xid) = &state.xid {
            if let Some(existing) = self.xid_index.get(xid) {
                return Err(StreamlineError::Conflict(format!(
                    "Xid {} already in use by {}",
                    xid,
                    *existing
                )));
            }
        }

        self.log.append(&TransactionLogEntry::Started {
            id,
            state: state.clone(),
        })?;

        if let Some(xid) = &state.xid {
            self.xid_index.insert(xid.clone(), id);
        }
        if let Some(token) = &state.creator {
            self.creator_index.insert(token.clone(), id);
        }
        self.transactions.insert(id, TransactionEntry::new(state));

        debug!(transaction_id = %id, "Transaction registered");
        Ok(())
    }

    pub fn contains(&self, id: TransactionId) -> bool {
        self.transactions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn get_state(&self, id: TransactionId) -> Option<TransactionState> {
        self.transactions.get(&id).map(|e| e.state.clone())
    }

    pub fn retrieve_state(&self, id: TransactionId) -> Result<TransactionState> {
        self.get_state(id).ok_or_else(|| Self::not_found(id))
    }

    /// Set the state of a transaction
    ///
    /// With `persist` the change is written through to the log; without it
    /// the caller is logging the transaction's work in the same step.
    pub fn update_state(
        &self,
        id: TransactionId,
        status: TransactionStatus,
        persist: bool,
    ) -> Result<TransactionState> {
        self.apply_status(id, None, status, false, persist)
    }

    /// Set the state only if the transaction is currently in `expected`
    pub fn update_state_from(
        &self,
        id: TransactionId,
        expected: TransactionStatus,
        status: TransactionStatus,
        persist: bool,
    ) -> Result<TransactionState> {
        self.apply_status(id, Some(expected), status, false, persist)
    }

    /// Move to PREPARED, remembering whether this was a one-phase prepare
    pub fn mark_prepared(&self, id: TransactionId, one_phase: bool, persist: bool) -> Result<TransactionState> {
        self.apply_status(id, None, TransactionStatus::Prepared, one_phase, persist)
    }

    fn apply_status(
        &self,
        id: TransactionId,
        expected: Option<TransactionStatus>,
        status: TransactionStatus,
        one_phase: bool,
        persist: bool,
    ) -> Result<TransactionState> {
        let check = |current: TransactionStatus| -> Result<()> {
            match expected {
                Some(expected) if expected != current => Err(StreamlineError::Conflict(format!(
                    "Transaction {} is {}, expected {}",
                    id, current, expected
                ))),
                _ => Ok(()),
            }
        };

        {
            let entry = self.transactions.get(&id).ok_or_else(|| Self::not_found(id))?;
            check(entry.state.status)?;
        }

        if persist {
            self.log
                .append(&TransactionLogEntry::StateChanged { id, status })?;
        }

        let mut entry = self
            .transactions
            .get_mut(&id)
            .ok_or_else(|| Self::not_found(id))?;
        check(entry.state.status)?;
        entry.state.set_status(status, one_phase);
        Ok(entry.state.clone())
    }

    /// Replace the owner fields of a detached or rejoined transaction
    pub fn set_connection(&self, id: TransactionId, connection: Option<ConnectionId>) -> Result<()> {
        let mut entry = self
            .transactions
            .get_mut(&id)
            .ok_or_else(|| Self::not_found(id))?;
        match connection {
            Some(conn) => {
                entry.state.connection = Some(conn);
                entry.state.detached = false;
                entry.state.detached_time_ms = 0;
            }
            None => entry.state.detach(),
        }
        Ok(())
    }

    // ── Work ──

    pub fn add_produced_message(&self, id: TransactionId, msg: MessageRef) -> Result<()> {
        let mut entry = self
            .transactions
            .get_mut(&id)
            .ok_or_else(|| Self::not_found(id))?;
        if !entry.state.status.accepts_work() {
            return Err(StreamlineError::Conflict(format!(
                "Cannot add message {} to transaction {} in state {}",
                msg.id, id, entry.state.status
            )));
        }
        entry.produced.push(msg);
        Ok(())
    }

    /// Record a consumed message acknowledgment against a transaction
    pub fn add_consumed_ack(&self, id: TransactionId, ack: ConsumedAck) -> Result<AckInsert> {
        let mut entry = self.transactions.get_mut(&id).ok_or_else(|| {
            StreamlineError::Gone(format!("Transaction {} no longer exists", id))
        })?;
        if !entry.state.status.accepts_work() {
            return Err(StreamlineError::Conflict(format!(
                "Cannot acknowledge {} in transaction {} in state {}",
                ack.message, id, entry.state.status
            )));
        }
        if entry
            .consumed
            .iter()
            .any(|a| a.message == ack.message && a.consumer == ack.consumer)
        {
            return Ok(AckInsert::Duplicate);
        }

        let is_new_message = !entry.consumed.iter().any(|a| a.message == ack.message);
        if is_new_message {
            let distinct: HashSet<MessageId> = entry.consumed.iter().map(|a| a.message).collect();
            if distinct.len() >= self.max_consumed {
                return Err(StreamlineError::ResourceExhausted(format!(
                    "Transaction {} exceeded {} consumed messages",
                    id, self.max_consumed
                )));
            }
        }
        entry.consumed.push(ack);
        Ok(AckInsert::Inserted)
    }

    /// Retract a single acknowledgment
    pub fn remove_consumed_ack(&self, id: TransactionId, message: MessageId, consumer: ConsumerId) -> bool {
        let Some(mut entry) = self.transactions.get_mut(&id) else {
            return false;
        };
        let before = entry.consumed.len();
        entry
            .consumed
            .retain(|a| !(a.message == message && a.consumer == consumer));
        let removed = entry.consumed.len() != before;
        if removed {
            for acks in entry.remote.values_mut() {
                acks.retain(|a| !(a.message == message && a.consumer == consumer));
            }
            entry.remote.retain(|_, acks| !acks.is_empty());
            if !entry.consumed.iter().any(|a| a.message == message) {
                entry.ack_brokers.remove(&message);
            }
        }
        removed
    }

    pub fn retrieve_produced_messages(&self, id: TransactionId) -> Result<Vec<MessageRef>> {
        self.transactions
            .get(&id)
            .map(|e| e.produced.clone())
            .ok_or_else(|| Self::not_found(id))
    }

    pub fn retrieve_consumed_messages(&self, id: TransactionId) -> Result<Vec<ConsumedAck>> {
        self.transactions
            .get(&id)
            .map(|e| e.consumed.clone())
            .ok_or_else(|| Self::not_found(id))
    }

    /// True if `consumer` acknowledged `message` within `id`
    pub fn has_consumed_ack(&self, id: TransactionId, message: MessageId, consumer: ConsumerId) -> bool {
        self.transactions
            .get(&id)
            .map(|e| {
                e.consumed
                    .iter()
                    .any(|a| a.message == message && a.consumer == consumer)
            })
            .unwrap_or(false)
    }

    /// Record that `ack` is owed to the broker that owns the message
    pub fn record_remote_ack_broker(
        &self,
        id: TransactionId,
        broker: BrokerAddress,
        ack: ConsumedAck,
    ) -> Result<()> {
        let mut entry = self.transactions.get_mut(&id).ok_or_else(|| {
            StreamlineError::Gone(format!("Transaction {} no longer exists", id))
        })?;
        if let Some(existing) = entry.ack_brokers.get(&ack.message) {
            if *existing != broker {
                return Err(RemoteFailure::new(
                    RemoteFailureKind::Gone,
                    broker,
                    format!(
                        "message {} was requeued, previously owned by {}",
                        ack.message, existing
                    ),
                )
                .with_consumers([ack.consumer])
                .into());
            }
        }
        entry.ack_brokers.insert(ack.message, broker.clone());
        let acks = entry.remote.entry(broker).or_default();
        if !acks.contains(&ack) {
            acks.push(ack);
        }
        Ok(())
    }

    pub fn retrieve_remote_ack_brokers(
        &self,
        id: TransactionId,
    ) -> Result<BTreeMap<BrokerAddress, Vec<ConsumedAck>>> {
        self.transactions
            .get(&id)
            .map(|e| e.remote.clone())
            .ok_or_else(|| Self::not_found(id))
    }

    /// Owning broker recorded for a consumed message
    pub fn ack_broker(&self, id: TransactionId, message: MessageId) -> Option<BrokerAddress> {
        self.transactions
            .get(&id)
            .and_then(|e| e.ack_brokers.get(&message).cloned())
    }

    pub fn set_cluster_brokers(&self, id: TransactionId, brokers: Vec<TransactionBroker>) -> Result<()> {
        let mut entry = self
            .transactions
            .get_mut(&id)
            .ok_or_else(|| Self::not_found(id))?;
        entry.cluster_brokers = Some(brokers);
        Ok(())
    }

    pub fn cluster_brokers(&self, id: TransactionId) -> Option<Vec<TransactionBroker>> {
        self.transactions
            .get(&id)
            .and_then(|e| e.cluster_brokers.clone())
    }

    pub fn is_cluster_transaction(&self, id: TransactionId) -> bool {
        self.transactions
            .get(&id)
            .map(|e| e.cluster_brokers.is_some())
            .unwrap_or(false)
    }

    pub fn mark_broker_completed(&self, id: TransactionId, broker: &BrokerAddress) {
        if let Some(mut entry) = self.transactions.get_mut(&id) {
            if let Some(brokers) = entry.cluster_brokers.as_mut() {
                for b in brokers.iter_mut().filter(|b| &b.broker == broker) {
                    b.completed = true;
                }
            }
        }
    }

    pub fn transaction_work(&self, id: TransactionId) -> Result<TransactionWork> {
        self.transactions
            .get(&id)
            .map(|e| e.work())
            .ok_or_else(|| Self::not_found(id))
    }

    /// The transaction as it would be written to the log
    pub fn base_transaction(&self, id: TransactionId) -> Result<BaseTransaction> {
        self.transactions
            .get(&id)
            .map(|e| e.base(id))
            .ok_or_else(|| Self::not_found(id))
    }

    // ── Removal ──

    /// Drop all bookkeeping for a transaction
    ///
    /// Without `force` only terminal transactions are removed.
    pub fn remove(&self, id: TransactionId, force: bool) -> Result<TransactionStatus> {
        let status = {
            let entry = self.transactions.get(&id).ok_or_else(|| Self::not_found(id))?;
            if !force && !entry.state.status.is_terminal() {
                return Err(StreamlineError::Conflict(format!(
                    "Transaction {} is {}, not resolved",
                    id, entry.state.status
                )));
            }
            entry.state.status
        };

        if let Err(e) = self.log.append(&TransactionLogEntry::Removed { id }) {
            warn!(transaction_id = %id, error = %e, "Failed to log transaction removal");
        }

        let Some((_, entry)) = self.transactions.remove(&id) else {
            return Err(Self::not_found(id));
        };
        if let Some(xid) = &entry.state.xid {
            self.xid_index.remove_if(xid, |_, v| *v == id);
        }
        if let Some(token) = &entry.state.creator {
            self.creator_index.remove_if(token, |_, v| *v == id);
        }
        self.remember_resolved(id, status);

        debug!(transaction_id = %id, %status, force, "Transaction removed");
        Ok(status)
    }

    fn remember_resolved(&self, id: TransactionId, status: TransactionStatus) {
        if self.resolved_limit == 0 {
            return;
        }
        let mut resolved = self.resolved.lock();
        while resolved.len() >= self.resolved_limit {
            resolved.pop_front();
        }
        resolved.push_back(ResolvedTransaction {
            id,
            status,
            resolved_at_ms: now_ms(),
        });
    }

    /// Final status of a recently removed transaction
    pub fn resolved(&self, id: TransactionId) -> Option<TransactionStatus> {
        self.resolved
            .lock()
            .iter()
            .rev()
            .find(|r| r.id == id)
            .map(|r| r.status)
    }

    pub fn resolved_count(&self) -> usize {
        self.resolved.lock().len()
    }

    /// Forget resolved transactions older than `older_than_ms`
    pub fn purge_resolved(&self, older_than_ms: i64) -> usize {
        let cutoff = now_ms() - older_than_ms;
        let mut resolved = self.resolved.lock();
        let before = resolved.len();
        resolved.retain(|r| r.resolved_at_ms > cutoff);
        before - resolved.len()
    }

    // ── Lookups ──

    /// Transaction created by a request carrying `token`
    pub fn find_by_creator_token(&self, token: &str) -> Option<TransactionId> {
        self.creator_index.get(token).map(|id| *id)
    }

    pub fn id_for_xid(&self, xid: &Xid) -> Option<TransactionId> {
        self.xid_index.get(xid).map(|id| *id)
    }

    pub fn ids(&self) -> Vec<TransactionId> {
        let mut ids: Vec<TransactionId> = self.transactions.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    pub fn in_status(&self, status: TransactionStatus) -> Vec<(TransactionId, TransactionState)> {
        let mut found: Vec<(TransactionId, TransactionState)> = self
            .transactions
            .iter()
            .filter(|e| e.state.status == status)
            .map(|e| (*e.key(), e.state.clone()))
            .collect();
        found.sort_by_key(|(id, _)| *id);
        found
    }

    pub fn for_connection(&self, connection: ConnectionId) -> Vec<TransactionId> {
        let mut ids: Vec<TransactionId> = self
            .transactions
            .iter()
            .filter(|e| e.state.connection == Some(connection))
            .map(|e| *e.key())
            .collect();
        ids.sort();
        ids
    }

    /// Unresolved transactions worth keeping across a log compaction
    pub fn durable_transactions(&self) -> Vec<BaseTransaction> {
        let mut txns: Vec<BaseTransaction> = self
            .transactions
            .iter()
            .filter(|e| {
                matches!(
                    e.state.status,
                    TransactionStatus::Prepared | TransactionStatus::Committed
                )
            })
            .map(|e| e.base(*e.key()))
            .collect();
        txns.sort_by_key(BaseTransaction::id);
        txns
    }

    /// Snapshot unresolved transactions and truncate the log
    pub fn compact_log(&self) -> Result<usize> {
        let txns = self.durable_transactions();
        self.log.compact(&txns)?;
        Ok(txns.len())
    }

    // ── Recovery ──

    /// Put a logged transaction back with its indexes
    fn restore(&self, id: TransactionId, txn: BaseTransaction) {
        let entry = TransactionEntry::from_base(txn);
        if let Some(xid) = &entry.state.xid {
            self.xid_index.insert(xid.clone(), id);
        }
        if let Some(token) = &entry.state.creator {
            self.creator_index.insert(token.clone(), id);
        }
        self.transactions.insert(id, entry);
    }

    /// Rebuild in-doubt transactions from the snapshot and log
    pub fn recover(&self) -> Result<RecoveryReport> {
        let snapshot = self.log.load_snapshot()?;
        let entries = self.log.replay_log()?;
        let replayed = replay(snapshot, entries);

        let mut report = RecoveryReport {
            max_id: replayed.keys().next_back().copied(),
            ..RecoveryReport::default()
        };

        for (id, txn) in replayed {
            match txn.state().status {
                TransactionStatus::Prepared => {
                    self.restore(id, txn);
                    report.in_doubt.push(id);
                }
                TransactionStatus::Committed => {
                    self.restore(id, txn.clone());
                    report.committed.push(txn);
                }
                _ => report.discarded.push(id),
            }
        }

        info!(
            in_doubt = report.in_doubt.len(),
            committed = report.committed.len(),
            discarded = report.discarded.len(),
            "Transaction recovery complete"
        );
        Ok(report)
    }
}

/// Fold log entries over a snapshot into the last known state per transaction
pub fn replay(
    snapshot: Vec<BaseTransaction>,
    entries: Vec<TransactionLogEntry>,
) -> BTreeMap<TransactionId, BaseTransaction> {
    let mut txns: BTreeMap<TransactionId, BaseTransaction> =
        snapshot.into_iter().map(|t| (t.id(), t)).collect();

    for entry in entries {
        match entry {
            TransactionLogEntry::Started { id, state } => {
                txns.insert(
                    id,
                    BaseTransaction::Local {
                        id,
                        state,
                        work: TransactionWork::default(),
                    },
                );
            }
            TransactionLogEntry::StateChanged { id, status }
            | TransactionLogEntry::Completed { id, status } => {
                if let Some(txn) = txns.get_mut(&id) {
                    txn.state_mut().status = status;
                }
            }
            TransactionLogEntry::Prepared { transaction }
            | TransactionLogEntry::Committed { transaction } => {
                txns.insert(transaction.id(), transaction);
            }
            TransactionLogEntry::RolledBack { id } => {
                if let Some(txn) = txns.get_mut(&id) {
                    txn.state_mut().status = TransactionStatus::RolledBack;
                }
            }
            TransactionLogEntry::Removed { id } => {
                txns.remove(&id);
            }
            TransactionLogEntry::Snapshot { .. } => {}
        }
    }
    txns
}
