//! Transaction state structures
//!
//! Defines the lifecycle states, the per-transaction state record and the
//! durable work payload (produced messages and consumed acknowledgments)
//! that is logged for crash recovery.

use crate::message::{BrokerAddress, ConnectionId, ConsumerId, MessageId, MessageRef};
use crate::transaction::xa::Xid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cluster-unique transaction identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl TransactionId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Generates transaction ids that are unique across restarts
///
/// The upper bits carry the wall clock in milliseconds, the lower 16 bits a
/// counter. Ids never go backwards even if the clock does.
#[derive(Debug, Default)]
pub struct TransactionIdGenerator {
    last: AtomicU64,
}

impl TransactionIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> TransactionId {
        let floor = (now_ms().max(0) as u64) << 16;
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(floor.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        TransactionId(floor.max(previous + 1))
    }

    /// Make sure future ids are greater than `seen` (used after recovery)
    pub fn observe(&self, seen: TransactionId) {
        self.last.fetch_max(seen.0, Ordering::SeqCst);
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Transaction lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    Created,
    Started,
    /// Work ended (XA END TMSUCCESS), awaiting prepare or one-phase commit
    Complete,
    Failed,
    Prepared,
    Committed,
    RolledBack,
}

impl TransactionStatus {
    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Committed | TransactionStatus::RolledBack)
    }

    /// Check if acknowledgments and sends may still be added
    pub fn accepts_work(&self) -> bool {
        matches!(self, TransactionStatus::Started)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionStatus::Created => "CREATED",
            TransactionStatus::Started => "STARTED",
            TransactionStatus::Complete => "COMPLETE",
            TransactionStatus::Failed => "FAILED",
            TransactionStatus::Prepared => "PREPARED",
            TransactionStatus::Committed => "COMMITTED",
            TransactionStatus::RolledBack => "ROLLEDBACK",
        };
        f.write_str(name)
    }
}

/// What happens to a transaction when its owner goes away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AutoRollback {
    #[default]
    None,
    All,
    NotPrepared,
    Never,
}

/// Client operation driving a state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Start,
    End,
    Prepare,
    Commit,
    Rollback,
    Recover,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Start => "START",
            Operation::End => "END",
            Operation::Prepare => "PREPARE",
            Operation::Commit => "COMMIT",
            Operation::Rollback => "ROLLBACK",
            Operation::Recover => "RECOVER",
        };
        f.write_str(name)
    }
}

/// Why a rollback is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RollbackReason {
    Application,
    Admin,
    ConnectionCleanup,
    TakeoverCleanup,
}

impl RollbackReason {
    /// Remote brokers holding acks are told about the rollback even when the
    /// transaction never reached a cluster prepare
    pub fn forces_remote_notify(&self) -> bool {
        matches!(self, RollbackReason::Admin | RollbackReason::TakeoverCleanup)
    }
}

impl fmt::Display for RollbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RollbackReason::Application => "APPLICATION",
            RollbackReason::Admin => "ADMIN",
            RollbackReason::ConnectionCleanup => "CONNECTION_CLEANUP",
            RollbackReason::TakeoverCleanup => "TAKEOVER_CLEANUP",
        };
        f.write_str(name)
    }
}

/// Per-transaction state record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionState {
    pub auto_rollback: AutoRollback,
    pub lifetime_ms: i64,
    pub sessionless: bool,
    pub status: TransactionStatus,
    pub xid: Option<Xid>,
    /// Prepared as part of a one-phase commit
    pub one_phase_prepare: bool,
    /// Status held before entering FAILED
    pub fail_from: Option<TransactionStatus>,
    /// Idempotency token of the creating request
    pub creator: Option<String>,
    pub connection: Option<ConnectionId>,
    pub user: Option<String>,
    pub client_id: Option<String>,
    pub create_time_ms: i64,
    pub last_access_ms: i64,
    pub detached: bool,
    pub detached_time_ms: i64,
}

impl TransactionState {
    pub fn new(auto_rollback: AutoRollback, xid: Option<Xid>) -> Self {
        let now = now_ms();
        Self {
            auto_rollback,
            lifetime_ms: 0,
            sessionless: xid.is_some(),
            status: TransactionStatus::Created,
            xid,
            one_phase_prepare: false,
            fail_from: None,
            creator: None,
            connection: None,
            user: None,
            client_id: None,
            create_time_ms: now,
            last_access_ms: now,
            detached: false,
            detached_time_ms: 0,
        }
    }

    /// A local (non-XA) transaction
    pub fn local() -> Self {
        Self::new(AutoRollback::All, None)
    }

    pub fn with_creator(mut self, token: impl Into<String>) -> Self {
        self.creator = Some(token.into());
        self
    }

    pub fn with_connection(mut self, connection: ConnectionId) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_sessionless(mut self, sessionless: bool) -> Self {
        self.sessionless = sessionless;
        self
    }

    pub fn with_status(mut self, status: TransactionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_xa(&self) -> bool {
        self.xid.is_some()
    }

    /// Move to `status`, recording FAILED origin and one-phase prepare
    pub fn set_status(&mut self, status: TransactionStatus, one_phase: bool) {
        if status == TransactionStatus::Failed && self.status != TransactionStatus::Failed {
            self.fail_from = Some(self.status);
        }
        if status == TransactionStatus::Prepared {
            self.one_phase_prepare = one_phase;
        }
        self.status = status;
        self.last_access_ms = now_ms();
    }

    pub fn detach(&mut self) {
        self.detached = true;
        self.detached_time_ms = now_ms();
        self.connection = None;
    }
}

/// One consumed-message acknowledgment recorded against a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsumedAck {
    pub message: MessageId,
    pub consumer: ConsumerId,
    /// Durable identity used for persistence and redelivery
    pub stored_consumer: ConsumerId,
}

impl ConsumedAck {
    pub fn new(message: MessageId, consumer: ConsumerId, stored_consumer: ConsumerId) -> Self {
        Self {
            message,
            consumer,
            stored_consumer,
        }
    }
}

/// Durable transaction payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionWork {
    pub sent: Vec<MessageRef>,
    pub acks: Vec<ConsumedAck>,
    /// Acknowledgments owed to the brokers that own the messages
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub remote: BTreeMap<BrokerAddress, Vec<ConsumedAck>>,
}

impl TransactionWork {
    pub fn is_empty(&self) -> bool {
        self.sent.is_empty() && self.acks.is_empty()
    }
}

/// A remote broker participating in a cluster transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionBroker {
    pub broker: BrokerAddress,
    /// Outcome delivered to this broker
    pub completed: bool,
}

impl TransactionBroker {
    pub fn new(broker: BrokerAddress) -> Self {
        Self {
            broker,
            completed: false,
        }
    }
}

/// A transaction as written to the durable log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaseTransaction {
    /// Work confined to this broker
    Local {
        id: TransactionId,
        state: TransactionState,
        work: TransactionWork,
    },
    /// Work spans other brokers
    Cluster {
        id: TransactionId,
        state: TransactionState,
        work: TransactionWork,
        participants: Vec<TransactionBroker>,
    },
}

impl BaseTransaction {
    pub fn id(&self) -> TransactionId {
        match self {
            BaseTransaction::Local { id, .. } | BaseTransaction::Cluster { id, .. } => *id,
        }
    }

    pub fn state(&self) -> &TransactionState {
        match self {
            BaseTransaction::Local { state, .. } | BaseTransaction::Cluster { state, .. } => state,
        }
    }

    pub fn state_mut(&mut self) -> &mut TransactionState {
        match self {
            BaseTransaction::Local { state, .. } | BaseTransaction::Cluster { state, .. } => state,
        }
    }

    pub fn work(&self) -> &TransactionWork {
        match self {
            BaseTransaction::Local { work, .. } | BaseTransaction::Cluster { work, .. } => work,
        }
    }

    pub fn participants(&self) -> &[TransactionBroker] {
        match self {
            BaseTransaction::Local { .. } => &[],
            BaseTransaction::Cluster { participants, .. } => participants,
        }
    }

    pub fn is_cluster(&self) -> bool {
        matches!(self, BaseTransaction::Cluster { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_generator_is_monotonic() {
        let generator = TransactionIdGenerator::new();
        let mut previous = generator.next_id();
        for _ in 0..1000 {
            let next = generator.next_id();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn test_id_generator_observe() {
        let generator = TransactionIdGenerator::new();
        let far = TransactionId(u64::MAX / 2);
        generator.observe(far);
        assert!(generator.next_id() > far);
    }

    #[test]
    fn test_set_status_records_fail_from() {
        let mut state = TransactionState::local();
        state.set_status(TransactionStatus::Started, false);
        state.set_status(TransactionStatus::Failed, false);
        assert_eq!(state.fail_from, Some(TransactionStatus::Started));

        // staying in FAILED keeps the original origin
        state.set_status(TransactionStatus::Failed, false);
        assert_eq!(state.fail_from, Some(TransactionStatus::Started));
    }

    #[test]
    fn test_prepared_records_one_phase() {
        let mut state = TransactionState::local();
        state.set_status(TransactionStatus::Prepared, true);
        assert!(state.one_phase_prepare);
    }

    #[test]
    fn test_sessionless_defaults_to_xa() {
        let xid = Xid::new(1, b"g", b"b").unwrap();
        assert!(TransactionState::new(AutoRollback::NotPrepared, Some(xid)).sessionless);
        assert!(!TransactionState::local().sessionless);
    }

    #[test]
    fn test_terminal_states() {
        assert!(TransactionStatus::Committed.is_terminal());
        assert!(TransactionStatus::RolledBack.is_terminal());
        assert!(!TransactionStatus::Prepared.is_terminal());
        assert_eq!(TransactionStatus::RolledBack.to_string(), "ROLLEDBACK");
    }

    #[test]
    fn test_base_transaction_accessors() {
        let txn = BaseTransaction::Cluster {
            id: TransactionId(9),
            state: TransactionState::local(),
            work: TransactionWork::default(),
            participants: vec![TransactionBroker::new(BrokerAddress::new("b:1"))],
        };
        assert!(txn.is_cluster());
        assert_eq!(txn.id(), TransactionId(9));
        assert_eq!(txn.participants().len(), 1);
        assert!(txn.work().is_empty());
    }
}
