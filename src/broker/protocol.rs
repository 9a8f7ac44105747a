//! Request and reply contract of the transactional session protocol
//!
//! Framing and transport are handled by the broker's connection layer;
//! these types carry only the fields the transaction engine reads and
//! writes.

use crate::ack::{AckKind, AckSummary, DeadAckInfo};
use crate::error::{Status, StreamlineError};
use crate::message::{BrokerAddress, ConsumerId, MessageId};
use crate::transaction::{AutoRollback, RollbackOptions, TransactionId, TransactionStatus, XaFlags, Xid};

use bytes::Bytes;
use std::collections::BTreeMap;

/// How a request names its transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionRef {
    pub id: Option<TransactionId>,
    pub xid: Option<Xid>,
    /// Request is a client retry; an already-resolved transaction is not an error
    pub replay: bool,
}

impl TransactionRef {
    pub fn id(id: TransactionId) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn xid(xid: Xid) -> Self {
        Self {
            xid: Some(xid),
            ..Self::default()
        }
    }

    pub fn replayed(mut self) -> Self {
        self.replay = true;
        self
    }
}

/// A transactional request from a client session
#[derive(Debug, Clone)]
pub enum Request {
    Start {
        transaction: Option<TransactionId>,
        xid: Option<Xid>,
        flags: Option<XaFlags>,
        auto_rollback: AutoRollback,
        sessionless: bool,
        lifetime_ms: i64,
        /// Idempotency token of the request
        token: Option<String>,
    },
    End {
        target: TransactionRef,
        flags: Option<XaFlags>,
    },
    Prepare {
        target: TransactionRef,
        flags: Option<XaFlags>,
        one_phase: bool,
    },
    Commit {
        target: TransactionRef,
        flags: Option<XaFlags>,
        one_phase: bool,
        start_next: bool,
    },
    Rollback {
        target: TransactionRef,
        flags: Option<XaFlags>,
        options: RollbackOptions,
        start_next: bool,
    },
    Recover {
        transaction: Option<TransactionId>,
        flags: Option<XaFlags>,
    },
    Verify {
        target: TransactionRef,
    },
    Ack {
        kind: AckKind,
        /// Packed (consumer, message) blocks
        body: Bytes,
        transaction: Option<TransactionId>,
        validate: bool,
        dead: Option<DeadAckInfo>,
    },
    Redeliver {
        body: Bytes,
        set_redelivered: bool,
        transaction: Option<TransactionId>,
    },
}

impl Request {
    /// Local transaction START with default settings
    pub fn start_local() -> Self {
        Request::Start {
            transaction: None,
            xid: None,
            flags: None,
            auto_rollback: AutoRollback::All,
            sessionless: false,
            lifetime_ms: 0,
            token: None,
        }
    }

    /// XA START with NOFLAGS for a new branch
    pub fn start_xa(xid: Xid) -> Self {
        Request::Start {
            transaction: None,
            xid: Some(xid),
            flags: Some(XaFlags::NOFLAGS),
            auto_rollback: AutoRollback::NotPrepared,
            sessionless: true,
            lifetime_ms: 0,
            token: None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::Start { .. } => "START",
            Request::End { .. } => "END",
            Request::Prepare { .. } => "PREPARE",
            Request::Commit { .. } => "COMMIT",
            Request::Rollback { .. } => "ROLLBACK",
            Request::Recover { .. } => "RECOVER",
            Request::Verify { .. } => "VERIFY",
            Request::Ack { .. } => "ACK",
            Request::Redeliver { .. } => "REDELIVER",
        }
    }
}

/// Ownership of one consumed message in a prepared transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckOwner {
    pub consumer: ConsumerId,
    pub stored_consumer: ConsumerId,
    /// Broker owning the message when it is not this one
    pub broker: Option<BrokerAddress>,
}

/// Operation-specific reply payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ReplyBody {
    #[default]
    Empty,
    Xids(Vec<Xid>),
    Verify {
        status: TransactionStatus,
        detail: BTreeMap<MessageId, Vec<AckOwner>>,
    },
    Ack(AckSummary),
    Redelivered(usize),
}

/// Reply to a transactional request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: Status,
    pub transaction_id: Option<TransactionId>,
    /// Transaction started by COMMIT/ROLLBACK with `start_next`
    pub next_transaction_id: Option<TransactionId>,
    pub body: ReplyBody,
    pub reason: Option<String>,
    /// Failure originated on another broker
    pub remote: bool,
    /// Consumers the client should react to
    pub consumers: Vec<ConsumerId>,
    /// PREPARE failed and left the transaction FAILED
    pub prepare_failed: bool,
}

impl Reply {
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            transaction_id: None,
            next_transaction_id: None,
            body: ReplyBody::Empty,
            reason: None,
            remote: false,
            consumers: Vec::new(),
            prepare_failed: false,
        }
    }

    pub fn error(err: &StreamlineError) -> Self {
        Self {
            status: err.status(),
            reason: Some(err.to_string()),
            remote: err.is_remote(),
            consumers: err.affected_consumers().to_vec(),
            ..Self::ok()
        }
    }

    pub fn with_transaction(mut self, id: TransactionId) -> Self {
        self.transaction_id = Some(id);
        self
    }

    pub fn with_next_transaction(mut self, id: Option<TransactionId>) -> Self {
        self.next_transaction_id = id;
        self
    }

    pub fn with_body(mut self, body: ReplyBody) -> Self {
        self.body = body;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_success()
    }
}
