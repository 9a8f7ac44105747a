//! Shared test fixtures for streamline-txn integration tests
//!
//! # Usage
//!
//! In your test file, add:
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::sync::Arc;
use streamline_txn::ack::{encode_ack_blocks, AckEntry, AckKind};
use streamline_txn::broker::protocol::TransactionRef;
use streamline_txn::broker::{Request, TransactionHandler};
use streamline_txn::message::{BrokerAddress, ConsumerId, DestinationId, MessageId, MessageRef};
use streamline_txn::testing::{TestBroker, TEST_BROKER_ADDRESS};
use streamline_txn::transaction::{RollbackOptions, TransactionId, Xid};
use streamline_txn::TransactionConfig;
use tempfile::TempDir;

// ============================================================================
// Brokers
// ============================================================================

/// Broker whose transaction log lives in `dir`
pub fn durable_broker(dir: &TempDir) -> TestBroker {
    TestBroker::with_config(
        TransactionConfig::default()
            .with_data_dir(dir.path())
            .with_broker_address(TEST_BROKER_ADDRESS),
    )
}

pub fn handler(broker: &TestBroker) -> TransactionHandler {
    TransactionHandler::new(broker.ctx.clone())
}

pub fn shared_handler(broker: &TestBroker) -> Arc<TransactionHandler> {
    Arc::new(handler(broker))
}

pub fn remote_broker() -> BrokerAddress {
    BrokerAddress::new("b:7676")
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn queue_message(id: u64) -> MessageRef {
    MessageRef::new(MessageId(id), DestinationId::queue("orders"))
}

pub fn topic_message(id: u64) -> MessageRef {
    MessageRef::new(MessageId(id), DestinationId::topic("prices"))
}

pub fn xid(n: u8) -> Xid {
    Xid::new(0x5354_524d, &[b'g', n], &[b'b', n]).unwrap()
}

// ============================================================================
// Requests
// ============================================================================

pub fn ack_request(transaction: Option<TransactionId>, acks: &[(u64, u64)]) -> Request {
    let entries: Vec<AckEntry> = acks
        .iter()
        .map(|(consumer, message)| AckEntry::new(ConsumerId(*consumer), MessageId(*message)))
        .collect();
    Request::Ack {
        kind: AckKind::Normal,
        body: encode_ack_blocks(&entries),
        transaction,
        validate: false,
        dead: None,
    }
}

pub fn commit(target: TransactionRef) -> Request {
    Request::Commit {
        target,
        flags: None,
        one_phase: false,
        start_next: false,
    }
}

pub fn rollback(target: TransactionRef, options: RollbackOptions) -> Request {
    Request::Rollback {
        target,
        flags: None,
        options,
        start_next: false,
    }
}

pub fn prepare(target: TransactionRef) -> Request {
    Request::Prepare {
        target,
        flags: None,
        one_phase: false,
    }
}
