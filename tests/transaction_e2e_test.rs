//! End-to-end transaction flows through the request handler
//!
//! Covers local commit of sends and acks, XA prepare surviving a restart,
//! and request execution through the worker pool.

mod common;

use common::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use streamline_txn::broker::protocol::{ReplyBody, TransactionRef};
use streamline_txn::broker::{ConsumerHandle, DestinationStore, Request, WorkerPool};
use streamline_txn::error::Status;
use streamline_txn::message::{ConnectionId, ConsumerId, MessageId};
use streamline_txn::testing::{TestBroker, TEST_BROKER_ADDRESS};
use streamline_txn::transaction::{RollbackOptions, TransactionStatus, XaFlags};
use streamline_txn::TransactionConfig;
use tempfile::tempdir;

#[tokio::test]
async fn test_local_transaction_commits_sends_and_acks() {
    let broker = TestBroker::new();
    broker.consumers.register(ConsumerHandle::new(ConsumerId(1)));
    broker.store.insert(queue_message(1));
    broker.store.deliver(MessageId(1), ConsumerId(1));
    let handler = handler(&broker);

    let id = handler
        .handle(ConnectionId(1), Request::start_local())
        .await
        .transaction_id
        .unwrap();
    broker.produce(id, queue_message(100));

    let ack = handler
        .handle(ConnectionId(1), ack_request(Some(id), &[(1, 1)]))
        .await;
    assert!(ack.is_ok());
    assert!(matches!(ack.body, ReplyBody::Ack(ref s) if s.deferred == 1));
    // nothing is visible before commit
    assert!(broker.store.routed().is_empty());
    assert!(broker.store.lookup(MessageId(1)).is_some());

    let reply = handler
        .handle(ConnectionId(1), commit(TransactionRef::id(id)))
        .await;
    assert!(reply.is_ok(), "commit failed: {:?}", reply.reason);

    assert_eq!(broker.store.routed(), vec![MessageId(100)]);
    assert!(broker.store.lookup(MessageId(1)).is_none());
    assert!(broker.ctx.registry().is_empty());
    assert_eq!(broker.ctx.stats().get_stats().commits, 1);
}

#[tokio::test]
async fn test_rollback_discards_sends_and_returns_messages() {
    let broker = TestBroker::new();
    broker.consumers.register(ConsumerHandle::new(ConsumerId(1)));
    let handler = handler(&broker);

    let id = handler
        .handle(ConnectionId(1), Request::start_local())
        .await
        .transaction_id
        .unwrap();
    broker.produce(id, queue_message(100));
    broker.consume(id, queue_message(1).with_timestamp(20), ConsumerId(1));
    broker.consume(id, queue_message(2).with_timestamp(10), ConsumerId(1));
    broker.consume(id, queue_message(3).with_priority(8), ConsumerId(1));

    let reply = handler
        .handle(
            ConnectionId(1),
            rollback(TransactionRef::id(id), RollbackOptions::redelivering()),
        )
        .await;
    assert!(reply.is_ok());

    assert!(broker.store.lookup(MessageId(100)).is_none());
    assert!(broker.store.routed().is_empty());
    assert_eq!(
        broker.consumers.redelivered_to(ConsumerId(1)),
        vec![MessageId(3), MessageId(2), MessageId(1)]
    );
    assert_eq!(
        broker.ctx.registry().resolved(id),
        Some(TransactionStatus::RolledBack)
    );
}

#[tokio::test]
async fn test_prepared_xa_transaction_survives_restart() {
    let dir = tempdir().unwrap();
    let xid = xid(1);

    let id = {
        let broker = durable_broker(&dir);
        let handler = handler(&broker);
        let id = handler
            .handle(ConnectionId(1), Request::start_xa(xid.clone()))
            .await
            .transaction_id
            .unwrap();
        broker.produce(id, queue_message(100));
        broker.consume(id, queue_message(1), ConsumerId(1));

        let end = handler
            .handle(
                ConnectionId(1),
                Request::End {
                    target: TransactionRef::xid(xid.clone()),
                    flags: Some(XaFlags::SUCCESS),
                },
            )
            .await;
        assert!(end.is_ok());
        let prepared = handler
            .handle(ConnectionId(1), prepare(TransactionRef::xid(xid.clone())))
            .await;
        assert!(prepared.is_ok(), "prepare failed: {:?}", prepared.reason);
        id
    };

    // restart over the same log
    let broker = durable_broker(&dir);
    let report = broker.ctx.recover().unwrap();
    assert_eq!(report.in_doubt, vec![id]);
    assert_eq!(
        broker.ctx.registry().retrieve_state(id).unwrap().status,
        TransactionStatus::Prepared
    );

    let handler = handler(&broker);
    let scan = handler
        .handle(
            ConnectionId(2),
            Request::Recover {
                transaction: None,
                flags: Some(XaFlags::STARTRSCAN),
            },
        )
        .await;
    assert_eq!(scan.body, ReplyBody::Xids(vec![xid.clone()]));

    // the message store comes back with the same messages
    broker.store.insert(queue_message(100));
    broker.store.insert(queue_message(1));
    broker.store.deliver(MessageId(1), ConsumerId(1));

    let reply = handler
        .handle(ConnectionId(2), commit(TransactionRef::xid(xid)))
        .await;
    assert!(reply.is_ok(), "commit failed: {:?}", reply.reason);
    assert_eq!(broker.store.routed(), vec![MessageId(100)]);
    assert!(broker.store.lookup(MessageId(1)).is_none());

    // new transactions never reuse a recovered id
    let next = handler
        .handle(ConnectionId(2), Request::start_local())
        .await
        .transaction_id
        .unwrap();
    assert!(next > id);
}

#[tokio::test]
async fn test_unprepared_transactions_are_discarded_on_restart() {
    let dir = tempdir().unwrap();
    let id = {
        let broker = durable_broker(&dir);
        let id = broker.begin();
        broker.consume(id, queue_message(1), ConsumerId(1));
        id
    };

    let broker = durable_broker(&dir);
    let report = broker.ctx.recover().unwrap();
    assert!(report.in_doubt.is_empty());
    assert_eq!(report.discarded, vec![id]);
    assert!(broker.ctx.registry().is_empty());
}

#[tokio::test]
async fn test_verify_reports_prepared_ownership() {
    let broker = TestBroker::new();
    let handler = handler(&broker);
    let xid = xid(2);
    let id = handler
        .handle(ConnectionId(1), Request::start_xa(xid.clone()))
        .await
        .transaction_id
        .unwrap();
    broker.consume(id, queue_message(1), ConsumerId(4));

    let verify = handler
        .handle(
            ConnectionId(1),
            Request::Verify {
                target: TransactionRef::id(id),
            },
        )
        .await;
    match verify.body {
        ReplyBody::Verify { status, detail } => {
            assert_eq!(status, TransactionStatus::Started);
            assert!(detail.is_empty());
        }
        other => panic!("unexpected body {:?}", other),
    }

    handler
        .handle(
            ConnectionId(1),
            Request::End {
                target: TransactionRef::xid(xid.clone()),
                flags: Some(XaFlags::SUCCESS),
            },
        )
        .await;
    handler
        .handle(ConnectionId(1), prepare(TransactionRef::xid(xid)))
        .await;

    let verify = handler
        .handle(
            ConnectionId(1),
            Request::Verify {
                target: TransactionRef::id(id),
            },
        )
        .await;
    match verify.body {
        ReplyBody::Verify { status, detail } => {
            assert_eq!(status, TransactionStatus::Prepared);
            let owners = &detail[&MessageId(1)];
            assert_eq!(owners[0].consumer, ConsumerId(4));
            assert_eq!(owners[0].broker, None);
        }
        other => panic!("unexpected body {:?}", other),
    }
}

#[tokio::test]
async fn test_worker_pool_bounds_concurrency() {
    let broker = TestBroker::with_config(
        TransactionConfig::in_memory()
            .with_broker_address(TEST_BROKER_ADDRESS)
            .with_worker_pool_size(2),
    );
    let pool = Arc::new(WorkerPool::new(shared_handler(&broker)));

    let mut tasks = Vec::new();
    for conn in 0..8u64 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let handle = pool.open_connection(ConnectionId(conn));
            for _ in 0..5 {
                let id = handle
                    .submit(Request::start_local())
                    .await
                    .unwrap()
                    .transaction_id
                    .unwrap();
                let reply = handle.submit(commit(TransactionRef::id(id))).await.unwrap();
                assert!(reply.is_ok());
            }
            handle.close().await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.requests_processed.load(Ordering::Relaxed), 80);
    assert!(stats.max_concurrent.load(Ordering::Relaxed) <= 2);
    assert_eq!(stats.current_in_flight(), 0);
    assert!(broker.ctx.registry().is_empty());
    assert_eq!(broker.ctx.stats().get_stats().commits, 40);
}

#[tokio::test]
async fn test_closed_connection_leaves_prepared_work_in_doubt() {
    let broker = TestBroker::new();
    let pool = WorkerPool::new(shared_handler(&broker));
    let handle = pool.open_connection(ConnectionId(3));

    let local = handle
        .submit(Request::start_local())
        .await
        .unwrap()
        .transaction_id
        .unwrap();
    let xid = xid(3);
    let xa = handle
        .submit(Request::start_xa(xid.clone()))
        .await
        .unwrap()
        .transaction_id
        .unwrap();
    handle
        .submit(Request::End {
            target: TransactionRef::xid(xid.clone()),
            flags: Some(XaFlags::SUCCESS),
        })
        .await
        .unwrap();
    let prepared = handle.submit(prepare(TransactionRef::xid(xid))).await.unwrap();
    assert!(prepared.is_ok());

    handle.close().await.unwrap();

    assert!(!broker.ctx.registry().contains(local));
    assert_eq!(
        broker.ctx.registry().retrieve_state(xa).unwrap().status,
        TransactionStatus::Prepared
    );
}

#[tokio::test]
async fn test_commit_of_unknown_transaction_is_not_found() {
    let broker = TestBroker::new();
    let reply = handler(&broker)
        .handle(
            ConnectionId(1),
            commit(TransactionRef::id(streamline_txn::TransactionId(42))),
        )
        .await;
    assert_eq!(reply.status, Status::NotFound);
    assert!(reply.reason.unwrap().contains("42"));
}
