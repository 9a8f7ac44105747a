#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # Streamline Transactions
//!
//! The transactional delivery engine of the Streamline message broker.
//! Clients group message sends and consumed-message acknowledgments into
//! atomic units that are either committed or rolled back together.
//!
//! ## Features
//!
//! - **Local and XA transactions**: START/END/PREPARE/COMMIT/ROLLBACK/RECOVER
//!   driven by a pure state machine over XA flags
//! - **Durable prepare**: prepared work is written to an fsynced
//!   transaction log and restored in doubt after a restart
//! - **Cluster two-phase commit**: acknowledgments of messages owned by
//!   other brokers are prepared there before the local commit
//! - **Ordered redelivery**: rolled-back messages go back to their
//!   consumers in priority/timestamp/sequence order
//! - **Dead-letter escalation**: messages that keep rolling back are
//!   diverted to the dead-letter destination
//!
//! ## Quick Start
//!
//! ```ignore
//! use streamline_txn::broker::{BrokerContext, TransactionHandler, Request};
//! use streamline_txn::config::TransactionConfig;
//! use std::sync::Arc;
//!
//! let ctx = BrokerContext::builder(TransactionConfig::default())
//!     .with_store(store)
//!     .with_consumers(consumers)
//!     .build()?;
//!
//! let handler = TransactionHandler::new(ctx);
//! handler.recover_log().await?;
//! let reply = handler.handle(connection, Request::start_local()).await;
//! ```
//!
//! ## Feature Flags
//!
//! - `metrics`: emit counters through the `metrics` facade

// Deny .unwrap() in production code to prevent panics in the broker.
// Test code is exempt via #[cfg(test)] and --cfg test.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

// ── Stable public API modules ──
pub mod ack;
pub mod broker;
pub mod cluster;
pub mod config;
pub mod dlq;
pub mod error;
pub mod message;
pub mod transaction;

// ── Test support (in-memory collaborators, used by integration tests) ──
#[doc(hidden)]
pub mod testing;

// ── Re-exports ──
pub use ack::{AckEntry, AckKind, AckOutcome, AckRecorder, AckRequest, AckSummary, DeadAckInfo};
pub use broker::{
    BrokerContext, ConnectionHandle, ConsumerHandle, ConsumerRegistry, DestinationStore, Reply,
    ReplyBody, Request, TransactionHandler, WorkerPool,
};
pub use cluster::{ClusterNotifier, ClusterOutcome};
pub use config::TransactionConfig;
pub use error::{Result, Status, StreamlineError};
pub use message::{BrokerAddress, ConnectionId, ConsumerId, DestinationId, MessageId, MessageRef};
pub use transaction::{
    CommitCoordinator, RollbackCoordinator, RollbackOptions, TransactionId, TransactionLog,
    TransactionRegistry, TransactionState, TransactionStatus, XaFlags, Xid,
};
