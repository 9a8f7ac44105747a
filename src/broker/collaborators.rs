//! Interfaces to the broker subsystems the transaction engine drives
//!
//! The message store, destination routing and consumer/session management
//! live outside this crate. The engine only needs the narrow operations
//! below; brokers provide implementations, tests use the in-memory ones in
//! [`crate::testing`].

use crate::dlq::DlqMetadata;
use crate::error::Result;
use crate::message::{BrokerAddress, ConsumerId, MessageId, MessageRef, SessionId};

/// Why a message is removed from its destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoveReason {
    /// Fully acknowledged by every required consumer
    Acknowledged,
    /// Produced in a transaction that rolled back
    Rollback,
    /// Local copy of a message owned by another broker was released
    RemoteReleased,
}

/// Destination storage and routing
pub trait DestinationStore: Send + Sync {
    /// Look up a live message reference
    fn lookup(&self, id: MessageId) -> Option<MessageRef>;

    /// Route a committed message to its destination's consumers
    fn route(&self, msg: &MessageRef) -> Result<()>;

    /// Hold a committed message until its delivery time
    fn route_delayed(&self, msg: &MessageRef, deliver_at_ms: i64) -> Result<()>;

    /// Remove a message; returns false if it was already gone
    fn remove(&self, id: MessageId, reason: RemoveReason) -> Result<bool>;

    /// Record that `stored` acknowledged the message
    ///
    /// Returns true once every required consumer has acknowledged it and
    /// the message may be removed.
    fn acknowledge(&self, id: MessageId, stored: ConsumerId) -> Result<bool>;

    fn is_acknowledged(&self, id: MessageId, stored: ConsumerId) -> bool;

    /// Undo a tentative consumption so the message can be delivered again
    fn undeliver(&self, id: MessageId, stored: ConsumerId, redelivered: bool) -> Result<()>;

    /// Put a message back on its queue's pending list (no live consumer)
    fn requeue(&self, msg: &MessageRef, stored: ConsumerId, redelivered: bool) -> Result<()>;

    /// Add to the per-consumer delivery count, returning the new count
    fn update_delivery_count(&self, id: MessageId, stored: ConsumerId, delta: u32) -> Result<u32>;

    /// Move a message to the dead-letter destination and remove it here
    fn move_to_dead_letter(&self, msg: &MessageRef, metadata: &DlqMetadata) -> Result<()>;
}

/// A consumer as seen by the transaction engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerHandle {
    pub id: ConsumerId,
    /// Durable identity; equal to `id` for non-durable consumers
    pub stored_id: ConsumerId,
    pub session: Option<SessionId>,
    /// Attached to a live session
    pub active: bool,
    /// Consumer lives on another broker and reaches us through the cluster
    pub remote_broker: Option<BrokerAddress>,
}

impl ConsumerHandle {
    pub fn new(id: ConsumerId) -> Self {
        Self {
            id,
            stored_id: id,
            session: None,
            active: true,
            remote_broker: None,
        }
    }

    pub fn with_stored_id(mut self, stored_id: ConsumerId) -> Self {
        self.stored_id = stored_id;
        self
    }

    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_remote_broker(mut self, broker: BrokerAddress) -> Self {
        self.remote_broker = Some(broker);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn is_durable(&self) -> bool {
        self.stored_id != self.id
    }
}

/// Consumer and session management
pub trait ConsumerRegistry: Send + Sync {
    fn lookup(&self, id: ConsumerId) -> Option<ConsumerHandle>;

    /// Drop a message from the consumer session's delivered-unacked list
    fn release_delivered(&self, consumer: ConsumerId, message: MessageId) -> bool;

    /// Push messages back to a live consumer in the given order
    ///
    /// Returns false if the consumer can no longer take them.
    fn redeliver(&self, consumer: ConsumerId, refs: &[MessageRef], to_front: bool) -> Result<bool>;

    /// Requeue messages on a durable subscription whose consumer is gone
    fn route_to_durable(&self, stored: ConsumerId, refs: &[MessageRef]) -> Result<bool>;

    /// Ask the client to recreate a consumer after a remote failure
    fn request_recreation(&self, consumer: ConsumerId);
}
