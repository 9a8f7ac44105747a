//! Message acknowledgment
//!
//! [`AckRecorder`] applies ACK requests from consumer sessions. NORMAL acks
//! outside a transaction take effect immediately; inside a transaction they
//! are recorded against it and applied on commit. DEAD and UNDELIVERABLE
//! acks never join a transaction: the message goes straight to the
//! dead-letter destination.
//!
//! # Wire format
//!
//! An ack body is a sequence of 16-byte blocks, each holding the consumer
//! id and the message id as big-endian `u64`s.

use crate::broker::{BrokerContext, RemoveReason};
use crate::dlq::{DeadReason, DlqContext};
use crate::error::{RemoteFailure, RemoteFailureKind, Result, StreamlineError};
use crate::message::{ConsumerId, MessageId, MessageRef};
use crate::transaction::{AckInsert, ConsumedAck, TransactionId, TransactionStatus};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tracing::{debug, warn};

/// Size of one (consumer, message) block in an ack body
pub const ACK_BLOCK_SIZE: usize = 16;

/// Kind of acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckKind {
    Normal,
    /// Consumer could not process the message
    Undeliverable,
    /// Message is dead (e.g. expired on the client)
    Dead,
}

impl AckKind {
    pub fn is_dead(&self) -> bool {
        !matches!(self, AckKind::Normal)
    }
}

/// One (consumer, message) pair of an ack request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckEntry {
    pub consumer: ConsumerId,
    pub message: MessageId,
}

impl AckEntry {
    pub fn new(consumer: ConsumerId, message: MessageId) -> Self {
        Self { consumer, message }
    }
}

/// Decode an ack body into its entries
pub fn decode_ack_blocks(mut body: &[u8]) -> Result<Vec<AckEntry>> {
    if body.is_empty() {
        return Err(StreamlineError::protocol_msg("empty ack message"));
    }
    if body.len() % ACK_BLOCK_SIZE != 0 {
        return Err(StreamlineError::protocol_msg("corrupted ack message"));
    }
    let mut entries = Vec::with_capacity(body.len() / ACK_BLOCK_SIZE);
    while body.has_remaining() {
        let consumer = ConsumerId(body.get_u64());
        let message = MessageId(body.get_u64());
        entries.push(AckEntry::new(consumer, message));
    }
    Ok(entries)
}

/// Encode entries as an ack body
pub fn encode_ack_blocks(entries: &[AckEntry]) -> Bytes {
    let mut buf = BytesMut::with_capacity(entries.len() * ACK_BLOCK_SIZE);
    for entry in entries {
        buf.put_u64(entry.consumer.0);
        buf.put_u64(entry.message.0);
    }
    buf.freeze()
}

/// Extra information carried by DEAD and UNDELIVERABLE acks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadAckInfo {
    pub reason: DeadReason,
    pub comment: Option<String>,
    pub cause: Option<String>,
    /// Only bump the delivery count, keep the message
    pub delivery_count_update_only: bool,
}

impl DeadAckInfo {
    pub fn new(reason: DeadReason) -> Self {
        Self {
            reason,
            comment: None,
            cause: None,
            delivery_count_update_only: false,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn delivery_count_only(mut self) -> Self {
        self.delivery_count_update_only = true;
        self
    }
}

/// A decoded ACK request
#[derive(Debug, Clone)]
pub struct AckRequest {
    pub kind: AckKind,
    pub entries: Vec<AckEntry>,
    pub transaction: Option<TransactionId>,
    /// Probe only: check the acks exist without changing anything
    pub validate: bool,
    pub dead: Option<DeadAckInfo>,
}

impl AckRequest {
    pub fn normal(entries: Vec<AckEntry>) -> Self {
        Self {
            kind: AckKind::Normal,
            entries,
            transaction: None,
            validate: false,
            dead: None,
        }
    }

    pub fn dead(kind: AckKind, entries: Vec<AckEntry>, info: DeadAckInfo) -> Self {
        Self {
            kind,
            entries,
            transaction: None,
            validate: false,
            dead: Some(info),
        }
    }

    pub fn in_transaction(mut self, id: TransactionId) -> Self {
        self.transaction = Some(id);
        self
    }

    pub fn validating(mut self) -> Self {
        self.validate = true;
        self
    }
}

/// Effect of a single acknowledgment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// Fully acknowledged; the caller owns the reference and removes it
    Removable(MessageRef),
    /// Acknowledged, other consumers still hold the message
    Retained,
    /// Recorded against a transaction
    Deferred,
    DeadLettered,
    DeliveryCountUpdated,
    /// Duplicate ack, nothing to do
    AlreadyAcknowledged,
}

/// Totals of a processed request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckSummary {
    pub removed: Vec<MessageId>,
    pub retained: usize,
    pub deferred: usize,
    pub dead_lettered: usize,
    pub delivery_count_updates: usize,
    pub duplicates: usize,
}

/// Applies acknowledgments from consumer sessions
pub struct AckRecorder {
    ctx: Arc<BrokerContext>,
}

impl AckRecorder {
    pub fn new(ctx: Arc<BrokerContext>) -> Self {
        Self { ctx }
    }

    /// Acknowledge one message for one consumer
    ///
    /// `stored` overrides the durable identity; by default it comes from
    /// the consumer registry.
    pub fn acknowledge(
        &self,
        consumer: ConsumerId,
        stored: Option<ConsumerId>,
        message: MessageId,
        kind: AckKind,
        transaction: Option<TransactionId>,
        dead: Option<&DeadAckInfo>,
    ) -> Result<AckOutcome> {
        let handle = self.ctx.consumers().lookup(consumer);
        let stored = stored
            .or_else(|| handle.as_ref().map(|h| h.stored_id))
            .unwrap_or(consumer);

        if kind.is_dead() {
            return self.acknowledge_dead(consumer, stored, message, kind, transaction, dead);
        }

        if let Some(id) = transaction {
            return self.acknowledge_in_transaction(id, consumer, stored, message);
        }

        let Some(handle) = handle else {
            return Err(StreamlineError::ConsumerNotFound(consumer));
        };
        let Some(msg) = self.ctx.store().lookup(message) else {
            if let Some(broker) = handle.remote_broker {
                return Err(RemoteFailure::new(
                    RemoteFailureKind::Gone,
                    broker,
                    format!("message {} no longer exists", message),
                )
                .with_consumers([consumer])
                .into());
            }
            debug!(message_id = %message, consumer_id = %consumer, "Ack for message already gone");
            return Ok(AckOutcome::AlreadyAcknowledged);
        };

        self.ctx.consumers().release_delivered(consumer, message);
        if self.ctx.store().is_acknowledged(message, stored) {
            return Ok(AckOutcome::AlreadyAcknowledged);
        }
        let fully_acked = self.ctx.store().acknowledge(message, stored)?;
        self.ctx.rollback_counts().reset(message, stored);
        if fully_acked {
            Ok(AckOutcome::Removable(msg))
        } else {
            Ok(AckOutcome::Retained)
        }
    }

    fn acknowledge_in_transaction(
        &self,
        id: TransactionId,
        consumer: ConsumerId,
        stored: ConsumerId,
        message: MessageId,
    ) -> Result<AckOutcome> {
        let ack = ConsumedAck::new(message, consumer, stored);
        let result = self.ctx.registry().add_consumed_ack(id, ack).and_then(|inserted| {
            if inserted == AckInsert::Duplicate {
                return Ok(AckOutcome::AlreadyAcknowledged);
            }
            if let Some(msg) = self.ctx.store().lookup(message) {
                if msg.is_remote(self.ctx.local_broker()) {
                    if let Some(owner) = msg.broker {
                        self.ctx.registry().record_remote_ack_broker(id, owner, ack)?;
                    }
                }
            }
            Ok(AckOutcome::Deferred)
        });

        if let Err(e) = &result {
            if self.ctx.registry().contains(id) {
                warn!(
                    transaction_id = %id,
                    message_id = %message,
                    error = %e,
                    "Transactional ack failed, marking transaction FAILED"
                );
                if let Err(fe) = self
                    .ctx
                    .registry()
                    .update_state(id, TransactionStatus::Failed, true)
                {
                    warn!(transaction_id = %id, error = %fe, "Unable to mark transaction FAILED");
                }
            }
        }
        result
    }

    fn acknowledge_dead(
        &self,
        consumer: ConsumerId,
        stored: ConsumerId,
        message: MessageId,
        kind: AckKind,
        transaction: Option<TransactionId>,
        dead: Option<&DeadAckInfo>,
    ) -> Result<AckOutcome> {
        let info = dead.cloned().unwrap_or_else(|| {
            DeadAckInfo::new(if kind == AckKind::Dead {
                DeadReason::Expired
            } else {
                DeadReason::Undeliverable
            })
        });

        let Some(msg) = self.ctx.store().lookup(message) else {
            debug!(message_id = %message, "Dead ack for message already gone");
            return Ok(AckOutcome::AlreadyAcknowledged);
        };

        let delta = if transaction.is_none() { 1 } else { 0 };
        let delivery_count = self
            .ctx
            .store()
            .update_delivery_count(message, stored, delta)?;
        if info.delivery_count_update_only && info.reason == DeadReason::Undeliverable {
            return Ok(AckOutcome::DeliveryCountUpdated);
        }

        self.ctx.consumers().release_delivered(consumer, message);

        let mut context = DlqContext::new(info.reason)
            .with_delivery_count(delivery_count)
            .with_consumer(consumer);
        if let Some(comment) = info.comment {
            context = context.with_comment(comment);
        }
        if let Some(cause) = info.cause {
            context = context.with_cause(cause);
        }
        self.ctx.dead_letters().divert(&msg, context)?;
        self.ctx.rollback_counts().reset_message(message);
        self.ctx.stats().record_dead_lettered();
        Ok(AckOutcome::DeadLettered)
    }

    /// Check that every ack of a transactional request was recorded
    pub fn validate(&self, request: &AckRequest) -> Result<()> {
        if request.kind.is_dead() {
            return Err(StreamlineError::protocol_invalid_field(
                "ack type",
                "validation is not supported for dead acks",
            ));
        }
        let Some(id) = request.transaction else {
            return Err(StreamlineError::protocol_invalid_field(
                "transaction id",
                "validation requires a transaction",
            ));
        };
        for entry in &request.entries {
            if self.ctx.consumers().lookup(entry.consumer).is_none() {
                return Err(StreamlineError::protocol_invalid_field(
                    "consumer id",
                    format!("unknown consumer {}", entry.consumer),
                ));
            }
            if !self
                .ctx
                .registry()
                .has_consumed_ack(id, entry.message, entry.consumer)
            {
                return Err(StreamlineError::MessageNotFound(entry.message));
            }
        }
        Ok(())
    }

    /// Apply every entry of a request and clean up removable messages
    pub fn process(&self, request: &AckRequest) -> Result<AckSummary> {
        if request.validate {
            self.validate(request)?;
            return Ok(AckSummary::default());
        }

        let mut summary = AckSummary::default();
        for entry in &request.entries {
            let outcome = self.acknowledge(
                entry.consumer,
                None,
                entry.message,
                request.kind,
                request.transaction,
                request.dead.as_ref(),
            )?;
            match outcome {
                AckOutcome::Removable(msg) => {
                    match self.ctx.store().remove(msg.id, RemoveReason::Acknowledged) {
                        Ok(_) => {
                            self.ctx.rollback_counts().reset_message(msg.id);
                            summary.removed.push(msg.id);
                        }
                        Err(e) => warn!(
                            message_id = %msg.id,
                            error = %e,
                            "Failed to remove acknowledged message"
                        ),
                    }
                }
                AckOutcome::Retained => summary.retained += 1,
                AckOutcome::Deferred => summary.deferred += 1,
                AckOutcome::DeadLettered => summary.dead_lettered += 1,
                AckOutcome::DeliveryCountUpdated => summary.delivery_count_updates += 1,
                AckOutcome::AlreadyAcknowledged => summary.duplicates += 1,
            }
        }
        Ok(summary)
    }
}
