//! Returning consumed messages to their consumers
//!
//! Used by rollback and by the client's explicit REDELIVER request. A live
//! consumer gets its messages pushed back to the front in delivery order.
//! Without one, queue messages go back on the queue and durable topic
//! messages go back on the subscription; non-durable topic messages are
//! simply dropped with the consumer.

use crate::ack::AckEntry;
use crate::broker::BrokerContext;
use crate::error::Result;
use crate::message::{ConsumerId, MessageRef, OrderedRefs};
use crate::transaction::state::TransactionStatus;
use crate::transaction::TransactionId;

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Redeliver messages whose consumer is not attached to a live session
pub(crate) fn redeliver_without_consumer(
    ctx: &BrokerContext,
    consumer: ConsumerId,
    stored: ConsumerId,
    refs: &[MessageRef],
    set_redelivered: bool,
) -> usize {
    let mut returned = 0;
    let mut durable = Vec::new();

    for msg in refs {
        if msg.destination.is_queue() {
            match ctx.store().requeue(msg, stored, set_redelivered) {
                Ok(()) => returned += 1,
                Err(e) => warn!(
                    message_id = %msg.id,
                    consumer_id = %consumer,
                    error = %e,
                    "Failed to requeue message"
                ),
            }
        } else if stored != consumer {
            durable.push(msg.clone());
        } else {
            debug!(
                message_id = %msg.id,
                consumer_id = %consumer,
                "Dropping message of closed non-durable subscriber"
            );
        }
    }

    if !durable.is_empty() {
        match ctx.consumers().route_to_durable(stored, &durable) {
            Ok(true) => returned += durable.len(),
            Ok(false) => debug!(
                consumer_id = %stored,
                count = durable.len(),
                "Durable subscription no longer exists"
            ),
            Err(e) => warn!(
                consumer_id = %stored,
                error = %e,
                "Failed to route messages to durable subscription"
            ),
        }
    }
    returned
}

/// Explicit request to push delivered-but-unacknowledged messages back
#[derive(Debug, Clone, Default)]
pub struct RedeliverRequest {
    pub entries: Vec<AckEntry>,
    /// Mark the messages as redelivered
    pub set_redelivered: bool,
    /// Transaction the messages were consumed in
    pub transaction: Option<TransactionId>,
}

/// Handles REDELIVER requests from sessions
pub struct Redeliverer {
    ctx: Arc<BrokerContext>,
}

impl Redeliverer {
    pub fn new(ctx: Arc<BrokerContext>) -> Self {
        Self { ctx }
    }

    /// Redeliver the listed messages, returning how many were returned
    pub fn redeliver(&self, request: &RedeliverRequest) -> Result<usize> {
        let failed_txn = request.transaction.filter(|id| {
            self.ctx
                .registry()
                .get_state(*id)
                .is_some_and(|s| s.status == TransactionStatus::Failed)
        });

        let mut grouped: BTreeMap<ConsumerId, OrderedRefs> = BTreeMap::new();
        for entry in &request.entries {
            let Some(msg) = self.ctx.store().lookup(entry.message) else {
                debug!(message_id = %entry.message, "Message for redelivery is gone");
                continue;
            };
            if let Some(id) = failed_txn {
                // Stays with the failed transaction for its rollback
                if self
                    .ctx
                    .registry()
                    .has_consumed_ack(id, entry.message, entry.consumer)
                {
                    continue;
                }
            }
            grouped.entry(entry.consumer).or_default().insert(msg);
        }

        let mut returned = 0;
        for (consumer, refs) in grouped {
            let handle = self.ctx.consumers().lookup(consumer);
            let refs = refs.into_vec();
            match handle {
                Some(handle) if handle.active => {
                    for msg in &refs {
                        if let Err(e) =
                            self.ctx
                                .store()
                                .undeliver(msg.id, handle.stored_id, request.set_redelivered)
                        {
                            warn!(message_id = %msg.id, error = %e, "Failed to undeliver message");
                        }
                    }
                    match self.ctx.consumers().redeliver(consumer, &refs, true) {
                        Ok(true) => returned += refs.len(),
                        Ok(false) | Err(_) => {
                            returned += redeliver_without_consumer(
                                &self.ctx,
                                consumer,
                                handle.stored_id,
                                &refs,
                                request.set_redelivered,
                            );
                        }
                    }
                }
                Some(handle) => {
                    returned += redeliver_without_consumer(
                        &self.ctx,
                        consumer,
                        handle.stored_id,
                        &refs,
                        request.set_redelivered,
                    );
                }
                None => {
                    returned += redeliver_without_consumer(
                        &self.ctx,
                        consumer,
                        consumer,
                        &refs,
                        request.set_redelivered,
                    );
                }
            }
        }

        self.ctx.stats().record_redelivered(returned as usize);
        Ok(returned)
    }
}
