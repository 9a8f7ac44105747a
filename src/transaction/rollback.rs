//! Transaction rollback
//!
//! Rolling back discards produced messages and returns consumed ones:
//! - live consumers get their messages back at the front, in delivery
//!   order, when the client asked for broker-side redelivery
//! - messages of closed or inactive consumers go back through the
//!   no-consumer path (queue, durable subscription or dropped)
//! - messages owned by other brokers are released on those brokers
//!
//! Each rollback counts against the consecutive-rollback limit of every
//! returned message. A message past the limit is either dead-lettered or,
//! without dead-lettering, the rollback is refused before anything changes.

use crate::broker::{BrokerContext, RemoveReason};
use crate::cluster::ClusterOutcome;
use crate::dlq::{DeadReason, DlqContext};
use crate::error::{Result, StreamlineError};
use crate::message::{BrokerAddress, ConsumerId, MessageId, OrderedRefs};
use crate::transaction::log::TransactionLogEntry;
use crate::transaction::redeliver::redeliver_without_consumer;
use crate::transaction::state::{
    ConsumedAck, Operation, RollbackReason, TransactionId, TransactionStatus,
};
use crate::transaction::xa::XaFlags;

#[cfg(feature = "metrics")]
use metrics::counter;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Client-supplied rollback behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackOptions {
    /// Broker pushes consumed messages back to live consumers
    pub redeliver: bool,
    /// Mark returned messages as redelivered
    pub set_redelivered: bool,
    /// Consecutive rollback limit; zero or negative uses the broker setting
    pub max_rollbacks: i32,
    /// Dead-letter messages past the limit instead of refusing the rollback
    pub dead_letter_on_max: bool,
}

impl Default for RollbackOptions {
    fn default() -> Self {
        Self {
            redeliver: false,
            set_redelivered: true,
            max_rollbacks: -1,
            dead_letter_on_max: false,
        }
    }
}

impl RollbackOptions {
    pub fn redelivering() -> Self {
        Self {
            redeliver: true,
            ..Self::default()
        }
    }

    pub fn with_max_rollbacks(mut self, max: i32, dead_letter: bool) -> Self {
        self.max_rollbacks = max;
        self.dead_letter_on_max = dead_letter;
        self
    }

    /// Limit and dead-letter flag in force given the broker's setting
    pub fn effective_limit(&self, config_max: i32) -> (i32, bool) {
        if self.max_rollbacks > 0 {
            (self.max_rollbacks, self.dead_letter_on_max)
        } else {
            (config_max, config_max > 0)
        }
    }
}

/// What a rollback did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackOutcome {
    pub removed_produced: usize,
    /// Messages pushed back to live consumers
    pub redelivered: usize,
    /// Messages returned through the no-consumer path
    pub requeued: usize,
    pub dead_lettered: Vec<MessageId>,
    /// Remote brokers or messages notified
    pub released: usize,
}

struct ConsumerGroup {
    stored: ConsumerId,
    refs: OrderedRefs,
}

/// Drives rollback for transactions of one broker
pub struct RollbackCoordinator {
    ctx: Arc<BrokerContext>,
}

impl RollbackCoordinator {
    pub fn new(ctx: Arc<BrokerContext>) -> Self {
        Self { ctx }
    }

    pub async fn rollback(
        &self,
        id: TransactionId,
        flags: Option<XaFlags>,
        reason: RollbackReason,
        options: RollbackOptions,
    ) -> Result<RollbackOutcome> {
        let registry = self.ctx.registry();
        let mut state = registry.retrieve_state(id)?;

        // An XA branch that was never ended is force-ended to FAILED, but
        // only once the rollback is known to go ahead
        let force_end = state.is_xa() && state.status == TransactionStatus::Started;
        if force_end {
            state.set_status(TransactionStatus::Failed, false);
        }
        state.next_state(Operation::Rollback, flags)?;

        let was_prepared = state.status == TransactionStatus::Prepared;
        let was_cluster = registry.is_cluster_transaction(id);
        let work = registry.transaction_work(id)?;
        let remote = self.ctx.remote_acks(id, &work)?;

        let groups = self.group_local_acks(&work.acks, &remote);
        let (max, dead_letter) =
            options.effective_limit(self.ctx.config().max_consecutive_rollbacks);

        if options.redeliver && max > 0 && !dead_letter {
            self.check_rollback_limit(&groups, max)?;
        }

        if force_end {
            warn!(
                transaction_id = %id,
                %reason,
                "Rolling back XA transaction that was never ended, marking FAILED"
            );
            registry.update_state(id, TransactionStatus::Failed, true)?;
        }

        if was_prepared {
            self.ctx.log().append(&TransactionLogEntry::Completed {
                id,
                status: TransactionStatus::RolledBack,
            })?;
        } else {
            self.ctx
                .log()
                .append(&TransactionLogEntry::RolledBack { id })?;
        }
        registry.update_state(id, TransactionStatus::RolledBack, false)?;

        let mut outcome = RollbackOutcome::default();
        let destinations = self.ctx.destination_use().await;
        for msg in &work.sent {
            match self.ctx.store().remove(msg.id, RemoveReason::Rollback) {
                Ok(true) => outcome.removed_produced += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    transaction_id = %id,
                    message_id = %msg.id,
                    error = %e,
                    "Failed to remove rolled back message"
                ),
            }
        }
        for (consumer, group) in groups {
            self.return_consumed(id, consumer, group, &options, max, dead_letter, &mut outcome);
        }
        drop(destinations);

        outcome.released = self
            .notify_remote(id, reason, was_cluster, &remote)
            .await;

        registry.remove(id, false)?;

        self.ctx.stats().record_rollback();
        self.ctx
            .stats()
            .record_redelivered((outcome.redelivered + outcome.requeued) as usize);
        #[cfg(feature = "metrics")]
        counter!("streamline_txn_rollbacks_total").increment(1);

        match reason {
            RollbackReason::Application => debug!(
                transaction_id = %id,
                redelivered = outcome.redelivered,
                requeued = outcome.requeued,
                "Transaction rolled back"
            ),
            RollbackReason::Admin => warn!(
                transaction_id = %id,
                redelivered = outcome.redelivered,
                requeued = outcome.requeued,
                "Transaction rolled back by administrator"
            ),
            RollbackReason::ConnectionCleanup | RollbackReason::TakeoverCleanup => info!(
                transaction_id = %id,
                %reason,
                requeued = outcome.requeued,
                "Transaction rolled back during cleanup"
            ),
        }
        Ok(outcome)
    }

    /// Local consumed references per consumer, in delivery order
    fn group_local_acks(
        &self,
        acks: &[ConsumedAck],
        remote: &BTreeMap<BrokerAddress, Vec<ConsumedAck>>,
    ) -> BTreeMap<ConsumerId, ConsumerGroup> {
        let mut groups: BTreeMap<ConsumerId, ConsumerGroup> = BTreeMap::new();
        for ack in acks {
            if remote.values().any(|r| r.contains(ack)) {
                continue;
            }
            let Some(msg) = self.ctx.store().lookup(ack.message) else {
                debug!(message_id = %ack.message, "Consumed message already gone");
                continue;
            };
            if msg.overridden {
                continue;
            }
            groups
                .entry(ack.consumer)
                .or_insert_with(|| ConsumerGroup {
                    stored: ack.stored_consumer,
                    refs: OrderedRefs::new(),
                })
                .refs
                .insert(msg);
        }
        groups
    }

    fn is_active(&self, consumer: ConsumerId) -> bool {
        self.ctx
            .consumers()
            .lookup(consumer)
            .is_some_and(|c| c.active)
    }

    fn check_rollback_limit(&self, groups: &BTreeMap<ConsumerId, ConsumerGroup>, max: i32) -> Result<()> {
        for (consumer, group) in groups {
            if !self.is_active(*consumer) {
                continue;
            }
            for msg in group.refs.iter() {
                let count = self.ctx.rollback_counts().get(msg.id, group.stored);
                if i64::from(count) + 1 > i64::from(max) {
                    return Err(StreamlineError::MaxRollbacksExceeded {
                        message: msg.id,
                        consumer: *consumer,
                        max,
                    });
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn return_consumed(
        &self,
        id: TransactionId,
        consumer: ConsumerId,
        mut group: ConsumerGroup,
        options: &RollbackOptions,
        max: i32,
        dead_letter: bool,
        outcome: &mut RollbackOutcome,
    ) {
        if !self.is_active(consumer) {
            let refs = group.refs.into_vec();
            outcome.requeued += redeliver_without_consumer(
                &self.ctx,
                consumer,
                group.stored,
                &refs,
                options.set_redelivered,
            );
            return;
        }
        if !options.redeliver {
            // The client session redelivers to its own consumers
            return;
        }

        let stored = group.stored;
        let candidates: Vec<_> = group.refs.iter().cloned().collect();
        for msg in &candidates {
            if let Err(e) = self
                .ctx
                .store()
                .undeliver(msg.id, stored, options.set_redelivered)
            {
                warn!(
                    transaction_id = %id,
                    message_id = %msg.id,
                    error = %e,
                    "Failed to undeliver message"
                );
            }
            if max <= 0 {
                continue;
            }
            let count = self.ctx.rollback_counts().increment(msg.id, stored);
            if !dead_letter || i64::from(count) <= i64::from(max) {
                continue;
            }
            let context = DlqContext::new(DeadReason::RollbackLimit)
                .with_rollback_count(count)
                .with_consumer(consumer)
                .with_comment(format!("exceeded {} consecutive rollbacks", max));
            match self.ctx.dead_letters().divert(msg, context) {
                Ok(_) => {
                    group.refs.remove(msg.id);
                    self.ctx.rollback_counts().reset_message(msg.id);
                    self.ctx.stats().record_dead_lettered();
                    outcome.dead_lettered.push(msg.id);
                }
                Err(e) => warn!(
                    transaction_id = %id,
                    message_id = %msg.id,
                    error = %e,
                    "Failed to dead-letter message past rollback limit"
                ),
            }
        }

        if group.refs.is_empty() {
            return;
        }
        let refs = group.refs.into_vec();
        match self.ctx.consumers().redeliver(consumer, &refs, true) {
            Ok(true) => outcome.redelivered += refs.len(),
            Ok(false) => {
                outcome.requeued += redeliver_without_consumer(
                    &self.ctx,
                    consumer,
                    stored,
                    &refs,
                    options.set_redelivered,
                );
            }
            Err(e) => {
                warn!(
                    transaction_id = %id,
                    consumer_id = %consumer,
                    error = %e,
                    "Redelivery to consumer failed, returning messages"
                );
                outcome.requeued += redeliver_without_consumer(
                    &self.ctx,
                    consumer,
                    stored,
                    &refs,
                    options.set_redelivered,
                );
            }
        }
    }

    /// Tell owning brokers about the rollback; failures are logged only
    async fn notify_remote(
        &self,
        id: TransactionId,
        reason: RollbackReason,
        was_cluster: bool,
        remote: &BTreeMap<BrokerAddress, Vec<ConsumedAck>>,
    ) -> usize {
        let mut released = 0;

        if was_cluster || reason.forces_remote_notify() {
            let mut brokers: BTreeMap<BrokerAddress, &[ConsumedAck]> = remote
                .iter()
                .map(|(b, acks)| (b.clone(), acks.as_slice()))
                .collect();
            for participant in self.ctx.registry().cluster_brokers(id).unwrap_or_default() {
                if !participant.completed {
                    brokers.entry(participant.broker).or_insert(&[]);
                }
            }
            for (broker, acks) in brokers {
                match self
                    .ctx
                    .cluster()
                    .outcome(&broker, id, ClusterOutcome::RolledBack, acks)
                    .await
                {
                    Ok(()) => {
                        self.ctx.registry().mark_broker_completed(id, &broker);
                        released += 1;
                    }
                    Err(e) => {
                        self.ctx.stats().record_remote_failure();
                        warn!(
                            transaction_id = %id,
                            broker = %broker,
                            error = %e,
                            "Failed to notify broker of rollback"
                        );
                    }
                }
            }
            return released;
        }

        for (broker, acks) in remote {
            for ack in acks {
                let claimed_by_other = self
                    .ctx
                    .store()
                    .lookup(ack.message)
                    .and_then(|m| m.last_remote_consumer)
                    .is_some_and(|last| last != ack.consumer);
                if claimed_by_other {
                    debug!(
                        transaction_id = %id,
                        message_id = %ack.message,
                        "Message claimed by another remote consumer, not releasing"
                    );
                    continue;
                }
                match self
                    .ctx
                    .cluster()
                    .release(broker, Some(id), ack.message, ack.consumer)
                    .await
                {
                    Ok(()) => released += 1,
                    Err(e) => {
                        self.ctx.stats().record_remote_failure();
                        warn!(
                            transaction_id = %id,
                            broker = %broker,
                            message_id = %ack.message,
                            error = %e,
                            "Failed to release remote message"
                        );
                    }
                }
            }
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ConsumerHandle;
    use crate::error::Status;
    use crate::message::{DestinationId, MessageRef};
    use crate::testing::TestBroker;

    fn coordinator(broker: &TestBroker) -> RollbackCoordinator {
        RollbackCoordinator::new(broker.ctx.clone())
    }

    #[tokio::test]
    async fn test_rollback_redelivers_to_live_consumer() {
        let broker = TestBroker::new();
        broker.consumers.register(ConsumerHandle::new(ConsumerId(1)));
        let id = broker.begin();
        broker.produce(id, MessageRef::new(MessageId(10), DestinationId::queue("out")));
        broker.consume(id, MessageRef::new(MessageId(1), DestinationId::queue("q")), ConsumerId(1));
        broker.consume(
            id,
            MessageRef::new(MessageId(2), DestinationId::queue("q")).with_priority(9),
            ConsumerId(1),
        );

        let outcome = coordinator(&broker)
            .rollback(id, None, RollbackReason::Application, RollbackOptions::redelivering())
            .await
            .unwrap();

        assert_eq!(outcome.removed_produced, 1);
        assert_eq!(outcome.redelivered, 2);
        assert_eq!(
            broker.consumers.redelivered_to(ConsumerId(1)),
            vec![MessageId(2), MessageId(1)]
        );
        assert_eq!(
            broker.ctx.registry().resolved(id),
            Some(TransactionStatus::RolledBack)
        );
    }

    #[tokio::test]
    async fn test_rollback_without_redeliver_leaves_live_consumers_alone() {
        let broker = TestBroker::new();
        broker.consumers.register(ConsumerHandle::new(ConsumerId(1)));
        broker
            .consumers
            .register(ConsumerHandle::new(ConsumerId(2)).inactive());
        let id = broker.begin();
        broker.consume(id, MessageRef::new(MessageId(1), DestinationId::queue("q")), ConsumerId(1));
        broker.consume(id, MessageRef::new(MessageId(2), DestinationId::queue("q")), ConsumerId(2));

        let outcome = coordinator(&broker)
            .rollback(id, None, RollbackReason::Application, RollbackOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.redelivered, 0);
        assert_eq!(outcome.requeued, 1);
        assert!(broker.consumers.redelivered_to(ConsumerId(1)).is_empty());
        assert_eq!(broker.store.requeued(), vec![MessageId(2)]);
    }

    #[tokio::test]
    async fn test_rollback_limit_refused_without_dead_letter() {
        let broker = TestBroker::new();
        broker.consumers.register(ConsumerHandle::new(ConsumerId(1)));
        let options = RollbackOptions::redelivering().with_max_rollbacks(1, false);

        let first = broker.begin();
        broker.consume(first, MessageRef::new(MessageId(1), DestinationId::queue("q")), ConsumerId(1));
        coordinator(&broker)
            .rollback(first, None, RollbackReason::Application, options)
            .await
            .unwrap();
        assert_eq!(broker.ctx.rollback_counts().get(MessageId(1), ConsumerId(1)), 1);

        let second = broker.begin();
        broker.consume_existing(second, MessageId(1), ConsumerId(1));
        let err = coordinator(&broker)
            .rollback(second, None, RollbackReason::Application, options)
            .await
            .unwrap_err();
        assert!(matches!(err, StreamlineError::MaxRollbacksExceeded { max: 1, .. }));
        assert_eq!(err.status(), Status::Error);
        // nothing changed
        assert!(broker.ctx.registry().contains(second));
        assert_eq!(broker.ctx.rollback_counts().get(MessageId(1), ConsumerId(1)), 1);
    }

    #[tokio::test]
    async fn test_refused_rollback_leaves_unended_xa_branch_started() {
        let broker = TestBroker::new();
        broker.consumers.register(ConsumerHandle::new(ConsumerId(1)));
        broker
            .store
            .insert(MessageRef::new(MessageId(1), DestinationId::queue("q")));
        broker.ctx.rollback_counts().increment(MessageId(1), ConsumerId(1));

        let id = broker.ctx.next_transaction_id();
        let xid = crate::transaction::Xid::new(7, b"gtrid", b"bq").unwrap();
        broker
            .ctx
            .registry()
            .create(
                id,
                crate::transaction::TransactionState::new(Default::default(), Some(xid))
                    .with_status(TransactionStatus::Started),
            )
            .unwrap();
        broker.consume_existing(id, MessageId(1), ConsumerId(1));

        let err = coordinator(&broker)
            .rollback(
                id,
                None,
                RollbackReason::Application,
                RollbackOptions::redelivering().with_max_rollbacks(1, false),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StreamlineError::MaxRollbacksExceeded { .. }));
        assert_eq!(
            broker.ctx.registry().retrieve_state(id).unwrap().status,
            TransactionStatus::Started
        );
    }

    #[tokio::test]
    async fn test_rollback_limit_dead_letters() {
        let broker = TestBroker::new();
        broker.consumers.register(ConsumerHandle::new(ConsumerId(1)));
        let options = RollbackOptions::redelivering().with_max_rollbacks(1, true);

        let first = broker.begin();
        broker.consume(first, MessageRef::new(MessageId(1), DestinationId::queue("q")), ConsumerId(1));
        coordinator(&broker)
            .rollback(first, None, RollbackReason::Application, options)
            .await
            .unwrap();

        let second = broker.begin();
        broker.consume_existing(second, MessageId(1), ConsumerId(1));
        let outcome = coordinator(&broker)
            .rollback(second, None, RollbackReason::Application, options)
            .await
            .unwrap();

        assert_eq!(outcome.dead_lettered, vec![MessageId(1)]);
        assert_eq!(outcome.redelivered, 0);
        assert_eq!(broker.store.dead_letters().len(), 1);
        assert_eq!(broker.ctx.rollback_counts().get(MessageId(1), ConsumerId(1)), 0);
        assert_eq!(broker.ctx.stats().get_stats().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_rollback_releases_remote_messages() {
        let broker = TestBroker::new();
        let remote = BrokerAddress::new("b:7676");
        let id = broker.begin();
        broker.consume(
            id,
            MessageRef::new(MessageId(1), DestinationId::queue("q")).with_broker(remote.clone()),
            ConsumerId(1),
        );
        broker.consume(
            id,
            MessageRef::new(MessageId(2), DestinationId::queue("q"))
                .with_broker(remote.clone())
                .with_last_remote_consumer(ConsumerId(99)),
            ConsumerId(1),
        );

        let outcome = coordinator(&broker)
            .rollback(id, None, RollbackReason::Application, RollbackOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.released, 1);
        assert_eq!(broker.notifier.releases_to(&remote), vec![MessageId(1)]);
    }

    #[tokio::test]
    async fn test_admin_rollback_notifies_brokers() {
        let broker = TestBroker::new();
        let remote = BrokerAddress::new("b:7676");
        let id = broker.begin();
        broker.consume(
            id,
            MessageRef::new(MessageId(1), DestinationId::queue("q")).with_broker(remote.clone()),
            ConsumerId(1),
        );

        coordinator(&broker)
            .rollback(id, None, RollbackReason::Admin, RollbackOptions::default())
            .await
            .unwrap();
        assert_eq!(broker.notifier.outcomes_to(&remote, ClusterOutcome::RolledBack), 1);
        assert!(broker.notifier.releases_to(&remote).is_empty());
    }
}
