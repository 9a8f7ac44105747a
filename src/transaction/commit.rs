//! Prepare and commit
//!
//! A transaction whose consumed messages all live in this broker's store
//! commits in one phase: the full work is logged as `Committed` and the
//! side effects run. When some consumed messages are owned by other
//! brokers, those brokers must durably record the acknowledgments first,
//! so the transaction is logged as a cluster transaction in PREPARED,
//! every participant is asked to prepare, and only then is the commit
//! completed locally and the participants told the outcome.
//!
//! Side-effect failures follow a fixed policy:
//! - a produced message that cannot be routed is logged and skipped
//! - a consumed acknowledgment that fails is logged, the rest still run and
//!   the commit is reported incomplete
//! - a transaction log failure aborts before any side effect

use crate::broker::{BrokerContext, RemoveReason};
use crate::cluster::ClusterOutcome;
use crate::error::{RemoteFailureKind, Result, StreamlineError};
use crate::message::{BrokerAddress, MessageId};
use crate::transaction::log::TransactionLogEntry;
use crate::transaction::state::{
    now_ms, BaseTransaction, ConsumedAck, Operation, TransactionBroker, TransactionId,
    TransactionStatus, TransactionWork,
};
use crate::transaction::xa::XaFlags;

#[cfg(feature = "metrics")]
use metrics::counter;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Result of a prepare
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareOutcome {
    pub status: TransactionStatus,
    /// Remote brokers that prepared; empty for a broker-local transaction
    pub participants: Vec<BrokerAddress>,
}

impl PrepareOutcome {
    pub fn is_cluster(&self) -> bool {
        !self.participants.is_empty()
    }
}

/// Result of a commit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Committed through a PREPARED state
    pub two_phase: bool,
    /// Produced messages handed to their destinations
    pub routed: usize,
    /// Consumed acknowledgments applied
    pub acknowledged: usize,
    /// Messages removed after their last acknowledgment
    pub removed: Vec<MessageId>,
    /// False when some acknowledgment failed
    pub complete: bool,
    /// Participants that received the committed notification
    pub notified: Vec<BrokerAddress>,
}

/// Drives prepare and commit for transactions of one broker
pub struct CommitCoordinator {
    ctx: Arc<BrokerContext>,
}

impl CommitCoordinator {
    pub fn new(ctx: Arc<BrokerContext>) -> Self {
        Self { ctx }
    }

    /// Explicit PREPARE from the client
    pub async fn prepare(
        &self,
        id: TransactionId,
        flags: Option<XaFlags>,
        one_phase: bool,
    ) -> Result<PrepareOutcome> {
        let state = self.ctx.registry().retrieve_state(id)?;
        state.next_state(Operation::Prepare, flags)?;
        self.do_prepare(id, one_phase, true).await
    }

    /// Move a transaction to PREPARED, running the cluster prepare when
    /// remote brokers own some of its consumed messages
    ///
    /// With `log_local` a broker-local transaction is logged as prepared
    /// with its work; otherwise it is left untouched for the one-phase
    /// commit to log.
    async fn do_prepare(
        &self,
        id: TransactionId,
        one_phase: bool,
        log_local: bool,
    ) -> Result<PrepareOutcome> {
        let result = self.try_prepare(id, one_phase, log_local).await;
        if result.is_err() {
            self.fail_unless_prepared(id);
        }
        result
    }

    async fn try_prepare(
        &self,
        id: TransactionId,
        one_phase: bool,
        log_local: bool,
    ) -> Result<PrepareOutcome> {
        let registry = self.ctx.registry();
        let mut state = registry.retrieve_state(id)?;
        let work = registry.transaction_work(id)?;
        let remote = self.ctx.remote_acks(id, &work)?;

        state.set_status(TransactionStatus::Prepared, one_phase);

        if remote.is_empty() {
            if !log_local {
                return Ok(PrepareOutcome {
                    status: registry.retrieve_state(id)?.status,
                    participants: Vec::new(),
                });
            }
            self.ctx.log().append(&TransactionLogEntry::Prepared {
                transaction: BaseTransaction::Local {
                    id,
                    state,
                    work,
                },
            })?;
            registry.mark_prepared(id, one_phase, false)?;
            debug!(transaction_id = %id, "Transaction prepared");
            return Ok(PrepareOutcome {
                status: TransactionStatus::Prepared,
                participants: Vec::new(),
            });
        }

        let participants: Vec<TransactionBroker> =
            remote.keys().cloned().map(TransactionBroker::new).collect();
        self.ctx.log().append(&TransactionLogEntry::Prepared {
            transaction: BaseTransaction::Cluster {
                id,
                state,
                work,
                participants: participants.clone(),
            },
        })?;
        registry.set_cluster_brokers(id, participants)?;

        info!(
            transaction_id = %id,
            brokers = remote.len(),
            one_phase,
            "Preparing cluster transaction"
        );

        for (broker, acks) in &remote {
            if let Err(e) = self.ctx.cluster().prepare(broker, id, acks).await {
                self.ctx.stats().record_remote_failure();
                return Err(self.handle_prepare_failure(id, broker, acks, e));
            }
        }

        registry.mark_prepared(id, one_phase, false)?;
        self.ctx.stats().record_cluster_prepare();

        Ok(PrepareOutcome {
            status: TransactionStatus::Prepared,
            participants: remote.into_keys().collect(),
        })
    }

    /// Force FAILED and retract the acknowledgments a failed participant
    /// can no longer honor
    fn handle_prepare_failure(
        &self,
        id: TransactionId,
        broker: &BrokerAddress,
        acks: &[ConsumedAck],
        err: StreamlineError,
    ) -> StreamlineError {
        let failure = match err {
            StreamlineError::Remote(failure)
                if matches!(
                    failure.kind,
                    RemoteFailureKind::BrokerDown | RemoteFailureKind::AckNotFound
                ) =>
            {
                failure
            }
            other => {
                warn!(
                    transaction_id = %id,
                    broker = %broker,
                    error = %other,
                    "Preparing transaction failed"
                );
                return other;
            }
        };

        // Durable subscribers must be recreated to pick up the messages again
        let recreate: Vec<_> = acks
            .iter()
            .filter(|a| a.stored_consumer != a.consumer)
            .map(|a| a.consumer)
            .collect();
        for consumer in &recreate {
            self.ctx.consumers().request_recreation(*consumer);
        }

        if let Err(e) = self
            .ctx
            .registry()
            .update_state(id, TransactionStatus::Failed, true)
        {
            warn!(
                transaction_id = %id,
                broker = %broker,
                error = %e,
                "Unable to mark transaction FAILED after prepare failure"
            );
            return StreamlineError::Remote(failure.with_consumers(recreate));
        }

        let retract: Vec<&ConsumedAck> = match failure.kind {
            RemoteFailureKind::AckNotFound if !failure.consumers.is_empty() => acks
                .iter()
                .filter(|a| failure.consumers.contains(&a.consumer))
                .collect(),
            RemoteFailureKind::AckNotFound => acks.iter().collect(),
            _ => acks
                .iter()
                .filter(|a| a.stored_consumer != a.consumer)
                .collect(),
        };
        for ack in retract {
            self.ctx
                .registry()
                .remove_consumed_ack(id, ack.message, ack.consumer);
        }

        warn!(
            transaction_id = %id,
            broker = %broker,
            error = %failure,
            "Preparing transaction failed"
        );
        StreamlineError::Remote(failure.with_consumers(recreate))
    }

    fn fail_unless_prepared(&self, id: TransactionId) {
        let registry = self.ctx.registry();
        let Some(state) = registry.get_state(id) else {
            return;
        };
        if matches!(
            state.status,
            TransactionStatus::Prepared | TransactionStatus::Failed
        ) {
            return;
        }
        if let Err(e) = registry.update_state(id, TransactionStatus::Failed, true) {
            warn!(transaction_id = %id, error = %e, "Failed to log FAILED state, updating in memory");
            if let Err(e) = registry.update_state(id, TransactionStatus::Failed, false) {
                warn!(transaction_id = %id, error = %e, "Unable to mark transaction FAILED");
            }
        }
    }

    /// Commit a transaction
    pub async fn commit(
        &self,
        id: TransactionId,
        flags: Option<XaFlags>,
        one_phase: bool,
    ) -> Result<CommitOutcome> {
        let registry = self.ctx.registry();
        let state = registry.retrieve_state(id)?;
        let flags = if one_phase {
            Some(flags.unwrap_or_default() | XaFlags::ONEPHASE)
        } else {
            flags
        };
        state.next_state(Operation::Commit, flags)?;
        if state.status == TransactionStatus::Committed {
            return self.redrive(id).await;
        }

        let mut two_phase = state.status == TransactionStatus::Prepared;
        if !two_phase {
            let work = registry.transaction_work(id)?;
            if !self.ctx.remote_acks(id, &work)?.is_empty() {
                if state.status == TransactionStatus::Started {
                    registry.update_state(id, TransactionStatus::Complete, false)?;
                }
                self.do_prepare(id, true, false).await?;
                two_phase = true;
            }
        }

        let work = registry.transaction_work(id)?;
        let remote = self.ctx.remote_acks(id, &work)?;

        if two_phase {
            self.ctx.log().append(&TransactionLogEntry::Completed {
                id,
                status: TransactionStatus::Committed,
            })?;
        } else {
            let mut transaction = registry.base_transaction(id)?;
            transaction
                .state_mut()
                .set_status(TransactionStatus::Committed, false);
            self.ctx
                .log()
                .append(&TransactionLogEntry::Committed { transaction })?;
        }
        registry.update_state(id, TransactionStatus::Committed, false)?;

        self.finish(id, &work, &remote, two_phase).await
    }

    /// Finish a transaction whose commit record is already durable
    ///
    /// Used for transactions restored in COMMITTED by recovery and for a
    /// client repeating COMMIT on one of them.
    pub async fn redrive(&self, id: TransactionId) -> Result<CommitOutcome> {
        let registry = self.ctx.registry();
        let state = registry.retrieve_state(id)?;
        if state.status != TransactionStatus::Committed {
            return Err(StreamlineError::Conflict(format!(
                "Transaction {} is {}, not committed",
                id, state.status
            )));
        }
        let work = registry.transaction_work(id)?;
        let remote = self.ctx.remote_acks(id, &work)?;
        let two_phase = registry.is_cluster_transaction(id);
        info!(
            transaction_id = %id,
            two_phase,
            sent = work.sent.len(),
            acks = work.acks.len(),
            "Completing committed transaction"
        );
        self.finish(id, &work, &remote, two_phase).await
    }

    /// Apply side effects, tell participants the outcome, drop the entry
    async fn finish(
        &self,
        id: TransactionId,
        work: &TransactionWork,
        remote: &BTreeMap<BrokerAddress, Vec<ConsumedAck>>,
        two_phase: bool,
    ) -> Result<CommitOutcome> {
        let registry = self.ctx.registry();
        let mut outcome = {
            let _destinations = self.ctx.destination_use().await;
            self.apply_commit(id, work, remote)
        };
        outcome.two_phase = two_phase;

        if let Some(brokers) = registry.cluster_brokers(id) {
            for participant in brokers.iter().filter(|b| !b.completed) {
                let acks = remote
                    .get(&participant.broker)
                    .map(Vec::as_slice)
                    .unwrap_or(&[]);
                match self
                    .ctx
                    .cluster()
                    .outcome(&participant.broker, id, ClusterOutcome::Committed, acks)
                    .await
                {
                    Ok(()) => {
                        registry.mark_broker_completed(id, &participant.broker);
                        outcome.notified.push(participant.broker.clone());
                    }
                    Err(e) => {
                        self.ctx.stats().record_remote_failure();
                        warn!(
                            transaction_id = %id,
                            broker = %participant.broker,
                            error = %e,
                            "Failed to notify broker of commit"
                        );
                    }
                }
            }
        }

        registry.remove(id, !outcome.complete)?;

        self.ctx.stats().record_commit(outcome.complete);
        #[cfg(feature = "metrics")]
        counter!("streamline_txn_commits_total").increment(1);

        if outcome.complete {
            debug!(
                transaction_id = %id,
                two_phase,
                routed = outcome.routed,
                acknowledged = outcome.acknowledged,
                "Transaction committed"
            );
        } else {
            warn!(
                transaction_id = %id,
                routed = outcome.routed,
                acknowledged = outcome.acknowledged,
                "Transaction committed with failed acknowledgments"
            );
        }
        Ok(outcome)
    }

    /// Route produced messages and apply consumed acknowledgments
    fn apply_commit(
        &self,
        id: TransactionId,
        work: &TransactionWork,
        remote: &BTreeMap<BrokerAddress, Vec<ConsumedAck>>,
    ) -> CommitOutcome {
        let store = self.ctx.store();
        let consumers = self.ctx.consumers();
        let mut outcome = CommitOutcome {
            complete: true,
            ..CommitOutcome::default()
        };


        for sent in &work.sent {
            let Some(msg) = store.lookup(sent.id) else {
                warn!(
                    transaction_id = %id,
                    message_id = %sent.id,
                    "Produced message no longer exists, skipping"
                );
                continue;
            };
            let routed = match msg.delivery_time {
                Some(at) if at > now_ms() => store.route_delayed(&msg, at),
                _ => store.route(&msg),
            };
            match routed {
                Ok(()) => outcome.routed += 1,
                Err(e) => warn!(
                    transaction_id = %id,
                    message_id = %msg.id,
                    destination = %msg.destination,
                    error = %e,
                    "Failed to route committed message"
                ),
            }
        }

        for ack in &work.acks {
            if remote.values().any(|acks| acks.contains(ack)) {
                // Owning broker applies the ack on the committed notification
                consumers.release_delivered(ack.consumer, ack.message);
                continue;
            }

            let stored = ack.stored_consumer;
            if consumers
                .lookup(ack.consumer)
                .is_some_and(|c| c.session.is_some())
            {
                consumers.release_delivered(ack.consumer, ack.message);
            }

            match store.acknowledge(ack.message, stored) {
                Ok(fully_acked) => {
                    outcome.acknowledged += 1;
                    self.ctx.rollback_counts().reset(ack.message, stored);
                    if fully_acked {
                        match store.remove(ack.message, RemoveReason::Acknowledged) {
                            Ok(_) => {
                                self.ctx.rollback_counts().reset_message(ack.message);
                                outcome.removed.push(ack.message);
                            }
                            Err(e) => {
                                outcome.complete = false;
                                error!(
                                    transaction_id = %id,
                                    message_id = %ack.message,
                                    error = %e,
                                    "Failed to remove acknowledged message"
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    outcome.complete = false;
                    error!(
                        transaction_id = %id,
                        message_id = %ack.message,
                        consumer_id = %ack.consumer,
                        error = %e,
                        "Failed to acknowledge committed message"
                    );
                }
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RemoteFailure, Status};
    use crate::message::{ConsumerId, DestinationId, MessageRef};
    use crate::testing::TestBroker;
    use crate::transaction::TransactionState;

    fn started(broker: &TestBroker) -> TransactionId {
        let id = broker.ctx.next_transaction_id();
        broker
            .ctx
            .registry()
            .create(id, TransactionState::local().with_status(TransactionStatus::Started))
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_local_commit_routes_and_acks() {
        let broker = TestBroker::new();
        let id = started(&broker);

        let produced = MessageRef::new(MessageId(1), DestinationId::queue("out"));
        broker.store.insert(produced.clone());
        broker.ctx.registry().add_produced_message(id, produced).unwrap();

        broker
            .store
            .insert(MessageRef::new(MessageId(2), DestinationId::queue("in")));
        broker.store.deliver(MessageId(2), ConsumerId(7));
        broker
            .ctx
            .registry()
            .add_consumed_ack(id, ConsumedAck::new(MessageId(2), ConsumerId(7), ConsumerId(7)))
            .unwrap();

        let coordinator = CommitCoordinator::new(broker.ctx.clone());
        let outcome = coordinator.commit(id, None, false).await.unwrap();

        assert!(!outcome.two_phase);
        assert!(outcome.complete);
        assert_eq!(outcome.routed, 1);
        assert_eq!(outcome.removed, vec![MessageId(2)]);
        assert_eq!(broker.store.routed(), vec![MessageId(1)]);
        assert!(!broker.ctx.registry().contains(id));

        let err = coordinator.commit(id, None, false).await.unwrap_err();
        assert_eq!(err.status(), Status::NotFound);
    }

    #[tokio::test]
    async fn test_commit_of_committed_transaction_finishes_it() {
        let broker = TestBroker::new();
        let id = started(&broker);
        let produced = MessageRef::new(MessageId(100), DestinationId::queue("out"));
        broker.store.insert(produced.clone());
        broker.ctx.registry().add_produced_message(id, produced).unwrap();
        broker
            .ctx
            .registry()
            .update_state(id, TransactionStatus::Committed, false)
            .unwrap();

        let coordinator = CommitCoordinator::new(broker.ctx.clone());
        let outcome = coordinator.commit(id, None, false).await.unwrap();
        assert_eq!(outcome.routed, 1);
        assert_eq!(broker.store.routed(), vec![MessageId(100)]);
        assert!(!broker.ctx.registry().contains(id));
    }

    #[tokio::test]
    async fn test_commit_waits_for_destination_change() {
        let broker = TestBroker::new();
        let id = started(&broker);
        let produced = MessageRef::new(MessageId(1), DestinationId::queue("out"));
        broker.store.insert(produced.clone());
        broker.ctx.registry().add_produced_message(id, produced).unwrap();

        let change = broker.ctx.destination_change().await;
        let coordinator = CommitCoordinator::new(broker.ctx.clone());
        let task = tokio::spawn(async move { coordinator.commit(id, None, false).await });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(broker.store.routed().is_empty());

        drop(change);
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.routed, 1);
        assert_eq!(broker.store.routed(), vec![MessageId(1)]);
    }

    #[tokio::test]
    async fn test_redrive_refuses_uncommitted_transaction() {
        let broker = TestBroker::new();
        let id = started(&broker);
        let err = CommitCoordinator::new(broker.ctx.clone())
            .redrive(id)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Status::Conflict);
        assert!(broker.ctx.registry().contains(id));
    }

    #[tokio::test]
    async fn test_missing_produced_message_is_skipped() {
        let broker = TestBroker::new();
        let id = started(&broker);
        broker
            .ctx
            .registry()
            .add_produced_message(id, MessageRef::new(MessageId(1), DestinationId::queue("out")))
            .unwrap();

        let outcome = CommitCoordinator::new(broker.ctx.clone())
            .commit(id, None, false)
            .await
            .unwrap();
        assert_eq!(outcome.routed, 0);
        assert!(outcome.complete);
    }

    #[tokio::test]
    async fn test_failed_ack_marks_commit_incomplete() {
        let broker = TestBroker::new();
        let id = started(&broker);
        // message 3 is not in the store, so its acknowledgment fails
        broker
            .ctx
            .registry()
            .add_consumed_ack(id, ConsumedAck::new(MessageId(3), ConsumerId(7), ConsumerId(7)))
            .unwrap();
        broker
            .store
            .insert(MessageRef::new(MessageId(4), DestinationId::queue("in")));
        broker.store.deliver(MessageId(4), ConsumerId(7));
        broker
            .ctx
            .registry()
            .add_consumed_ack(id, ConsumedAck::new(MessageId(4), ConsumerId(7), ConsumerId(7)))
            .unwrap();

        let outcome = CommitCoordinator::new(broker.ctx.clone())
            .commit(id, None, false)
            .await
            .unwrap();
        assert!(!outcome.complete);
        assert_eq!(outcome.acknowledged, 1);
        assert!(!broker.ctx.registry().contains(id));
        assert_eq!(broker.ctx.stats().get_stats().incomplete_commits, 1);
    }

    #[tokio::test]
    async fn test_cluster_commit_prepares_then_commits() {
        let broker = TestBroker::new();
        let id = started(&broker);
        let remote = BrokerAddress::new("b:7676");
        broker.store.insert(
            MessageRef::new(MessageId(5), DestinationId::queue("in")).with_broker(remote.clone()),
        );
        broker
            .ctx
            .registry()
            .add_consumed_ack(id, ConsumedAck::new(MessageId(5), ConsumerId(7), ConsumerId(7)))
            .unwrap();

        let outcome = CommitCoordinator::new(broker.ctx.clone())
            .commit(id, None, false)
            .await
            .unwrap();
        assert!(outcome.two_phase);
        assert_eq!(outcome.notified, vec![remote.clone()]);
        assert_eq!(broker.notifier.prepares_to(&remote), 1);
        assert_eq!(broker.notifier.outcomes_to(&remote, ClusterOutcome::Committed), 1);
    }

    #[tokio::test]
    async fn test_prepare_failure_forces_failed() {
        let broker = TestBroker::new();
        let id = started(&broker);
        let remote = BrokerAddress::new("b:7676");
        broker.store.insert(
            MessageRef::new(MessageId(5), DestinationId::topic("t")).with_broker(remote.clone()),
        );
        broker
            .ctx
            .registry()
            .add_consumed_ack(id, ConsumedAck::new(MessageId(5), ConsumerId(7), ConsumerId(70)))
            .unwrap();
        broker
            .notifier
            .fail_prepare(&remote, RemoteFailure::broker_down(remote.clone(), "unreachable"));

        let err = CommitCoordinator::new(broker.ctx.clone())
            .commit(id, None, false)
            .await
            .unwrap_err();
        assert!(err.is_remote());
        assert_eq!(err.affected_consumers(), &[ConsumerId(7)]);

        let state = broker.ctx.registry().retrieve_state(id).unwrap();
        assert_eq!(state.status, TransactionStatus::Failed);
        // durable ack retracted
        assert!(broker.ctx.registry().retrieve_consumed_messages(id).unwrap().is_empty());
        assert_eq!(broker.consumers.recreation_requests(), vec![ConsumerId(7)]);
    }
}
