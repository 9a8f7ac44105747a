//! Testing utilities for the transaction engine
//!
//! In-memory implementations of the broker collaborators plus
//! [`TestBroker`], which wires them into a [`BrokerContext`] and offers
//! shortcuts for building transactional work.
//!
//! # Example
//!
//! ```ignore
//! use streamline_txn::testing::TestBroker;
//!
//! #[tokio::test]
//! async fn test_commit() {
//!     let broker = TestBroker::new();
//!     let id = broker.begin();
//!     broker.produce(id, MessageRef::new(MessageId(1), DestinationId::queue("q")));
//!     // ...
//! }
//! ```

use crate::broker::{BrokerContext, ConsumerHandle, ConsumerRegistry, DestinationStore, RemoveReason};
use crate::cluster::{ClusterNotifier, ClusterOutcome};
use crate::config::TransactionConfig;
use crate::dlq::DlqMetadata;
use crate::error::{RemoteFailure, Result, StreamlineError};
use crate::message::{BrokerAddress, ConsumerId, MessageId, MessageRef};
use crate::transaction::{ConsumedAck, TransactionId, TransactionState, TransactionStatus};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

// ============================================================================
// Destination store
// ============================================================================

#[derive(Default)]
struct StoreState {
    messages: BTreeMap<MessageId, MessageRef>,
    delivered: HashMap<MessageId, BTreeSet<ConsumerId>>,
    acked: HashMap<MessageId, BTreeSet<ConsumerId>>,
    delivery_counts: HashMap<(MessageId, ConsumerId), u32>,
    routed: Vec<MessageId>,
    delayed: Vec<(MessageId, i64)>,
    requeued: Vec<MessageId>,
    undelivered: Vec<(MessageId, ConsumerId)>,
    removed: Vec<(MessageId, RemoveReason)>,
    dead_letters: Vec<(MessageRef, DlqMetadata)>,
}

/// Destination store keeping everything in memory and recording calls
#[derive(Default)]
pub struct InMemoryDestinationStore {
    state: Mutex<StoreState>,
}

impl InMemoryDestinationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message to its destination
    pub fn insert(&self, msg: MessageRef) {
        self.state.lock().messages.insert(msg.id, msg);
    }

    /// Mark a message as delivered to a consumer
    pub fn deliver(&self, message: MessageId, consumer: ConsumerId) {
        self.state
            .lock()
            .delivered
            .entry(message)
            .or_default()
            .insert(consumer);
    }

    /// Messages routed by commits, in order
    pub fn routed(&self) -> Vec<MessageId> {
        self.state.lock().routed.clone()
    }

    /// Messages held for delayed delivery with their delivery times
    pub fn delayed(&self) -> Vec<(MessageId, i64)> {
        self.state.lock().delayed.clone()
    }

    /// Messages put back on their queue, in order
    pub fn requeued(&self) -> Vec<MessageId> {
        self.state.lock().requeued.clone()
    }

    pub fn undelivered(&self) -> Vec<(MessageId, ConsumerId)> {
        self.state.lock().undelivered.clone()
    }

    pub fn removed(&self) -> Vec<(MessageId, RemoveReason)> {
        self.state.lock().removed.clone()
    }

    pub fn dead_letters(&self) -> Vec<(MessageRef, DlqMetadata)> {
        self.state.lock().dead_letters.clone()
    }

    pub fn delivery_count(&self, message: MessageId, consumer: ConsumerId) -> u32 {
        self.state
            .lock()
            .delivery_counts
            .get(&(message, consumer))
            .copied()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().messages.is_empty()
    }
}

impl DestinationStore for InMemoryDestinationStore {
    fn lookup(&self, id: MessageId) -> Option<MessageRef> {
        self.state.lock().messages.get(&id).cloned()
    }

    fn route(&self, msg: &MessageRef) -> Result<()> {
        self.state.lock().routed.push(msg.id);
        Ok(())
    }

    fn route_delayed(&self, msg: &MessageRef, deliver_at_ms: i64) -> Result<()> {
        self.state.lock().delayed.push((msg.id, deliver_at_ms));
        Ok(())
    }

    fn remove(&self, id: MessageId, reason: RemoveReason) -> Result<bool> {
        let mut state = self.state.lock();
        let existed = state.messages.remove(&id).is_some();
        if existed {
            state.delivered.remove(&id);
            state.acked.remove(&id);
            state.removed.push((id, reason));
        }
        Ok(existed)
    }

    fn acknowledge(&self, id: MessageId, stored: ConsumerId) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.messages.contains_key(&id) {
            return Err(StreamlineError::MessageNotFound(id));
        }
        let acked = state.acked.entry(id).or_default();
        acked.insert(stored);
        let acked = acked.clone();
        Ok(state
            .delivered
            .get(&id)
            .map_or(true, |delivered| delivered.is_subset(&acked)))
    }

    fn is_acknowledged(&self, id: MessageId, stored: ConsumerId) -> bool {
        self.state
            .lock()
            .acked
            .get(&id)
            .is_some_and(|acked| acked.contains(&stored))
    }

    fn undeliver(&self, id: MessageId, stored: ConsumerId, _redelivered: bool) -> Result<()> {
        let mut state = self.state.lock();
        if !state.messages.contains_key(&id) {
            return Err(StreamlineError::MessageNotFound(id));
        }
        if let Some(delivered) = state.delivered.get_mut(&id) {
            delivered.remove(&stored);
        }
        state.undelivered.push((id, stored));
        Ok(())
    }

    fn requeue(&self, msg: &MessageRef, stored: ConsumerId, _redelivered: bool) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(delivered) = state.delivered.get_mut(&msg.id) {
            delivered.remove(&stored);
        }
        state.requeued.push(msg.id);
        Ok(())
    }

    fn update_delivery_count(&self, id: MessageId, stored: ConsumerId, delta: u32) -> Result<u32> {
        let mut state = self.state.lock();
        if !state.messages.contains_key(&id) {
            return Err(StreamlineError::MessageNotFound(id));
        }
        let count = state.delivery_counts.entry((id, stored)).or_insert(0);
        *count += delta;
        Ok(*count)
    }

    fn move_to_dead_letter(&self, msg: &MessageRef, metadata: &DlqMetadata) -> Result<()> {
        let mut state = self.state.lock();
        state.messages.remove(&msg.id);
        state.delivered.remove(&msg.id);
        state.acked.remove(&msg.id);
        state.dead_letters.push((msg.clone(), metadata.clone()));
        Ok(())
    }
}

// ============================================================================
// Consumer registry
// ============================================================================

#[derive(Default)]
struct ConsumerState {
    consumers: HashMap<ConsumerId, ConsumerHandle>,
    redelivered: HashMap<ConsumerId, Vec<MessageId>>,
    durable: HashMap<ConsumerId, Vec<MessageId>>,
    released: Vec<(ConsumerId, MessageId)>,
    recreation: Vec<ConsumerId>,
}

/// Consumer registry recording redeliveries and recreation requests
#[derive(Default)]
pub struct InMemoryConsumerRegistry {
    state: Mutex<ConsumerState>,
}

impl InMemoryConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: ConsumerHandle) {
        self.state.lock().consumers.insert(handle.id, handle);
    }

    /// Detach a consumer from its session, keeping it registered
    pub fn deactivate(&self, id: ConsumerId) {
        if let Some(handle) = self.state.lock().consumers.get_mut(&id) {
            handle.active = false;
        }
    }

    pub fn unregister(&self, id: ConsumerId) {
        self.state.lock().consumers.remove(&id);
    }

    /// Messages pushed back to a live consumer, in delivery order
    pub fn redelivered_to(&self, consumer: ConsumerId) -> Vec<MessageId> {
        self.state
            .lock()
            .redelivered
            .get(&consumer)
            .cloned()
            .unwrap_or_default()
    }

    /// Messages routed back to a durable subscription
    pub fn routed_to_durable(&self, stored: ConsumerId) -> Vec<MessageId> {
        self.state
            .lock()
            .durable
            .get(&stored)
            .cloned()
            .unwrap_or_default()
    }

    pub fn released(&self) -> Vec<(ConsumerId, MessageId)> {
        self.state.lock().released.clone()
    }

    pub fn recreation_requests(&self) -> Vec<ConsumerId> {
        self.state.lock().recreation.clone()
    }
}

impl ConsumerRegistry for InMemoryConsumerRegistry {
    fn lookup(&self, id: ConsumerId) -> Option<ConsumerHandle> {
        self.state.lock().consumers.get(&id).cloned()
    }

    fn release_delivered(&self, consumer: ConsumerId, message: MessageId) -> bool {
        let mut state = self.state.lock();
        if !state.consumers.contains_key(&consumer) {
            return false;
        }
        state.released.push((consumer, message));
        true
    }

    fn redeliver(&self, consumer: ConsumerId, refs: &[MessageRef], _to_front: bool) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.consumers.get(&consumer).is_some_and(|c| c.active) {
            return Ok(false);
        }
        state
            .redelivered
            .entry(consumer)
            .or_default()
            .extend(refs.iter().map(|r| r.id));
        Ok(true)
    }

    fn route_to_durable(&self, stored: ConsumerId, refs: &[MessageRef]) -> Result<bool> {
        self.state
            .lock()
            .durable
            .entry(stored)
            .or_default()
            .extend(refs.iter().map(|r| r.id));
        Ok(true)
    }

    fn request_recreation(&self, consumer: ConsumerId) {
        self.state.lock().recreation.push(consumer);
    }
}

// ============================================================================
// Cluster notifier
// ============================================================================

#[derive(Default)]
struct NotifierState {
    prepares: Vec<(BrokerAddress, TransactionId, Vec<ConsumedAck>)>,
    outcomes: Vec<(BrokerAddress, TransactionId, ClusterOutcome)>,
    releases: Vec<(BrokerAddress, MessageId)>,
    prepare_failures: HashMap<BrokerAddress, RemoteFailure>,
    outcome_failures: HashMap<BrokerAddress, RemoteFailure>,
}

/// Cluster notifier recording every call, with injectable failures
#[derive(Default)]
pub struct RecordingClusterNotifier {
    state: Mutex<NotifierState>,
}

impl RecordingClusterNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every PREPARE sent to `broker` fail
    pub fn fail_prepare(&self, broker: &BrokerAddress, failure: RemoteFailure) {
        self.state
            .lock()
            .prepare_failures
            .insert(broker.clone(), failure);
    }

    /// Make every outcome sent to `broker` fail
    pub fn fail_outcome(&self, broker: &BrokerAddress, failure: RemoteFailure) {
        self.state
            .lock()
            .outcome_failures
            .insert(broker.clone(), failure);
    }

    /// Clear injected failures for `broker`
    pub fn heal(&self, broker: &BrokerAddress) {
        let mut state = self.state.lock();
        state.prepare_failures.remove(broker);
        state.outcome_failures.remove(broker);
    }

    pub fn prepares_to(&self, broker: &BrokerAddress) -> usize {
        self.state
            .lock()
            .prepares
            .iter()
            .filter(|(b, _, _)| b == broker)
            .count()
    }

    pub fn prepared_acks(&self, broker: &BrokerAddress) -> Vec<ConsumedAck> {
        self.state
            .lock()
            .prepares
            .iter()
            .filter(|(b, _, _)| b == broker)
            .flat_map(|(_, _, acks)| acks.iter().copied())
            .collect()
    }

    pub fn outcomes_to(&self, broker: &BrokerAddress, outcome: ClusterOutcome) -> usize {
        self.state
            .lock()
            .outcomes
            .iter()
            .filter(|(b, _, o)| b == broker && *o == outcome)
            .count()
    }

    pub fn releases_to(&self, broker: &BrokerAddress) -> Vec<MessageId> {
        self.state
            .lock()
            .releases
            .iter()
            .filter(|(b, _)| b == broker)
            .map(|(_, m)| *m)
            .collect()
    }
}

#[async_trait]
impl ClusterNotifier for RecordingClusterNotifier {
    async fn send_prepare(
        &self,
        broker: &BrokerAddress,
        transaction: TransactionId,
        acks: &[ConsumedAck],
    ) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(failure) = state.prepare_failures.get(broker) {
            return Err(failure.clone().into());
        }
        state.prepares.push((broker.clone(), transaction, acks.to_vec()));
        Ok(())
    }

    async fn send_outcome(
        &self,
        broker: &BrokerAddress,
        transaction: TransactionId,
        outcome: ClusterOutcome,
        _acks: &[ConsumedAck],
    ) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(failure) = state.outcome_failures.get(broker) {
            return Err(failure.clone().into());
        }
        state.outcomes.push((broker.clone(), transaction, outcome));
        Ok(())
    }

    async fn release_message(
        &self,
        broker: &BrokerAddress,
        _transaction: Option<TransactionId>,
        message: MessageId,
        _consumer: ConsumerId,
    ) -> Result<()> {
        self.state.lock().releases.push((broker.clone(), message));
        Ok(())
    }
}

// ============================================================================
// Test broker
// ============================================================================

/// Broker address used by [`TestBroker::new`]
pub const TEST_BROKER_ADDRESS: &str = "a:7676";

/// A transaction engine over in-memory collaborators
pub struct TestBroker {
    pub ctx: Arc<BrokerContext>,
    pub store: Arc<InMemoryDestinationStore>,
    pub consumers: Arc<InMemoryConsumerRegistry>,
    pub notifier: Arc<RecordingClusterNotifier>,
}

impl TestBroker {
    /// Broker at [`TEST_BROKER_ADDRESS`] without a transaction log
    pub fn new() -> Self {
        Self::with_config(TransactionConfig::in_memory().with_broker_address(TEST_BROKER_ADDRESS))
    }

    /// Build over `config`
    ///
    /// # Panics
    ///
    /// Panics if the context cannot be built, e.g. the log directory is
    /// not writable.
    pub fn with_config(config: TransactionConfig) -> Self {
        match Self::try_with_config(config) {
            Ok(broker) => broker,
            Err(e) => panic!("failed to build test broker: {}", e),
        }
    }

    pub fn try_with_config(config: TransactionConfig) -> Result<Self> {
        let store = Arc::new(InMemoryDestinationStore::new());
        let consumers = Arc::new(InMemoryConsumerRegistry::new());
        let notifier = Arc::new(RecordingClusterNotifier::new());
        let ctx = BrokerContext::builder(config)
            .with_store(store.clone())
            .with_consumers(consumers.clone())
            .with_notifier(notifier.clone())
            .build()?;
        Ok(Self {
            ctx,
            store,
            consumers,
            notifier,
        })
    }

    /// Start a local transaction
    ///
    /// # Panics
    ///
    /// Panics if the transaction cannot be registered.
    pub fn begin(&self) -> TransactionId {
        let id = self.ctx.next_transaction_id();
        if let Err(e) = self.ctx.registry().create(
            id,
            TransactionState::local().with_status(TransactionStatus::Started),
        ) {
            panic!("failed to start transaction {}: {}", id, e);
        }
        id
    }

    /// Send `msg` within transaction `id`
    ///
    /// # Panics
    ///
    /// Panics if the transaction does not accept work.
    pub fn produce(&self, id: TransactionId, msg: MessageRef) {
        self.store.insert(msg.clone());
        if let Err(e) = self.ctx.registry().add_produced_message(id, msg) {
            panic!("failed to add produced message to {}: {}", id, e);
        }
    }

    /// Store `msg`, deliver it to `consumer` and acknowledge it in `id`
    pub fn consume(&self, id: TransactionId, msg: MessageRef, consumer: ConsumerId) {
        let message = msg.id;
        self.store.insert(msg);
        self.consume_existing(id, message, consumer);
    }

    /// Deliver an already stored message to `consumer` and acknowledge it in `id`
    ///
    /// # Panics
    ///
    /// Panics if the transaction does not accept work.
    pub fn consume_existing(&self, id: TransactionId, message: MessageId, consumer: ConsumerId) {
        self.store.deliver(message, consumer);
        if let Err(e) = self
            .ctx
            .registry()
            .add_consumed_ack(id, ConsumedAck::new(message, consumer, consumer))
        {
            panic!("failed to add consumed ack to {}: {}", id, e);
        }
    }
}

impl Default for TestBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DestinationId;

    #[test]
    fn test_store_acknowledge_tracks_delivered_consumers() {
        let store = InMemoryDestinationStore::new();
        store.insert(MessageRef::new(MessageId(1), DestinationId::topic("t")));
        store.deliver(MessageId(1), ConsumerId(1));
        store.deliver(MessageId(1), ConsumerId(2));

        assert!(!store.acknowledge(MessageId(1), ConsumerId(1)).unwrap());
        assert!(store.is_acknowledged(MessageId(1), ConsumerId(1)));
        assert!(store.acknowledge(MessageId(1), ConsumerId(2)).unwrap());
        assert!(store.acknowledge(MessageId(2), ConsumerId(1)).is_err());
    }

    #[test]
    fn test_inactive_consumer_refuses_redelivery() {
        let consumers = InMemoryConsumerRegistry::new();
        consumers.register(ConsumerHandle::new(ConsumerId(1)).inactive());
        let msg = MessageRef::new(MessageId(1), DestinationId::queue("q"));
        assert!(!consumers.redeliver(ConsumerId(1), &[msg.clone()], true).unwrap());
        assert!(!consumers.redeliver(ConsumerId(2), &[msg], true).unwrap());
    }
}
