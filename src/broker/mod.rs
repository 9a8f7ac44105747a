//! Broker-side wiring of the transaction engine
//!
//! [`BrokerContext`] is constructed once at broker start and handed to every
//! coordinator. It owns the registry and transaction log and holds the
//! broker subsystems the engine drives:
//!
//! - the destination store and consumer registry ([`collaborators`])
//! - the cluster notification channel
//! - the dead-letter router
//!
//! Requests arrive through [`TransactionHandler`] and are executed by the
//! connection [`WorkerPool`].

pub mod collaborators;
mod handler;
pub mod protocol;
mod worker;

pub use collaborators::{ConsumerHandle, ConsumerRegistry, DestinationStore, RemoveReason};
pub use handler::TransactionHandler;
pub use protocol::{Reply, ReplyBody, Request};
pub use worker::{ConnectionHandle, WorkerPool, WorkerPoolStats};

use crate::cluster::{ClusterChannel, ClusterNotifier, StandaloneNotifier};
use crate::config::TransactionConfig;
use crate::dlq::DeadLetterRouter;
use crate::error::{Result, StreamlineError};
use crate::message::{BrokerAddress, ConsumerId, MessageId};
use crate::transaction::{
    ConsumedAck, RecoveryReport, TransactionId, TransactionIdGenerator, TransactionLog,
    TransactionRegistry, TransactionStats, TransactionWork,
};

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::info;

/// Consecutive rollback counts per (message, stored consumer)
#[derive(Debug, Default)]
pub struct RollbackCounters {
    counts: DashMap<(MessageId, ConsumerId), u32>,
}

impl RollbackCounters {
    pub fn get(&self, message: MessageId, stored: ConsumerId) -> u32 {
        self.counts
            .get(&(message, stored))
            .map(|c| *c)
            .unwrap_or(0)
    }

    /// Count one more rollback, returning the new total
    pub fn increment(&self, message: MessageId, stored: ConsumerId) -> u32 {
        let mut count = self.counts.entry((message, stored)).or_insert(0);
        *count += 1;
        *count
    }

    /// Forget the count once the message is acknowledged or dead-lettered
    pub fn reset(&self, message: MessageId, stored: ConsumerId) {
        self.counts.remove(&(message, stored));
    }

    /// Forget every consumer's count for a message that left the store
    pub fn reset_message(&self, message: MessageId) {
        self.counts.retain(|(m, _), _| *m != message);
    }

    /// Forget the counts of a consumer that no longer exists
    pub fn reset_consumer(&self, stored: ConsumerId) {
        self.counts.retain(|(_, c), _| *c != stored);
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Shared services of one broker
pub struct BrokerContext {
    config: TransactionConfig,
    registry: Arc<TransactionRegistry>,
    store: Arc<dyn DestinationStore>,
    consumers: Arc<dyn ConsumerRegistry>,
    cluster: ClusterChannel,
    dead_letters: DeadLetterRouter,
    rollback_counts: RollbackCounters,
    stats: TransactionStats,
    ids: TransactionIdGenerator,
    /// Destination structure; shared by commit/rollback side effects,
    /// exclusive for attach and teardown
    destinations: RwLock<()>,
}

impl BrokerContext {
    pub fn builder(config: TransactionConfig) -> BrokerContextBuilder {
        BrokerContextBuilder {
            config,
            store: None,
            consumers: None,
            notifier: None,
        }
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub fn local_broker(&self) -> &BrokerAddress {
        &self.config.broker_address
    }

    pub fn registry(&self) -> &Arc<TransactionRegistry> {
        &self.registry
    }

    pub fn log(&self) -> &Arc<TransactionLog> {
        self.registry.log()
    }

    pub fn store(&self) -> &Arc<dyn DestinationStore> {
        &self.store
    }

    pub fn consumers(&self) -> &Arc<dyn ConsumerRegistry> {
        &self.consumers
    }

    pub fn cluster(&self) -> &ClusterChannel {
        &self.cluster
    }

    pub fn dead_letters(&self) -> &DeadLetterRouter {
        &self.dead_letters
    }

    pub fn rollback_counts(&self) -> &RollbackCounters {
        &self.rollback_counts
    }

    pub fn stats(&self) -> &TransactionStats {
        &self.stats
    }

    pub fn next_transaction_id(&self) -> TransactionId {
        self.ids.next_id()
    }

    /// Consumed acknowledgments owed to other brokers, grouped by owner
    ///
    /// Combines the owners recorded at acknowledge time with the owning
    /// broker attribute of each consumed reference still in the store.
    pub fn remote_acks(
        &self,
        id: TransactionId,
        work: &TransactionWork,
    ) -> Result<BTreeMap<BrokerAddress, Vec<ConsumedAck>>> {
        let mut remote = self.registry.retrieve_remote_ack_brokers(id)?;
        for ack in &work.acks {
            if remote.values().any(|acks| acks.contains(ack)) {
                continue;
            }
            let Some(msg) = self.store.lookup(ack.message) else {
                continue;
            };
            if let Some(owner) = msg.broker.as_ref().filter(|_| msg.is_remote(self.local_broker())) {
                remote.entry(owner.clone()).or_default().push(*ack);
            }
        }
        remote.remove(self.local_broker());
        Ok(remote)
    }

    /// Exclude commit and rollback side effects while destinations change
    ///
    /// The broker holds this guard while attaching consumers or producers
    /// and while tearing a destination down. It waits for routing and
    /// redelivery already in progress.
    pub async fn destination_change(&self) -> RwLockWriteGuard<'_, ()> {
        self.destinations.write().await
    }

    /// Shared side of [`Self::destination_change`], held while a commit or
    /// rollback touches the store
    pub(crate) async fn destination_use(&self) -> RwLockReadGuard<'_, ()> {
        self.destinations.read().await
    }

    /// Drop the rollback counts of a consumer whose identity will not return
    ///
    /// A non-durable consumer never comes back once closed. A durable one
    /// keeps its counts until its subscription is removed.
    pub fn consumer_closed(&self, consumer: &ConsumerHandle, subscription_removed: bool) {
        let durable = consumer.stored_id != consumer.id;
        if !durable || subscription_removed {
            self.rollback_counts.reset_consumer(consumer.stored_id);
        }
    }

    /// Restore in-doubt transactions from the transaction log
    pub fn recover(&self) -> Result<RecoveryReport> {
        let report = self.registry.recover()?;
        if let Some(max_id) = report.max_id {
            self.ids.observe(max_id);
        }
        Ok(report)
    }
}

/// Builder for [`BrokerContext`]
pub struct BrokerContextBuilder {
    config: TransactionConfig,
    store: Option<Arc<dyn DestinationStore>>,
    consumers: Option<Arc<dyn ConsumerRegistry>>,
    notifier: Option<Arc<dyn ClusterNotifier>>,
}

impl BrokerContextBuilder {
    pub fn with_store(mut self, store: Arc<dyn DestinationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_consumers(mut self, consumers: Arc<dyn ConsumerRegistry>) -> Self {
        self.consumers = Some(consumers);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ClusterNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Open the transaction log and assemble the context
    pub fn build(self) -> Result<Arc<BrokerContext>> {
        self.config.validate()?;

        let store = self
            .store
            .ok_or_else(|| StreamlineError::Config("destination store is required".to_string()))?;
        let consumers = self
            .consumers
            .ok_or_else(|| StreamlineError::Config("consumer registry is required".to_string()))?;
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(StandaloneNotifier));

        let log = Arc::new(TransactionLog::new(
            &self.config.data_dir,
            self.config.log_enabled,
        )?);
        let registry = Arc::new(TransactionRegistry::with_limits(
            log,
            self.config.max_consumed_per_transaction,
            self.config.resolved_cache_limit,
        ));
        let dead_letters = DeadLetterRouter::new(
            store.clone(),
            self.config.dlq(),
            self.config.broker_address.clone(),
        );
        let cluster = ClusterChannel::new(notifier, self.config.remote_timeout());

        info!(
            broker = %self.config.broker_address,
            log_enabled = self.config.log_enabled,
            max_consecutive_rollbacks = self.config.max_consecutive_rollbacks,
            "Transaction engine initialized"
        );

        Ok(Arc::new(BrokerContext {
            config: self.config,
            registry,
            store,
            consumers,
            cluster,
            dead_letters,
            rollback_counts: RollbackCounters::default(),
            stats: TransactionStats::default(),
            ids: TransactionIdGenerator::new(),
            destinations: RwLock::new(()),
        }))
    }
}
