//! Cluster notification channel
//!
//! Only the narrow "tell a remote broker about a message outcome" contract
//! is used here. Membership and failover are handled elsewhere.
//!
//! Every call goes through [`ClusterChannel`], which bounds it with the
//! configured remote timeout and normalizes failures into
//! [`RemoteFailure`]s.

use crate::error::{RemoteFailure, Result, StreamlineError};
use crate::message::{BrokerAddress, ConsumerId, MessageId};
use crate::transaction::{ConsumedAck, TransactionId};
use async_trait::async_trait;
#[cfg(feature = "metrics")]
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Outcome of a cluster transaction sent to participants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterOutcome {
    Committed,
    RolledBack,
}

impl std::fmt::Display for ClusterOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterOutcome::Committed => write!(f, "committed"),
            ClusterOutcome::RolledBack => write!(f, "rolledback"),
        }
    }
}

/// Transport to other brokers
#[async_trait]
pub trait ClusterNotifier: Send + Sync {
    /// Ask `broker` to durably record the acknowledgments it owns
    async fn send_prepare(
        &self,
        broker: &BrokerAddress,
        transaction: TransactionId,
        acks: &[ConsumedAck],
    ) -> Result<()>;

    /// Deliver the final outcome of a prepared transaction
    async fn send_outcome(
        &self,
        broker: &BrokerAddress,
        transaction: TransactionId,
        outcome: ClusterOutcome,
        acks: &[ConsumedAck],
    ) -> Result<()>;

    /// Release a message back to available state on its owning broker
    async fn release_message(
        &self,
        broker: &BrokerAddress,
        transaction: Option<TransactionId>,
        message: MessageId,
        consumer: ConsumerId,
    ) -> Result<()>;
}

/// Notifier for a broker running without a cluster
#[derive(Debug, Default)]
pub struct StandaloneNotifier;

#[async_trait]
impl ClusterNotifier for StandaloneNotifier {
    async fn send_prepare(
        &self,
        broker: &BrokerAddress,
        _transaction: TransactionId,
        _acks: &[ConsumedAck],
    ) -> Result<()> {
        Err(RemoteFailure::broker_down(broker.clone(), "clustering is not enabled").into())
    }

    async fn send_outcome(
        &self,
        broker: &BrokerAddress,
        _transaction: TransactionId,
        _outcome: ClusterOutcome,
        _acks: &[ConsumedAck],
    ) -> Result<()> {
        Err(RemoteFailure::broker_down(broker.clone(), "clustering is not enabled").into())
    }

    async fn release_message(
        &self,
        broker: &BrokerAddress,
        _transaction: Option<TransactionId>,
        _message: MessageId,
        _consumer: ConsumerId,
    ) -> Result<()> {
        Err(RemoteFailure::broker_down(broker.clone(), "clustering is not enabled").into())
    }
}

/// Bounded-timeout wrapper around a [`ClusterNotifier`]
#[derive(Clone)]
pub struct ClusterChannel {
    notifier: Arc<dyn ClusterNotifier>,
    timeout: Duration,
}

impl ClusterChannel {
    pub fn new(notifier: Arc<dyn ClusterNotifier>, timeout: Duration) -> Self {
        Self { notifier, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn bounded<F>(&self, broker: &BrokerAddress, call: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>>,
    {
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(StreamlineError::Remote(failure))) => Err(failure),
            Ok(Err(other)) => Err(RemoteFailure::broker_down(broker.clone(), other.to_string())),
            Err(_) => Err(RemoteFailure::timeout(broker.clone())),
        };
        if let Err(failure) = &result {
            debug!(broker = %broker, error = %failure, "Cluster call failed");
            #[cfg(feature = "metrics")]
            counter!("streamline_txn_remote_failures_total").increment(1);
        }
        result.map_err(StreamlineError::from)
    }

    pub async fn prepare(
        &self,
        broker: &BrokerAddress,
        transaction: TransactionId,
        acks: &[ConsumedAck],
    ) -> Result<()> {
        self.bounded(broker, self.notifier.send_prepare(broker, transaction, acks))
            .await
    }

    pub async fn outcome(
        &self,
        broker: &BrokerAddress,
        transaction: TransactionId,
        outcome: ClusterOutcome,
        acks: &[ConsumedAck],
    ) -> Result<()> {
        self.bounded(
            broker,
            self.notifier.send_outcome(broker, transaction, outcome, acks),
        )
        .await
    }

    pub async fn release(
        &self,
        broker: &BrokerAddress,
        transaction: Option<TransactionId>,
        message: MessageId,
        consumer: ConsumerId,
    ) -> Result<()> {
        self.bounded(
            broker,
            self.notifier
                .release_message(broker, transaction, message, consumer),
        )
        .await
    }
}
