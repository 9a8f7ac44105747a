//! Dead-letter routing for messages that cannot be delivered
//!
//! Messages end up on the dead-letter destination when:
//! - a consumer acknowledges them as DEAD or UNDELIVERABLE
//! - they exceed the consecutive rollback limit of a consumer
//!
//! The original destination, the reason and the delivery history travel
//! with the diverted message as [`DlqMetadata`].

use bytes::Bytes;
#[cfg(feature = "metrics")]
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

use crate::broker::DestinationStore;
use crate::error::{Result, StreamlineError};
use crate::message::{BrokerAddress, ConsumerId, DestinationId, MessageRef};
use crate::transaction::now_ms;

/// Default dead-letter destination name
pub const DEFAULT_DEAD_LETTER_DESTINATION: &str = "mq.sys.dmq";

/// Property key carrying serialized [`DlqMetadata`]
pub const DLQ_METADATA_HEADER: &str = "x-dlq-metadata";

/// DLQ configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqConfig {
    /// Whether DLQ is enabled
    pub enabled: bool,

    /// Queue receiving diverted messages
    pub destination: String,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            destination: DEFAULT_DEAD_LETTER_DESTINATION.to_string(),
        }
    }
}

impl DlqConfig {
    /// Create a new DLQ config with DLQ enabled
    pub fn enabled() -> Self {
        Self::default()
    }

    /// Create a new DLQ config with DLQ disabled
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Set the dead-letter destination
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = destination.into();
        self
    }
}

/// Why a message was diverted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeadReason {
    /// Consumer reported the message undeliverable
    Undeliverable,
    /// Message expired before it could be consumed
    Expired,
    /// Rolled back more often than the consumer's limit allows
    RollbackLimit,
}

impl fmt::Display for DeadReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeadReason::Undeliverable => "UNDELIVERABLE",
            DeadReason::Expired => "EXPIRED",
            DeadReason::RollbackLimit => "ROLLBACK_LIMIT",
        };
        f.write_str(name)
    }
}

/// Context for a message being sent to DLQ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqContext {
    pub reason: DeadReason,

    /// Free-form comment supplied by the client or the broker
    pub comment: Option<String>,

    /// Description of the error that caused the diversion
    pub cause: Option<String>,

    pub delivery_count: u32,

    pub rollback_count: u32,

    /// Consumer that gave up on the message
    pub consumer: Option<ConsumerId>,
}

impl DlqContext {
    pub fn new(reason: DeadReason) -> Self {
        Self {
            reason,
            comment: None,
            cause: None,
            delivery_count: 0,
            rollback_count: 0,
            consumer: None,
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

    pub fn with_delivery_count(mut self, count: u32) -> Self {
        self.delivery_count = count;
        self
    }

    pub fn with_rollback_count(mut self, count: u32) -> Self {
        self.rollback_count = count;
        self
    }

    pub fn with_consumer(mut self, consumer: ConsumerId) -> Self {
        self.consumer = Some(consumer);
        self
    }
}

/// Metadata recorded on a diverted message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqMetadata {
    pub original_destination: DestinationId,

    pub dead_letter_destination: String,

    pub reason: DeadReason,

    pub comment: Option<String>,

    pub cause: Option<String>,

    pub delivery_count: u32,

    pub rollback_count: u32,

    pub consumer: Option<ConsumerId>,

    /// Broker that diverted the message
    pub broker: BrokerAddress,

    /// Original enqueue timestamp
    pub original_timestamp: i64,

    /// When the message was diverted
    pub dead_timestamp: i64,
}

impl DlqMetadata {
    /// Create metadata from a message reference and context
    pub fn from_message(
        msg: &MessageRef,
        destination: &str,
        broker: &BrokerAddress,
        context: &DlqContext,
    ) -> Self {
        Self {
            original_destination: msg.destination.clone(),
            dead_letter_destination: destination.to_string(),
            reason: context.reason,
            comment: context.comment.clone(),
            cause: context.cause.clone(),
            delivery_count: context.delivery_count,
            rollback_count: context.rollback_count,
            consumer: context.consumer,
            broker: broker.clone(),
            original_timestamp: msg.timestamp,
            dead_timestamp: now_ms(),
        }
    }

    /// Serialized form stored under [`DLQ_METADATA_HEADER`]
    pub fn to_header(&self) -> Result<Bytes> {
        let json = serde_json::to_vec(self).map_err(|e| {
            StreamlineError::storage("dlq", format!("Failed to serialize DLQ metadata: {}", e))
        })?;
        Ok(Bytes::from(json))
    }

    pub fn from_header(value: &[u8]) -> Result<Self> {
        serde_json::from_slice(value).map_err(|e| {
            StreamlineError::storage("dlq", format!("Failed to parse DLQ metadata: {}", e))
        })
    }
}

/// Diverts messages to the dead-letter destination
pub struct DeadLetterRouter {
    store: Arc<dyn DestinationStore>,
    config: DlqConfig,
    broker: BrokerAddress,
}

impl DeadLetterRouter {
    pub fn new(store: Arc<dyn DestinationStore>, config: DlqConfig, broker: BrokerAddress) -> Self {
        Self {
            store,
            config,
            broker,
        }
    }

    /// Check if DLQ is enabled
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn destination(&self) -> &str {
        &self.config.destination
    }

    /// Check if a destination is the dead-letter destination
    pub fn is_dead_letter_destination(&self, destination: &DestinationId) -> bool {
        destination.is_queue() && destination.name == self.config.destination
    }

    /// Move a message to the dead-letter destination
    pub fn divert(&self, msg: &MessageRef, context: DlqContext) -> Result<DlqMetadata> {
        if !self.config.enabled {
            return Err(StreamlineError::Config("DLQ is disabled".to_string()));
        }

        let metadata =
            DlqMetadata::from_message(msg, &self.config.destination, &self.broker, &context);
        self.store.move_to_dead_letter(msg, &metadata)?;

        warn!(
            message_id = %msg.id,
            original_destination = %msg.destination,
            dlq_destination = %self.config.destination,
            reason = %context.reason,
            rollback_count = context.rollback_count,
            "Message moved to dead-letter destination"
        );
        #[cfg(feature = "metrics")]
        counter!("streamline_txn_dead_lettered_total").increment(1);

        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageId;
    use crate::testing::InMemoryDestinationStore;

    fn router(config: DlqConfig) -> (Arc<InMemoryDestinationStore>, DeadLetterRouter) {
        let store = Arc::new(InMemoryDestinationStore::new());
        let router = DeadLetterRouter::new(store.clone(), config, BrokerAddress::new("a:7676"));
        (store, router)
    }

    #[test]
    fn test_dlq_config_defaults() {
        let config = DlqConfig::default();
        assert!(config.enabled);
        assert_eq!(config.destination, "mq.sys.dmq");
        assert!(!DlqConfig::disabled().enabled);
    }

    #[test]
    fn test_divert_records_metadata() {
        let (store, router) = router(DlqConfig::enabled());
        let msg = MessageRef::new(MessageId(5), DestinationId::queue("orders")).with_timestamp(100);
        store.insert(msg.clone());

        let metadata = router
            .divert(
                &msg,
                DlqContext::new(DeadReason::RollbackLimit)
                    .with_rollback_count(3)
                    .with_consumer(ConsumerId(1)),
            )
            .unwrap();

        assert_eq!(metadata.original_destination, DestinationId::queue("orders"));
        assert_eq!(metadata.rollback_count, 3);
        assert_eq!(metadata.original_timestamp, 100);
        assert!(store.lookup(MessageId(5)).is_none());
        let dead = store.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].1.reason, DeadReason::RollbackLimit);
    }

    #[test]
    fn test_divert_when_disabled() {
        let (_store, router) = router(DlqConfig::disabled());
        let msg = MessageRef::new(MessageId(5), DestinationId::queue("orders"));
        let err = router
            .divert(&msg, DlqContext::new(DeadReason::Undeliverable))
            .unwrap_err();
        assert!(err.to_string().contains("DLQ is disabled"));
    }

    #[test]
    fn test_metadata_header_round_trip() {
        let msg = MessageRef::new(MessageId(1), DestinationId::topic("prices"));
        let metadata = DlqMetadata::from_message(
            &msg,
            DEFAULT_DEAD_LETTER_DESTINATION,
            &BrokerAddress::new("a:1"),
            &DlqContext::new(DeadReason::Expired).with_comment("ttl"),
        );
        let parsed = DlqMetadata::from_header(&metadata.to_header().unwrap()).unwrap();
        assert_eq!(parsed, metadata);
    }

    #[test]
    fn test_is_dead_letter_destination() {
        let (_store, router) = router(DlqConfig::enabled());
        assert!(router.is_dead_letter_destination(&DestinationId::queue("mq.sys.dmq")));
        assert!(!router.is_dead_letter_destination(&DestinationId::topic("mq.sys.dmq")));
    }
}
