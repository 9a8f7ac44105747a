//! Message references and identifiers
//!
//! A [`MessageRef`] describes one in-flight message as seen by the
//! transactional engine. References are owned by their destination; a
//! transaction only records identifiers and looks references up again
//! through the destination store when it needs them.

pub mod ordering;

pub use ordering::{OrderKey, OrderedRefs};

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl $name {
            pub fn new(value: u64) -> Self {
                Self(value)
            }

            pub fn value(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

numeric_id!(
    /// Broker-assigned message identifier
    MessageId,
    "msg-"
);
numeric_id!(
    /// Consumer identifier (live or stored)
    ConsumerId,
    "consumer-"
);
numeric_id!(
    /// Client connection identifier
    ConnectionId,
    "conn-"
);
numeric_id!(
    /// Consumer session identifier
    SessionId,
    "session-"
);

/// Kind of destination a message was published to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DestinationKind {
    Queue,
    Topic,
}

/// A destination (queue or topic)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DestinationId {
    pub name: String,
    pub kind: DestinationKind,
}

impl DestinationId {
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::Queue,
        }
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::Topic,
        }
    }

    pub fn is_queue(&self) -> bool {
        self.kind == DestinationKind::Queue
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DestinationKind::Queue => write!(f, "queue:{}", self.name),
            DestinationKind::Topic => write!(f, "topic:{}", self.name),
        }
    }
}

/// Address of a broker in the cluster
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BrokerAddress(pub String);

impl BrokerAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One in-flight message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    pub id: MessageId,
    pub destination: DestinationId,
    /// JMS-style priority, 0..=9, higher first
    pub priority: u8,
    /// Enqueue timestamp in milliseconds
    pub timestamp: i64,
    /// Broker-wide unique enqueue sequence
    pub sequence: u64,
    pub persistent: bool,
    /// Owning broker when the message lives in a remote broker's store
    #[serde(default)]
    pub broker: Option<BrokerAddress>,
    /// Scheduled delivery time in milliseconds
    #[serde(default)]
    pub delivery_time: Option<i64>,
    #[serde(default)]
    pub dead: bool,
    /// Superseded by a takeover
    #[serde(default)]
    pub overridden: bool,
    /// Supersedes an earlier reference after a takeover
    #[serde(default)]
    pub overriding: bool,
    /// Latest remote consumer that claimed this message
    #[serde(default)]
    pub last_remote_consumer: Option<ConsumerId>,
}

impl MessageRef {
    pub fn new(id: MessageId, destination: DestinationId) -> Self {
        Self {
            id,
            destination,
            priority: 4,
            timestamp: 0,
            sequence: id.0,
            persistent: true,
            broker: None,
            delivery_time: None,
            dead: false,
            overridden: false,
            overriding: false,
            last_remote_consumer: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_broker(mut self, broker: BrokerAddress) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn with_delivery_time(mut self, delivery_time: i64) -> Self {
        self.delivery_time = Some(delivery_time);
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn with_last_remote_consumer(mut self, consumer: ConsumerId) -> Self {
        self.last_remote_consumer = Some(consumer);
        self
    }

    /// Returns true if the message lives in a store owned by a broker other than `local`
    pub fn is_remote(&self, local: &BrokerAddress) -> bool {
        matches!(&self.broker, Some(owner) if owner != local)
    }

    /// Ordering key under the delivery ordering policy
    pub fn order_key(&self) -> OrderKey {
        OrderKey::of(self)
    }
}
