//! Domain-specific error types for Streamline transactions

use crate::error::Status;
use crate::message::{BrokerAddress, ConsumerId};
use thiserror::Error;

/// Structured storage error domain
#[derive(Debug, Error, Clone)]
pub enum StorageError {
    #[error("{operation}: {detail}")]
    Operation { operation: String, detail: String },
    #[error("{0}")]
    Message(String),
}

impl StorageError {
    pub fn operation(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Operation {
            operation: operation.into(),
            detail: detail.into(),
        }
    }
}

impl From<String> for StorageError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

/// Structured protocol error domain
#[derive(Debug, Error, Clone)]
pub enum ProtocolError {
    #[error("{operation}: {detail}")]
    Operation { operation: String, detail: String },
    #[error("invalid {field}: {reason}")]
    InvalidField { field: String, reason: String },
    #[error("missing {0}")]
    Missing(String),
    #[error("{0}")]
    Message(String),
}

impl ProtocolError {
    pub fn operation(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Operation {
            operation: operation.into(),
            detail: detail.into(),
        }
    }

    pub fn invalid_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn missing(field: impl Into<String>) -> Self {
        Self::Missing(field.into())
    }
}

impl From<String> for ProtocolError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

impl From<&str> for ProtocolError {
    fn from(value: &str) -> Self {
        Self::Message(value.to_string())
    }
}

/// Structured configuration error domain
#[derive(Debug, Error, Clone)]
pub enum ConfigError {
    #[error("{setting}: {reason}")]
    InvalidSetting { setting: String, reason: String },
    #[error("{0}")]
    Message(String),
}

impl ConfigError {
    pub fn invalid_setting(setting: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSetting {
            setting: setting.into(),
            reason: reason.into(),
        }
    }
}

impl From<String> for ConfigError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

/// Kind of failure reported by a remote broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteFailureKind {
    /// Broker is unreachable or left the cluster
    BrokerDown,
    /// Remote broker has no record of the acknowledgment yet
    AckNotFound,
    /// Message reference no longer exists on the remote broker
    Gone,
    /// No answer within the configured remote timeout
    Timeout,
}

impl RemoteFailureKind {
    pub fn status(&self) -> Status {
        match self {
            RemoteFailureKind::BrokerDown | RemoteFailureKind::Gone => Status::Gone,
            RemoteFailureKind::AckNotFound => Status::NotFound,
            RemoteFailureKind::Timeout => Status::Timeout,
        }
    }
}

impl std::fmt::Display for RemoteFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteFailureKind::BrokerDown => write!(f, "broker down"),
            RemoteFailureKind::AckNotFound => write!(f, "ack not found"),
            RemoteFailureKind::Gone => write!(f, "gone"),
            RemoteFailureKind::Timeout => write!(f, "timeout"),
        }
    }
}

/// Failure that originated on another broker
///
/// Carries the consumers the client should react to (e.g. by recreating them).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind} from {broker}: {detail}")]
pub struct RemoteFailure {
    pub kind: RemoteFailureKind,
    pub broker: BrokerAddress,
    pub consumers: Vec<ConsumerId>,
    pub detail: String,
}

impl RemoteFailure {
    pub fn new(kind: RemoteFailureKind, broker: BrokerAddress, detail: impl Into<String>) -> Self {
        Self {
            kind,
            broker,
            consumers: Vec::new(),
            detail: detail.into(),
        }
    }

    pub fn broker_down(broker: BrokerAddress, detail: impl Into<String>) -> Self {
        Self::new(RemoteFailureKind::BrokerDown, broker, detail)
    }

    pub fn timeout(broker: BrokerAddress) -> Self {
        Self::new(RemoteFailureKind::Timeout, broker, "no reply within remote timeout")
    }

    /// Attach the consumers affected by this failure
    pub fn with_consumers(mut self, consumers: impl IntoIterator<Item = ConsumerId>) -> Self {
        for consumer in consumers {
            if !self.consumers.contains(&consumer) {
                self.consumers.push(consumer);
            }
        }
        self
    }
}
