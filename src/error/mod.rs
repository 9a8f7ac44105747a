//! Error types for Streamline transactions
//!
//! This module defines the error type used throughout the transactional
//! delivery engine and the mapping of every error onto a reply [`Status`].
//! Errors that originated on another broker additionally carry the remote
//! flag and the consumers the client should react to.

use thiserror::Error;

mod domain;
mod status;

pub use domain::{ConfigError, ProtocolError, RemoteFailure, RemoteFailureKind, StorageError};
pub use status::Status;

use crate::message::{ConsumerId, MessageId};
use crate::transaction::{TransactionId, TransitionError, TransitionErrorKind};

/// Result type alias for Streamline operations
pub type Result<T> = std::result::Result<T, StreamlineError>;

/// Main error type for Streamline transactions
#[derive(Error, Debug)]
pub enum StreamlineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Storage error: {0}")]
    StorageDomain(#[from] StorageError),

    #[error("Protocol error: {0}")]
    ProtocolDomain(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration error: {0}")]
    ConfigDomain(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    #[error("Transaction already exists: {0}")]
    DuplicateTransaction(TransactionId),

    #[error("Unknown Xid: {0}")]
    UnknownXid(String),

    #[error("Illegal transaction transition: {0}")]
    Transition(#[from] TransitionError),

    #[error("Transaction conflict: {0}")]
    Conflict(String),

    #[error("Gone: {0}")]
    Gone(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(ConsumerId),

    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    #[error("Remote broker failure: {0}")]
    Remote(#[from] RemoteFailure),

    #[error("Message {message} exceeded {max} consecutive rollbacks for consumer {consumer}")]
    MaxRollbacksExceeded {
        message: MessageId,
        consumer: ConsumerId,
        max: i32,
    },

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Server is shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StreamlineError {
    // ========== Error Context Builders ==========

    /// Create a storage error with operation context
    ///
    /// # Example
    /// ```ignore
    /// StreamlineError::storage("append", "disk full")
    /// // produces: "Storage error: append: disk full"
    /// ```
    pub fn storage(operation: &str, detail: impl Into<String>) -> Self {
        StreamlineError::StorageDomain(StorageError::operation(operation, detail))
    }

    /// Create a protocol error from a message string
    pub fn protocol_msg(msg: impl Into<String>) -> Self {
        StreamlineError::ProtocolDomain(ProtocolError::Message(msg.into()))
    }

    /// Create a protocol error with context
    pub fn protocol(operation: &str, detail: impl Into<String>) -> Self {
        StreamlineError::ProtocolDomain(ProtocolError::operation(operation, detail))
    }

    /// Create a protocol error for invalid field values
    pub fn protocol_invalid_field(field: &str, reason: impl Into<String>) -> Self {
        StreamlineError::ProtocolDomain(ProtocolError::invalid_field(field, reason))
    }

    /// Create a protocol error for a required field that is absent
    pub fn protocol_missing(field: &str) -> Self {
        StreamlineError::ProtocolDomain(ProtocolError::missing(field))
    }

    /// Create a configuration error with context
    pub fn config(setting: &str, reason: impl Into<String>) -> Self {
        StreamlineError::ConfigDomain(ConfigError::invalid_setting(setting, reason))
    }

    // ========== Reply Mapping ==========

    /// Status reported to the client for this error
    pub fn status(&self) -> Status {
        match self {
            StreamlineError::Io(_)
            | StreamlineError::Storage(_)
            | StreamlineError::StorageDomain(_)
            | StreamlineError::Serialization(_) => Status::Error,
            StreamlineError::ProtocolDomain(_) => Status::BadRequest,
            StreamlineError::Config(_) | StreamlineError::ConfigDomain(_) => Status::Error,
            StreamlineError::TransactionNotFound(_) => Status::NotFound,
            StreamlineError::DuplicateTransaction(_) => Status::Conflict,
            StreamlineError::UnknownXid(_) => Status::BadRequest,
            StreamlineError::Transition(e) => match e.kind {
                TransitionErrorKind::NotModified => Status::NotModified,
                TransitionErrorKind::FailedState => Status::Error,
                TransitionErrorKind::Illegal => Status::Conflict,
            },
            StreamlineError::Conflict(_) => Status::Conflict,
            StreamlineError::Gone(_) => Status::Gone,
            StreamlineError::NotImplemented(_) => Status::NotImplemented,
            StreamlineError::ConsumerNotFound(_) => Status::NotFound,
            StreamlineError::MessageNotFound(_) => Status::NotFound,
            StreamlineError::Remote(r) => r.kind.status(),
            StreamlineError::MaxRollbacksExceeded { .. } => Status::Error,
            StreamlineError::ResourceExhausted(_) => Status::Error,
            StreamlineError::ShuttingDown => Status::Error,
            StreamlineError::Internal(_) => Status::Error,
        }
    }

    /// Returns true if this error originated on another broker
    pub fn is_remote(&self) -> bool {
        matches!(self, StreamlineError::Remote(_))
    }

    /// Consumers implicated by a remote failure
    pub fn affected_consumers(&self) -> &[ConsumerId] {
        match self {
            StreamlineError::Remote(r) => &r.consumers,
            _ => &[],
        }
    }

    /// Returns true if this error is a durability failure of the transaction log
    pub fn is_durability_failure(&self) -> bool {
        matches!(
            self,
            StreamlineError::Io(_) | StreamlineError::Storage(_) | StreamlineError::StorageDomain(_)
        )
    }

    /// Returns true if the client may resend the same request
    pub fn is_retriable(&self) -> bool {
        self.status().is_retriable()
    }
}

impl From<&StreamlineError> for u16 {
    fn from(err: &StreamlineError) -> u16 {
        err.status().as_u16()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::BrokerAddress;
    use crate::transaction::{Operation, TransactionStatus};
    use std::io;

    #[test]
    fn test_io_error_display() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: StreamlineError = io_err.into();
        assert!(err.to_string().contains("IO error"));
        assert_eq!(err.status(), Status::Error);
        assert!(err.is_durability_failure());
    }

    #[test]
    fn test_storage_builder() {
        let err = StreamlineError::storage("append", "disk full");
        assert_eq!(err.to_string(), "Storage error: append: disk full");
    }

    #[test]
    fn test_protocol_errors_are_bad_request() {
        let err = StreamlineError::protocol_missing("transaction id");
        assert_eq!(err.status(), Status::BadRequest);
        assert_eq!(err.to_string(), "Protocol error: missing transaction id");

        let err = StreamlineError::UnknownXid("fmt=1".to_string());
        assert_eq!(err.status(), Status::BadRequest);
    }

    #[test]
    fn test_not_found_mapping() {
        let err = StreamlineError::TransactionNotFound(TransactionId::new(42));
        assert_eq!(err.status(), Status::NotFound);
        assert!(!err.is_remote());
        assert!(err.affected_consumers().is_empty());
    }

    #[test]
    fn test_transition_mapping() {
        let illegal = TransitionError {
            kind: TransitionErrorKind::Illegal,
            operation: Operation::Commit,
            flags: None,
            from: TransactionStatus::Started,
            fail_from: None,
        };
        assert_eq!(StreamlineError::from(illegal).status(), Status::Conflict);

        let not_modified = TransitionError {
            kind: TransitionErrorKind::NotModified,
            operation: Operation::End,
            flags: None,
            from: TransactionStatus::Failed,
            fail_from: Some(TransactionStatus::Started),
        };
        assert_eq!(StreamlineError::from(not_modified).status(), Status::NotModified);
    }

    #[test]
    fn test_remote_failure_carries_consumers() {
        let failure = RemoteFailure::broker_down(BrokerAddress::new("broker-b:7676"), "link lost")
            .with_consumers([ConsumerId(7), ConsumerId(9), ConsumerId(7)]);
        let err = StreamlineError::from(failure);

        assert!(err.is_remote());
        assert_eq!(err.status(), Status::Gone);
        assert_eq!(err.affected_consumers(), &[ConsumerId(7), ConsumerId(9)]);
        assert!(err.is_retriable());
    }

    #[test]
    fn test_status_code_conversion() {
        let err = StreamlineError::NotImplemented("lifetime".to_string());
        assert_eq!(u16::from(&err), 501);
    }
}
