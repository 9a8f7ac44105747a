//! Reply status codes for transactional requests

use serde::{Deserialize, Serialize};

/// Status carried on every transactional reply
///
/// Codes follow the broker session protocol, which borrows HTTP numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum Status {
    /// Request processed
    Ok = 200,
    /// Request had no effect (e.g. END on a transaction that already failed)
    NotModified = 304,
    /// Malformed request (missing transaction id, unknown Xid, bad ack block)
    BadRequest = 400,
    /// Unknown transaction, consumer or message
    NotFound = 404,
    /// Remote broker did not answer in time
    Timeout = 408,
    /// Operation illegal in the current state
    Conflict = 409,
    /// Referenced state disappeared (message requeued, broker gone)
    Gone = 410,
    /// Internal failure
    Error = 500,
    /// Feature not supported by this broker
    NotImplemented = 501,
}

impl Status {
    /// Returns true if this status reports success
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// Returns true if a client may retry the same request unchanged
    pub fn is_retriable(&self) -> bool {
        matches!(self, Status::Timeout | Status::Gone)
    }

    /// Wire representation
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// Parse a wire code
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            200 => Some(Status::Ok),
            304 => Some(Status::NotModified),
            400 => Some(Status::BadRequest),
            404 => Some(Status::NotFound),
            408 => Some(Status::Timeout),
            409 => Some(Status::Conflict),
            410 => Some(Status::Gone),
            500 => Some(Status::Error),
            501 => Some(Status::NotImplemented),
            _ => None,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::Ok => "OK",
            Status::NotModified => "NOT_MODIFIED",
            Status::BadRequest => "BAD_REQUEST",
            Status::NotFound => "NOT_FOUND",
            Status::Timeout => "TIMEOUT",
            Status::Conflict => "CONFLICT",
            Status::Gone => "GONE",
            Status::Error => "ERROR",
            Status::NotImplemented => "NOT_IMPLEMENTED",
        };
        write!(f, "{} ({})", name, self.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes() {
        assert_eq!(Status::Ok.as_u16(), 200);
        assert_eq!(Status::Conflict.as_u16(), 409);
        assert_eq!(Status::from_u16(410), Some(Status::Gone));
        assert_eq!(Status::from_u16(418), None);
    }

    #[test]
    fn test_retriable() {
        assert!(Status::Timeout.is_retriable());
        assert!(Status::Gone.is_retriable());
        assert!(!Status::Conflict.is_retriable());
        assert!(!Status::BadRequest.is_retriable());
    }

    #[test]
    fn test_display() {
        assert_eq!(Status::NotFound.to_string(), "NOT_FOUND (404)");
    }
}
