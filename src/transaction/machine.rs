//! Transaction state machine
//!
//! Pure transition functions: given the current state, the operation and
//! the XA flags, compute the next state or reject the transition. Nothing
//! here mutates a transaction; callers apply the result through the
//! registry.

use crate::transaction::state::{Operation, TransactionState, TransactionStatus};
use crate::transaction::xa::XaFlags;
use std::fmt;
use thiserror::Error;

/// How an illegal transition is reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionErrorKind {
    /// END on a transaction that failed while started
    NotModified,
    /// Any other operation on a FAILED transaction
    FailedState,
    /// Operation not allowed in the current state
    Illegal,
}

/// A rejected state transition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct TransitionError {
    pub kind: TransitionErrorKind,
    pub operation: Operation,
    pub flags: Option<XaFlags>,
    pub from: TransactionStatus,
    pub fail_from: Option<TransactionStatus>,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = self.flags.unwrap_or_default();
        match self.kind {
            TransitionErrorKind::NotModified => write!(
                f,
                "{} [{}] on transaction that failed while {}",
                self.operation,
                flags,
                self.fail_from.unwrap_or(TransactionStatus::Started)
            ),
            TransitionErrorKind::FailedState => write!(
                f,
                "{} [{}] not allowed on FAILED transaction (failed from {})",
                self.operation,
                flags,
                self.fail_from
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            ),
            TransitionErrorKind::Illegal => write!(
                f,
                "{} [{}] not allowed in state {}",
                self.operation, flags, self.from
            ),
        }
    }
}

/// Compute the next state of a transaction
///
/// Local transactions commit and roll back directly from any live state;
/// XA transactions follow the full flag matrix.
pub fn next_state(
    status: TransactionStatus,
    fail_from: Option<TransactionStatus>,
    xa: bool,
    operation: Operation,
    flags: Option<XaFlags>,
) -> Result<TransactionStatus, TransitionError> {
    use TransactionStatus::*;

    let set = |flag| XaFlags::is_set(flags, flag);

    let next = match operation {
        Operation::Start => {
            if set(XaFlags::NOFLAGS) {
                matches!(status, Created | Started | Complete).then_some(Started)
            } else if set(XaFlags::JOIN) {
                matches!(status, Started | Complete).then_some(Started)
            } else if set(XaFlags::RESUME) {
                matches!(status, Started).then_some(Started)
            } else {
                None
            }
        }
        Operation::End => {
            if set(XaFlags::SUSPEND) {
                matches!(status, Started).then_some(Started)
            } else if set(XaFlags::FAIL) {
                matches!(status, Started | Failed).then_some(Failed)
            } else if set(XaFlags::SUCCESS) || set(XaFlags::ONEPHASE) {
                matches!(status, Started | Complete).then_some(Complete)
            } else {
                None
            }
        }
        Operation::Prepare => matches!(status, Complete | Prepared).then_some(Prepared),
        // COMMITTED again finishes a commit whose completion was never recorded
        Operation::Commit if !xa => {
            matches!(status, Started | Complete | Prepared | Committed).then_some(Committed)
        }
        Operation::Commit => {
            if set(XaFlags::ONEPHASE) {
                matches!(status, Complete | Committed).then_some(Committed)
            } else {
                matches!(status, Prepared | Committed).then_some(Committed)
            }
        }
        Operation::Rollback if !xa => {
            matches!(status, Started | Complete | Prepared | Failed).then_some(RolledBack)
        }
        Operation::Rollback => {
            matches!(status, Complete | Prepared | Failed | RolledBack).then_some(RolledBack)
        }
        Operation::Recover => None,
    };

    next.ok_or_else(|| {
        let kind = if status == Failed {
            if operation == Operation::End && fail_from == Some(Started) {
                TransitionErrorKind::NotModified
            } else {
                TransitionErrorKind::FailedState
            }
        } else {
            TransitionErrorKind::Illegal
        };
        TransitionError {
            kind,
            operation,
            flags,
            from: status,
            fail_from,
        }
    })
}

/// Next state for a transaction driven by another broker's outcome
pub fn remote_next_state(
    status: TransactionStatus,
    target: TransactionStatus,
) -> Result<TransactionStatus, TransitionError> {
    use TransactionStatus::*;

    let legal = match target {
        Committed => matches!(status, Prepared | Committed),
        RolledBack => matches!(status, Prepared | RolledBack),
        _ => false,
    };
    if legal {
        Ok(target)
    } else {
        Err(TransitionError {
            kind: TransitionErrorKind::Illegal,
            operation: if target == RolledBack {
                Operation::Rollback
            } else {
                Operation::Commit
            },
            flags: None,
            from: status,
            fail_from: None,
        })
    }
}

impl TransactionState {
    /// Next state for `operation` from this state
    pub fn next_state(
        &self,
        operation: Operation,
        flags: Option<XaFlags>,
    ) -> Result<TransactionStatus, TransitionError> {
        next_state(self.status, self.fail_from, self.is_xa(), operation, flags)
    }
}
