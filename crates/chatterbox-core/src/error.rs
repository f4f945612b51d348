//! Error taxonomy for coordinator operations.
//!
//! Every error is scoped to the connection that triggered it: a failing
//! operation is reported back to the originating client as an
//! `operation-error` event and must never disturb concurrent operations
//! for other identities or call sessions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::history::StorageError;

/// Error category surfaced to clients in `operation-error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Malformed or oversized input; rejected before persistence.
    Validation,
    /// Durable message store is unreachable; the client should retry
    /// with backoff. No automatic server-side retry.
    StorageUnavailable,
    /// Call peer cannot be reached: callee offline at `call-user`, or
    /// the caller's connection went stale before `call-accept`.
    CallPeerUnreachable,
    /// A non-terminal call session already exists for this user pair.
    Busy,
    /// Unexpected fault; logged server-side, generic message surfaced.
    Internal,
}

/// Errors produced by coordinator operations.
#[derive(Error, Debug)]
pub enum SignalError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("message store unavailable: {0}")]
    StorageUnavailable(String),

    #[error("call peer unreachable: {0}")]
    CallPeerUnreachable(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SignalError {
    /// The client-facing error category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SignalError::Validation(_) => ErrorKind::Validation,
            SignalError::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            SignalError::CallPeerUnreachable(_) => ErrorKind::CallPeerUnreachable,
            SignalError::Busy(_) => ErrorKind::Busy,
            SignalError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The message surfaced to the client.
    ///
    /// Internal faults get a generic message; details stay in the server log.
    pub fn client_message(&self) -> String {
        match self {
            SignalError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<StorageError> for SignalError {
    fn from(e: StorageError) -> Self {
        SignalError::StorageUnavailable(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            SignalError::Validation("too long".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            SignalError::Busy("pair in call".into()).kind(),
            ErrorKind::Busy
        );
    }

    #[test]
    fn test_internal_message_is_generic() {
        let err = SignalError::Internal("sqlite page corrupt".into());
        assert_eq!(err.client_message(), "internal server error");
        // The Display impl keeps the detail for logging.
        assert!(err.to_string().contains("sqlite page corrupt"));
    }

    #[test]
    fn test_kind_serialization() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::StorageUnavailable).unwrap(),
            "\"storage-unavailable\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorKind::CallPeerUnreachable).unwrap(),
            "\"call-peer-unreachable\""
        );
    }
}
