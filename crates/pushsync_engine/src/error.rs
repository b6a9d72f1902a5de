//! Error types for the sync engine.

use pushsync_core::CoreError;
use pushsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Coarse error classes used by the retry decision table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeouts and connection failures; retried up to the request's limit.
    Transient,
    /// Identity problems; terminal, dirty marks are kept.
    Auth,
    /// Undecodable or rejected exchanges; terminal.
    Malformed,
    /// Cooperative cancellation.
    Cancelled,
    /// Local failures (store, queue, caller input).
    Local,
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// No registration is established for the resource.
    #[error("no established identity for resource {resource}")]
    MissingIdentity {
        /// Resource the operation targeted.
        resource: String,
    },

    /// Connection failure or retryable server status.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// The request timed out.
    #[error("request timed out")]
    Timeout,

    /// The server rejected the credentials or the registration.
    #[error("authentication or registration invalid: {0}")]
    AuthOrRegistrationInvalid(String),

    /// The response could not be interpreted.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The server rejected the request for another reason.
    #[error("request rejected with status {status}: {message}")]
    Rejected {
        /// HTTP status.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Local persistence failed.
    #[error("store error: {0}")]
    Store(#[from] CoreError),

    /// The queue was shut down.
    #[error("operation queue is closed")]
    QueueClosed,

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// The current installation cannot depersonalize itself through the
    /// other-installation call.
    #[error("cannot depersonalize the current registration; use depersonalize instead")]
    CantDepersonalizeCurrent,

    /// The caller passed unusable input.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::MalformedResponse(err.to_string())
    }
}

impl SyncError {
    /// Creates a missing-identity error for a resource.
    pub fn missing_identity(resource: impl std::fmt::Display) -> Self {
        Self::MissingIdentity {
            resource: resource.to_string(),
        }
    }

    /// The error's class in the retry decision table.
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::TransientNetwork(_) | SyncError::Timeout => ErrorClass::Transient,
            SyncError::MissingIdentity { .. } | SyncError::AuthOrRegistrationInvalid(_) => {
                ErrorClass::Auth
            }
            SyncError::MalformedResponse(_) | SyncError::Rejected { .. } => ErrorClass::Malformed,
            SyncError::Cancelled => ErrorClass::Cancelled,
            SyncError::Store(_)
            | SyncError::QueueClosed
            | SyncError::InvalidStateTransition { .. }
            | SyncError::CantDepersonalizeCurrent
            | SyncError::InvalidInput(_) => ErrorClass::Local,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::TransientNetwork("connection reset".into()).is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(!SyncError::AuthOrRegistrationInvalid("401".into()).is_retryable());
        assert!(!SyncError::MalformedResponse("bad json".into()).is_retryable());
        assert!(!SyncError::missing_identity("reg").is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::QueueClosed.is_retryable());
    }

    #[test]
    fn classes() {
        assert_eq!(SyncError::missing_identity("r").class(), ErrorClass::Auth);
        assert_eq!(
            SyncError::Rejected {
                status: 400,
                message: String::new()
            }
            .class(),
            ErrorClass::Malformed
        );
        assert_eq!(SyncError::Cancelled.class(), ErrorClass::Cancelled);
    }

    #[test]
    fn protocol_errors_become_malformed() {
        let err: SyncError = ProtocolError::malformed("fetch_user", "not an object").into();
        assert!(matches!(err, SyncError::MalformedResponse(_)));
        assert!(err.to_string().contains("fetch_user"));
    }

    #[test]
    fn error_display() {
        let err = SyncError::missing_identity("reg-1");
        assert_eq!(err.to_string(), "no established identity for resource reg-1");
    }
}
