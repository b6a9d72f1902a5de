//! Protocol errors.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while decoding responses.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Body is not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Body is JSON but does not have the expected shape.
    #[error("malformed {request} response: {reason}")]
    Malformed {
        /// Request the response belongs to.
        request: &'static str,
        /// What was wrong.
        reason: String,
    },
}

impl ProtocolError {
    /// Creates a malformed-shape error.
    pub fn malformed(request: &'static str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            request,
            reason: reason.into(),
        }
    }
}
