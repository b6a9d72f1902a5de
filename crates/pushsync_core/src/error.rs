//! Error types for pushsync core.

use crate::attribute::{AttributeKey, EntityKind};
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The state directory is held by another process.
    #[error("store locked: another process has exclusive access")]
    StoreLocked,

    /// The state directory is missing or malformed.
    #[error("invalid store layout: {message}")]
    InvalidLayout {
        /// Description of the problem.
        message: String,
    },

    /// An attribute was written to an entity of the wrong kind.
    #[error("attribute {key:?} does not belong to {kind} entity")]
    ForeignAttribute {
        /// Attribute that was rejected.
        key: AttributeKey,
        /// Kind of the entity it was written to.
        kind: EntityKind,
    },

    /// A persisted entity has a different kind than requested.
    #[error("entity kind mismatch: expected {expected}, found {found}")]
    KindMismatch {
        /// Requested kind.
        expected: EntityKind,
        /// Kind found in storage.
        found: EntityKind,
    },
}

impl CoreError {
    /// Creates an invalid layout error.
    pub fn invalid_layout(message: impl Into<String>) -> Self {
        Self::InvalidLayout {
            message: message.into(),
        }
    }
}
