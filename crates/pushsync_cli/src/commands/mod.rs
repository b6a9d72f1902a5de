//! CLI command implementations.

pub mod identity;
pub mod messages;
pub mod set;
pub mod show;
pub mod sync;

use pushsync_core::{AttributeKey, AttributesSet};
use pushsync_engine::{OperationOutcome, SyncError, SyncResult};

/// One line describing what an operation did.
pub fn describe(outcome: &OperationOutcome) -> String {
    match outcome {
        OperationOutcome::NothingToSync => "nothing to sync".to_string(),
        OperationOutcome::Reconciled(report) => format!(
            "reconciled: overwritten [{}], cleared [{}]",
            key_list(&report.overwritten),
            key_list(&report.cleared)
        ),
        OperationOutcome::MessagesIngested { new_messages } if new_messages.is_empty() => {
            "no new messages".to_string()
        }
        OperationOutcome::MessagesIngested { new_messages } => {
            format!("new messages: {}", new_messages.join(", "))
        }
        OperationOutcome::SeenReported { count } => format!("reported {count} seen"),
        OperationOutcome::MoSent(messages) => format!("sent {} messages", messages.len()),
        OperationOutcome::Completed => "done".to_string(),
    }
}

/// Shown when a command needs a registration.
pub const NOT_REGISTERED: &str = "not registered; run `pushsync register <token>` first";

/// Like `describe`, treating a missing registration as a hint.
pub fn describe_result(result: SyncResult<OperationOutcome>) -> Result<String, SyncError> {
    match result {
        Ok(outcome) => Ok(describe(&outcome)),
        Err(SyncError::MissingIdentity { .. }) => {
            Ok(NOT_REGISTERED.to_string())
        }
        Err(e) => Err(e),
    }
}

/// Wire name of a key, or its variant name for local-only keys.
pub(crate) fn key_name(key: AttributeKey) -> String {
    match key.wire_name() {
        Some(name) => name.to_string(),
        None => format!("{key:?}"),
    }
}

pub(crate) fn key_list(keys: &AttributesSet) -> String {
    keys.iter().map(key_name).collect::<Vec<_>>().join(", ")
}
