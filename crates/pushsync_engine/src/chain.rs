//! Follow-up operations.

use crate::operation::{OperationKind, OperationOutcome, OperationResult};

/// A follow-up operation the queue should build and enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    /// Fetch messages from the server.
    FetchMessages,
}

/// Maps a finished operation to zero or one follow-up.
pub trait ChainPolicy: Send + Sync {
    /// Returns the follow-up for `(kind, result)`, if any.
    fn follow_up(&self, kind: OperationKind, result: &OperationResult) -> Option<FollowUp>;
}

/// Ingesting at least one new message chains a message fetch; nothing else
/// chains.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultChainPolicy;

impl ChainPolicy for DefaultChainPolicy {
    fn follow_up(&self, kind: OperationKind, result: &OperationResult) -> Option<FollowUp> {
        match (kind, result.outcome()) {
            (
                OperationKind::HandleMessages,
                Some(OperationOutcome::MessagesIngested { new_messages }),
            ) if !new_messages.is_empty() => Some(FollowUp::FetchMessages),
            _ => None,
        }
    }
}

/// Never chains.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoChain;

impl ChainPolicy for NoChain {
    fn follow_up(&self, _kind: OperationKind, _result: &OperationResult) -> Option<FollowUp> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;

    fn ingested(ids: &[&str]) -> OperationResult {
        OperationResult::success(OperationOutcome::MessagesIngested {
            new_messages: ids.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[test]
    fn new_messages_chain_a_fetch() {
        let policy = DefaultChainPolicy;
        assert_eq!(
            policy.follow_up(OperationKind::HandleMessages, &ingested(&["m1"])),
            Some(FollowUp::FetchMessages)
        );
    }

    #[test]
    fn no_new_messages_no_chain() {
        assert_eq!(
            DefaultChainPolicy.follow_up(OperationKind::HandleMessages, &ingested(&[])),
            None
        );
    }

    #[test]
    fn never_on_cancel_or_failure() {
        let policy = DefaultChainPolicy;
        assert_eq!(
            policy.follow_up(OperationKind::HandleMessages, &OperationResult::Cancel),
            None
        );
        assert_eq!(
            policy.follow_up(
                OperationKind::HandleMessages,
                &OperationResult::Failure(SyncError::Timeout)
            ),
            None
        );
    }

    #[test]
    fn other_kinds_never_chain() {
        assert_eq!(
            DefaultChainPolicy.follow_up(OperationKind::FetchMessages, &ingested(&["m1"])),
            None
        );
        assert_eq!(
            NoChain.follow_up(OperationKind::HandleMessages, &ingested(&["m1"])),
            None
        );
    }
}
