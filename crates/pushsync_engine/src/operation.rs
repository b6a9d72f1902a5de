//! Sync operations and their state machine.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use pushsync_core::{
    AttrValue, AttributeKey, AttributesSet, EntityKind, Message, MoMessage, ReconcileReport,
    ResourceId,
};
use pushsync_protocol::ApiRequest;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique operation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationId(u64);

impl OperationId {
    fn next() -> Self {
        Self(NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// The kinds of operation the engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Register the push service token.
    Registration,
    /// Pull installation attributes.
    FetchInstance,
    /// Push dirty installation attributes.
    UpdateInstance,
    /// Change the primary flag of another installation.
    UpdateOtherInstance,
    /// Pull user attributes.
    FetchUser,
    /// Push dirty user attributes.
    UpdateUser,
    /// Bind the installation to a user identity.
    Personalize,
    /// Unbind the current installation from its user.
    Depersonalize,
    /// Unbind another installation from the user.
    DepersonalizeOther,
    /// Report changed system data.
    SystemData,
    /// Store incoming messages locally (no network).
    HandleMessages,
    /// Fetch messages and post delivery reports.
    FetchMessages,
    /// Report seen messages.
    ReportSeen,
    /// Send mobile-originated messages.
    SendMo,
}

impl OperationKind {
    /// Stable name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::Registration => "registration",
            OperationKind::FetchInstance => "fetch_instance",
            OperationKind::UpdateInstance => "update_instance",
            OperationKind::UpdateOtherInstance => "update_other_instance",
            OperationKind::FetchUser => "fetch_user",
            OperationKind::UpdateUser => "update_user",
            OperationKind::Personalize => "personalize",
            OperationKind::Depersonalize => "depersonalize",
            OperationKind::DepersonalizeOther => "depersonalize_other",
            OperationKind::SystemData => "system_data",
            OperationKind::HandleMessages => "handle_messages",
            OperationKind::FetchMessages => "fetch_messages",
            OperationKind::ReportSeen => "report_seen",
            OperationKind::SendMo => "send_mo",
        }
    }

    /// Returns true if the operation changes local or remote state.
    ///
    /// Only the two fetches are readers.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, OperationKind::FetchInstance | OperationKind::FetchUser)
    }

    /// Returns true if execution needs an established registration.
    pub fn requires_identity(&self) -> bool {
        !matches!(
            self,
            OperationKind::Registration | OperationKind::HandleMessages
        )
    }

    /// Returns true if the operation issues no request.
    pub fn is_local(&self) -> bool {
        matches!(self, OperationKind::HandleMessages)
    }

    /// Entity an attribute operation merges into.
    pub fn entity(&self) -> Option<EntityKind> {
        match self {
            OperationKind::Registration
            | OperationKind::FetchInstance
            | OperationKind::UpdateInstance
            | OperationKind::SystemData => Some(EntityKind::Installation),
            OperationKind::FetchUser
            | OperationKind::UpdateUser
            | OperationKind::Personalize
            | OperationKind::Depersonalize
            | OperationKind::UpdateOtherInstance
            | OperationKind::DepersonalizeOther => Some(EntityKind::User),
            _ => None,
        }
    }

    /// Default scheduling priority.
    pub fn default_priority(&self) -> Priority {
        match self {
            OperationKind::Personalize => Priority::VeryHigh,
            OperationKind::Registration | OperationKind::Depersonalize => Priority::High,
            OperationKind::ReportSeen | OperationKind::SystemData => Priority::Low,
            _ => Priority::Normal,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Scheduling priority; higher runs first within a lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Background work.
    Low,
    /// Default.
    #[default]
    Normal,
    /// Ahead of normal work.
    High,
    /// Ahead of everything else.
    VeryHigh,
}

/// Operation lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    /// Built, not started.
    Pending,
    /// Executing (including retries).
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Cancelled before or during execution.
    Cancelled,
}

impl OperationState {
    /// Returns true for the three final states.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Succeeded | OperationState::Failed | OperationState::Cancelled
        )
    }

    /// Returns true if `self -> to` is a legal transition.
    pub fn can_transition_to(&self, to: OperationState) -> bool {
        matches!(
            (self, to),
            (OperationState::Pending, OperationState::Running)
                | (OperationState::Pending, OperationState::Cancelled)
                | (OperationState::Running, OperationState::Succeeded)
                | (OperationState::Running, OperationState::Failed)
                | (OperationState::Running, OperationState::Cancelled)
        )
    }
}

/// Cooperative cancellation flag shared between an operation and its handle.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates an unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Kind-specific data an operation carries for its merge step.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationPayload {
    /// Merge the attribute response into the operation's entity, scoped.
    Attributes,
    /// Update the cached installations list entry for another installation.
    OtherInstance {
        /// Target push registration id.
        registration: String,
        /// New primary flag.
        is_primary: bool,
    },
    /// Replace the user with an empty one on success.
    Depersonalize,
    /// Drop another installation from the cached installations list.
    DepersonalizeOther {
        /// Target push registration id.
        registration: String,
    },
    /// Commit this system data hash on success.
    SystemData {
        /// Hex SHA-256 of the reported data.
        hash: String,
    },
    /// Messages to ingest locally.
    IncomingMessages(Vec<Message>),
    /// Delivery reports posted with the fetch.
    FetchMessages {
        /// Message ids reported as delivered.
        delivery_reports: Vec<String>,
    },
    /// Seen reports being sent.
    Seen {
        /// Reported message ids.
        message_ids: Vec<String>,
    },
    /// Mobile-originated messages being sent.
    Mo(Vec<MoMessage>),
}

impl OperationPayload {
    /// Returns true if the payload carries a batch with nothing in it.
    fn is_empty_batch(&self) -> bool {
        match self {
            OperationPayload::IncomingMessages(messages) => messages.is_empty(),
            OperationPayload::Seen { message_ids } => message_ids.is_empty(),
            OperationPayload::Mo(messages) => messages.is_empty(),
            _ => false,
        }
    }

    fn is_batch(&self) -> bool {
        matches!(
            self,
            OperationPayload::IncomingMessages(_)
                | OperationPayload::FetchMessages { .. }
                | OperationPayload::Seen { .. }
                | OperationPayload::Mo(_)
        )
    }
}

/// What a successful operation achieved.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    /// The snapshot was empty; nothing was sent.
    NothingToSync,
    /// An attribute response was merged.
    Reconciled(ReconcileReport),
    /// Messages were processed; lists the newly stored ones.
    MessagesIngested {
        /// Ids of messages not seen before.
        new_messages: Vec<String>,
    },
    /// Seen statuses were reported.
    SeenReported {
        /// Number of reported messages.
        count: usize,
    },
    /// Mobile-originated messages were sent; per-message status inside.
    MoSent(Vec<MoMessage>),
    /// The server accepted the request; no payload to merge.
    Completed,
}

/// Terminal result of an operation, delivered exactly once.
#[derive(Debug)]
pub enum OperationResult {
    /// The operation succeeded.
    Success {
        /// What it achieved.
        outcome: OperationOutcome,
        /// Follow-up enqueued because of this result.
        chained: Option<OperationId>,
    },
    /// The operation failed.
    Failure(SyncError),
    /// The operation was cancelled.
    Cancel,
}

impl OperationResult {
    /// A success without a follow-up.
    pub fn success(outcome: OperationOutcome) -> Self {
        OperationResult::Success {
            outcome,
            chained: None,
        }
    }

    /// Returns true for `Success`.
    pub fn is_success(&self) -> bool {
        matches!(self, OperationResult::Success { .. })
    }

    /// Returns true for `Cancel`.
    pub fn is_cancel(&self) -> bool {
        matches!(self, OperationResult::Cancel)
    }

    /// The success outcome, if any.
    pub fn outcome(&self) -> Option<&OperationOutcome> {
        match self {
            OperationResult::Success { outcome, .. } => Some(outcome),
            _ => None,
        }
    }

    /// The failure, if any.
    pub fn error(&self) -> Option<&SyncError> {
        match self {
            OperationResult::Failure(err) => Some(err),
            _ => None,
        }
    }

    /// The chained follow-up, if any.
    pub fn chained(&self) -> Option<OperationId> {
        match self {
            OperationResult::Success { chained, .. } => *chained,
            _ => None,
        }
    }

    /// Converts to a plain result; `Cancel` becomes `SyncError::Cancelled`.
    pub fn into_result(self) -> SyncResult<OperationOutcome> {
        match self {
            OperationResult::Success { outcome, .. } => Ok(outcome),
            OperationResult::Failure(err) => Err(err),
            OperationResult::Cancel => Err(SyncError::Cancelled),
        }
    }
}

/// A unit of sync work.
///
/// The attribute snapshot and the request are fixed at construction; every
/// attempt sends the same request.
pub struct SyncOperation {
    id: OperationId,
    kind: OperationKind,
    resource_id: ResourceId,
    scope: AttributesSet,
    sent: BTreeMap<AttributeKey, AttrValue>,
    priority: Priority,
    request: Option<ApiRequest>,
    payload: OperationPayload,
    state: Mutex<OperationState>,
    cancel: CancelToken,
}

impl SyncOperation {
    /// Creates an operation.
    ///
    /// Returns `None` when there is nothing to do: an attribute operation
    /// with an empty scope, or a batch operation with an empty batch.
    pub fn new(
        kind: OperationKind,
        resource_id: ResourceId,
        scope: AttributesSet,
        request: Option<ApiRequest>,
        payload: OperationPayload,
    ) -> Option<Self> {
        if payload.is_batch() {
            if payload.is_empty_batch() {
                return None;
            }
        } else if scope.is_empty() {
            return None;
        }
        Some(Self {
            id: OperationId::next(),
            kind,
            resource_id,
            scope,
            sent: BTreeMap::new(),
            priority: kind.default_priority(),
            request,
            payload,
            state: Mutex::new(OperationState::Pending),
            cancel: CancelToken::new(),
        })
    }

    /// Overrides the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Records the attribute values carried by the request body.
    pub fn with_sent(mut self, sent: BTreeMap<AttributeKey, AttrValue>) -> Self {
        self.sent = sent;
        self
    }

    /// Operation id.
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Operation kind.
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Attribute values the request sends; empty for fetches.
    pub fn sent(&self) -> &BTreeMap<AttributeKey, AttrValue> {
        &self.sent
    }

    /// Target resource; the queue lane key.
    pub fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }

    /// Attribute snapshot.
    pub fn scope(&self) -> &AttributesSet {
        &self.scope
    }

    /// Scheduling priority.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// The request every attempt sends (none for local operations).
    pub fn request(&self) -> Option<&ApiRequest> {
        self.request.as_ref()
    }

    /// Retries allowed after transient failures.
    pub fn retry_limit(&self) -> u32 {
        self.request.as_ref().map(|r| r.retry_limit).unwrap_or(0)
    }

    /// Kind-specific merge data.
    pub fn payload(&self) -> &OperationPayload {
        &self.payload
    }

    /// Returns true if the operation is a lane writer.
    pub fn is_mutating(&self) -> bool {
        self.kind.is_mutating()
    }

    /// Current state.
    pub fn state(&self) -> OperationState {
        *self.state.lock()
    }

    /// Moves to `to`, rejecting illegal transitions.
    pub fn transition(&self, to: OperationState) -> SyncResult<()> {
        let mut state = self.state.lock();
        if !state.can_transition_to(to) {
            return Err(SyncError::InvalidStateTransition {
                from: format!("{:?}", *state),
                to: format!("{:?}", to),
            });
        }
        *state = to;
        Ok(())
    }

    /// The operation's cancellation token.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl fmt::Debug for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOperation")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("resource_id", &self.resource_id)
            .field("scope", &self.scope)
            .field("priority", &self.priority)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetch(scope: AttributesSet) -> Option<SyncOperation> {
        let reg = ResourceId::new("reg-1");
        SyncOperation::new(
            OperationKind::FetchUser,
            reg.clone(),
            scope,
            Some(ApiRequest::fetch_user(reg)),
            OperationPayload::Attributes,
        )
    }

    #[test]
    fn empty_scope_is_nothing_to_do() {
        assert!(fetch(AttributesSet::new()).is_none());
        assert!(fetch(AttributesSet::from([AttributeKey::FirstName])).is_some());
    }

    #[test]
    fn empty_batch_is_nothing_to_do() {
        let op = SyncOperation::new(
            OperationKind::HandleMessages,
            ResourceId::new("messages"),
            AttributesSet::new(),
            None,
            OperationPayload::IncomingMessages(Vec::new()),
        );
        assert!(op.is_none());
    }

    #[test]
    fn state_machine() {
        let op = fetch(AttributesSet::from([AttributeKey::FirstName])).unwrap();
        assert_eq!(op.state(), OperationState::Pending);

        assert!(op.transition(OperationState::Succeeded).is_err());
        op.transition(OperationState::Running).unwrap();
        op.transition(OperationState::Succeeded).unwrap();
        assert!(op.state().is_terminal());

        let err = op.transition(OperationState::Running).unwrap_err();
        assert!(matches!(err, SyncError::InvalidStateTransition { .. }));
    }

    #[test]
    fn pending_can_be_cancelled() {
        let op = fetch(AttributesSet::from([AttributeKey::FirstName])).unwrap();
        op.transition(OperationState::Cancelled).unwrap();
        assert!(op.transition(OperationState::Running).is_err());
    }

    #[test]
    fn ids_are_unique_and_ordered() {
        let a = fetch(AttributesSet::from([AttributeKey::FirstName])).unwrap();
        let b = fetch(AttributesSet::from([AttributeKey::FirstName])).unwrap();
        assert!(a.id() < b.id());
        assert!(a.id().to_string().starts_with("op-"));
    }

    #[test]
    fn kind_table() {
        assert!(!OperationKind::FetchInstance.is_mutating());
        assert!(OperationKind::HandleMessages.is_mutating());
        assert!(!OperationKind::Registration.requires_identity());
        assert_eq!(
            OperationKind::Personalize.default_priority(),
            Priority::VeryHigh
        );
        assert!(Priority::VeryHigh > Priority::Normal);
    }

    #[test]
    fn cancel_token_is_shared() {
        let op = fetch(AttributesSet::from([AttributeKey::FirstName])).unwrap();
        let token = op.cancel_token().clone();
        token.cancel();
        assert!(op.is_cancelled());
    }

    #[test]
    fn cancel_result_maps_to_cancelled_error() {
        assert!(matches!(
            OperationResult::Cancel.into_result(),
            Err(SyncError::Cancelled)
        ));
        let ok = OperationResult::success(OperationOutcome::NothingToSync);
        assert!(ok.is_success());
        assert_eq!(ok.chained(), None);
    }
}
