//! Executing operations.

use crate::error::{SyncError, SyncResult};
use crate::events::{EventSink, SyncEvent};
use crate::identity::IdentityCheck;
use crate::operation::{
    OperationKind, OperationOutcome, OperationPayload, OperationResult, OperationState,
    SyncOperation,
};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::transport::NetworkClient;
use pushsync_core::{
    AttrValue, AttributeKey, AttributeTracker, AttributesSet, Entity, EntityKind, Message,
    MessageStore, MoMessage, MoStatus, Reconciler,
};
use pushsync_protocol::{AttributeFields, ResponsePayload};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::Instrument;

/// Runs operations against the network and commits their results.
pub struct Executor {
    network: Arc<dyn NetworkClient>,
    identity: Arc<dyn IdentityCheck>,
    installation: Arc<AttributeTracker>,
    user: Arc<AttributeTracker>,
    messages: Arc<dyn MessageStore>,
    events: Arc<dyn EventSink>,
    retry: RetryPolicy,
}

impl Executor {
    /// Creates an executor.
    pub fn new(
        network: Arc<dyn NetworkClient>,
        identity: Arc<dyn IdentityCheck>,
        installation: Arc<AttributeTracker>,
        user: Arc<AttributeTracker>,
        messages: Arc<dyn MessageStore>,
        events: Arc<dyn EventSink>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            network,
            identity,
            installation,
            user,
            messages,
            events,
            retry,
        }
    }

    fn tracker(&self, kind: EntityKind) -> &AttributeTracker {
        match kind {
            EntityKind::Installation => &self.installation,
            EntityKind::User => &self.user,
        }
    }

    /// Runs one attempt.
    ///
    /// Checkpoints, in order: cancellation, identity, the single network
    /// call, cancellation again, then the commit. An attempt that stops at a
    /// checkpoint performs no I/O past it.
    pub async fn execute_once(&self, op: &SyncOperation) -> SyncResult<OperationOutcome> {
        if op.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        if op.kind().requires_identity() && !self.identity.is_resource_healthy(op.resource_id()) {
            return Err(SyncError::missing_identity(op.resource_id()));
        }

        let response = match op.request() {
            Some(request) => Some(self.network.send(request).await?),
            None => None,
        };

        if op.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        self.commit(op, response)
    }

    /// Runs an operation to a terminal state, retrying transient failures
    /// with the operation's original request.
    pub async fn execute(&self, op: &SyncOperation) -> OperationResult {
        let span = tracing::info_span!(
            "operation",
            id = %op.id(),
            kind = %op.kind(),
            resource = %op.resource_id()
        );
        self.run(op).instrument(span).await
    }

    async fn run(&self, op: &SyncOperation) -> OperationResult {
        if op.is_cancelled() {
            return self.finish(op, OperationState::Cancelled, OperationResult::Cancel);
        }
        if let Err(err) = op.transition(OperationState::Running) {
            return OperationResult::Failure(err);
        }
        tracing::debug!(scope = op.scope().len(), "operation started");
        self.events.emit(SyncEvent::OperationStarted {
            id: op.id(),
            kind: op.kind(),
        });

        let mut retries = 0;
        loop {
            match self.execute_once(op).await {
                Ok(outcome) => {
                    return self.finish(
                        op,
                        OperationState::Succeeded,
                        OperationResult::success(outcome),
                    );
                }
                Err(SyncError::Cancelled) => {
                    return self.finish(op, OperationState::Cancelled, OperationResult::Cancel);
                }
                Err(err) => match self.retry.decide(&err, retries, op.retry_limit()) {
                    RetryDecision::Retry { delay } => {
                        retries += 1;
                        tracing::warn!(error = %err, retry = retries, ?delay, "retrying operation");
                        self.events.emit(SyncEvent::OperationRetrying {
                            id: op.id(),
                            kind: op.kind(),
                            retry: retries,
                            delay,
                        });
                        tokio::time::sleep(delay).await;
                    }
                    RetryDecision::Fail => {
                        return self.finish(
                            op,
                            OperationState::Failed,
                            OperationResult::Failure(err),
                        );
                    }
                },
            }
        }
    }

    fn finish(
        &self,
        op: &SyncOperation,
        state: OperationState,
        result: OperationResult,
    ) -> OperationResult {
        if let Err(err) = op.transition(state) {
            tracing::warn!(error = %err, "unexpected operation state");
        }
        let event = match &result {
            OperationResult::Success { .. } => {
                tracing::info!("operation succeeded");
                SyncEvent::OperationSucceeded {
                    id: op.id(),
                    kind: op.kind(),
                }
            }
            OperationResult::Failure(err) => {
                tracing::warn!(error = %err, "operation failed");
                SyncEvent::OperationFailed {
                    id: op.id(),
                    kind: op.kind(),
                    error: err.to_string(),
                }
            }
            OperationResult::Cancel => {
                tracing::debug!("operation cancelled");
                SyncEvent::OperationCancelled {
                    id: op.id(),
                    kind: op.kind(),
                }
            }
        };
        self.events.emit(event);
        result
    }

    fn commit(
        &self,
        op: &SyncOperation,
        response: Option<ResponsePayload>,
    ) -> SyncResult<OperationOutcome> {
        match op.payload() {
            OperationPayload::Attributes => self.merge_attributes(op, response),
            OperationPayload::OtherInstance {
                registration,
                is_primary,
            } => {
                let is_primary = *is_primary;
                self.record_primary(registration, is_primary)?;
                if is_primary
                    && self.installation.get(AttributeKey::IsPrimaryDevice) == Some(json!(true))
                {
                    self.installation
                        .set_current(AttributeKey::IsPrimaryDevice, json!(false))?;
                }
                Ok(OperationOutcome::Completed)
            }
            OperationPayload::Depersonalize => {
                self.user.replace(Entity::empty(EntityKind::User))?;
                self.events.emit(SyncEvent::EntityChanged {
                    kind: EntityKind::User,
                    keys: AttributesSet::of_kind(EntityKind::User),
                });
                Ok(OperationOutcome::Completed)
            }
            OperationPayload::DepersonalizeOther { registration } => {
                self.edit_installations(|list| remove_installation(list, registration))?;
                Ok(OperationOutcome::Completed)
            }
            OperationPayload::SystemData { hash } => {
                self.installation
                    .set_current(AttributeKey::SystemDataHash, json!(hash))?;
                Ok(OperationOutcome::Completed)
            }
            OperationPayload::IncomingMessages(messages) => Ok(self.ingest(messages)),
            OperationPayload::FetchMessages { delivery_reports } => {
                let messages = match response {
                    Some(ResponsePayload::Messages(messages)) => messages,
                    other => return Err(unexpected(op, other.as_ref())),
                };
                self.messages.mark_delivery_reported(delivery_reports);
                Ok(self.ingest(&messages))
            }
            OperationPayload::Seen { message_ids } => {
                self.messages.mark_seen_reported(message_ids);
                Ok(OperationOutcome::SeenReported {
                    count: message_ids.len(),
                })
            }
            OperationPayload::Mo(sent) => {
                let results = match response {
                    Some(ResponsePayload::MoResults(results)) => results,
                    other => return Err(unexpected(op, other.as_ref())),
                };
                let merged = merge_mo_results(sent, &results);
                self.messages.save_mo(&merged);
                Ok(OperationOutcome::MoSent(merged))
            }
        }
    }

    fn merge_attributes(
        &self,
        op: &SyncOperation,
        response: Option<ResponsePayload>,
    ) -> SyncResult<OperationOutcome> {
        let Some(kind) = op.kind().entity() else {
            return Err(unexpected(op, response.as_ref()));
        };
        let fields: AttributeFields = match response {
            Some(ResponsePayload::Attributes(fields)) if fields.kind == kind => fields,
            other => return Err(unexpected(op, other.as_ref())),
        };

        if op.kind() == OperationKind::Registration {
            let has_id = fields
                .get(AttributeKey::PushRegistrationId)
                .and_then(Value::as_str)
                .is_some_and(|id| !id.is_empty());
            if !has_id {
                return Err(SyncError::MalformedResponse(
                    "registration response without pushRegistrationId".into(),
                ));
            }
        }

        let report = self.tracker(kind).transact(|entity| {
            Reconciler::apply_sent(&fields.fields, entity, op.scope(), op.sent())
        })?;
        let changed = report.changed();
        if !changed.is_empty() {
            self.events.emit(SyncEvent::EntityChanged {
                kind,
                keys: changed,
            });
        }
        Ok(OperationOutcome::Reconciled(report))
    }

    /// Records a primary flag change in the cached installations list.
    pub(crate) fn record_primary(&self, registration: &str, is_primary: bool) -> SyncResult<()> {
        self.edit_installations(|list| set_primary(list, registration, is_primary))
    }

    fn edit_installations(&self, edit: impl FnOnce(&mut Vec<Value>)) -> SyncResult<()> {
        let changed = self.user.transact(|entity| {
            let Some(Value::Array(mut list)) = entity.get(AttributeKey::Installations).cloned()
            else {
                return false;
            };
            edit(&mut list);
            entity.commit_server_value(AttributeKey::Installations, Value::Array(list));
            true
        })?;
        if changed {
            self.events.emit(SyncEvent::EntityChanged {
                kind: EntityKind::User,
                keys: AttributesSet::from([AttributeKey::Installations]),
            });
        }
        Ok(())
    }

    fn ingest(&self, messages: &[Message]) -> OperationOutcome {
        let new_messages: Vec<String> = self
            .messages
            .insert_new(messages)
            .into_iter()
            .map(|m| m.message_id)
            .collect();
        if !new_messages.is_empty() {
            tracing::debug!(count = new_messages.len(), "messages stored");
            self.events.emit(SyncEvent::MessagesReceived {
                message_ids: new_messages.clone(),
            });
        }
        OperationOutcome::MessagesIngested { new_messages }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

fn unexpected(op: &SyncOperation, response: Option<&ResponsePayload>) -> SyncError {
    let found = match response {
        None => "no response",
        Some(ResponsePayload::Empty) => "empty payload",
        Some(ResponsePayload::Attributes(fields)) => match fields.kind {
            EntityKind::Installation => "installation attributes",
            EntityKind::User => "user attributes",
        },
        Some(ResponsePayload::Messages(_)) => "messages",
        Some(ResponsePayload::MoResults(_)) => "mo results",
    };
    SyncError::MalformedResponse(format!("unexpected {} for {}", found, op.kind()))
}

fn registration_of(entry: &Value) -> Option<&str> {
    entry.get("pushRegistrationId").and_then(Value::as_str)
}

/// Sets the primary flag of one entry; a new primary demotes the others.
fn set_primary(list: &mut [Value], registration: &str, is_primary: bool) {
    for entry in list.iter_mut() {
        let target = registration_of(entry) == Some(registration);
        if let Some(object) = entry.as_object_mut() {
            if target {
                object.insert("isPrimary".into(), AttrValue::Bool(is_primary));
            } else if is_primary {
                object.insert("isPrimary".into(), AttrValue::Bool(false));
            }
        }
    }
}

fn remove_installation(list: &mut Vec<Value>, registration: &str) {
    list.retain(|entry| registration_of(entry) != Some(registration));
}

/// Applies per-message server statuses; messages the server did not
/// report on count as failed.
fn merge_mo_results(sent: &[MoMessage], results: &[MoMessage]) -> Vec<MoMessage> {
    sent.iter()
        .map(|message| {
            let status = results
                .iter()
                .find(|r| r.message_id == message.message_id)
                .map(|r| r.status)
                .unwrap_or(MoStatus::SentWithFailure);
            MoMessage {
                status,
                ..message.clone()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_primary_demotes_others() {
        let mut list = vec![
            json!({"pushRegistrationId": "a", "isPrimary": true}),
            json!({"pushRegistrationId": "b", "isPrimary": false}),
        ];
        set_primary(&mut list, "b", true);
        assert_eq!(list[0]["isPrimary"], json!(false));
        assert_eq!(list[1]["isPrimary"], json!(true));

        set_primary(&mut list, "b", false);
        assert_eq!(list[1]["isPrimary"], json!(false));
        assert_eq!(list[0]["isPrimary"], json!(false));
    }

    #[test]
    fn remove_installation_by_id() {
        let mut list = vec![
            json!({"pushRegistrationId": "a"}),
            json!({"pushRegistrationId": "b"}),
        ];
        remove_installation(&mut list, "a");
        assert_eq!(list, vec![json!({"pushRegistrationId": "b"})]);
    }

    #[test]
    fn unreported_mo_messages_fail() {
        let a = MoMessage::new(None, "a", None);
        let b = MoMessage::new(None, "b", None);
        let mut ok = a.clone();
        ok.status = MoStatus::SentSuccessfully;

        let merged = merge_mo_results(&[a, b], &[ok]);
        assert_eq!(merged[0].status, MoStatus::SentSuccessfully);
        assert_eq!(merged[1].status, MoStatus::SentWithFailure);
        assert_eq!(merged[1].text, "b");
    }
}
