//! Building operations from local state.

use crate::chain::FollowUp;
use crate::error::{SyncError, SyncResult};
use crate::operation::{OperationKind, OperationPayload, SyncOperation};
use chrono::Utc;
use pushsync_core::{
    AttributeKey, AttributeTracker, AttributesSet, EntityKind, Message, MessageStore, MoMessage,
    ResourceId, SystemData,
};
use pushsync_protocol::ApiRequest;
use serde_json::json;
use std::sync::Arc;

/// Lane used before a registration exists.
const UNREGISTERED_LANE: &str = "unregistered";
/// Inbox lane used before a registration exists.
const MESSAGES_LANE: &str = "messages";
/// How many known message ids a fetch reports back.
const ARCHIVE_LIMIT: usize = 100;

/// Snapshots local state into operations.
///
/// Every builder method returns `Ok(None)` when there is nothing to send,
/// and `SyncError::MissingIdentity` when the operation needs a registration
/// that does not exist yet.
pub struct OperationBuilder {
    installation: Arc<AttributeTracker>,
    user: Arc<AttributeTracker>,
    messages: Arc<dyn MessageStore>,
}

impl OperationBuilder {
    /// Creates a builder over the local state.
    pub fn new(
        installation: Arc<AttributeTracker>,
        user: Arc<AttributeTracker>,
        messages: Arc<dyn MessageStore>,
    ) -> Self {
        Self {
            installation,
            user,
            messages,
        }
    }

    /// The current push registration id.
    pub fn registration_id(&self) -> Option<String> {
        self.installation
            .get_string(AttributeKey::PushRegistrationId)
            .filter(|reg| !reg.is_empty())
    }

    /// Returns false once push registration was disabled. Enabled by default.
    pub fn registration_enabled(&self) -> bool {
        self.installation
            .get(AttributeKey::RegistrationEnabled)
            .and_then(|v| v.as_bool())
            .unwrap_or(true)
    }

    fn require_registration(&self) -> SyncResult<ResourceId> {
        self.registration_id()
            .map(ResourceId::new)
            .ok_or_else(|| SyncError::missing_identity(UNREGISTERED_LANE))
    }

    /// Lane for installation and user operations.
    pub fn installation_lane(&self) -> ResourceId {
        self.registration_id()
            .map(ResourceId::new)
            .unwrap_or_else(|| ResourceId::new(UNREGISTERED_LANE))
    }

    /// Lane for message operations.
    pub fn message_lane(&self) -> ResourceId {
        self.registration_id()
            .map(|reg| ResourceId::new(reg).child(MESSAGES_LANE))
            .unwrap_or_else(|| ResourceId::new(MESSAGES_LANE))
    }

    /// Registers the push service token when it changed or no
    /// registration exists yet.
    pub fn registration(&self) -> SyncResult<Option<SyncOperation>> {
        let entity = self.installation.snapshot();
        let has_token = entity
            .get_str(AttributeKey::PushServiceToken)
            .is_some_and(|token| !token.is_empty());
        let registered = self.registration_id().is_some();
        if !has_token || (registered && !entity.is_dirty(AttributeKey::PushServiceToken)) {
            return Ok(None);
        }

        let mut body_scope = AttributesSet::from([AttributeKey::PushServiceToken]);
        if entity.is_dirty(AttributeKey::RegistrationEnabled) {
            body_scope.insert(AttributeKey::RegistrationEnabled);
        }
        if registered {
            body_scope.insert(AttributeKey::PushRegistrationId);
        }
        let scope = body_scope.union(&AttributesSet::from([AttributeKey::PushRegistrationId]));
        let values = entity.values_for(&body_scope);

        let lane = self.installation_lane();
        let request = ApiRequest::registration(lane.clone(), &values);
        Ok(SyncOperation::new(
            OperationKind::Registration,
            lane,
            scope,
            Some(request),
            OperationPayload::Attributes,
        )
        .map(|op| op.with_sent(values)))
    }

    /// Pulls every syncable installation key that is not locally dirty.
    pub fn fetch_instance(&self) -> SyncResult<Option<SyncOperation>> {
        let reg = self.require_registration()?;
        let scope = AttributesSet::syncable(EntityKind::Installation)
            .difference(&self.installation.dirty_keys());
        Ok(SyncOperation::new(
            OperationKind::FetchInstance,
            reg.clone(),
            scope,
            Some(ApiRequest::fetch_instance(reg)),
            OperationPayload::Attributes,
        ))
    }

    /// Pushes the dirty installation keys.
    pub fn update_instance(&self) -> SyncResult<Option<SyncOperation>> {
        let entity = self.installation.snapshot();
        let scope = entity
            .dirty_keys()
            .intersection(&AttributesSet::syncable(EntityKind::Installation))
            .difference(&AttributesSet::from([
                AttributeKey::PushServiceToken,
                AttributeKey::PushRegistrationId,
            ]));
        if scope.is_empty() {
            return Ok(None);
        }
        let reg = self.require_registration()?;
        let values = entity.values_for(&scope);
        let request = ApiRequest::patch_instance(reg.clone(), &values);
        Ok(SyncOperation::new(
            OperationKind::UpdateInstance,
            reg,
            scope,
            Some(request),
            OperationPayload::Attributes,
        )
        .map(|op| op.with_sent(values)))
    }

    /// Pulls every syncable user key that is not locally dirty.
    pub fn fetch_user(&self) -> SyncResult<Option<SyncOperation>> {
        let reg = self.require_registration()?;
        let scope =
            AttributesSet::syncable(EntityKind::User).difference(&self.user.dirty_keys());
        Ok(SyncOperation::new(
            OperationKind::FetchUser,
            reg.clone(),
            scope,
            Some(ApiRequest::fetch_user(reg)),
            OperationPayload::Attributes,
        ))
    }

    fn dirty_user_scope(&self) -> (pushsync_core::Entity, AttributesSet) {
        let entity = self.user.snapshot();
        // The installations list is server-owned.
        let scope = entity
            .dirty_keys()
            .intersection(&AttributesSet::syncable(EntityKind::User))
            .difference(&AttributesSet::from([AttributeKey::Installations]));
        (entity, scope)
    }

    /// Pushes the dirty user keys.
    pub fn update_user(&self) -> SyncResult<Option<SyncOperation>> {
        let (entity, scope) = self.dirty_user_scope();
        if scope.is_empty() {
            return Ok(None);
        }
        let reg = self.require_registration()?;
        let values = entity.values_for(&scope);
        let request = ApiRequest::patch_user(reg.clone(), &values);
        Ok(SyncOperation::new(
            OperationKind::UpdateUser,
            reg,
            scope,
            Some(request),
            OperationPayload::Attributes,
        )
        .map(|op| op.with_sent(values)))
    }

    /// Personalizes with the dirty user keys (identity and attributes).
    pub fn personalize(&self, force_depersonalize: bool) -> SyncResult<Option<SyncOperation>> {
        let (entity, scope) = self.dirty_user_scope();
        if scope.is_empty() {
            return Ok(None);
        }
        let reg = self.require_registration()?;
        let values = entity.values_for(&scope);
        let request = ApiRequest::personalize(reg.clone(), force_depersonalize, &values);
        Ok(SyncOperation::new(
            OperationKind::Personalize,
            reg,
            scope,
            Some(request),
            OperationPayload::Attributes,
        )
        .map(|op| op.with_sent(values)))
    }

    /// Depersonalizes the current installation.
    pub fn depersonalize(&self) -> SyncResult<Option<SyncOperation>> {
        let reg = self.require_registration()?;
        Ok(SyncOperation::new(
            OperationKind::Depersonalize,
            reg.clone(),
            AttributesSet::of_kind(EntityKind::User),
            Some(ApiRequest::depersonalize(reg, None)),
            OperationPayload::Depersonalize,
        ))
    }

    /// Sets the primary flag of another installation of the user.
    pub fn update_other_instance(
        &self,
        registration: &str,
        is_primary: bool,
    ) -> SyncResult<Option<SyncOperation>> {
        let reg = self.require_registration()?;
        let request = ApiRequest::patch_other_instance(reg.clone(), registration, is_primary);
        Ok(SyncOperation::new(
            OperationKind::UpdateOtherInstance,
            reg,
            AttributesSet::from([AttributeKey::Installations]),
            Some(request),
            OperationPayload::OtherInstance {
                registration: registration.to_string(),
                is_primary,
            },
        ))
    }

    /// Depersonalizes another installation of the user.
    pub fn depersonalize_other(&self, registration: &str) -> SyncResult<Option<SyncOperation>> {
        let reg = self.require_registration()?;
        if reg.as_str() == registration {
            return Err(SyncError::CantDepersonalizeCurrent);
        }
        Ok(SyncOperation::new(
            OperationKind::DepersonalizeOther,
            reg.clone(),
            AttributesSet::from([AttributeKey::Installations]),
            Some(ApiRequest::depersonalize(reg, Some(registration))),
            OperationPayload::DepersonalizeOther {
                registration: registration.to_string(),
            },
        ))
    }

    /// Reports system data when its hash differs from the stored one.
    pub fn system_data(&self, data: &SystemData) -> SyncResult<Option<SyncOperation>> {
        let hash = data.hash_hex();
        let stored = self
            .installation
            .snapshot()
            .current(AttributeKey::SystemDataHash)
            .cloned();
        if stored == Some(json!(hash)) {
            return Ok(None);
        }
        let reg = self.require_registration()?;
        Ok(SyncOperation::new(
            OperationKind::SystemData,
            reg.clone(),
            AttributesSet::from([AttributeKey::SystemDataHash]),
            Some(ApiRequest::system_data(reg, data)),
            OperationPayload::SystemData { hash },
        ))
    }

    /// Ingests incoming messages locally. Nothing while registration is
    /// disabled.
    pub fn handle_messages(&self, messages: Vec<Message>) -> SyncResult<Option<SyncOperation>> {
        if !self.registration_enabled() {
            tracing::debug!(dropped = messages.len(), "push registration disabled, messages ignored");
            return Ok(None);
        }
        Ok(SyncOperation::new(
            OperationKind::HandleMessages,
            self.message_lane(),
            AttributesSet::new(),
            None,
            OperationPayload::IncomingMessages(messages),
        ))
    }

    /// Fetches messages, reporting pending deliveries. Nothing while
    /// registration is disabled.
    pub fn fetch_messages(&self) -> SyncResult<Option<SyncOperation>> {
        if !self.registration_enabled() {
            tracing::debug!("push registration disabled, fetch skipped");
            return Ok(None);
        }
        self.require_registration()?;
        let lane = self.message_lane();

        let mut archive = self.messages.message_ids();
        if archive.len() > ARCHIVE_LIMIT {
            archive.drain(..archive.len() - ARCHIVE_LIMIT);
        }
        let delivery_reports = self.messages.pending_delivery_reports();
        let request = ApiRequest::sync_messages(lane.clone(), &archive, &delivery_reports);

        Ok(SyncOperation::new(
            OperationKind::FetchMessages,
            lane,
            AttributesSet::new(),
            Some(request),
            OperationPayload::FetchMessages { delivery_reports },
        ))
    }

    /// Reports seen messages not reported yet.
    pub fn report_seen(&self) -> SyncResult<Option<SyncOperation>> {
        let pending = self.messages.pending_seen();
        if pending.is_empty() {
            return Ok(None);
        }
        self.require_registration()?;
        let lane = self.message_lane();
        let request = ApiRequest::seen_messages(lane.clone(), &pending, Utc::now());
        Ok(SyncOperation::new(
            OperationKind::ReportSeen,
            lane,
            AttributesSet::new(),
            Some(request),
            OperationPayload::Seen {
                message_ids: pending.into_iter().map(|e| e.message_id).collect(),
            },
        ))
    }

    /// Sends mobile-originated messages.
    pub fn send_mo(&self, messages: Vec<MoMessage>) -> SyncResult<Option<SyncOperation>> {
        if messages.is_empty() {
            return Ok(None);
        }
        let reg = self.require_registration()?;
        let lane = self.message_lane();
        let request = ApiRequest::mo_messages(reg, lane.clone(), &messages);
        Ok(SyncOperation::new(
            OperationKind::SendMo,
            lane,
            AttributesSet::new(),
            Some(request),
            OperationPayload::Mo(messages),
        ))
    }

    /// Builds a chained follow-up.
    pub fn follow_up(&self, follow_up: FollowUp) -> SyncResult<Option<SyncOperation>> {
        match follow_up {
            FollowUp::FetchMessages => self.fetch_messages(),
        }
    }
}

impl std::fmt::Debug for OperationBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationBuilder")
            .field("registration_id", &self.registration_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pushsync_core::{DeliveryMethod, MemoryEntityStore, MemoryMessageStore};
    use std::collections::BTreeMap;

    struct Fixture {
        installation: Arc<AttributeTracker>,
        user: Arc<AttributeTracker>,
        messages: Arc<MemoryMessageStore>,
        builder: OperationBuilder,
    }

    fn fixture(registered: bool) -> Fixture {
        let store = Arc::new(MemoryEntityStore::new());
        let installation = Arc::new(
            AttributeTracker::open(EntityKind::Installation, store.clone()).unwrap(),
        );
        let user = Arc::new(AttributeTracker::open(EntityKind::User, store).unwrap());
        let messages = Arc::new(MemoryMessageStore::new());
        if registered {
            installation
                .set_current(AttributeKey::PushRegistrationId, json!("reg-1"))
                .unwrap();
        }
        let builder = OperationBuilder::new(installation.clone(), user.clone(), messages.clone());
        Fixture {
            installation,
            user,
            messages,
            builder,
        }
    }

    #[test]
    fn update_scope_is_dirty_syncable_keys() {
        let f = fixture(true);
        f.installation
            .set(AttributeKey::IsPrimaryDevice, json!(true))
            .unwrap();
        f.installation
            .set(AttributeKey::BadgeNumber, json!(3))
            .unwrap();

        let op = f.builder.update_instance().unwrap().unwrap();
        assert_eq!(op.scope(), &AttributesSet::from([AttributeKey::IsPrimaryDevice]));
        assert_eq!(op.resource_id().as_str(), "reg-1");
        assert_eq!(
            op.request().unwrap().body,
            Some(json!({ "isPrimary": true }))
        );
    }

    #[test]
    fn nothing_dirty_is_nothing_to_sync() {
        let f = fixture(false);
        assert!(f.builder.update_instance().unwrap().is_none());
        assert!(f.builder.update_user().unwrap().is_none());
        assert!(f.builder.report_seen().unwrap().is_none());
    }

    #[test]
    fn missing_registration_is_missing_identity() {
        let f = fixture(false);
        f.user.set(AttributeKey::FirstName, json!("Ana")).unwrap();
        let err = f.builder.update_user().unwrap_err();
        assert!(matches!(err, SyncError::MissingIdentity { .. }));
        assert!(f.builder.fetch_instance().is_err());
    }

    #[test]
    fn fetch_skips_dirty_keys() {
        let f = fixture(true);
        f.user.set(AttributeKey::FirstName, json!("Ana")).unwrap();
        let op = f.builder.fetch_user().unwrap().unwrap();
        assert!(!op.scope().contains(AttributeKey::FirstName));
        assert!(op.scope().contains(AttributeKey::LastName));
        assert!(!op.is_mutating());
    }

    #[test]
    fn registration_needs_a_changed_token() {
        let f = fixture(false);
        assert!(f.builder.registration().unwrap().is_none());

        f.installation
            .set(AttributeKey::PushServiceToken, json!("token"))
            .unwrap();
        let op = f.builder.registration().unwrap().unwrap();
        assert_eq!(op.resource_id().as_str(), UNREGISTERED_LANE);
        assert!(op.scope().contains(AttributeKey::PushRegistrationId));
        assert_eq!(op.retry_limit(), 3);
        assert_eq!(
            op.request().unwrap().body,
            Some(json!({ "pushServiceToken": "token" }))
        );
    }

    #[test]
    fn disabled_registration_stops_message_intake() {
        let f = fixture(true);
        assert!(f.builder.registration_enabled());
        f.installation
            .set(AttributeKey::RegistrationEnabled, json!(false))
            .unwrap();

        let incoming = vec![Message::new("m1", false, DeliveryMethod::Push, json!({}))];
        assert!(f.builder.handle_messages(incoming).unwrap().is_none());
        assert!(f.builder.fetch_messages().unwrap().is_none());
        assert!(f
            .builder
            .follow_up(FollowUp::FetchMessages)
            .unwrap()
            .is_none());
    }

    #[test]
    fn sent_values_match_the_body() {
        let f = fixture(true);
        f.user.set(AttributeKey::FirstName, json!("Ana")).unwrap();
        let op = f.builder.update_user().unwrap().unwrap();
        assert_eq!(
            op.sent(),
            &BTreeMap::from([(AttributeKey::FirstName, json!("Ana"))])
        );
        assert!(f.builder.fetch_user().unwrap().unwrap().sent().is_empty());
    }

    #[test]
    fn depersonalize_other_rejects_current() {
        let f = fixture(true);
        let err = f.builder.depersonalize_other("reg-1").unwrap_err();
        assert!(matches!(err, SyncError::CantDepersonalizeCurrent));
        assert!(f.builder.depersonalize_other("reg-2").unwrap().is_some());
    }

    #[test]
    fn system_data_skips_unchanged_hash() {
        let f = fixture(true);
        let data = SystemData {
            sdk_version: "1".into(),
            os_version: "2".into(),
            device_model: "m".into(),
            app_version: "3".into(),
            notifications_enabled: true,
            carrier: None,
        };
        assert!(f.builder.system_data(&data).unwrap().is_some());

        f.installation
            .set_current(AttributeKey::SystemDataHash, json!(data.hash_hex()))
            .unwrap();
        assert!(f.builder.system_data(&data).unwrap().is_none());
    }

    #[test]
    fn message_operations_share_the_inbox_lane() {
        let f = fixture(true);
        f.messages.insert_new(&[Message::new(
            "m1",
            false,
            DeliveryMethod::Push,
            json!({}),
        )]);

        let handle = f
            .builder
            .handle_messages(vec![Message::new("m2", false, DeliveryMethod::Push, json!({}))])
            .unwrap()
            .unwrap();
        let fetch = f.builder.fetch_messages().unwrap().unwrap();
        assert_eq!(handle.resource_id(), fetch.resource_id());
        assert_eq!(fetch.resource_id().as_str(), "reg-1/messages");
        assert_eq!(
            fetch.request().unwrap().body,
            Some(json!({ "mIDs": ["m1"], "drIDs": ["m1"] }))
        );
        assert!(f.builder.handle_messages(Vec::new()).unwrap().is_none());
    }
}
