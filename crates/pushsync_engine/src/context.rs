//! The sync context.
//!
//! Owns the trackers, stores, queue and collaborators of one client. The
//! caller creates it, passes it where it is needed and shuts it down.

use crate::builder::OperationBuilder;
use crate::chain::{ChainPolicy, DefaultChainPolicy};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{BroadcastSink, EventSink, SyncEvent};
use crate::executor::Executor;
use crate::identity::{IdentityCheck, RegistrationHealth};
use crate::operation::{OperationOutcome, SyncOperation};
use crate::queue::{OperationHandle, OperationQueue};
use crate::retry::RetryPolicy;
use crate::transport::NetworkClient;
use chrono::Utc;
use pushsync_core::{
    AttrValue, AttributeKey, AttributeTracker, AttributesSet, Entity, EntityKind, EntityStore,
    MemoryEntityStore, MemoryMessageStore, Message, MessageStore, MoMessage, SystemData,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Depersonalization marker stored while a depersonalize is in flight.
const DEPERSONALIZE_PENDING: &str = "pending";

/// Identity keys used to personalize a user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserIdentity {
    /// External user id.
    pub external_user_id: Option<String>,
    /// Email addresses.
    pub emails: Vec<String>,
    /// Phone numbers (MSISDN).
    pub phones: Vec<String>,
}

impl UserIdentity {
    /// An identity with only an external user id.
    pub fn external(id: impl Into<String>) -> Self {
        Self {
            external_user_id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Returns true if no identity key is set.
    pub fn is_empty(&self) -> bool {
        self.external_user_id.as_deref().map_or(true, str::is_empty)
            && self.emails.is_empty()
            && self.phones.is_empty()
    }

    fn values(&self) -> Vec<(AttributeKey, AttrValue)> {
        let mut values = Vec::new();
        if let Some(id) = self.external_user_id.as_deref().filter(|id| !id.is_empty()) {
            values.push((AttributeKey::ExternalUserId, json!(id)));
        }
        if !self.emails.is_empty() {
            let emails: Vec<Value> = self.emails.iter().map(|e| json!({ "address": e })).collect();
            values.push((AttributeKey::Emails, Value::Array(emails)));
        }
        if !self.phones.is_empty() {
            let phones: Vec<Value> = self.phones.iter().map(|p| json!({ "number": p })).collect();
            values.push((AttributeKey::Phones, Value::Array(phones)));
        }
        values
    }
}

/// Builder for `SyncContext`.
pub struct SyncContextBuilder {
    config: SyncConfig,
    network: Arc<dyn NetworkClient>,
    entity_store: Option<Arc<dyn EntityStore>>,
    message_store: Option<Arc<dyn MessageStore>>,
    identity: Option<Arc<dyn IdentityCheck>>,
    events: Option<Arc<dyn EventSink>>,
    chain: Option<Arc<dyn ChainPolicy>>,
}

impl SyncContextBuilder {
    /// Uses this entity store (default: in memory).
    pub fn entity_store(mut self, store: Arc<dyn EntityStore>) -> Self {
        self.entity_store = Some(store);
        self
    }

    /// Uses this message store (default: in memory).
    pub fn message_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.message_store = Some(store);
        self
    }

    /// Uses this identity check (default: `RegistrationHealth`).
    pub fn identity(mut self, identity: Arc<dyn IdentityCheck>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Sends events to this sink (default: a `BroadcastSink`).
    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Uses this chain policy (default: `DefaultChainPolicy`).
    pub fn chain_policy(mut self, chain: Arc<dyn ChainPolicy>) -> Self {
        self.chain = Some(chain);
        self
    }

    /// Opens the trackers and wires the context.
    pub fn build(self) -> SyncResult<SyncContext> {
        let entity_store = self
            .entity_store
            .unwrap_or_else(|| Arc::new(MemoryEntityStore::new()));
        let messages = self
            .message_store
            .unwrap_or_else(|| Arc::new(MemoryMessageStore::new()));

        let installation = Arc::new(AttributeTracker::open(
            EntityKind::Installation,
            Arc::clone(&entity_store),
        )?);
        let user = Arc::new(AttributeTracker::open(EntityKind::User, entity_store)?);

        let identity = self
            .identity
            .unwrap_or_else(|| Arc::new(RegistrationHealth::new(Arc::clone(&installation))));
        let (events, broadcast) = match self.events {
            Some(events) => (events, None),
            None => {
                let sink = BroadcastSink::new(self.config.event_capacity);
                (Arc::new(sink.clone()) as Arc<dyn EventSink>, Some(sink))
            }
        };
        let chain = self
            .chain
            .unwrap_or_else(|| Arc::new(DefaultChainPolicy));

        let executor = Arc::new(Executor::new(
            self.network,
            identity,
            Arc::clone(&installation),
            Arc::clone(&user),
            Arc::clone(&messages),
            Arc::clone(&events),
            RetryPolicy::new(self.config.retry.clone()),
        ));
        let builder = Arc::new(OperationBuilder::new(
            Arc::clone(&installation),
            Arc::clone(&user),
            Arc::clone(&messages),
        ));
        let queue = OperationQueue::new(
            Arc::clone(&executor),
            Arc::clone(&builder),
            chain,
            Arc::clone(&events),
            self.config.max_concurrent_operations,
        );

        tracing::debug!(
            workers = self.config.max_concurrent_operations,
            registration = ?builder.registration_id(),
            "sync context ready"
        );
        Ok(SyncContext {
            config: self.config,
            installation,
            user,
            messages,
            events,
            broadcast,
            executor,
            builder,
            queue,
        })
    }
}

impl std::fmt::Debug for SyncContextBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContextBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// One client's sync state and scheduler.
///
/// Entry points build an operation from a snapshot of local state, enqueue
/// it and wait for its result. An empty snapshot resolves to
/// `OperationOutcome::NothingToSync` without touching the network.
pub struct SyncContext {
    config: SyncConfig,
    installation: Arc<AttributeTracker>,
    user: Arc<AttributeTracker>,
    messages: Arc<dyn MessageStore>,
    events: Arc<dyn EventSink>,
    broadcast: Option<BroadcastSink>,
    executor: Arc<Executor>,
    builder: Arc<OperationBuilder>,
    queue: OperationQueue,
}

impl SyncContext {
    /// Starts building a context around a network collaborator.
    pub fn builder(config: SyncConfig, network: Arc<dyn NetworkClient>) -> SyncContextBuilder {
        SyncContextBuilder {
            config,
            network,
            entity_store: None,
            message_store: None,
            identity: None,
            events: None,
            chain: None,
        }
    }

    /// The configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The installation tracker.
    pub fn installation(&self) -> &Arc<AttributeTracker> {
        &self.installation
    }

    /// The user tracker.
    pub fn user(&self) -> &Arc<AttributeTracker> {
        &self.user
    }

    /// The message store.
    pub fn message_store(&self) -> &Arc<dyn MessageStore> {
        &self.messages
    }

    /// The operation builder.
    pub fn operations(&self) -> &OperationBuilder {
        &self.builder
    }

    /// The operation queue.
    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    /// Subscribes to events, if the context owns a broadcast sink.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<SyncEvent>> {
        self.broadcast.as_ref().map(BroadcastSink::subscribe)
    }

    /// The current push registration id.
    pub fn registration_id(&self) -> Option<String> {
        self.builder.registration_id()
    }

    /// Enqueues a prepared operation.
    pub fn enqueue(&self, op: SyncOperation) -> OperationHandle {
        self.queue.enqueue(op)
    }

    async fn run(&self, op: SyncResult<Option<SyncOperation>>) -> SyncResult<OperationOutcome> {
        match op? {
            Some(op) => self.queue.enqueue(op).wait().await.into_result(),
            None => Ok(OperationOutcome::NothingToSync),
        }
    }

    /// Stores the push service token and registers when it changed.
    pub async fn register(&self, device_token: &str) -> SyncResult<OperationOutcome> {
        if device_token.is_empty() {
            return Err(SyncError::InvalidInput("empty device token".into()));
        }
        if self.installation.get_string(AttributeKey::PushServiceToken).as_deref()
            != Some(device_token)
        {
            self.installation
                .set(AttributeKey::PushServiceToken, json!(device_token))?;
        }
        self.run(self.builder.registration()).await
    }

    /// Pushes dirty installation attributes.
    pub async fn save_installation(&self) -> SyncResult<OperationOutcome> {
        self.run(self.builder.update_instance()).await
    }

    /// Pulls installation attributes.
    pub async fn fetch_installation(&self) -> SyncResult<OperationOutcome> {
        self.run(self.builder.fetch_instance()).await
    }

    /// Pushes dirty installation attributes, then pulls the rest.
    pub async fn sync_installation(&self) -> SyncResult<OperationOutcome> {
        self.save_installation().await?;
        self.fetch_installation().await
    }

    /// Pushes dirty user attributes.
    pub async fn save_user(&self) -> SyncResult<OperationOutcome> {
        self.run(self.builder.update_user()).await
    }

    /// Pulls user attributes.
    pub async fn fetch_user(&self) -> SyncResult<OperationOutcome> {
        self.run(self.builder.fetch_user()).await
    }

    /// Pushes dirty user attributes, then pulls the rest.
    pub async fn sync_user(&self) -> SyncResult<OperationOutcome> {
        self.save_user().await?;
        self.fetch_user().await
    }

    /// Links the installation to a user.
    ///
    /// A depersonalize left pending by an earlier failure is completed
    /// first. The identity and any extra user attributes are then written
    /// into the dirty user, so a failed call leaves them queued for the next
    /// sync.
    pub async fn personalize(
        &self,
        identity: &UserIdentity,
        attributes: BTreeMap<AttributeKey, AttrValue>,
        force_depersonalize: bool,
    ) -> SyncResult<OperationOutcome> {
        if identity.is_empty() {
            return Err(SyncError::InvalidInput(
                "personalize needs an external user id, email or phone".into(),
            ));
        }
        let user_keys = AttributesSet::syncable(EntityKind::User);
        if let Some(key) = attributes.keys().find(|key| !user_keys.contains(**key)) {
            return Err(SyncError::InvalidInput(format!(
                "{:?} is not a user attribute",
                key
            )));
        }

        self.finish_pending_depersonalize().await?;
        self.user
            .set_many(identity.values().into_iter().chain(attributes))?;
        self.run(self.builder.personalize(force_depersonalize)).await
    }

    /// Unlinks the installation from its user.
    ///
    /// The user is reset only after the server confirmed. Until then the
    /// request stays pending and is retried by `on_start` or the next
    /// `personalize`; a failure bumps the local failure counter.
    pub async fn depersonalize(&self) -> SyncResult<OperationOutcome> {
        let op = self.builder.depersonalize()?;
        self.user
            .set_current(AttributeKey::DepersonalizeStatus, json!(DEPERSONALIZE_PENDING))?;
        let result = self.run(Ok(op)).await;
        if let Err(err) = &result {
            if !matches!(err, SyncError::Cancelled) {
                let failures = self
                    .user
                    .get(AttributeKey::DepersonalizeFailCounter)
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0)
                    + 1;
                tracing::warn!(error = %err, failures, "depersonalize failed");
                self.user
                    .set_current(AttributeKey::DepersonalizeFailCounter, json!(failures))?;
            }
        }
        result
    }

    /// Returns true while a depersonalize awaits server confirmation.
    pub fn depersonalize_pending(&self) -> bool {
        self.user.get_string(AttributeKey::DepersonalizeStatus).as_deref()
            == Some(DEPERSONALIZE_PENDING)
    }

    async fn finish_pending_depersonalize(&self) -> SyncResult<()> {
        if !self.depersonalize_pending() || self.registration_id().is_none() {
            return Ok(());
        }
        tracing::info!("completing pending depersonalize");
        self.depersonalize().await.map(|_| ())
    }

    /// Drops all local user data without contacting the server.
    pub fn reset_user(&self) -> SyncResult<()> {
        self.user.replace(Entity::empty(EntityKind::User))?;
        self.events.emit(SyncEvent::EntityChanged {
            kind: EntityKind::User,
            keys: AttributesSet::of_kind(EntityKind::User),
        });
        Ok(())
    }

    /// Sets the primary flag of one of the user's installations.
    ///
    /// The current installation goes through its dirty attributes; other
    /// installations are patched directly.
    pub async fn set_installation_primary(
        &self,
        registration: &str,
        is_primary: bool,
    ) -> SyncResult<OperationOutcome> {
        if self.registration_id().as_deref() != Some(registration) {
            return self
                .run(self.builder.update_other_instance(registration, is_primary))
                .await;
        }
        self.installation
            .set(AttributeKey::IsPrimaryDevice, json!(is_primary))?;
        let outcome = self.run(self.builder.update_instance()).await?;
        self.executor.record_primary(registration, is_primary)?;
        Ok(outcome)
    }

    /// Depersonalizes another installation of the user.
    pub async fn depersonalize_installation(
        &self,
        registration: &str,
    ) -> SyncResult<OperationOutcome> {
        self.run(self.builder.depersonalize_other(registration)).await
    }

    /// Enables or disables push registration and reports it to the server.
    ///
    /// While disabled, incoming messages are dropped and message fetches
    /// are skipped. Before a registration exists the flag is sent with it.
    pub async fn set_push_registration_enabled(
        &self,
        enabled: bool,
    ) -> SyncResult<OperationOutcome> {
        self.installation
            .set(AttributeKey::RegistrationEnabled, json!(enabled))?;
        tracing::info!(enabled, "push registration status changed");
        if self.registration_id().is_none() {
            return self.run(self.builder.registration()).await;
        }
        self.save_installation().await
    }

    /// Returns false while push registration is disabled.
    pub fn is_push_registration_enabled(&self) -> bool {
        self.builder.registration_enabled()
    }

    /// Stores incoming messages; new ones trigger a message fetch.
    pub async fn handle_messages(&self, messages: Vec<Message>) -> SyncResult<OperationOutcome> {
        self.run(self.builder.handle_messages(messages)).await
    }

    /// Fetches messages and reports pending deliveries.
    pub async fn fetch_messages(&self) -> SyncResult<OperationOutcome> {
        self.run(self.builder.fetch_messages()).await
    }

    /// Marks messages as seen now and reports every unreported seen mark.
    pub async fn set_seen(&self, message_ids: &[String]) -> SyncResult<OperationOutcome> {
        let marked = self.messages.mark_seen(message_ids, Utc::now());
        tracing::debug!(marked, "messages marked seen");
        self.run(self.builder.report_seen()).await
    }

    /// Sends mobile-originated messages.
    pub async fn send_mo(&self, messages: Vec<MoMessage>) -> SyncResult<OperationOutcome> {
        self.run(self.builder.send_mo(messages)).await
    }

    /// Reports system data if it changed since the last report.
    pub async fn sync_system_data(&self, data: &SystemData) -> SyncResult<OperationOutcome> {
        self.run(self.builder.system_data(data)).await
    }

    /// Stores the badge number locally.
    pub fn set_badge_number(&self, badge: u32) -> SyncResult<()> {
        self.installation
            .set_current(AttributeKey::BadgeNumber, json!(badge))?;
        Ok(())
    }

    /// The stored badge number.
    pub fn badge_number(&self) -> u32 {
        self.installation
            .get(AttributeKey::BadgeNumber)
            .and_then(|v| v.as_u64())
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0)
    }

    /// Application start: registers a pending token, completes a pending
    /// depersonalize, then syncs.
    pub async fn on_start(&self) -> SyncResult<()> {
        self.run(self.builder.registration()).await?;
        self.finish_pending_depersonalize().await?;
        self.on_foreground().await
    }

    /// Application foreground: syncs installation, user and seen marks.
    ///
    /// Does nothing before a registration exists. Every step runs; the
    /// first error is returned.
    pub async fn on_foreground(&self) -> SyncResult<()> {
        if self.registration_id().is_none() {
            tracing::debug!("not registered, skipping sync");
            return Ok(());
        }
        let results = [
            self.sync_installation().await,
            self.sync_user().await,
            self.run(self.builder.report_seen()).await,
        ];
        results.into_iter().find_map(Result::err).map_or(Ok(()), Err)
    }

    /// Waits until no operation is pending or running.
    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await
    }

    /// Cancels pending operations and rejects new ones.
    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    /// Shuts down and waits for running operations to finish.
    ///
    /// With `clean_up`, both entities and every stored message are dropped
    /// afterwards, leaving the client as if it had never run.
    pub async fn stop(&self, clean_up: bool) -> SyncResult<()> {
        self.queue.shutdown();
        self.queue.wait_idle().await;
        if !clean_up {
            tracing::info!("sync context stopped");
            return Ok(());
        }

        for (tracker, kind) in [
            (&self.installation, EntityKind::Installation),
            (&self.user, EntityKind::User),
        ] {
            tracker.replace(Entity::empty(kind))?;
            self.events.emit(SyncEvent::EntityChanged {
                kind,
                keys: AttributesSet::of_kind(kind),
            });
        }
        self.messages.clear();
        tracing::info!("sync context stopped, local data dropped");
        Ok(())
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("registration_id", &self.registration_id())
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}
