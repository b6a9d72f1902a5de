//! API request variants.

use chrono::{DateTime, Utc};
use pushsync_core::{AttrValue, AttributeKey, MoMessage, ResourceId, SeenEntry, SystemData};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    /// GET
    Get,
    /// POST
    Post,
    /// PATCH
    Patch,
}

impl HttpMethod {
    /// Upper-case method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Patch => "PATCH",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of Mobile API calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Create or refresh the installation registration.
    Registration,
    /// Read the current installation.
    FetchInstance,
    /// Patch the current installation.
    PatchInstance,
    /// Patch another installation of the same user.
    PatchOtherInstance,
    /// Read the user profile.
    FetchUser,
    /// Patch the user profile.
    PatchUser,
    /// Bind the installation to a user identity.
    Personalize,
    /// Unbind an installation from its user.
    Depersonalize,
    /// Fetch messages and post delivery reports.
    SyncMessages,
    /// Report seen messages.
    SeenMessages,
    /// Send mobile-originated messages.
    MoMessages,
    /// Report system data.
    SystemData,
}

impl RequestKind {
    /// Stable name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            RequestKind::Registration => "registration",
            RequestKind::FetchInstance => "fetch_instance",
            RequestKind::PatchInstance => "patch_instance",
            RequestKind::PatchOtherInstance => "patch_other_instance",
            RequestKind::FetchUser => "fetch_user",
            RequestKind::PatchUser => "patch_user",
            RequestKind::Personalize => "personalize",
            RequestKind::Depersonalize => "depersonalize",
            RequestKind::SyncMessages => "sync_messages",
            RequestKind::SeenMessages => "seen_messages",
            RequestKind::MoMessages => "mo_messages",
            RequestKind::SystemData => "system_data",
        }
    }

    /// HTTP method used for this call.
    pub fn method(&self) -> HttpMethod {
        match self {
            RequestKind::FetchInstance | RequestKind::FetchUser => HttpMethod::Get,
            RequestKind::PatchInstance
            | RequestKind::PatchOtherInstance
            | RequestKind::PatchUser => HttpMethod::Patch,
            _ => HttpMethod::Post,
        }
    }

    /// Returns true if the call changes server state.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, RequestKind::FetchInstance | RequestKind::FetchUser)
    }

    /// Default number of retries after a transient failure.
    pub fn default_retry_limit(&self) -> u32 {
        match self {
            RequestKind::Registration => 3,
            _ => 0,
        }
    }

    /// Returns false for calls that establish identity themselves.
    pub fn requires_identity(&self) -> bool {
        !matches!(self, RequestKind::Registration)
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A fully built API request.
///
/// Requests are immutable once built: a retried attempt sends exactly the
/// same method, path, query and body.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    /// Which call this is.
    pub kind: RequestKind,
    /// HTTP method.
    pub method: HttpMethod,
    /// Path below the base URL.
    pub path: String,
    /// Resource the request targets.
    pub resource_id: ResourceId,
    /// Query parameters.
    pub query: BTreeMap<String, String>,
    /// JSON body.
    pub body: Option<Value>,
    /// Retries allowed after transient failures.
    pub retry_limit: u32,
}

impl ApiRequest {
    fn new(kind: RequestKind, resource_id: ResourceId, path: String) -> Self {
        Self {
            kind,
            method: kind.method(),
            path,
            resource_id,
            query: BTreeMap::new(),
            body: None,
            retry_limit: kind.default_retry_limit(),
        }
    }

    /// Adds a query parameter.
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// Sets the JSON body.
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Overrides the retry limit.
    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    /// Serialized body; empty when there is none.
    ///
    /// JSON objects serialize with sorted keys, so equal requests always
    /// produce equal bytes.
    pub fn body_bytes(&self) -> Vec<u8> {
        self.body
            .as_ref()
            .and_then(|b| serde_json::to_vec(b).ok())
            .unwrap_or_default()
    }

    /// Path with the encoded query string.
    pub fn path_and_query(&self) -> String {
        if self.query.is_empty() {
            return self.path.clone();
        }
        let query: Vec<String> = self
            .query
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        format!("{}?{}", self.path, query.join("&"))
    }

    /// Registers (or re-registers) the push service token.
    pub fn registration(
        resource_id: ResourceId,
        values: &BTreeMap<AttributeKey, AttrValue>,
    ) -> Self {
        Self::new(
            RequestKind::Registration,
            resource_id,
            "/mobile/1/appinstance".into(),
        )
        .with_body(attributes_body(values))
    }

    /// Reads the installation identified by `registration`.
    pub fn fetch_instance(registration: ResourceId) -> Self {
        let path = format!("/mobile/1/appinstance/{}", registration);
        Self::new(RequestKind::FetchInstance, registration, path)
    }

    /// Patches the installation with the given scoped values.
    pub fn patch_instance(
        registration: ResourceId,
        values: &BTreeMap<AttributeKey, AttrValue>,
    ) -> Self {
        let path = format!("/mobile/1/appinstance/{}", registration);
        Self::new(RequestKind::PatchInstance, registration, path).with_body(attributes_body(values))
    }

    /// Patches another installation of the same user.
    pub fn patch_other_instance(registration: ResourceId, other: &str, is_primary: bool) -> Self {
        let path = format!(
            "/mobile/1/appinstance/{}/user/instances/{}",
            registration, other
        );
        Self::new(RequestKind::PatchOtherInstance, registration, path)
            .with_body(json!({ "isPrimary": is_primary }))
    }

    /// Reads the user bound to `registration`.
    pub fn fetch_user(registration: ResourceId) -> Self {
        let path = format!("/mobile/1/appinstance/{}/user", registration);
        Self::new(RequestKind::FetchUser, registration, path)
    }

    /// Patches the user profile with the given scoped values.
    pub fn patch_user(registration: ResourceId, values: &BTreeMap<AttributeKey, AttrValue>) -> Self {
        let path = format!("/mobile/1/appinstance/{}/user", registration);
        Self::new(RequestKind::PatchUser, registration, path).with_body(attributes_body(values))
    }

    /// Personalizes the installation with identity and attributes.
    pub fn personalize(
        registration: ResourceId,
        force_depersonalize: bool,
        values: &BTreeMap<AttributeKey, AttrValue>,
    ) -> Self {
        let path = format!("/mobile/1/appinstance/{}/personalize", registration);
        let request = Self::new(RequestKind::Personalize, registration, path)
            .with_body(attributes_body(values));
        if force_depersonalize {
            request.with_query("forceDepersonalize", "true")
        } else {
            request
        }
    }

    /// Depersonalizes this installation, or `other` when given.
    pub fn depersonalize(registration: ResourceId, other: Option<&str>) -> Self {
        let path = format!("/mobile/1/appinstance/{}/depersonalize", registration);
        let request = Self::new(RequestKind::Depersonalize, registration, path);
        match other {
            Some(other) => request.with_query("pushRegistrationId", other),
            None => request,
        }
    }

    /// Fetches messages, reporting which ids are known and which were delivered.
    pub fn sync_messages(resource_id: ResourceId, archive_ids: &[String], dlr_ids: &[String]) -> Self {
        let mut body = Map::new();
        if !archive_ids.is_empty() {
            body.insert("mIDs".into(), json!(archive_ids));
        }
        if !dlr_ids.is_empty() {
            body.insert("drIDs".into(), json!(dlr_ids));
        }
        Self::new(
            RequestKind::SyncMessages,
            resource_id,
            "/mobile/5/messages".into(),
        )
        .with_body(Value::Object(body))
    }

    /// Reports seen messages, with deltas relative to `now`.
    pub fn seen_messages(resource_id: ResourceId, entries: &[SeenEntry], now: DateTime<Utc>) -> Self {
        let messages: Vec<Value> = entries
            .iter()
            .map(|e| {
                json!({
                    "messageId": e.message_id,
                    "timestampDelta": e.timestamp_delta(now),
                })
            })
            .collect();
        Self::new(
            RequestKind::SeenMessages,
            resource_id,
            "/mobile/2/messages/seen".into(),
        )
        .with_body(json!({ "messages": messages }))
    }

    /// Sends mobile-originated messages on behalf of `registration`.
    pub fn mo_messages(registration: ResourceId, resource_id: ResourceId, messages: &[MoMessage]) -> Self {
        let messages: Vec<Value> = messages
            .iter()
            .map(|m| {
                let mut item = Map::new();
                item.insert("messageId".into(), json!(m.message_id));
                item.insert("text".into(), json!(m.text));
                if let Some(destination) = &m.destination {
                    item.insert("destination".into(), json!(destination));
                }
                if let Some(custom) = &m.custom_payload {
                    item.insert("customPayload".into(), custom.clone());
                }
                Value::Object(item)
            })
            .collect();
        Self::new(
            RequestKind::MoMessages,
            resource_id,
            "/mobile/1/messages/mo".into(),
        )
        .with_body(json!({ "from": registration.as_str(), "messages": messages }))
    }

    /// Reports system data.
    pub fn system_data(registration: ResourceId, data: &SystemData) -> Self {
        Self::new(
            RequestKind::SystemData,
            registration,
            "/mobile/1/data/system".into(),
        )
        .with_body(data.to_wire())
    }
}

/// Builds a JSON object body from attribute values, using wire names.
///
/// Local-only keys are skipped.
pub fn attributes_body(values: &BTreeMap<AttributeKey, AttrValue>) -> Value {
    let body: Map<String, Value> = values
        .iter()
        .filter_map(|(key, value)| key.wire_name().map(|name| (name.to_string(), value.clone())))
        .collect();
    Value::Object(body)
}
