//! An in-process Mobile API.
//!
//! Serves the endpoints the client talks to from in-memory state, through
//! `LoopbackClient`. Failures can be scripted ahead of time, and the state
//! can be saved and loaded so that a fake server outlives one process.

use parking_lot::Mutex;
use pushsync_engine::{HttpRequest, HttpResponse, LoopbackServer};
use pushsync_protocol::HttpMethod;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

type Object = Map<String, Value>;

/// Server-side state of the fake API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiState {
    /// Number of registrations handed out.
    pub next_registration: u64,
    /// Installations by push registration id.
    pub installations: BTreeMap<String, Object>,
    /// Users by the push registration id they are attached to.
    pub users: BTreeMap<String, Object>,
    /// Messages available for fetching.
    pub inbox: Vec<Value>,
    /// Delivery reports received.
    pub delivery_reports: Vec<String>,
    /// Seen reports received.
    pub seen: Vec<String>,
    /// Mobile-originated messages received.
    pub mo_messages: Vec<Value>,
    /// System data reports received.
    pub system_data: Vec<Value>,
}

#[derive(Debug, Default)]
struct Inner {
    state: ApiState,
    /// `None` simulates a dropped connection.
    failures: VecDeque<Option<u16>>,
    requests: Vec<String>,
}

/// A fake Mobile API.
///
/// Cloning shares the state.
#[derive(Debug, Clone)]
pub struct FakeMobileApi {
    application_code: String,
    inner: Arc<Mutex<Inner>>,
}

impl FakeMobileApi {
    /// Creates an empty API accepting `application_code`.
    pub fn new(application_code: impl Into<String>) -> Self {
        Self::with_state(application_code, ApiState::default())
    }

    /// Creates an API starting from `state`.
    pub fn with_state(application_code: impl Into<String>, state: ApiState) -> Self {
        Self {
            application_code: application_code.into(),
            inner: Arc::new(Mutex::new(Inner {
                state,
                ..Inner::default()
            })),
        }
    }

    /// Loads state saved with `save`, or starts empty if the file is absent.
    pub fn load(application_code: impl Into<String>, path: &Path) -> std::io::Result<Self> {
        let state = match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ApiState::default(),
            Err(e) => return Err(e),
        };
        Ok(Self::with_state(application_code, state))
    }

    /// Writes the state as JSON.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.state())?;
        std::fs::write(path, bytes)
    }

    /// A copy of the current state.
    pub fn state(&self) -> ApiState {
        self.inner.lock().state.clone()
    }

    /// Answers the next request with `status` instead of handling it.
    pub fn fail_next(&self, status: u16) {
        self.inner.lock().failures.push_back(Some(status));
    }

    /// Drops the connection of the next request.
    pub fn disconnect_next(&self) {
        self.inner.lock().failures.push_back(None);
    }

    /// Makes a message available for fetching.
    pub fn deliver(&self, message_id: &str, body: &str) {
        self.inner.lock().state.inbox.push(json!({
            "messageId": message_id,
            "body": body,
        }));
    }

    /// Adds another installation to the user attached to `registration`.
    pub fn add_user_installation(&self, registration: &str, other: &str, is_primary: bool) {
        let mut inner = self.inner.lock();
        let user = inner.state.users.entry(registration.to_string()).or_default();
        let mut instances = instances_of(user);
        instances.push(instance_entry(other, is_primary));
        user.insert("instances".into(), Value::Array(instances));
    }

    /// Every handled request as `METHOD path`, in arrival order.
    pub fn requests(&self) -> Vec<String> {
        self.inner.lock().requests.clone()
    }

    fn authorized(&self, request: &HttpRequest) -> bool {
        request.header("authorization") == Some(format!("App {}", self.application_code).as_str())
    }
}

impl LoopbackServer for FakeMobileApi {
    fn handle(&self, request: &HttpRequest, path: &str) -> Result<HttpResponse, String> {
        let mut inner = self.inner.lock();
        inner.requests.push(format!("{} {}", request.method, path));
        if let Some(failure) = inner.failures.pop_front() {
            return failure
                .map(HttpResponse::status)
                .ok_or_else(|| "connection reset by peer".to_string());
        }
        if !self.authorized(request) {
            return Ok(HttpResponse::status(401));
        }

        let (path, query) = split_query(path);
        let body = if request.body.is_empty() {
            Value::Null
        } else {
            match serde_json::from_slice(&request.body) {
                Ok(body) => body,
                Err(_) => return Ok(HttpResponse::status(400)),
            }
        };
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        let identity = request.header("pushregistrationid");
        let state = &mut inner.state;

        let response = match (request.method, segments.as_slice()) {
            (HttpMethod::Post, ["mobile", "1", "appinstance"]) => state.register(&body),
            (_, ["mobile", "1", "appinstance", reg, ..]) if !state.installations.contains_key(*reg) => {
                HttpResponse::status(404)
            }
            (HttpMethod::Get, ["mobile", "1", "appinstance", reg]) => state.installation(reg),
            (HttpMethod::Patch, ["mobile", "1", "appinstance", reg]) => {
                state.patch_installation(reg, &body)
            }
            (HttpMethod::Get, ["mobile", "1", "appinstance", reg, "user"]) => state.user(reg),
            (HttpMethod::Patch, ["mobile", "1", "appinstance", reg, "user"]) => {
                state.patch_user(reg, &body)
            }
            (HttpMethod::Patch, ["mobile", "1", "appinstance", reg, "user", "instances", other]) => {
                state.patch_other_instance(reg, other, &body)
            }
            (HttpMethod::Post, ["mobile", "1", "appinstance", reg, "personalize"]) => {
                let force = query.get("forceDepersonalize").map(String::as_str) == Some("true");
                state.personalize(reg, &body, force)
            }
            (HttpMethod::Post, ["mobile", "1", "appinstance", reg, "depersonalize"]) => {
                state.depersonalize(reg, query.get("pushRegistrationId").map(String::as_str))
            }
            (HttpMethod::Post, ["mobile", "5", "messages"]) => match identity {
                Some(reg) if state.installations.contains_key(reg) => state.sync_messages(&body),
                _ => HttpResponse::status(404),
            },
            (HttpMethod::Post, ["mobile", "2", "messages", "seen"]) => state.record_seen(&body),
            (HttpMethod::Post, ["mobile", "1", "messages", "mo"]) => state.record_mo(&body),
            (HttpMethod::Post, ["mobile", "1", "data", "system"]) => {
                state.system_data.push(body);
                HttpResponse::status(200)
            }
            _ => HttpResponse::status(404),
        };
        tracing::trace!(method = %request.method, path, status = response.status, "fake api");
        Ok(response)
    }
}

impl ApiState {
    fn register(&mut self, body: &Value) -> HttpResponse {
        let Some(fields) = body.as_object() else {
            return HttpResponse::status(400);
        };
        if fields.get("pushServiceToken").and_then(Value::as_str).is_none() {
            return HttpResponse::status(400);
        }

        let known = fields
            .get("pushRegistrationId")
            .and_then(Value::as_str)
            .filter(|reg| self.installations.contains_key(*reg))
            .map(str::to_string);
        let reg = match known {
            Some(reg) => reg,
            None => {
                self.next_registration += 1;
                format!("reg-{}", self.next_registration)
            }
        };

        let installation = self.installations.entry(reg.clone()).or_insert_with(|| {
            let mut fresh = Object::new();
            fresh.insert("regEnabled".into(), json!(true));
            fresh.insert("isPrimary".into(), json!(false));
            fresh
        });
        merge(installation, fields);
        installation.insert("pushRegistrationId".into(), json!(reg));
        let response = Value::Object(installation.clone());

        self.users.entry(reg.clone()).or_insert_with(|| {
            let mut user = Object::new();
            user.insert("instances".into(), json!([instance_entry(&reg, false)]));
            user
        });
        HttpResponse::ok(&response)
    }

    fn installation(&self, reg: &str) -> HttpResponse {
        match self.installations.get(reg) {
            Some(installation) => HttpResponse::ok(&Value::Object(installation.clone())),
            None => HttpResponse::status(404),
        }
    }

    fn patch_installation(&mut self, reg: &str, body: &Value) -> HttpResponse {
        let Some(fields) = body.as_object() else {
            return HttpResponse::status(400);
        };
        if let Some(installation) = self.installations.get_mut(reg) {
            merge(installation, fields);
        }
        if let Some(primary) = fields.get("isPrimary").and_then(Value::as_bool) {
            self.mark_primary(reg, reg, primary);
        }
        self.installation(reg)
    }

    fn user(&self, reg: &str) -> HttpResponse {
        let user = self.users.get(reg).cloned().unwrap_or_default();
        HttpResponse::ok(&Value::Object(user))
    }

    fn patch_user(&mut self, reg: &str, body: &Value) -> HttpResponse {
        let Some(fields) = body.as_object() else {
            return HttpResponse::status(400);
        };
        let user = self.users.entry(reg.to_string()).or_default();
        merge(user, fields);
        self.user(reg)
    }

    fn personalize(&mut self, reg: &str, body: &Value, force: bool) -> HttpResponse {
        let Some(fields) = body.as_object() else {
            return HttpResponse::status(400);
        };
        let user = self.users.entry(reg.to_string()).or_default();
        let current = user.get("externalUserId").and_then(Value::as_str);
        let requested = fields.get("externalUserId").and_then(Value::as_str);
        if let (Some(current), Some(requested)) = (current, requested) {
            if current != requested {
                if !force {
                    return HttpResponse::status(409);
                }
                user.retain(|key, _| key == "instances");
            }
        }
        merge(user, fields);
        self.user(reg)
    }

    fn depersonalize(&mut self, reg: &str, other: Option<&str>) -> HttpResponse {
        let user = self.users.entry(reg.to_string()).or_default();
        match other {
            Some(other) if other == reg => HttpResponse::status(400),
            Some(other) => {
                let mut instances = instances_of(user);
                instances.retain(|entry| entry["pushRegistrationId"] != json!(other));
                user.insert("instances".into(), Value::Array(instances));
                HttpResponse::status(200)
            }
            None => {
                let own: Vec<Value> = instances_of(user)
                    .into_iter()
                    .filter(|entry| entry["pushRegistrationId"] == json!(reg))
                    .collect();
                user.clear();
                user.insert("instances".into(), Value::Array(own));
                HttpResponse::status(200)
            }
        }
    }

    fn patch_other_instance(&mut self, reg: &str, other: &str, body: &Value) -> HttpResponse {
        let Some(primary) = body.get("isPrimary").and_then(Value::as_bool) else {
            return HttpResponse::status(400);
        };
        let known = self
            .users
            .get(reg)
            .map(instances_of)
            .unwrap_or_default()
            .iter()
            .any(|entry| entry["pushRegistrationId"] == json!(other));
        if !known {
            return HttpResponse::status(400);
        }
        self.mark_primary(reg, other, primary);
        HttpResponse::ok(&instance_entry(other, primary))
    }

    fn mark_primary(&mut self, owner: &str, target: &str, primary: bool) {
        let Some(user) = self.users.get_mut(owner) else {
            return;
        };
        let mut instances = instances_of(user);
        for entry in instances.iter_mut() {
            if entry["pushRegistrationId"] == json!(target) {
                entry["isPrimary"] = json!(primary);
            } else if primary {
                entry["isPrimary"] = json!(false);
            }
        }
        user.insert("instances".into(), Value::Array(instances));
    }

    fn sync_messages(&mut self, body: &Value) -> HttpResponse {
        let ids = |field: &str| -> Vec<String> {
            body.get(field)
                .and_then(Value::as_array)
                .map(|ids| {
                    ids.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };
        let known = ids("mIDs");
        self.delivery_reports.extend(ids("drIDs"));

        let payloads: Vec<Value> = self
            .inbox
            .iter()
            .filter(|m| {
                m["messageId"]
                    .as_str()
                    .is_some_and(|id| !known.iter().any(|k| k == id))
            })
            .cloned()
            .collect();
        HttpResponse::ok(&json!({ "payloads": payloads }))
    }

    fn record_seen(&mut self, body: &Value) -> HttpResponse {
        let Some(messages) = body.get("messages").and_then(Value::as_array) else {
            return HttpResponse::status(400);
        };
        self.seen.extend(
            messages
                .iter()
                .filter_map(|m| m["messageId"].as_str())
                .map(str::to_string),
        );
        HttpResponse::status(200)
    }

    fn record_mo(&mut self, body: &Value) -> HttpResponse {
        let Some(messages) = body.get("messages").and_then(Value::as_array) else {
            return HttpResponse::status(400);
        };
        let results: Vec<Value> = messages
            .iter()
            .map(|message| {
                let mut result = message.clone();
                // Messages without text are refused.
                let text = message["text"].as_str().unwrap_or_default();
                result["statusCode"] = json!(if text.is_empty() { 1 } else { 0 });
                result
            })
            .collect();
        self.mo_messages.extend(messages.iter().cloned());
        HttpResponse::ok(&json!({ "messages": results }))
    }
}

fn merge(target: &mut Object, fields: &Object) {
    for (key, value) in fields {
        if key != "instances" {
            target.insert(key.clone(), value.clone());
        }
    }
}

fn instances_of(user: &Object) -> Vec<Value> {
    user.get("instances")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn instance_entry(reg: &str, is_primary: bool) -> Value {
    json!({ "pushRegistrationId": reg, "isPrimary": is_primary })
}

fn split_query(path: &str) -> (&str, BTreeMap<String, String>) {
    let Some((path, query)) = path.split_once('?') else {
        return (path, BTreeMap::new());
    };
    let query = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    (path, query)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: HttpMethod, path: &str, body: Value) -> HttpRequest {
        HttpRequest {
            method,
            url: format!("https://mobile.test{path}"),
            headers: vec![("Authorization".into(), "App app".into())],
            body: serde_json::to_vec(&body).unwrap(),
        }
    }

    fn call(api: &FakeMobileApi, method: HttpMethod, path: &str, body: Value) -> (u16, Value) {
        let response = api.handle(&request(method, path, body), path).unwrap();
        let body = serde_json::from_slice(&response.body).unwrap_or(Value::Null);
        (response.status, body)
    }

    #[test]
    fn registration_hands_out_ids() {
        let api = FakeMobileApi::new("app");
        let (status, body) = call(
            &api,
            HttpMethod::Post,
            "/mobile/1/appinstance",
            json!({ "pushServiceToken": "t" }),
        );
        assert_eq!(status, 200);
        assert_eq!(body["pushRegistrationId"], json!("reg-1"));

        // Re-registering a known id keeps it.
        let (_, body) = call(
            &api,
            HttpMethod::Post,
            "/mobile/1/appinstance",
            json!({ "pushServiceToken": "t2", "pushRegistrationId": "reg-1" }),
        );
        assert_eq!(body["pushRegistrationId"], json!("reg-1"));
        assert_eq!(api.state().installations.len(), 1);
    }

    #[test]
    fn wrong_application_code_is_unauthorized() {
        let api = FakeMobileApi::new("other");
        let (status, _) = call(&api, HttpMethod::Get, "/mobile/1/appinstance/reg-1", Value::Null);
        assert_eq!(status, 401);
    }

    #[test]
    fn unknown_installation_is_not_found() {
        let api = FakeMobileApi::new("app");
        let (status, _) = call(&api, HttpMethod::Get, "/mobile/1/appinstance/nope/user", Value::Null);
        assert_eq!(status, 404);
    }

    #[test]
    fn scripted_failures_come_first() {
        let api = FakeMobileApi::new("app");
        api.fail_next(503);
        api.disconnect_next();
        let req = request(HttpMethod::Get, "/mobile/1/appinstance/x", Value::Null);
        assert_eq!(api.handle(&req, "/mobile/1/appinstance/x").unwrap().status, 503);
        assert!(api.handle(&req, "/mobile/1/appinstance/x").is_err());
        assert_eq!(api.requests().len(), 2);
    }

    #[test]
    fn personalize_conflicts_without_force() {
        let api = FakeMobileApi::new("app");
        call(&api, HttpMethod::Post, "/mobile/1/appinstance", json!({ "pushServiceToken": "t" }));
        let path = "/mobile/1/appinstance/reg-1/personalize";
        let (status, _) = call(&api, HttpMethod::Post, path, json!({ "externalUserId": "a" }));
        assert_eq!(status, 200);
        let (status, _) = call(&api, HttpMethod::Post, path, json!({ "externalUserId": "b" }));
        assert_eq!(status, 409);

        let forced = format!("{path}?forceDepersonalize=true");
        let (status, body) = call(&api, HttpMethod::Post, &forced, json!({ "externalUserId": "b" }));
        assert_eq!(status, 200);
        assert_eq!(body["externalUserId"], json!("b"));
    }

    #[test]
    fn state_survives_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api.json");
        let api = FakeMobileApi::new("app");
        api.deliver("m1", "hello");
        api.save(&path).unwrap();

        let loaded = FakeMobileApi::load("app", &path).unwrap();
        assert_eq!(loaded.state(), api.state());
        assert!(FakeMobileApi::load("app", &dir.path().join("missing.json")).is_ok());
    }
}
