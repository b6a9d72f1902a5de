//! HTTP network adapter.
//!
//! The actual HTTP client is abstracted via a trait so different libraries
//! (or an in-process loopback server) can carry the requests. This module
//! owns URL building, headers, the request timeout, and the mapping from
//! HTTP status codes to the error taxonomy.

use crate::error::{SyncError, SyncResult};
use crate::transport::NetworkClient;
use async_trait::async_trait;
use parking_lot::RwLock;
use pushsync_protocol::{ApiRequest, HttpMethod, RequestKind, ResponsePayload};
use std::time::Duration;

/// A request as handed to the HTTP client.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// HTTP method.
    pub method: HttpMethod,
    /// Absolute URL including the query string.
    pub url: String,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Body bytes (empty when there is none).
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Returns the first header with this name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A raw HTTP response.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// A 200 response with a JSON body.
    pub fn ok(body: &serde_json::Value) -> Self {
        Self {
            status: 200,
            body: serde_json::to_vec(body).unwrap_or_default(),
        }
    }

    /// A response with a status and no body.
    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
        }
    }
}

/// HTTP client abstraction.
///
/// `Err` means the exchange did not complete (connection refused, reset,
/// DNS failure); any received status is an `Ok` response.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Performs one HTTP exchange.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, String>;
}

/// Network collaborator speaking JSON over an `HttpClient`.
pub struct HttpNetwork<C: HttpClient> {
    base_url: String,
    application_code: String,
    timeout: Duration,
    client: C,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpNetwork<C> {
    /// Creates an adapter.
    pub fn new(
        base_url: impl Into<String>,
        application_code: impl Into<String>,
        timeout: Duration,
        client: C,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            application_code: application_code.into(),
            timeout,
            client,
            last_error: RwLock::new(None),
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// The underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Builds the HTTP request for an API request.
    pub fn to_http(&self, request: &ApiRequest) -> HttpRequest {
        let mut headers = vec![
            (
                "Authorization".to_string(),
                format!("App {}", self.application_code),
            ),
            ("Accept".to_string(), "application/json".to_string()),
        ];
        if request.kind.requires_identity() {
            headers.push((
                "pushregistrationid".to_string(),
                request.resource_id.root().to_string(),
            ));
        }
        if request.body.is_some() {
            headers.push(("Content-Type".to_string(), "application/json".to_string()));
        }
        HttpRequest {
            method: request.method,
            url: format!("{}{}", self.base_url, request.path_and_query()),
            headers,
            body: request.body_bytes(),
        }
    }

    fn record(&self, err: &SyncError) {
        *self.last_error.write() = Some(err.to_string());
    }
}

/// Maps a non-success status to the error taxonomy.
fn classify_status(kind: RequestKind, response: &HttpResponse) -> SyncError {
    let message = String::from_utf8_lossy(&response.body).into_owned();
    match response.status {
        401 | 403 => SyncError::AuthOrRegistrationInvalid(format!(
            "{} returned {}",
            kind, response.status
        )),
        // An unknown registration means our identity is stale.
        404 if kind.requires_identity() => SyncError::AuthOrRegistrationInvalid(format!(
            "{} returned 404: registration not found",
            kind
        )),
        408 | 429 => SyncError::TransientNetwork(format!("{} returned {}", kind, response.status)),
        status if status >= 500 => {
            SyncError::TransientNetwork(format!("{} returned {}", kind, status))
        }
        status => SyncError::Rejected { status, message },
    }
}

#[async_trait]
impl<C: HttpClient> NetworkClient for HttpNetwork<C> {
    async fn send(&self, request: &ApiRequest) -> SyncResult<ResponsePayload> {
        let http = self.to_http(request);
        tracing::debug!(method = %http.method, url = %http.url, "sending request");

        let response = match tokio::time::timeout(self.timeout, self.client.execute(http)).await
        {
            Err(_) => Err(SyncError::Timeout),
            Ok(Err(e)) => Err(SyncError::TransientNetwork(e)),
            Ok(Ok(response)) if (200..300).contains(&response.status) => {
                ResponsePayload::decode(request.kind, &response.body).map_err(SyncError::from)
            }
            Ok(Ok(response)) => Err(classify_status(request.kind, &response)),
        };

        match response {
            Ok(payload) => {
                *self.last_error.write() = None;
                Ok(payload)
            }
            Err(err) => {
                self.record(&err);
                Err(err)
            }
        }
    }
}

/// Trait for in-process servers that can answer loopback requests.
pub trait LoopbackServer: Send + Sync {
    /// Handles a request addressed by path and query.
    ///
    /// `Err` simulates a connection failure.
    fn handle(&self, request: &HttpRequest, path: &str) -> Result<HttpResponse, String>;
}

/// A loopback HTTP client that routes requests directly to a server.
///
/// Useful for testing without actual network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }

    /// The server behind the client.
    pub fn server(&self) -> &S {
        &self.server
    }
}

#[async_trait]
impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, String> {
        let path = request
            .url
            .find("/mobile/")
            .map(|i| request.url[i..].to_string())
            .unwrap_or_else(|| request.url.clone());
        self.server.handle(&request, &path)
    }
}
