//! Network collaborator abstraction.

use crate::error::SyncResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use pushsync_core::ResourceId;
use pushsync_protocol::{ApiRequest, ResponsePayload};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Sends API requests.
///
/// One call is one attempt: implementations never retry internally and
/// classify failures into the `SyncError` taxonomy.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Sends a request and decodes its response.
    async fn send(&self, request: &ApiRequest) -> SyncResult<ResponsePayload>;
}

type Responder = Box<dyn Fn(&ApiRequest) -> SyncResult<ResponsePayload> + Send + Sync>;

#[derive(Debug, Default)]
struct LaneUsage {
    readers: usize,
    writers: usize,
}

/// A scripted network for tests.
///
/// Answers every request through a closure, records each request, and
/// tracks how many requests are in flight, both overall and per resource.
/// A writer overlapping any other request on its resource, or a reader
/// overlapping a writer, counts as a lane violation.
pub struct ScriptedNetwork {
    responder: Responder,
    delay: Duration,
    requests: Mutex<Vec<ApiRequest>>,
    lanes: Mutex<HashMap<ResourceId, LaneUsage>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    lane_violations: AtomicUsize,
}

impl ScriptedNetwork {
    /// Creates a network answering with `responder`.
    pub fn new(
        responder: impl Fn(&ApiRequest) -> SyncResult<ResponsePayload> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Box::new(responder),
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
            lanes: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            lane_violations: AtomicUsize::new(0),
        }
    }

    /// Answers every request with an empty payload of the expected shape.
    pub fn empty() -> Self {
        Self::new(|request| Ok(ResponsePayload::decode(request.kind, b"")?))
    }

    /// Holds each request in flight for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every request sent so far, in send order.
    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests sent so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Highest number of concurrent requests observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Number of lane violations observed.
    pub fn lane_violations(&self) -> usize {
        self.lane_violations.load(Ordering::SeqCst)
    }

    fn enter(&self, request: &ApiRequest) {
        let writer = request.kind.is_mutating();
        {
            let mut lanes = self.lanes.lock();
            let usage = lanes.entry(request.resource_id.clone()).or_default();
            let conflict = if writer {
                usage.writers > 0 || usage.readers > 0
            } else {
                usage.writers > 0
            };
            if conflict {
                self.lane_violations.fetch_add(1, Ordering::SeqCst);
            }
            if writer {
                usage.writers += 1;
            } else {
                usage.readers += 1;
            }
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
    }

    fn leave(&self, request: &ApiRequest) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let mut lanes = self.lanes.lock();
        if let Some(usage) = lanes.get_mut(&request.resource_id) {
            if request.kind.is_mutating() {
                usage.writers = usage.writers.saturating_sub(1);
            } else {
                usage.readers = usage.readers.saturating_sub(1);
            }
        }
    }
}

#[async_trait]
impl NetworkClient for ScriptedNetwork {
    async fn send(&self, request: &ApiRequest) -> SyncResult<ResponsePayload> {
        self.enter(request);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let response = (self.responder)(request);
        self.leave(request);
        response
    }
}

impl std::fmt::Debug for ScriptedNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedNetwork")
            .field("delay", &self.delay)
            .field("requests", &self.request_count())
            .field("max_in_flight", &self.max_in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;

    fn reg() -> ResourceId {
        ResourceId::new("reg-1")
    }

    #[tokio::test]
    async fn records_requests() {
        let network = ScriptedNetwork::empty();
        let request = ApiRequest::fetch_user(reg());
        let response = network.send(&request).await.unwrap();

        assert!(response.attributes().is_some());
        assert_eq!(network.requests(), vec![request]);
        assert_eq!(network.max_in_flight(), 1);
        assert_eq!(network.lane_violations(), 0);
    }

    #[tokio::test]
    async fn responder_errors_pass_through() {
        let network = ScriptedNetwork::new(|_| Err(SyncError::Timeout));
        let err = network
            .send(&ApiRequest::fetch_instance(reg()))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Timeout));
        assert_eq!(network.request_count(), 1);
    }

    #[tokio::test]
    async fn overlapping_writers_are_violations() {
        let network = std::sync::Arc::new(
            ScriptedNetwork::empty().with_delay(Duration::from_millis(20)),
        );
        let values = Default::default();
        let a = ApiRequest::patch_user(reg(), &values);
        let b = ApiRequest::patch_user(reg(), &values);

        let n1 = network.clone();
        let n2 = network.clone();
        let (r1, r2) = tokio::join!(
            async move { n1.send(&a).await },
            async move { n2.send(&b).await }
        );
        r1.unwrap();
        r2.unwrap();

        assert_eq!(network.max_in_flight(), 2);
        assert_eq!(network.lane_violations(), 1);
    }
}
