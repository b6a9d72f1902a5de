//! Test clients wired to the fake API.

use crate::fake_api::FakeMobileApi;
use pushsync_core::{
    CoreError, DirEntityStore, EntityStore, MemoryEntityStore, MemoryMessageStore, MessageStore,
};
use pushsync_engine::{
    CollectingSink, HttpNetwork, LoopbackClient, RetryConfig, SyncConfig, SyncContext,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Application code the fake API accepts by default.
pub const TEST_APP_CODE: &str = "test-app";
/// Base URL used by test clients.
pub const TEST_BASE_URL: &str = "https://mobile.test";

/// The HTTP network of a test client.
pub type FakeNetwork = HttpNetwork<LoopbackClient<FakeMobileApi>>;

/// Configuration for tests: immediate retries.
pub fn test_config() -> SyncConfig {
    SyncConfig::new(TEST_APP_CODE, TEST_BASE_URL).with_retry(RetryConfig::immediate())
}

/// An HTTP network routed to `api`.
pub fn fake_network(api: FakeMobileApi, config: &SyncConfig) -> Arc<FakeNetwork> {
    Arc::new(HttpNetwork::new(
        config.base_url.clone(),
        config.application_code.clone(),
        config.request_timeout,
        LoopbackClient::new(api),
    ))
}

/// A sync context talking to a fake API, with automatic cleanup.
pub struct TestClient {
    /// The context.
    pub context: SyncContext,
    /// The fake server.
    pub api: FakeMobileApi,
    /// Every event the context emitted.
    pub events: Arc<CollectingSink>,
    /// The message store.
    pub messages: Arc<MemoryMessageStore>,
    /// Kept alive so the state directory survives until drop.
    temp_dir: Option<TempDir>,
}

impl TestClient {
    /// A client with in-memory state and a fresh API.
    pub fn memory() -> Self {
        Self::with_api(FakeMobileApi::new(TEST_APP_CODE))
    }

    /// A client with in-memory state and the given API.
    pub fn with_api(api: FakeMobileApi) -> Self {
        Self::build(api, Arc::new(MemoryEntityStore::new()), None)
    }

    /// A client persisting entities in a temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = DirEntityStore::open(temp_dir.path(), true).expect("Failed to open store");
        Self::build(
            FakeMobileApi::new(TEST_APP_CODE),
            Arc::new(store),
            Some(temp_dir),
        )
    }

    /// Drops the context and opens a new one over the same state directory
    /// and API. In-memory clients start over with empty entities.
    pub fn reopen(self) -> Self {
        let TestClient {
            context,
            api,
            temp_dir,
            ..
        } = self;
        context.shutdown();
        drop(context);

        match temp_dir {
            Some(dir) => {
                let store = reopen_store(dir.path());
                Self::build(api, Arc::new(store), Some(dir))
            }
            None => Self::with_api(api),
        }
    }

    /// The state directory, if file-based.
    pub fn path(&self) -> Option<PathBuf> {
        self.temp_dir.as_ref().map(|d| d.path().to_path_buf())
    }

    /// Registers with `token` and asserts it worked.
    pub async fn registered(self, token: &str) -> Self {
        self.context
            .register(token)
            .await
            .expect("registration failed");
        self
    }

    fn build(api: FakeMobileApi, store: Arc<dyn EntityStore>, temp_dir: Option<TempDir>) -> Self {
        let config = test_config();
        let network = fake_network(api.clone(), &config);
        let events = Arc::new(CollectingSink::new());
        let messages = Arc::new(MemoryMessageStore::new());
        let context = SyncContext::builder(config, network)
            .entity_store(store)
            .message_store(messages.clone() as Arc<dyn MessageStore>)
            .events(events.clone())
            .build()
            .expect("Failed to build sync context");
        Self {
            context,
            api,
            events,
            messages,
            temp_dir,
        }
    }
}

impl std::ops::Deref for TestClient {
    type Target = SyncContext;

    fn deref(&self) -> &Self::Target {
        &self.context
    }
}

/// Worker tasks of a dropped context may still hold the directory lock for
/// a moment.
fn reopen_store(path: &Path) -> DirEntityStore {
    for _ in 0..50 {
        match DirEntityStore::open(path, false) {
            Err(CoreError::StoreLocked) => std::thread::sleep(Duration::from_millis(20)),
            other => return other.expect("Failed to reopen store"),
        }
    }
    panic!("state directory is still locked");
}
