//! A client context over a state directory.

use pushsync_core::{DirEntityStore, DirMessageStore};
use pushsync_engine::{HttpNetwork, LoopbackClient, SyncConfig, SyncContext};
use pushsync_testkit::FakeMobileApi;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Application code used when none is given.
pub const DEFAULT_APP_CODE: &str = "pushsync-demo";

const BASE_URL: &str = "https://mobile.local";
const API_STATE_FILE: &str = "api.json";

/// The sync context of one CLI invocation.
///
/// Entities and messages live in the state directory; the fake API state is
/// loaded from and saved back to `api.json` next to them.
pub struct Session {
    context: SyncContext,
    api: FakeMobileApi,
    api_path: PathBuf,
}

impl Session {
    /// Opens (or creates) the state directory.
    pub fn open(path: &Path, application_code: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let store = DirEntityStore::open(path, true)?;
        let messages = DirMessageStore::open(path, false)?;
        let api_path = path.join(API_STATE_FILE);
        let api = FakeMobileApi::load(application_code, &api_path)?;

        let config = SyncConfig::new(application_code, BASE_URL);
        let network = Arc::new(HttpNetwork::new(
            config.base_url.clone(),
            config.application_code.clone(),
            config.request_timeout,
            LoopbackClient::new(api.clone()),
        ));
        let context = SyncContext::builder(config, network)
            .entity_store(Arc::new(store))
            .message_store(Arc::new(messages))
            .build()?;
        tracing::debug!(path = %path.display(), "opened state directory");

        Ok(Self {
            context,
            api,
            api_path,
        })
    }

    /// The sync context.
    pub fn context(&self) -> &SyncContext {
        &self.context
    }

    /// The fake API.
    pub fn api(&self) -> &FakeMobileApi {
        &self.api
    }

    /// Waits for chained work, stops the queue and saves the API state.
    pub async fn close(self) -> Result<(), Box<dyn std::error::Error>> {
        self.context.wait_idle().await;
        self.context.shutdown();
        self.api.save(&self.api_path)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_session() -> (tempfile::TempDir, Session) {
    let dir = tempfile::TempDir::new().expect("Failed to create temp directory");
    let session = Session::open(dir.path(), DEFAULT_APP_CODE).expect("Failed to open session");
    (dir, session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pushsync_core::{DeliveryMethod, Message};

    #[tokio::test]
    async fn close_saves_the_api_state() {
        let (dir, session) = test_session();
        session.api().deliver("m1", "hello");
        session.close().await.unwrap();

        let api = FakeMobileApi::load(DEFAULT_APP_CODE, &dir.path().join(API_STATE_FILE)).unwrap();
        assert_eq!(api.state().inbox.len(), 1);
    }

    #[tokio::test]
    async fn messages_survive_a_reopen() {
        let (dir, session) = test_session();
        let message = Message::new("m1", false, DeliveryMethod::Pull, serde_json::json!({}));
        session.context().message_store().insert_new(&[message]);
        session.close().await.unwrap();

        let session = Session::open(dir.path(), DEFAULT_APP_CODE).unwrap();
        assert!(session.context().message_store().contains("m1"));
    }
}
