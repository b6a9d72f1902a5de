//! # pushsync testkit
//!
//! Test utilities for pushsync.
//!
//! This crate provides:
//! - `FakeMobileApi`, an in-process Mobile API served through the loopback
//!   HTTP client, with scripted failures
//! - `TestClient`, a `SyncContext` wired to the fake API with in-memory or
//!   temporary-directory state
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pushsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn sync_user() {
//!     let client = TestClient::memory().registered("token").await;
//!     client.sync_user().await.unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fake_api;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fake_api::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fake_api::*;
pub use fixtures::*;
pub use generators::*;
