//! # pushsync engine
//!
//! Operation scheduling and execution for the pushsync client.
//!
//! This crate provides:
//! - `SyncOperation`, a unit of work with a fixed attribute snapshot and a
//!   `Pending -> Running -> {Succeeded, Failed, Cancelled}` state machine
//! - `Executor`, which runs one attempt: cancellation and identity
//!   checkpoints, exactly one network call, then a scoped merge
//! - `OperationQueue`, a bounded worker pool with per-resource lanes
//! - `RetryPolicy` and `ChainPolicy` for retries and follow-up operations
//! - Collaborator traits for the network, identity checks and events
//! - `SyncContext`, the explicit entry point owning all of the above
//!
//! ## Key Invariants
//!
//! - At most one mutating operation per resource id is in flight
//! - An operation issues at most one request per attempt; retries are a
//!   queue concern and resend the request built at construction time
//! - Cancelled and failed operations never clear dirty marks or chain
//! - Every enqueued operation resolves its handle exactly once

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod builder;
mod chain;
mod config;
mod context;
mod error;
mod events;
mod executor;
mod http;
mod identity;
mod operation;
mod queue;
mod retry;
mod transport;

pub use builder::OperationBuilder;
pub use chain::{ChainPolicy, DefaultChainPolicy, FollowUp, NoChain};
pub use config::{RetryConfig, SyncConfig};
pub use context::{SyncContext, SyncContextBuilder, UserIdentity};
pub use error::{ErrorClass, SyncError, SyncResult};
pub use events::{BroadcastSink, CollectingSink, EventSink, NullSink, SyncEvent};
pub use executor::Executor;
pub use http::{HttpClient, HttpNetwork, HttpRequest, HttpResponse, LoopbackClient, LoopbackServer};
pub use identity::{IdentityCheck, RegistrationHealth, StaticIdentity};
pub use operation::{
    CancelToken, OperationId, OperationKind, OperationOutcome, OperationPayload, OperationResult,
    OperationState, Priority, SyncOperation,
};
pub use queue::{OperationHandle, OperationQueue};
pub use retry::{RetryDecision, RetryPolicy};
pub use transport::{NetworkClient, ScriptedNetwork};
