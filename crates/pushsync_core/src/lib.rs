//! # pushsync core
//!
//! Local entity model for the pushsync client.
//!
//! This crate provides:
//! - `AttributeKey` / `AttributesSet` for scoping reads, writes and merges
//! - `Entity` with a server-confirmed *current* map and a local *dirty* overlay
//! - `AttributeTracker` for transactional dirty tracking over an `EntityStore`
//! - `Reconciler` for applying server responses within an operation's scope
//! - Message records and the `MessageStore` collaborator
//! - `DirEntityStore` / `DirMessageStore` for state kept in a directory
//!
//! ## Key Invariants
//!
//! - A key present in the dirty overlay is locally authoritative
//! - A value is never persisted without its dirty mark (and vice versa)
//! - Clearing dirty marks is a set difference, never a reset
//! - Reconciliation touches only keys inside the operation's scope

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod attribute;
mod dir;
mod dir_messages;
mod entity;
mod error;
mod ids;
mod message;
mod reconciler;
mod store;
mod system_data;
mod tracker;

pub use attribute::{AttributeKey, AttributesSet, EntityKind};
pub use dir::DirEntityStore;
pub use dir_messages::DirMessageStore;
pub use entity::Entity;
pub use error::{CoreError, CoreResult};
pub use ids::ResourceId;
pub use message::{
    DeliveryMethod, MemoryMessageStore, Message, MessageRecord, MessageStore, MoMessage, MoStatus,
    SeenEntry,
};
pub use reconciler::{MergeAction, ReconcileReport, Reconciler};
pub use store::{EntityStore, MemoryEntityStore};
pub use system_data::SystemData;
pub use tracker::AttributeTracker;

/// Attribute values are plain JSON values.
pub type AttrValue = serde_json::Value;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
