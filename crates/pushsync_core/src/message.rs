//! Push messages, mobile-originated messages and the message store.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// How a message reached the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMethod {
    /// Delivered by the platform push service.
    Push,
    /// Fetched from the server.
    Pull,
}

/// A message received by the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned message id.
    pub message_id: String,
    /// Silent messages are not shown to the user.
    pub is_silent: bool,
    /// Delivery channel.
    pub delivery_method: DeliveryMethod,
    /// Original payload.
    pub payload: serde_json::Value,
    /// Local receive time.
    pub received_at: DateTime<Utc>,
}

impl Message {
    /// Creates a message received now.
    pub fn new(
        message_id: impl Into<String>,
        is_silent: bool,
        delivery_method: DeliveryMethod,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            is_silent,
            delivery_method,
            payload,
            received_at: Utc::now(),
        }
    }
}

/// Local bookkeeping for a stored message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// The message.
    pub message: Message,
    /// When the user saw it, if ever.
    pub seen_at: Option<DateTime<Utc>>,
    /// Whether the seen status reached the server.
    pub seen_reported: bool,
    /// Whether the delivery report reached the server.
    pub delivery_reported: bool,
}

/// A seen-status report entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenEntry {
    /// Message id.
    pub message_id: String,
    /// When it was seen.
    pub seen_at: DateTime<Utc>,
}

impl SeenEntry {
    /// Seconds elapsed between `seen_at` and `now`, never negative.
    pub fn timestamp_delta(&self, now: DateTime<Utc>) -> u64 {
        (now - self.seen_at).num_seconds().max(0) as u64
    }
}

/// Send status of a mobile-originated message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoStatus {
    /// Not yet sent.
    Undefined,
    /// Accepted by the server.
    SentSuccessfully,
    /// Rejected by the server.
    SentWithFailure,
}

impl MoStatus {
    /// Maps a server status code (0 = success).
    pub fn from_code(code: i64) -> Self {
        if code == 0 {
            MoStatus::SentSuccessfully
        } else {
            MoStatus::SentWithFailure
        }
    }
}

/// A mobile-originated message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoMessage {
    /// Client-generated message id.
    pub message_id: String,
    /// Optional destination address.
    pub destination: Option<String>,
    /// Message text.
    pub text: String,
    /// Custom payload.
    pub custom_payload: Option<serde_json::Value>,
    /// Send status.
    pub status: MoStatus,
}

impl MoMessage {
    /// Creates an unsent message with a fresh id.
    pub fn new(
        destination: Option<String>,
        text: impl Into<String>,
        custom_payload: Option<serde_json::Value>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            destination,
            text: text.into(),
            custom_payload,
            status: MoStatus::Undefined,
        }
    }
}

/// Persistence collaborator for messages.
///
/// Every method is atomic with respect to the others.
pub trait MessageStore: Send + Sync {
    /// Returns true if a message with this id is stored.
    fn contains(&self, message_id: &str) -> bool;

    /// Stores messages not seen before and returns exactly those, in input
    /// order. Duplicates within `messages` are stored once.
    fn insert_new(&self, messages: &[Message]) -> Vec<Message>;

    /// Returns a stored message.
    fn get(&self, message_id: &str) -> Option<MessageRecord>;

    /// Ids of every stored message.
    fn message_ids(&self) -> Vec<String>;

    /// Ids of push-delivered messages whose delivery report is pending.
    fn pending_delivery_reports(&self) -> Vec<String>;

    /// Marks delivery reports as sent.
    fn mark_delivery_reported(&self, message_ids: &[String]);

    /// Records seen timestamps for known, not yet seen messages.
    /// Returns how many were updated.
    fn mark_seen(&self, message_ids: &[String], at: DateTime<Utc>) -> usize;

    /// Seen entries not yet reported.
    fn pending_seen(&self) -> Vec<SeenEntry>;

    /// Marks seen entries as reported.
    fn mark_seen_reported(&self, message_ids: &[String]);

    /// Stores or updates mobile-originated messages.
    fn save_mo(&self, messages: &[MoMessage]);

    /// Returns a stored mobile-originated message.
    fn get_mo(&self, message_id: &str) -> Option<MoMessage>;

    /// Drops every stored message.
    fn clear(&self);
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MessageTables {
    #[serde(default)]
    messages: BTreeMap<String, MessageRecord>,
    #[serde(default)]
    order: Vec<String>,
    #[serde(default)]
    mo: HashMap<String, MoMessage>,
}

/// An in-memory message store.
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    tables: RwLock<MessageTables>,
}

impl MemoryMessageStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages.
    pub fn len(&self) -> usize {
        self.tables.read().messages.len()
    }

    /// Returns true if no messages are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(&*self.tables.read())
    }

    pub(crate) fn from_json(data: &[u8]) -> serde_json::Result<Self> {
        Ok(Self {
            tables: RwLock::new(serde_json::from_slice(data)?),
        })
    }
}

impl MessageStore for MemoryMessageStore {
    fn contains(&self, message_id: &str) -> bool {
        self.tables.read().messages.contains_key(message_id)
    }

    fn insert_new(&self, messages: &[Message]) -> Vec<Message> {
        let mut tables = self.tables.write();
        let mut inserted = Vec::new();
        for message in messages {
            if tables.messages.contains_key(&message.message_id) {
                continue;
            }
            tables.messages.insert(
                message.message_id.clone(),
                MessageRecord {
                    message: message.clone(),
                    seen_at: None,
                    seen_reported: false,
                    delivery_reported: message.delivery_method != DeliveryMethod::Push,
                },
            );
            tables.order.push(message.message_id.clone());
            inserted.push(message.clone());
        }
        inserted
    }

    fn get(&self, message_id: &str) -> Option<MessageRecord> {
        self.tables.read().messages.get(message_id).cloned()
    }

    fn message_ids(&self) -> Vec<String> {
        self.tables.read().order.clone()
    }

    fn pending_delivery_reports(&self) -> Vec<String> {
        let tables = self.tables.read();
        tables
            .order
            .iter()
            .filter(|id| {
                tables
                    .messages
                    .get(id.as_str())
                    .is_some_and(|r| !r.delivery_reported)
            })
            .cloned()
            .collect()
    }

    fn mark_delivery_reported(&self, message_ids: &[String]) {
        let mut tables = self.tables.write();
        for id in message_ids {
            if let Some(record) = tables.messages.get_mut(id) {
                record.delivery_reported = true;
            }
        }
    }

    fn mark_seen(&self, message_ids: &[String], at: DateTime<Utc>) -> usize {
        let mut tables = self.tables.write();
        let mut updated = 0;
        for id in message_ids {
            if let Some(record) = tables.messages.get_mut(id) {
                if record.seen_at.is_none() {
                    record.seen_at = Some(at);
                    record.seen_reported = false;
                    updated += 1;
                }
            }
        }
        updated
    }

    fn pending_seen(&self) -> Vec<SeenEntry> {
        let tables = self.tables.read();
        tables
            .order
            .iter()
            .filter_map(|id| tables.messages.get(id.as_str()))
            .filter(|r| !r.seen_reported)
            .filter_map(|r| {
                r.seen_at.map(|seen_at| SeenEntry {
                    message_id: r.message.message_id.clone(),
                    seen_at,
                })
            })
            .collect()
    }

    fn mark_seen_reported(&self, message_ids: &[String]) {
        let mut tables = self.tables.write();
        for id in message_ids {
            if let Some(record) = tables.messages.get_mut(id) {
                if record.seen_at.is_some() {
                    record.seen_reported = true;
                }
            }
        }
    }

    fn save_mo(&self, messages: &[MoMessage]) {
        let mut tables = self.tables.write();
        for message in messages {
            tables
                .mo
                .insert(message.message_id.clone(), message.clone());
        }
    }

    fn get_mo(&self, message_id: &str) -> Option<MoMessage> {
        self.tables.read().mo.get(message_id).cloned()
    }

    fn clear(&self) {
        *self.tables.write() = MessageTables::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn push(id: &str) -> Message {
        Message::new(id, false, DeliveryMethod::Push, json!({"body": id}))
    }

    #[test]
    fn insert_new_deduplicates() {
        let store = MemoryMessageStore::new();
        let first = store.insert_new(&[push("m1"), push("m2")]);
        assert_eq!(first.len(), 2);

        let second = store.insert_new(&[push("m2"), push("m3"), push("m3")]);
        let ids: Vec<_> = second.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m3"]);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn delivery_reports_only_for_push() {
        let store = MemoryMessageStore::new();
        store.insert_new(&[
            push("m1"),
            Message::new("m2", false, DeliveryMethod::Pull, json!({})),
        ]);
        assert_eq!(store.pending_delivery_reports(), vec!["m1".to_string()]);

        store.mark_delivery_reported(&["m1".to_string()]);
        assert!(store.pending_delivery_reports().is_empty());
    }

    #[test]
    fn seen_lifecycle() {
        let store = MemoryMessageStore::new();
        store.insert_new(&[push("m1"), push("m2")]);

        let now = Utc::now();
        let ids = vec!["m1".to_string(), "unknown".to_string()];
        assert_eq!(store.mark_seen(&ids, now), 1);
        assert_eq!(store.mark_seen(&ids, now), 0);

        let pending = store.pending_seen();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message_id, "m1");

        store.mark_seen_reported(&["m1".to_string()]);
        assert!(store.pending_seen().is_empty());
    }

    #[test]
    fn clear_forgets_everything() {
        let store = MemoryMessageStore::new();
        store.insert_new(&[push("m1")]);
        store.save_mo(&[MoMessage::new(None, "hi", None)]);
        store.clear();

        assert!(store.is_empty());
        assert!(store.pending_delivery_reports().is_empty());
        assert_eq!(store.insert_new(&[push("m1")]).len(), 1);
    }

    #[test]
    fn timestamp_delta_never_negative() {
        let now = Utc::now();
        let entry = SeenEntry {
            message_id: "m".into(),
            seen_at: now + chrono::Duration::seconds(10),
        };
        assert_eq!(entry.timestamp_delta(now), 0);
    }

    #[test]
    fn mo_messages_get_unique_ids() {
        let a = MoMessage::new(None, "hi", None);
        let b = MoMessage::new(None, "hi", None);
        assert_ne!(a.message_id, b.message_id);
        assert_eq!(a.status, MoStatus::Undefined);
        assert_eq!(MoStatus::from_code(0), MoStatus::SentSuccessfully);
        assert_eq!(MoStatus::from_code(7), MoStatus::SentWithFailure);
    }
}
