//! Directory-backed message store.
//!
//! Keeps the inbox in memory and rewrites `messages.json` after every
//! change, next to the entity files of the same state directory.

use crate::dir::{lock_exclusive, prepare_dir, write_atomic};
use crate::error::{CoreError, CoreResult};
use crate::message::{
    MemoryMessageStore, Message, MessageRecord, MessageStore, MoMessage, SeenEntry,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

const MESSAGES_FILE: &str = "messages.json";
const MESSAGES_LOCK: &str = "MESSAGES.LOCK";

/// A message store persisting to `messages.json` in a state directory.
///
/// The `MessageStore` methods cannot fail, so a failed write is logged and
/// the in-memory state stays authoritative until the next successful one.
#[derive(Debug)]
pub struct DirMessageStore {
    path: PathBuf,
    inner: MemoryMessageStore,
    _lock_file: File,
    write_lock: Mutex<()>,
}

impl DirMessageStore {
    /// Opens or creates the message store of a state directory.
    ///
    /// # Errors
    ///
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process holds the message lock (`StoreLocked`)
    /// - `messages.json` exists but cannot be read or parsed
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        prepare_dir(path, create_if_missing)?;
        let lock_file = lock_exclusive(&path.join(MESSAGES_LOCK))?;

        let inner = match fs::read(path.join(MESSAGES_FILE)) {
            Ok(data) if data.is_empty() => MemoryMessageStore::new(),
            Ok(data) => MemoryMessageStore::from_json(&data)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => MemoryMessageStore::new(),
            Err(err) => return Err(err.into()),
        };
        tracing::debug!(path = %path.display(), messages = inner.len(), "message store opened");

        Ok(Self {
            path: path.to_path_buf(),
            inner,
            _lock_file: lock_file,
            write_lock: Mutex::new(()),
        })
    }

    /// Returns the file holding the messages.
    pub fn messages_path(&self) -> PathBuf {
        self.path.join(MESSAGES_FILE)
    }

    /// Number of stored messages.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if no messages are stored.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Runs a mutation and writes the result, serialized with other writers.
    fn mutate<R>(&self, f: impl FnOnce(&MemoryMessageStore) -> R) -> R {
        let _guard = self.write_lock.lock();
        let result = f(&self.inner);
        let written = self
            .inner
            .to_json()
            .map_err(CoreError::from)
            .and_then(|data| write_atomic(&self.path, MESSAGES_FILE, &data));
        if let Err(err) = written {
            tracing::warn!(path = %self.path.display(), error = %err, "message store not written");
        }
        result
    }
}

impl MessageStore for DirMessageStore {
    fn contains(&self, message_id: &str) -> bool {
        self.inner.contains(message_id)
    }

    fn insert_new(&self, messages: &[Message]) -> Vec<Message> {
        self.mutate(|inner| inner.insert_new(messages))
    }

    fn get(&self, message_id: &str) -> Option<MessageRecord> {
        self.inner.get(message_id)
    }

    fn message_ids(&self) -> Vec<String> {
        self.inner.message_ids()
    }

    fn pending_delivery_reports(&self) -> Vec<String> {
        self.inner.pending_delivery_reports()
    }

    fn mark_delivery_reported(&self, message_ids: &[String]) {
        self.mutate(|inner| inner.mark_delivery_reported(message_ids))
    }

    fn mark_seen(&self, message_ids: &[String], at: DateTime<Utc>) -> usize {
        self.mutate(|inner| inner.mark_seen(message_ids, at))
    }

    fn pending_seen(&self) -> Vec<SeenEntry> {
        self.inner.pending_seen()
    }

    fn mark_seen_reported(&self, message_ids: &[String]) {
        self.mutate(|inner| inner.mark_seen_reported(message_ids))
    }

    fn save_mo(&self, messages: &[MoMessage]) {
        self.mutate(|inner| inner.save_mo(messages))
    }

    fn get_mo(&self, message_id: &str) -> Option<MoMessage> {
        self.inner.get_mo(message_id)
    }

    fn clear(&self) {
        self.mutate(|inner| inner.clear())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DeliveryMethod;
    use crate::DirEntityStore;
    use serde_json::json;
    use tempfile::TempDir;

    fn push(id: &str) -> Message {
        Message::new(id, false, DeliveryMethod::Push, json!({"body": id}))
    }

    #[test]
    fn inbox_survives_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let store = DirMessageStore::open(temp.path(), true).unwrap();
            store.insert_new(&[push("m1"), push("m2")]);
            store.mark_delivery_reported(&["m1".to_string()]);
            store.mark_seen(&["m2".to_string()], Utc::now());
        }

        let store = DirMessageStore::open(temp.path(), false).unwrap();
        assert_eq!(store.message_ids(), vec!["m1".to_string(), "m2".to_string()]);
        assert!(store.insert_new(&[push("m1")]).is_empty());
        assert_eq!(store.pending_delivery_reports(), vec!["m2".to_string()]);
        assert_eq!(store.pending_seen().len(), 1);
        assert!(!temp.path().join("messages.json.tmp").exists());
    }

    #[test]
    fn shares_a_directory_with_the_entity_store() {
        let temp = TempDir::new().unwrap();
        let _entities = DirEntityStore::open(temp.path(), true).unwrap();
        let messages = DirMessageStore::open(temp.path(), false).unwrap();
        assert!(messages.is_empty());

        let second = DirMessageStore::open(temp.path(), false);
        assert!(matches!(second, Err(CoreError::StoreLocked)));
    }

    #[test]
    fn clear_is_persisted() {
        let temp = TempDir::new().unwrap();
        {
            let store = DirMessageStore::open(temp.path(), true).unwrap();
            store.insert_new(&[push("m1")]);
            store.clear();
        }
        let store = DirMessageStore::open(temp.path(), false).unwrap();
        assert!(store.is_empty());
        assert!(store.messages_path().exists());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(MESSAGES_FILE), b"{not json").unwrap();
        let result = DirMessageStore::open(temp.path(), false);
        assert!(matches!(result, Err(CoreError::Serialization(_))));
    }
}
