//! Locally tracked entities.

use crate::attribute::{AttributeKey, AttributesSet, EntityKind};
use crate::AttrValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A locally held entity (installation or user profile).
///
/// Two parallel maps are kept:
/// - `current`: the last server-confirmed value of each attribute
/// - `dirty`: attributes changed locally and not yet confirmed
///
/// A key in `dirty` is locally authoritative. Absence means `current` is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    kind: EntityKind,
    #[serde(default)]
    current: BTreeMap<AttributeKey, AttrValue>,
    #[serde(default)]
    dirty: BTreeMap<AttributeKey, AttrValue>,
}

impl Entity {
    /// Creates an empty entity of the given kind.
    pub fn empty(kind: EntityKind) -> Self {
        Self {
            kind,
            current: BTreeMap::new(),
            dirty: BTreeMap::new(),
        }
    }

    /// Returns the entity kind.
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Returns true if nothing is stored at all.
    pub fn is_empty(&self) -> bool {
        self.current.is_empty() && self.dirty.is_empty()
    }

    /// Resolved value: the dirty overlay wins over the current value.
    pub fn get(&self, key: AttributeKey) -> Option<&AttrValue> {
        self.dirty.get(&key).or_else(|| self.current.get(&key))
    }

    /// Resolved value as a string slice.
    pub fn get_str(&self, key: AttributeKey) -> Option<&str> {
        self.get(key).and_then(AttrValue::as_str)
    }

    /// Resolved value as a bool.
    pub fn get_bool(&self, key: AttributeKey) -> Option<bool> {
        self.get(key).and_then(AttrValue::as_bool)
    }

    /// Last server-confirmed value.
    pub fn current(&self, key: AttributeKey) -> Option<&AttrValue> {
        self.current.get(&key)
    }

    /// All server-confirmed values.
    pub fn current_values(&self) -> &BTreeMap<AttributeKey, AttrValue> {
        &self.current
    }

    /// All locally changed values.
    pub fn dirty_values(&self) -> &BTreeMap<AttributeKey, AttrValue> {
        &self.dirty
    }

    /// Writes a local value and marks the key dirty.
    pub fn set(&mut self, key: AttributeKey, value: AttrValue) {
        self.dirty.insert(key, value);
    }

    /// Marks a key dirty without changing its resolved value.
    ///
    /// A key with no value at all is marked dirty as JSON null.
    pub fn mark_dirty(&mut self, key: AttributeKey) {
        if !self.dirty.contains_key(&key) {
            let value = self.current.get(&key).cloned().unwrap_or(AttrValue::Null);
            self.dirty.insert(key, value);
        }
    }

    /// Unconfirmed local value, if any.
    pub fn dirty_value(&self, key: AttributeKey) -> Option<&AttrValue> {
        self.dirty.get(&key)
    }

    /// Returns true if the key has an unconfirmed local change.
    pub fn is_dirty(&self, key: AttributeKey) -> bool {
        self.dirty.contains_key(&key)
    }

    /// Snapshot of all dirty keys.
    pub fn dirty_keys(&self) -> AttributesSet {
        self.dirty.keys().copied().collect()
    }

    /// Clears the dirty mark of one key, promoting its local value to current.
    ///
    /// Returns true if the key was dirty.
    pub fn acknowledge(&mut self, key: AttributeKey) -> bool {
        match self.dirty.remove(&key) {
            Some(value) => {
                self.current.insert(key, value);
                true
            }
            None => false,
        }
    }

    /// Clears the dirty marks of exactly `keys` (set difference).
    pub fn clear(&mut self, keys: &AttributesSet) {
        for key in keys.iter() {
            self.acknowledge(key);
        }
    }

    /// Stores a server-confirmed value and drops any dirty mark for the key.
    pub fn commit_server_value(&mut self, key: AttributeKey, value: AttrValue) {
        self.dirty.remove(&key);
        self.current.insert(key, value);
    }

    /// Stores a server-confirmed value, leaving any dirty overlay in place.
    pub fn write_current(&mut self, key: AttributeKey, value: AttrValue) {
        self.current.insert(key, value);
    }

    /// Resolved values for every key in `scope`; missing values become null.
    pub fn values_for(&self, scope: &AttributesSet) -> BTreeMap<AttributeKey, AttrValue> {
        scope
            .iter()
            .map(|key| (key, self.get(key).cloned().unwrap_or(AttrValue::Null)))
            .collect()
    }
}
