//! Dirty-attribute tracking over an entity store.

use crate::attribute::{AttributeKey, AttributesSet, EntityKind};
use crate::entity::Entity;
use crate::error::{CoreError, CoreResult};
use crate::store::EntityStore;
use crate::AttrValue;
use parking_lot::Mutex;
use std::sync::Arc;

/// Tracks which attributes of one entity are dirty and persists every change.
///
/// All mutations run on a working copy that is saved through the
/// `EntityStore` first and only then installed as the in-memory state, so a
/// value is never held without its dirty mark or the other way round. The
/// tracker's lock is the serialization lane for the entity: user-facing
/// setters and operations merging server responses both go through it.
pub struct AttributeTracker {
    kind: EntityKind,
    entity: Mutex<Entity>,
    store: Arc<dyn EntityStore>,
}

impl AttributeTracker {
    /// Opens a tracker, loading the persisted entity.
    pub fn open(kind: EntityKind, store: Arc<dyn EntityStore>) -> CoreResult<Self> {
        let entity = store.load_entity(kind)?;
        if entity.kind() != kind {
            return Err(CoreError::KindMismatch {
                expected: kind,
                found: entity.kind(),
            });
        }
        Ok(Self {
            kind,
            entity: Mutex::new(entity),
            store,
        })
    }

    /// The kind of entity tracked.
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// A copy of the whole entity.
    pub fn snapshot(&self) -> Entity {
        self.entity.lock().clone()
    }

    /// Resolved value of one attribute.
    pub fn get(&self, key: AttributeKey) -> Option<AttrValue> {
        self.entity.lock().get(key).cloned()
    }

    /// Resolved string value of one attribute.
    pub fn get_string(&self, key: AttributeKey) -> Option<String> {
        self.entity.lock().get_str(key).map(str::to_owned)
    }

    /// Sets a value and marks it dirty.
    pub fn set(&self, key: AttributeKey, value: AttrValue) -> CoreResult<()> {
        self.set_many([(key, value)])
    }

    /// Sets several values in one persisted transaction.
    pub fn set_many(
        &self,
        values: impl IntoIterator<Item = (AttributeKey, AttrValue)>,
    ) -> CoreResult<()> {
        let values: Vec<_> = values.into_iter().collect();
        for (key, _) in &values {
            self.check_kind(*key)?;
        }
        self.transact(|entity| {
            for (key, value) in values {
                entity.set(key, value);
            }
        })
    }

    /// Marks a key dirty, keeping its value.
    pub fn mark_dirty(&self, key: AttributeKey) -> CoreResult<()> {
        self.check_kind(key)?;
        self.transact(|entity| entity.mark_dirty(key))
    }

    /// Stores a value as current without a dirty mark.
    ///
    /// For local-only bookkeeping and for values the server confirmed
    /// outside a reconciled response.
    pub fn set_current(&self, key: AttributeKey, value: AttrValue) -> CoreResult<()> {
        self.check_kind(key)?;
        self.transact(|entity| entity.commit_server_value(key, value))
    }

    /// Returns true if the key is dirty.
    pub fn is_dirty(&self, key: AttributeKey) -> bool {
        self.entity.lock().is_dirty(key)
    }

    /// Snapshot of the dirty keys at this instant.
    pub fn dirty_keys(&self) -> AttributesSet {
        self.entity.lock().dirty_keys()
    }

    /// Clears exactly `keys`; dirty marks set on other keys survive.
    pub fn clear(&self, keys: &AttributesSet) -> CoreResult<()> {
        self.transact(|entity| entity.clear(keys))
    }

    /// Runs `f` on a working copy and commits it atomically.
    ///
    /// If the store rejects the save, the in-memory entity is unchanged.
    pub fn transact<R>(&self, f: impl FnOnce(&mut Entity) -> R) -> CoreResult<R> {
        let mut guard = self.entity.lock();
        let mut working = guard.clone();
        let result = f(&mut working);
        if working != *guard {
            self.store.save_entity(&working)?;
            *guard = working;
        }
        Ok(result)
    }

    /// Atomically replaces the entity (logout / depersonalize).
    pub fn replace(&self, entity: Entity) -> CoreResult<()> {
        if entity.kind() != self.kind {
            return Err(CoreError::KindMismatch {
                expected: self.kind,
                found: entity.kind(),
            });
        }
        let mut guard = self.entity.lock();
        self.store.save_entity(&entity)?;
        *guard = entity;
        tracing::debug!(kind = %self.kind, "entity replaced");
        Ok(())
    }

    fn check_kind(&self, key: AttributeKey) -> CoreResult<()> {
        if key.entity_kind() == self.kind {
            Ok(())
        } else {
            Err(CoreError::ForeignAttribute {
                key,
                kind: self.kind,
            })
        }
    }
}

impl std::fmt::Debug for AttributeTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributeTracker")
            .field("kind", &self.kind)
            .field("entity", &*self.entity.lock())
            .finish()
    }
}
