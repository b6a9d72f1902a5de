//! Persistence collaborator for entities.

use crate::attribute::{AttributesSet, EntityKind};
use crate::entity::Entity;
use crate::error::{CoreError, CoreResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Loads and saves entities.
///
/// Implementations must make `save_entity` atomic: after a crash either the
/// previous or the new entity is observed, current and dirty maps together.
pub trait EntityStore: Send + Sync {
    /// Loads the entity of the given kind, or an empty one if none was saved.
    fn load_entity(&self, kind: EntityKind) -> CoreResult<Entity>;

    /// Atomically replaces the stored entity of `entity.kind()`.
    fn save_entity(&self, entity: &Entity) -> CoreResult<()>;

    /// Loads the set of dirty keys of the stored entity.
    fn load_dirty_snapshot(&self, kind: EntityKind) -> CoreResult<AttributesSet> {
        Ok(self.load_entity(kind)?.dirty_keys())
    }
}

/// An in-memory entity store.
///
/// Saves can be made to fail on demand, which tests use to check that
/// trackers never commit in-memory state the store did not accept.
#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    entities: RwLock<HashMap<EntityKind, Entity>>,
    saves: AtomicU64,
    fail_saves: AtomicBool,
}

impl MemoryEntityStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with entities.
    pub fn with_entities(entities: impl IntoIterator<Item = Entity>) -> Self {
        let store = Self::new();
        {
            let mut map = store.entities.write();
            for entity in entities {
                map.insert(entity.kind(), entity);
            }
        }
        store
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    /// Makes subsequent saves fail (or succeed again).
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Returns the stored entity without going through a tracker.
    pub fn stored(&self, kind: EntityKind) -> Option<Entity> {
        self.entities.read().get(&kind).cloned()
    }
}

impl EntityStore for MemoryEntityStore {
    fn load_entity(&self, kind: EntityKind) -> CoreResult<Entity> {
        Ok(self
            .entities
            .read()
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| Entity::empty(kind)))
    }

    fn save_entity(&self, entity: &Entity) -> CoreResult<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(CoreError::Io(io::Error::other(
                "memory store configured to fail",
            )));
        }
        self.entities.write().insert(entity.kind(), entity.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
