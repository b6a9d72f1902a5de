//! Directory-backed entity store.
//!
//! Layout of a state directory:
//!
//! ```text
//! <state_dir>/
//! ├─ LOCK               # Advisory lock for single-writer
//! ├─ installation.json  # Installation entity (current + dirty)
//! ├─ user.json          # User entity (current + dirty)
//! ├─ MESSAGES.LOCK      # Advisory lock of the message store
//! └─ messages.json      # Inbox, seen marks and outgoing messages
//! ```
//!
//! The LOCK files ensure only one process writes the state at a time.
//! Files are written with a write-then-rename so a crash leaves either
//! the previous or the new file, never a torn one.

use crate::attribute::EntityKind;
use crate::entity::Entity;
use crate::error::{CoreError, CoreResult};
use crate::store::EntityStore;
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";

/// An entity store persisting one JSON file per entity kind.
///
/// # Example
///
/// ```rust,ignore
/// use pushsync_core::{DirEntityStore, EntityKind, EntityStore};
///
/// let store = DirEntityStore::open(Path::new("state"), true)?;
/// let installation = store.load_entity(EntityKind::Installation)?;
/// ```
#[derive(Debug)]
pub struct DirEntityStore {
    path: PathBuf,
    _lock_file: File,
    write_lock: Mutex<()>,
}

impl DirEntityStore {
    /// Opens or creates a state directory and takes its exclusive lock.
    ///
    /// # Errors
    ///
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process holds the lock (`StoreLocked`)
    /// - I/O errors occur
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        prepare_dir(path, create_if_missing)?;
        let lock_file = lock_exclusive(&path.join(LOCK_FILE))?;

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
            write_lock: Mutex::new(()),
        })
    }

    /// Returns the state directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the file holding the entity of `kind`.
    pub fn entity_path(&self, kind: EntityKind) -> PathBuf {
        self.path.join(format!("{}.json", kind.as_str()))
    }

}

/// Checks that `path` is a directory, creating it if allowed.
pub(crate) fn prepare_dir(path: &Path, create_if_missing: bool) -> CoreResult<()> {
    if !path.exists() {
        if create_if_missing {
            fs::create_dir_all(path)?;
        } else {
            return Err(CoreError::invalid_layout(format!(
                "state directory does not exist: {}",
                path.display()
            )));
        }
    }

    if !path.is_dir() {
        return Err(CoreError::invalid_layout(format!(
            "path is not a directory: {}",
            path.display()
        )));
    }
    Ok(())
}

/// Opens `lock_path` and takes an exclusive advisory lock on it.
pub(crate) fn lock_exclusive(lock_path: &Path) -> CoreResult<File> {
    let lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)?;

    if lock_file.try_lock_exclusive().is_err() {
        return Err(CoreError::StoreLocked);
    }
    Ok(lock_file)
}

/// Replaces `dir/name` with `data` through a temp file and a rename.
pub(crate) fn write_atomic(dir: &Path, name: &str, data: &[u8]) -> CoreResult<()> {
    let target = dir.join(name);
    let temp = dir.join(format!("{name}.tmp"));

    let mut file = File::create(&temp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp, &target)?;
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}

impl EntityStore for DirEntityStore {
    fn load_entity(&self, kind: EntityKind) -> CoreResult<Entity> {
        let path = self.entity_path(kind);
        if !path.exists() {
            return Ok(Entity::empty(kind));
        }

        let data = fs::read(&path)?;
        if data.is_empty() {
            return Ok(Entity::empty(kind));
        }

        let entity: Entity = serde_json::from_slice(&data)?;
        if entity.kind() != kind {
            return Err(CoreError::KindMismatch {
                expected: kind,
                found: entity.kind(),
            });
        }
        Ok(entity)
    }

    fn save_entity(&self, entity: &Entity) -> CoreResult<()> {
        let _guard = self.write_lock.lock();
        let data = serde_json::to_vec_pretty(entity)?;
        write_atomic(&self.path, &format!("{}.json", entity.kind().as_str()), &data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::AttributeKey;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn open_creates_a_missing_directory() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state");

        let store = DirEntityStore::open(&path, true).unwrap();
        assert!(path.is_dir());
        assert!(path.join(LOCK_FILE).exists());
        assert_eq!(store.path(), path.as_path());
    }

    #[test]
    fn open_missing_without_create_fails() {
        let temp = TempDir::new().unwrap();
        let result = DirEntityStore::open(&temp.path().join("nope"), false);
        assert!(matches!(result, Err(CoreError::InvalidLayout { .. })));
    }

    #[test]
    fn second_open_is_locked() {
        let temp = TempDir::new().unwrap();
        let _first = DirEntityStore::open(temp.path(), true).unwrap();
        let second = DirEntityStore::open(temp.path(), true);
        assert!(matches!(second, Err(CoreError::StoreLocked)));
    }

    #[test]
    fn save_and_reload() {
        let temp = TempDir::new().unwrap();
        {
            let store = DirEntityStore::open(temp.path(), true).unwrap();
            let mut entity = Entity::empty(EntityKind::User);
            entity.commit_server_value(AttributeKey::ExternalUserId, json!("ext-1"));
            entity.set(AttributeKey::Tags, json!(["a", "b"]));
            store.save_entity(&entity).unwrap();
        }

        let store = DirEntityStore::open(temp.path(), false).unwrap();
        let entity = store.load_entity(EntityKind::User).unwrap();
        assert_eq!(
            entity.current(AttributeKey::ExternalUserId),
            Some(&json!("ext-1"))
        );
        assert!(entity.is_dirty(AttributeKey::Tags));
        assert!(!store
            .path()
            .join("user.json.tmp")
            .exists());
    }

    #[test]
    fn mismatched_file_is_rejected() {
        let temp = TempDir::new().unwrap();
        let store = DirEntityStore::open(temp.path(), true).unwrap();
        let user = serde_json::to_vec(&Entity::empty(EntityKind::User)).unwrap();
        fs::write(store.entity_path(EntityKind::Installation), user).unwrap();

        let result = store.load_entity(EntityKind::Installation);
        assert!(matches!(result, Err(CoreError::KindMismatch { .. })));
    }
}
