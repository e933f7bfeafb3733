//! Persistent key/value state: a closed set of keys, JSON values, and a
//! per-key revision counter for compare-and-swap writes.
//!
//! `MemoryStore` keeps everything in process. `FileStore` mirrors the map to
//! a JSON file and replaces it atomically (write temp sibling, rename) on
//! every update, so a write is durable once `update` returns.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Keys understood by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageKey {
    /// `{"bookId": ..., "chapter": ...}` of the chapter to open.
    CurrentBookChapter,
    /// Project root; audio and source paths resolve against it.
    ProjectDirectory,
    /// JSON-serialized map of book id → parsed content.
    LoadedBookContent,
    /// JSON-serialized versification table.
    Versification,
}

impl StorageKey {
    pub const ALL: [StorageKey; 4] = [
        StorageKey::CurrentBookChapter,
        StorageKey::ProjectDirectory,
        StorageKey::LoadedBookContent,
        StorageKey::Versification,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StorageKey::CurrentBookChapter => "current-book-chapter",
            StorageKey::ProjectDirectory => "project-directory",
            StorageKey::LoadedBookContent => "loaded-book-content",
            StorageKey::Versification => "versification",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to write state file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A stored value together with the revision it was read at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned {
    pub revision: u64,
    pub value: Value,
}

pub trait StateStore: Send + Sync {
    fn get_versioned(&self, key: StorageKey) -> Option<Versioned>;

    /// Unconditional write; bumps the key's revision.
    fn update(&self, key: StorageKey, value: Value) -> Result<(), StoreError>;

    /// Write only if the key is still at `expected_revision` (0 = absent).
    /// Returns `Ok(false)` on conflict without writing.
    fn update_if(
        &self,
        key: StorageKey,
        expected_revision: u64,
        value: Value,
    ) -> Result<bool, StoreError>;

    fn get(&self, key: StorageKey) -> Option<Value> {
        self.get_versioned(key).map(|v| v.value)
    }

    fn revision(&self, key: StorageKey) -> u64 {
        self.get_versioned(key).map_or(0, |v| v.revision)
    }
}

type Entries = BTreeMap<StorageKey, Versioned>;

fn lock(entries: &Mutex<Entries>) -> MutexGuard<'_, Entries> {
    entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn next_revision(entries: &Entries, key: StorageKey) -> u64 {
    entries.get(&key).map_or(0, |v| v.revision) + 1
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<Entries>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn get_versioned(&self, key: StorageKey) -> Option<Versioned> {
        lock(&self.entries).get(&key).cloned()
    }

    fn update(&self, key: StorageKey, value: Value) -> Result<(), StoreError> {
        let mut entries = lock(&self.entries);
        let revision = next_revision(&entries, key);
        entries.insert(key, Versioned { revision, value });
        Ok(())
    }

    fn update_if(
        &self,
        key: StorageKey,
        expected_revision: u64,
        value: Value,
    ) -> Result<bool, StoreError> {
        let mut entries = lock(&self.entries);
        let revision = next_revision(&entries, key);
        if revision - 1 != expected_revision {
            debug!(
                "store: conflict on {} (expected r{expected_revision}, at r{})",
                key.as_str(),
                revision - 1
            );
            return Ok(false);
        }
        entries.insert(key, Versioned { revision, value });
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// FileStore
// ---------------------------------------------------------------------------

#[derive(Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    entries: Entries,
}

pub struct FileStore {
    path: PathBuf,
    entries: Mutex<Entries>,
}

impl FileStore {
    /// Open (or lazily create) the state file at `path`.
    ///
    /// A file that cannot be decoded is moved aside to `<path>.corrupt` and
    /// the store starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<StateFile>(&text) {
                Ok(file) => {
                    info!(
                        "store: loaded {} key(s) from {}",
                        file.entries.len(),
                        path.display()
                    );
                    file.entries
                }
                Err(e) => {
                    warn!("store: {} is corrupt ({e}), starting empty", path.display());
                    let aside = corrupt_path(&path);
                    if let Err(e) = fs::rename(&path, &aside) {
                        warn!("store: could not move corrupt file aside: {e}");
                    }
                    Entries::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("store: {} not found, starting empty", path.display());
                Entries::new()
            }
            Err(e) => {
                warn!("store: failed to read {} ({e}), starting empty", path.display());
                Entries::new()
            }
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &Entries) -> Result<(), StoreError> {
        let text = serde_json::to_string(&StateFile {
            entries: entries.clone(),
        })?;
        let write_err = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, text).map_err(write_err)?;
        fs::rename(&tmp, &self.path).map_err(write_err)?;
        debug!("store: wrote {}", self.path.display());
        Ok(())
    }

    /// Insert `value` and persist; on failure the in-memory map is rolled back
    /// so memory never runs ahead of disk.
    fn commit(
        &self,
        entries: &mut Entries,
        key: StorageKey,
        value: Value,
    ) -> Result<(), StoreError> {
        let revision = next_revision(entries, key);
        let previous = entries.insert(key, Versioned { revision, value });
        if let Err(e) = self.persist(entries) {
            match previous {
                Some(prev) => entries.insert(key, prev),
                None => entries.remove(&key),
            };
            return Err(e);
        }
        Ok(())
    }
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".corrupt");
    PathBuf::from(name)
}

impl StateStore for FileStore {
    fn get_versioned(&self, key: StorageKey) -> Option<Versioned> {
        lock(&self.entries).get(&key).cloned()
    }

    fn update(&self, key: StorageKey, value: Value) -> Result<(), StoreError> {
        let mut entries = lock(&self.entries);
        self.commit(&mut entries, key, value)
    }

    fn update_if(
        &self,
        key: StorageKey,
        expected_revision: u64,
        value: Value,
    ) -> Result<bool, StoreError> {
        let mut entries = lock(&self.entries);
        let current = entries.get(&key).map_or(0, |v| v.revision);
        if current != expected_revision {
            debug!(
                "store: conflict on {} (expected r{expected_revision}, at r{current})",
                key.as_str()
            );
            return Ok(false);
        }
        self.commit(&mut entries, key, value)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memory_get_update() {
        let store = MemoryStore::new();
        assert_eq!(store.get(StorageKey::ProjectDirectory), None);
        assert_eq!(store.revision(StorageKey::ProjectDirectory), 0);
        store
            .update(StorageKey::ProjectDirectory, json!("/tmp/project"))
            .unwrap();
        assert_eq!(
            store.get(StorageKey::ProjectDirectory),
            Some(json!("/tmp/project"))
        );
        assert_eq!(store.revision(StorageKey::ProjectDirectory), 1);
    }

    #[test]
    fn memory_update_if_detects_conflict() {
        let store = MemoryStore::new();
        assert!(store.update_if(StorageKey::LoadedBookContent, 0, json!("a")).unwrap());
        // Second writer still believes the key is absent.
        assert!(!store.update_if(StorageKey::LoadedBookContent, 0, json!("b")).unwrap());
        assert_eq!(store.get(StorageKey::LoadedBookContent), Some(json!("a")));
        assert!(store.update_if(StorageKey::LoadedBookContent, 1, json!("c")).unwrap());
        assert_eq!(store.revision(StorageKey::LoadedBookContent), 2);
    }

    #[test]
    fn key_names_are_stable() {
        let names: Vec<&str> = StorageKey::ALL.iter().map(|k| k.as_str()).collect();
        assert_eq!(
            names,
            [
                "current-book-chapter",
                "project-directory",
                "loaded-book-content",
                "versification"
            ]
        );
        assert_eq!(
            serde_json::to_value(StorageKey::LoadedBookContent).unwrap(),
            json!("loaded-book-content")
        );
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        {
            let store = FileStore::open(&path);
            store
                .update(StorageKey::CurrentBookChapter, json!({"bookId": "GEN", "chapter": 2}))
                .unwrap();
            assert!(store.update_if(StorageKey::Versification, 0, json!("{}")).unwrap());
        }
        let reopened = FileStore::open(&path);
        assert_eq!(
            reopened.get(StorageKey::CurrentBookChapter),
            Some(json!({"bookId": "GEN", "chapter": 2}))
        );
        assert_eq!(reopened.revision(StorageKey::Versification), 1);
        assert!(!reopened.update_if(StorageKey::Versification, 0, json!("x")).unwrap());
    }

    #[test]
    fn file_store_moves_corrupt_file_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();
        let store = FileStore::open(&path);
        assert_eq!(store.get(StorageKey::ProjectDirectory), None);
        assert!(dir.path().join("state.json.corrupt").exists());
        store.update(StorageKey::ProjectDirectory, json!("/p")).unwrap();
        assert!(path.exists());
    }
}
