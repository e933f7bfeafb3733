//! Book content cache: parsed books mirrored in memory and persisted as a
//! single JSON blob under [`StorageKey::LoadedBookContent`].
//!
//! The whole map is the unit of persistence. Writes go through a
//! compare-and-swap loop on the store revision: read the blob, merge the
//! persisted books with ours, write back only if nobody wrote in between,
//! otherwise re-read and merge again. Two resolutions storing different
//! books therefore never lose each other's entry.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use anyhow::{Result, bail};
use log::{debug, info, trace, warn};
use serde_json::Value;

use crate::content::{BookId, ParsedBook};
use crate::store::{StateStore, StorageKey};

pub const DEFAULT_STORE_ATTEMPTS: usize = 5;

type BookMap = BTreeMap<BookId, ParsedBook>;

pub struct BookContentCache {
    store: Arc<dyn StateStore>,
    memory: Mutex<BookMap>,
    store_attempts: usize,
}

impl BookContentCache {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self::with_attempts(store, DEFAULT_STORE_ATTEMPTS)
    }

    pub fn with_attempts(store: Arc<dyn StateStore>, store_attempts: usize) -> Self {
        Self {
            store,
            memory: Mutex::new(BookMap::new()),
            store_attempts: store_attempts.max(1),
        }
    }

    fn memory(&self) -> MutexGuard<'_, BookMap> {
        self.memory.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Memory first, then the persisted blob. `None` only if both miss.
    pub fn load(&self, book: &BookId) -> Option<ParsedBook> {
        if let Some(hit) = self.memory().get(book) {
            trace!("cache: memory hit for {book}");
            return Some(hit.clone());
        }

        let persisted = self
            .store
            .get(StorageKey::LoadedBookContent)
            .map(|blob| decode_blob(&blob))
            .unwrap_or_default();
        let mut memory = self.memory();
        for (id, content) in persisted {
            memory.entry(id).or_insert(content);
        }
        let found = memory.get(book).cloned();
        debug!(
            "cache: {} {book} after reading persisted blob ({} book(s) in memory)",
            if found.is_some() { "hit" } else { "miss" },
            memory.len()
        );
        found
    }

    pub fn contains(&self, book: &BookId) -> bool {
        self.load(book).is_some()
    }

    /// Book ids currently mirrored in memory.
    pub fn books(&self) -> Vec<BookId> {
        self.memory().keys().cloned().collect()
    }

    /// Insert `content` and persist the whole map.
    ///
    /// Invalid content is rejected before touching either tier.
    pub fn store(&self, book: &BookId, content: ParsedBook) -> Result<()> {
        if !content.is_valid() {
            bail!("refusing to cache invalid content for {book}");
        }
        let start = Instant::now();
        self.memory().insert(book.clone(), content);

        for attempt in 1..=self.store_attempts {
            let (revision, persisted) = match self.store.get_versioned(StorageKey::LoadedBookContent)
            {
                Some(v) => (v.revision, decode_blob(&v.value)),
                None => (0, BookMap::new()),
            };

            let merged = {
                let mut memory = self.memory();
                for (id, content) in persisted {
                    memory.entry(id).or_insert(content);
                }
                encode_blob(&memory)?
            };

            if self
                .store
                .update_if(StorageKey::LoadedBookContent, revision, merged)?
            {
                info!(
                    "cache: stored {book} (attempt {attempt}) in {:.1}ms",
                    start.elapsed().as_secs_f64() * 1000.0
                );
                return Ok(());
            }
            debug!("cache: blob changed under us while storing {book}, retrying");
        }
        bail!(
            "cache: gave up storing {book} after {} conflicting attempts",
            self.store_attempts
        )
    }
}

/// Decode the persisted blob. Accepts the JSON-string form written by
/// [`encode_blob`] or an already-structured object. Corruption degrades to
/// an empty map; individual invalid books are dropped.
pub fn decode_blob(blob: &Value) -> BookMap {
    let parsed: Result<BTreeMap<BookId, Value>, String> = match blob {
        Value::String(text) => serde_json::from_str(text).map_err(|e| e.to_string()),
        Value::Object(_) => serde_json::from_value(blob.clone()).map_err(|e| e.to_string()),
        Value::Null => return BookMap::new(),
        other => Err(format!("unexpected blob type {}", json_type(other))),
    };
    let raw = match parsed {
        Ok(raw) => raw,
        Err(e) => {
            warn!("cache: persisted book content is corrupt ({e}), treating as empty");
            return BookMap::new();
        }
    };

    raw.into_iter()
        .filter_map(|(book, value)| match serde_json::from_value::<ParsedBook>(value) {
            Ok(content) if content.is_valid() => Some((book, content)),
            Ok(_) => {
                warn!("cache: dropping incomplete entry for {book}");
                None
            }
            Err(e) => {
                warn!("cache: dropping undecodable entry for {book}: {e}");
                None
            }
        })
        .collect()
}

fn encode_blob(books: &BookMap) -> Result<Value> {
    Ok(Value::String(serde_json::to_string(books)?))
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreError, Versioned};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn book(text: &str) -> ParsedBook {
        let mut b = ParsedBook::default();
        b.chapters.insert(1, BTreeMap::from([(1, text.to_string())]));
        b
    }

    #[test]
    fn store_then_load_from_fresh_cache() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let cache = BookContentCache::new(store.clone());
        cache.store(&"GEN".into(), book("a")).unwrap();

        let fresh = BookContentCache::new(store);
        assert_eq!(fresh.load(&"GEN".into()), Some(book("a")));
        assert_eq!(fresh.load(&"EXO".into()), None);
    }

    #[test]
    fn persisted_blob_is_a_json_string() {
        let store = Arc::new(MemoryStore::new());
        let cache = BookContentCache::new(store.clone());
        cache.store(&"RUT".into(), book("x")).unwrap();
        let blob = store.get(StorageKey::LoadedBookContent).unwrap();
        let Value::String(text) = blob else {
            panic!("expected string blob");
        };
        assert!(text.starts_with(r#"{"RUT":"#));
    }

    #[test]
    fn store_merges_books_written_by_another_cache() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let first = BookContentCache::new(store.clone());
        let second = BookContentCache::new(store.clone());
        // Both start from an empty view of the blob.
        assert!(first.load(&"GEN".into()).is_none());
        assert!(second.load(&"GEN".into()).is_none());

        first.store(&"GEN".into(), book("g")).unwrap();
        second.store(&"EXO".into(), book("e")).unwrap();

        let third = BookContentCache::new(store);
        assert!(third.load(&"GEN".into()).is_some());
        assert!(third.load(&"EXO".into()).is_some());
    }

    #[test]
    fn corrupt_blob_degrades_to_absent() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        store
            .update(StorageKey::LoadedBookContent, json!("{ definitely not json"))
            .unwrap();
        let cache = BookContentCache::new(store.clone());
        assert_eq!(cache.load(&"GEN".into()), None);

        // A later store overwrites the corrupt blob with a valid one.
        cache.store(&"GEN".into(), book("g")).unwrap();
        assert!(BookContentCache::new(store).load(&"GEN".into()).is_some());
    }

    #[test]
    fn decode_drops_invalid_entries_only() {
        let blob = json!({
            "GEN": {"chapters": {"1": {"1": "ok"}}},
            "EXO": {"chapters": {}},
            "LEV": {"chapters": "nope"}
        });
        let books = decode_blob(&blob);
        assert_eq!(books.len(), 1);
        assert!(books.contains_key(&BookId::from("GEN")));
        assert!(decode_blob(&json!(42)).is_empty());
        assert!(decode_blob(&Value::Null).is_empty());
    }

    #[test]
    fn invalid_content_is_not_cached() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let cache = BookContentCache::new(store.clone());
        assert!(cache.store(&"GEN".into(), ParsedBook::default()).is_err());
        assert!(cache.books().is_empty());
        assert_eq!(store.get(StorageKey::LoadedBookContent), None);
    }

    /// Store that injects a competing write before the first CAS attempt.
    struct RacingStore {
        inner: MemoryStore,
        races: AtomicUsize,
    }

    impl StateStore for RacingStore {
        fn get_versioned(&self, key: StorageKey) -> Option<Versioned> {
            self.inner.get_versioned(key)
        }
        fn update(&self, key: StorageKey, value: Value) -> Result<(), StoreError> {
            self.inner.update(key, value)
        }
        fn update_if(&self, key: StorageKey, rev: u64, value: Value) -> Result<bool, StoreError> {
            let race = self
                .races
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if race {
                let other = BookMap::from([(BookId::from("LEV"), book("l"))]);
                self.inner.update(key, encode_blob(&other).unwrap())?;
            }
            self.inner.update_if(key, rev, value)
        }
    }

    #[test]
    fn conflicting_writer_is_merged_not_lost() {
        let store = Arc::new(RacingStore {
            inner: MemoryStore::new(),
            races: AtomicUsize::new(1),
        });
        let cache = BookContentCache::new(store.clone());
        cache.store(&"GEN".into(), book("g")).unwrap();

        let books = decode_blob(&store.get(StorageKey::LoadedBookContent).unwrap());
        assert!(books.contains_key(&BookId::from("GEN")));
        assert!(books.contains_key(&BookId::from("LEV")));
    }

    #[test]
    fn gives_up_after_bounded_attempts() {
        let store = Arc::new(RacingStore {
            inner: MemoryStore::new(),
            races: AtomicUsize::new(usize::MAX / 2),
        });
        let cache = BookContentCache::with_attempts(store, 3);
        assert!(cache.store(&"GEN".into(), book("g")).is_err());
        // The in-memory tier still has it for this controller's lifetime.
        assert_eq!(cache.books(), vec![BookId::from("GEN")]);
    }
}
