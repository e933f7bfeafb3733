#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde_json::json;

use chapter_panel::cache::BookContentCache;
use chapter_panel::content::{BookId, ParsedBook};
use chapter_panel::panel::{PanelContext, PanelMessage, RenderSurface, SurfaceFactory};
use chapter_panel::resolver::ChapterResolver;
use chapter_panel::source::{AudioChapterExtractor, BookParser};
use chapter_panel::store::{MemoryStore, StateStore, StorageKey};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// One-chapter-per-entry book: `chapters[i]` verses in chapter `i + 1`.
pub fn book(chapters: &[u32]) -> ParsedBook {
    let mut parsed = ParsedBook::default();
    for (i, &verses) in chapters.iter().enumerate() {
        let c = i as u32 + 1;
        let map: BTreeMap<u32, String> = (1..=verses).map(|v| (v, format!("{c}:{v}"))).collect();
        parsed.chapters.insert(c, map);
    }
    parsed
}

// ---------------------------------------------------------------------------
// Parsers
// ---------------------------------------------------------------------------

/// Serves fixed books and counts every call.
#[derive(Default)]
pub struct CountingParser {
    books: HashMap<BookId, ParsedBook>,
    calls: AtomicUsize,
    gates: Mutex<HashMap<BookId, mpsc::Receiver<()>>>,
}

impl CountingParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_book(mut self, id: &str, content: ParsedBook) -> Self {
        self.books.insert(id.into(), content);
        self
    }

    /// Make the next parse of `id` block until the returned sender fires.
    pub fn gate(&self, id: &str) -> mpsc::Sender<()> {
        let (tx, rx) = mpsc::channel();
        self.gates.lock().unwrap().insert(id.into(), rx);
        tx
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl BookParser for CountingParser {
    fn parse_book(&self, book: &BookId) -> Result<Option<ParsedBook>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gates.lock().unwrap().remove(book);
        if let Some(rx) = gate {
            let _ = rx.recv();
        }
        Ok(self.books.get(book).cloned())
    }
}

// ---------------------------------------------------------------------------
// Surfaces
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingSurface {
    pub title: String,
    messages: Mutex<Vec<PanelMessage>>,
    disposals: AtomicUsize,
}

impl RecordingSurface {
    pub fn messages(&self) -> Vec<PanelMessage> {
        self.messages.lock().unwrap().clone()
    }

    pub fn disposals(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }
}

impl RenderSurface for RecordingSurface {
    fn post_message(&self, message: &PanelMessage) -> Result<()> {
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }

    fn dispose(&self) {
        self.disposals.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingFactory {
    surfaces: Mutex<Vec<Arc<RecordingSurface>>>,
}

impl RecordingFactory {
    pub fn surfaces(&self) -> Vec<Arc<RecordingSurface>> {
        self.surfaces.lock().unwrap().clone()
    }

    pub fn live(&self) -> usize {
        self.surfaces().iter().filter(|s| s.disposals() == 0).count()
    }
}

impl SurfaceFactory for RecordingFactory {
    fn create(&self, _view_type: &str, title: &str) -> Result<Arc<dyn RenderSurface>> {
        let surface = Arc::new(RecordingSurface {
            title: title.to_string(),
            ..RecordingSurface::default()
        });
        self.surfaces.lock().unwrap().push(surface.clone());
        Ok(surface)
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub fn seed_store(store: &dyn StateStore, book: &str, chapter: u32, project: &Path) {
    store
        .update(
            StorageKey::CurrentBookChapter,
            json!({"bookId": book, "chapter": chapter}),
        )
        .unwrap();
    store
        .update(
            StorageKey::ProjectDirectory,
            json!(project.to_string_lossy()),
        )
        .unwrap();
}

pub fn seed_versification(store: &dyn StateStore, blob: &str) {
    store
        .update(StorageKey::Versification, json!(blob))
        .unwrap();
}

pub fn extractor() -> Arc<AudioChapterExtractor> {
    Arc::new(AudioChapterExtractor::new("audio", vec!["wav".into()]))
}

pub fn resolver(store: Arc<dyn StateStore>, parser: Arc<CountingParser>) -> ChapterResolver {
    let cache = Arc::new(BookContentCache::new(store.clone()));
    ChapterResolver::new(store, cache, parser, extractor())
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub parser: Arc<CountingParser>,
    pub factory: Arc<RecordingFactory>,
    pub ctx: PanelContext,
}

pub fn harness(parser: CountingParser, book: &str, chapter: u32) -> Harness {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    seed_store(store.as_ref(), book, chapter, Path::new("/project"));
    let parser = Arc::new(parser);
    let factory = Arc::new(RecordingFactory::default());
    let ctx = PanelContext::new(store.clone(), parser.clone(), extractor(), factory.clone());
    Harness {
        store,
        parser,
        factory,
        ctx,
    }
}

/// Coordinates of every chapter payload the surface received, in order.
pub fn delivered_chapters(surface: &RecordingSurface) -> Vec<(String, u32)> {
    surface
        .messages()
        .into_iter()
        .filter_map(|m| match m {
            PanelMessage::ChapterData(data) => Some((data.book.to_string(), data.chapter)),
            PanelMessage::ResolutionError(_) => None,
        })
        .collect()
}
