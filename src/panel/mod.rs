//! Chapter panel: one live rendering surface fed by asynchronous resolution.
//!
//! Lifecycle:
//!   Created  : surface allocated, bridge not yet handed to any worker
//!   Active   : surface live; resolutions may be in flight
//!   Disposed : terminal; surface released, late deliveries are no-ops
//!
//! Each `request` runs on its own `chapter-resolve` thread and tags its
//! result with a generation number. Only the latest issued generation is
//! delivered, so an older request finishing last cannot overwrite the
//! panel. There is no cancellation; superseded workers run to completion.
//!
//! `PanelOwner` holds at most one controller. Opening a new panel disposes
//! the previous one first.

mod bridge;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::cache::{BookContentCache, DEFAULT_STORE_ATTEMPTS};
use crate::config::Config;
use crate::content::ChapterCoordinate;
use crate::resolver::ChapterResolver;
use crate::source::{AudioChapterExtractor, BookParser, ChapterExtractor, UsfmDirParser};
use crate::store::{FileStore, StateStore, StorageKey};

use bridge::MessageBridge;
pub use bridge::{
    ChannelSurface, Delivery, PanelMessage, PanelState, RenderSurface, ResolutionFailure,
    SurfaceFactory,
};

pub const VIEW_TYPE: &str = "chapterAudioEditor";

#[derive(Debug, Error)]
pub enum PanelError {
    #[error("no {} in persisted state", .0.as_str())]
    MissingState(StorageKey),

    #[error("invalid {} in persisted state: {message}", .key.as_str())]
    InvalidState { key: StorageKey, message: String },

    #[error("failed to create rendering surface: {0:#}")]
    Surface(anyhow::Error),

    #[error("panel is disposed")]
    Disposed,

    #[error("failed to start resolution worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Everything a controller needs from the host.
#[derive(Clone)]
pub struct PanelContext {
    pub store: Arc<dyn StateStore>,
    pub parser: Arc<dyn BookParser>,
    pub extractor: Arc<dyn ChapterExtractor>,
    pub surfaces: Arc<dyn SurfaceFactory>,
    pub store_attempts: usize,
}

impl PanelContext {
    pub fn new(
        store: Arc<dyn StateStore>,
        parser: Arc<dyn BookParser>,
        extractor: Arc<dyn ChapterExtractor>,
        surfaces: Arc<dyn SurfaceFactory>,
    ) -> Self {
        Self {
            store,
            parser,
            extractor,
            surfaces,
            store_attempts: DEFAULT_STORE_ATTEMPTS,
        }
    }

    /// Wire the default collaborators: a `FileStore` at `config.state_file`,
    /// USFM files under the persisted project directory, and per-verse audio.
    pub fn from_config(
        config: &Config,
        surfaces: Arc<dyn SurfaceFactory>,
    ) -> Result<Self, PanelError> {
        let store: Arc<dyn StateStore> = Arc::new(FileStore::open(&config.state_file));
        let project_dir = read_project_dir(store.as_ref())?;
        let parser = Arc::new(UsfmDirParser::new(config.usfm_dir_for(&project_dir)));
        let extractor = Arc::new(AudioChapterExtractor::new(
            config.audio_dir.clone(),
            config.audio_extensions.clone(),
        ));
        Ok(Self {
            store,
            parser,
            extractor,
            surfaces,
            store_attempts: config.store_attempts,
        })
    }
}

fn decode_state<T: DeserializeOwned>(key: StorageKey, value: Value) -> Result<T, PanelError> {
    // Hosts may store either the structured value or its JSON string.
    let value = match value {
        Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        other => other,
    };
    serde_json::from_value(value).map_err(|e| PanelError::InvalidState {
        key,
        message: e.to_string(),
    })
}

fn read_coordinate(store: &dyn StateStore) -> Result<ChapterCoordinate, PanelError> {
    let key = StorageKey::CurrentBookChapter;
    let value = store.get(key).ok_or(PanelError::MissingState(key))?;
    decode_state(key, value)
}

/// Accepts a plain path string or an editor URI object (`fsPath`/`path`).
fn read_project_dir(store: &dyn StateStore) -> Result<PathBuf, PanelError> {
    let key = StorageKey::ProjectDirectory;
    let value = store.get(key).ok_or(PanelError::MissingState(key))?;
    let invalid = |message: &str| PanelError::InvalidState {
        key,
        message: message.to_string(),
    };
    match value {
        Value::String(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        Value::Object(map) => map
            .get("fsPath")
            .or_else(|| map.get("path"))
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .ok_or_else(|| invalid("object has no fsPath or path")),
        _ => Err(invalid("expected a path string")),
    }
}

// ---------------------------------------------------------------------------
// ResolveTicket
// ---------------------------------------------------------------------------

/// Handle to one in-flight resolve-then-deliver run.
pub struct ResolveTicket {
    generation: u64,
    coordinate: ChapterCoordinate,
    handle: JoinHandle<Delivery>,
}

impl ResolveTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn coordinate(&self) -> &ChapterCoordinate {
        &self.coordinate
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Block until the worker finishes and report what happened to its message.
    pub fn wait(self) -> Delivery {
        self.handle.join().unwrap_or_else(|_| {
            warn!("panel: resolution worker for {} panicked", self.coordinate);
            Delivery::Failed
        })
    }
}

// ---------------------------------------------------------------------------
// PanelController
// ---------------------------------------------------------------------------

pub struct PanelController {
    title: String,
    project_dir: PathBuf,
    store: Arc<dyn StateStore>,
    resolver: Arc<ChapterResolver>,
    bridge: MessageBridge,
    coordinate: Mutex<ChapterCoordinate>,
    initial: Mutex<Option<ResolveTicket>>,
}

impl PanelController {
    /// Read the current chapter and project from the store, create the
    /// surface and start resolving in the background. Returns without waiting
    /// for the resolution.
    pub fn open(ctx: &PanelContext) -> Result<Self, PanelError> {
        let coordinate = read_coordinate(ctx.store.as_ref())?;
        let project_dir = read_project_dir(ctx.store.as_ref())?;
        info!(
            "panel: opening {coordinate} (project {})",
            project_dir.display()
        );

        let title = coordinate.to_string();
        let surface = ctx
            .surfaces
            .create(VIEW_TYPE, &title)
            .map_err(PanelError::Surface)?;

        let cache = Arc::new(BookContentCache::with_attempts(
            ctx.store.clone(),
            ctx.store_attempts,
        ));
        let resolver = Arc::new(ChapterResolver::new(
            ctx.store.clone(),
            cache,
            ctx.parser.clone(),
            ctx.extractor.clone(),
        ));

        let controller = Self {
            title,
            project_dir,
            store: ctx.store.clone(),
            resolver,
            bridge: MessageBridge::new(surface),
            coordinate: Mutex::new(coordinate.clone()),
            initial: Mutex::new(None),
        };
        controller.bridge.slot().state = PanelState::Active;

        // On failure `controller` drops here and disposes the new surface.
        let ticket = controller.spawn(coordinate)?;
        *controller.initial.lock().unwrap_or_else(|p| p.into_inner()) = Some(ticket);
        Ok(controller)
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn state(&self) -> PanelState {
        self.bridge.slot().state
    }

    /// Latest issued generation.
    pub fn generation(&self) -> u64 {
        self.bridge.slot().generation
    }

    /// Most recently requested chapter.
    pub fn coordinate(&self) -> ChapterCoordinate {
        self.coordinate.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn resolver(&self) -> &ChapterResolver {
        &self.resolver
    }

    /// Ticket of the resolution started by `open`, if not taken yet.
    pub fn take_initial_ticket(&self) -> Option<ResolveTicket> {
        self.initial.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    /// Show another chapter. Supersedes every earlier request; the
    /// coordinate is also persisted as the current chapter.
    ///
    /// A disposed panel refuses the request without touching the store.
    pub fn request(&self, coordinate: ChapterCoordinate) -> Result<ResolveTicket, PanelError> {
        if self.state() == PanelState::Disposed {
            debug!("panel: {} disposed, ignoring request for {coordinate}", self.title);
            return Err(PanelError::Disposed);
        }
        match serde_json::to_value(&coordinate) {
            Ok(value) => {
                if let Err(e) = self.store.update(StorageKey::CurrentBookChapter, value) {
                    warn!("panel: could not persist current chapter {coordinate}: {e}");
                }
            }
            Err(e) => warn!("panel: could not encode {coordinate}: {e}"),
        }
        *self.coordinate.lock().unwrap_or_else(|p| p.into_inner()) = coordinate.clone();
        self.spawn(coordinate)
    }

    fn spawn(&self, coordinate: ChapterCoordinate) -> Result<ResolveTicket, PanelError> {
        let generation = self.bridge.next_generation();
        let resolver = self.resolver.clone();
        let bridge = self.bridge.clone();
        let project_dir = self.project_dir.clone();
        let target = coordinate.clone();

        debug!("panel: spawning resolution for {coordinate} (gen {generation})");
        let handle = thread::Builder::new()
            .name("chapter-resolve".into())
            .spawn(move || {
                let start = Instant::now();
                let message = match resolver.resolve(&target, &project_dir) {
                    Ok(data) => PanelMessage::ChapterData(data),
                    Err(e) => {
                        warn!("panel: resolving {target} failed: {e}");
                        PanelMessage::ResolutionError(ResolutionFailure::new(&target, &e))
                    }
                };
                let delivery = bridge.send(generation, &message);
                debug!(
                    "panel: {target} (gen {generation}) finished in {:.1}ms: {delivery:?}",
                    start.elapsed().as_secs_f64() * 1000.0
                );
                delivery
            })?;

        Ok(ResolveTicket {
            generation,
            coordinate,
            handle,
        })
    }

    /// Close the panel and its surface. Idempotent.
    pub fn dispose(&self) {
        match self.bridge.release() {
            Some(surface) => {
                info!("panel: disposing {}", self.title);
                surface.dispose();
            }
            None => debug!("panel: {} already disposed", self.title),
        }
    }

    /// The surface was closed from outside. Releases our reference without
    /// calling back into the surface. Idempotent.
    pub fn surface_closed(&self) {
        if self.bridge.release().is_some() {
            info!("panel: surface for {} closed", self.title);
        }
    }
}

impl Drop for PanelController {
    fn drop(&mut self) {
        self.dispose();
    }
}

// ---------------------------------------------------------------------------
// PanelOwner
// ---------------------------------------------------------------------------

/// Holds at most one live controller.
#[derive(Default)]
pub struct PanelOwner {
    current: Option<PanelController>,
}

impl PanelOwner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispose the current panel (if any), then open a new one.
    ///
    /// If opening fails the owner is left empty.
    pub fn open(&mut self, ctx: &PanelContext) -> Result<&PanelController, PanelError> {
        self.dispose();
        let controller = PanelController::open(ctx)?;
        Ok(self.current.insert(controller))
    }

    /// Install `controller`, disposing the previous one first.
    pub fn replace(&mut self, controller: PanelController) -> &PanelController {
        self.dispose();
        self.current.insert(controller)
    }

    pub fn current(&self) -> Option<&PanelController> {
        self.current.as_ref()
    }

    /// Dispose and drop the current panel. No-op when empty.
    pub fn dispose(&mut self) {
        if let Some(previous) = self.current.take() {
            previous.dispose();
        }
    }
}
