//! Controller → surface message delivery.
//!
//! Delivery is fire-and-forget: no acknowledgment, no retry. Every send
//! carries the generation of the request that produced it and is checked
//! under the same lock that disposal takes, so a message is delivered only
//! if the surface is still live *and* no newer request has been issued.

use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::content::{BookId, ChapterCoordinate, ChapterData};
use crate::resolver::{ResolutionErrorKind, ResolveError};

/// Envelope sent to the rendering surface: `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PanelMessage {
    #[serde(rename = "chapter-data-delivery")]
    ChapterData(ChapterData),
    #[serde(rename = "resolution-error")]
    ResolutionError(ResolutionFailure),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionFailure {
    pub book: BookId,
    pub chapter: u32,
    pub kind: ResolutionErrorKind,
    pub message: String,
}

impl ResolutionFailure {
    pub fn new(coordinate: &ChapterCoordinate, error: &ResolveError) -> Self {
        Self {
            book: coordinate.book.clone(),
            chapter: coordinate.chapter,
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl PanelMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            PanelMessage::ChapterData(_) => "chapter-data-delivery",
            PanelMessage::ResolutionError(_) => "resolution-error",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode and validate an envelope; unknown kinds and malformed payloads
    /// are rejected.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// The presentation target. Only the owning controller holds a reference.
pub trait RenderSurface: Send + Sync {
    fn post_message(&self, message: &PanelMessage) -> Result<()>;

    /// Close the surface. Called at most once per surface by the controller.
    fn dispose(&self);
}

pub trait SurfaceFactory: Send + Sync {
    fn create(&self, view_type: &str, title: &str) -> Result<Arc<dyn RenderSurface>>;
}

/// Outcome of a single send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// A newer request was issued before this one completed.
    Stale,
    /// The surface was disposed before the message arrived.
    SurfaceGone,
    /// The surface rejected the message.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelState {
    Created,
    Active,
    Disposed,
}

pub(super) struct SurfaceSlot {
    pub surface: Option<Arc<dyn RenderSurface>>,
    pub state: PanelState,
    pub generation: u64,
}

#[derive(Clone)]
pub(super) struct MessageBridge {
    slot: Arc<Mutex<SurfaceSlot>>,
}

impl MessageBridge {
    pub(super) fn new(surface: Arc<dyn RenderSurface>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(SurfaceSlot {
                surface: Some(surface),
                state: PanelState::Created,
                generation: 0,
            })),
        }
    }

    pub(super) fn slot(&self) -> MutexGuard<'_, SurfaceSlot> {
        self.slot.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Issue a new generation; earlier generations become stale.
    pub(super) fn next_generation(&self) -> u64 {
        let mut slot = self.slot();
        slot.generation += 1;
        slot.generation
    }

    /// Deliver `message` if `generation` is still the latest and the surface
    /// is live. Never panics and never returns an error.
    pub(super) fn send(&self, generation: u64, message: &PanelMessage) -> Delivery {
        let slot = self.slot();
        let Some(surface) = slot.surface.as_ref() else {
            debug!("bridge: surface gone, dropping {} (gen {generation})", message.kind());
            return Delivery::SurfaceGone;
        };
        if generation != slot.generation {
            debug!(
                "bridge: dropping stale {} (gen {generation}, latest {})",
                message.kind(),
                slot.generation
            );
            return Delivery::Stale;
        }
        match surface.post_message(message) {
            Ok(()) => {
                debug!("bridge: delivered {} (gen {generation})", message.kind());
                Delivery::Delivered
            }
            Err(e) => {
                warn!("bridge: surface rejected {}: {e:#}", message.kind());
                Delivery::Failed
            }
        }
    }

    /// Release the surface reference and mark the panel disposed. Returns the
    /// surface if this call was the one that released it.
    pub(super) fn release(&self) -> Option<Arc<dyn RenderSurface>> {
        let mut slot = self.slot();
        slot.state = PanelState::Disposed;
        slot.surface.take()
    }
}

// ---------------------------------------------------------------------------
// ChannelSurface: forwards serialized envelopes over an mpsc channel
// ---------------------------------------------------------------------------

/// Surface that writes each envelope as a JSON line into a channel, for
/// hosts that pump messages to a webview or pipe on their own thread.
pub struct ChannelSurface {
    tx: mpsc::Sender<String>,
    disposed: Mutex<bool>,
}

impl ChannelSurface {
    pub fn channel() -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel();
        let surface = Arc::new(Self {
            tx,
            disposed: Mutex::new(false),
        });
        (surface, rx)
    }

    pub fn is_disposed(&self) -> bool {
        *self.disposed.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl RenderSurface for ChannelSurface {
    fn post_message(&self, message: &PanelMessage) -> Result<()> {
        if self.is_disposed() {
            anyhow::bail!("surface disposed");
        }
        self.tx
            .send(message.to_json()?)
            .map_err(|_| anyhow::anyhow!("surface receiver dropped"))
    }

    fn dispose(&self) {
        *self.disposed.lock().unwrap_or_else(|p| p.into_inner()) = true;
    }
}
