//! Cache-first chapter resolution for an audio editor panel.
//!
//! A `(book, chapter)` request is answered from parsed book content kept in
//! two tiers (memory and a persisted JSON blob), parsing the book source only
//! on the first miss. Books without a source fall back to an empty chapter
//! shell sized from the versification table. Results are pushed to a single
//! live rendering surface owned by a [`panel::PanelController`].

pub mod cache;
pub mod config;
pub mod content;
pub mod panel;
pub mod resolver;
pub mod source;
pub mod store;
pub mod usfm;
