//! Cache-first chapter resolution.
//!
//! cache hit → extract; miss → parse → store → extract; no source → build an
//! empty chapter shell from the versification table.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::cache::BookContentCache;
use crate::content::{
    BookId, ChapterCoordinate, ChapterData, ChapterSource, ParsedBook, VersificationTable,
};
use crate::source::{BookParser, ChapterExtractor};
use crate::store::{StateStore, StorageKey};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("{book} has no source text and no versification entry")]
    UnparsableBook { book: BookId },

    #[error("{book} has no chapter {chapter} (last chapter is {chapters})")]
    OutOfRangeChapter {
        book: BookId,
        chapter: u32,
        chapters: u32,
    },

    #[error("failed to parse {book}: {error:#}")]
    Parser { book: BookId, error: anyhow::Error },

    #[error("failed to extract {book} {chapter}: {error:#}")]
    Extract {
        book: BookId,
        chapter: u32,
        error: anyhow::Error,
    },
}

/// Wire-level classification of a failed resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionErrorKind {
    UnparsableBook,
    OutOfRangeChapter,
    ParserFailed,
    ExtractFailed,
}

impl ResolveError {
    pub fn kind(&self) -> ResolutionErrorKind {
        match self {
            Self::UnparsableBook { .. } => ResolutionErrorKind::UnparsableBook,
            Self::OutOfRangeChapter { .. } => ResolutionErrorKind::OutOfRangeChapter,
            Self::Parser { .. } => ResolutionErrorKind::ParserFailed,
            Self::Extract { .. } => ResolutionErrorKind::ExtractFailed,
        }
    }
}

pub struct ChapterResolver {
    store: Arc<dyn StateStore>,
    cache: Arc<BookContentCache>,
    parser: Arc<dyn BookParser>,
    extractor: Arc<dyn ChapterExtractor>,
}

impl ChapterResolver {
    pub fn new(
        store: Arc<dyn StateStore>,
        cache: Arc<BookContentCache>,
        parser: Arc<dyn BookParser>,
        extractor: Arc<dyn ChapterExtractor>,
    ) -> Self {
        Self {
            store,
            cache,
            parser,
            extractor,
        }
    }

    pub fn cache(&self) -> &BookContentCache {
        &self.cache
    }

    pub fn resolve(
        &self,
        coordinate: &ChapterCoordinate,
        project_dir: &Path,
    ) -> Result<ChapterData, ResolveError> {
        let start = Instant::now();
        let book = &coordinate.book;
        let chapter = coordinate.chapter;

        let parsed = match self.cache.load(book) {
            Some(content) => Some(content),
            None => self.parse_and_cache(book)?,
        };

        let data = match &parsed {
            Some(content) if content.chapter(chapter).is_some() => {
                self.extract(book, chapter, ChapterSource::Parsed(content), project_dir)?
            }
            // Partial drafts: chapters not yet translated still get a shell
            // as long as versification knows them.
            Some(content) => {
                let max_verse = self.partial_bound(book, chapter, content)?;
                self.extract(book, chapter, ChapterSource::Shell { max_verse }, project_dir)?
            }
            None => {
                let max_verse = self.shell_bound(book, chapter)?;
                self.extract(book, chapter, ChapterSource::Shell { max_verse }, project_dir)?
            }
        };

        info!(
            "resolve: {coordinate} ({}) → {} verse(s) in {:.1}ms",
            if data.is_shell() { "shell" } else { "parsed" },
            data.verses.len(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(data)
    }

    fn parse_and_cache(&self, book: &BookId) -> Result<Option<ParsedBook>, ResolveError> {
        let parsed = self
            .parser
            .parse_book(book)
            .map_err(|error| ResolveError::Parser {
                book: book.clone(),
                error,
            })?;
        let Some(content) = parsed.filter(|c| c.is_valid()) else {
            debug!("resolve: no usable source for {book}");
            return Ok(None);
        };
        if let Err(e) = self.cache.store(book, content.clone()) {
            // The content is still usable for this request.
            warn!("resolve: could not persist {book}: {e:#}");
        }
        Ok(Some(content))
    }

    /// Verse bound of `chapter` from the versification table.
    fn shell_bound(&self, book: &BookId, chapter: u32) -> Result<u32, ResolveError> {
        let unparsable = || ResolveError::UnparsableBook { book: book.clone() };
        let table = self.versification().ok_or_else(unparsable)?;
        let chapters = table.chapters(book).ok_or_else(unparsable)?;
        bound_in(chapters, chapter).ok_or_else(|| ResolveError::OutOfRangeChapter {
            book: book.clone(),
            chapter,
            chapters: chapters.len() as u32,
        })
    }

    /// Verse bound of a chapter the parsed content lacks. Out of range only
    /// when neither the content nor versification reaches it.
    fn partial_bound(
        &self,
        book: &BookId,
        chapter: u32,
        content: &ParsedBook,
    ) -> Result<u32, ResolveError> {
        let table = self.versification();
        let counts = table.as_ref().and_then(|t| t.chapters(book)).unwrap_or(&[]);
        if let Some(max_verse) = bound_in(counts, chapter) {
            debug!("resolve: {book} {chapter} not in source, using versification");
            return Ok(max_verse);
        }
        Err(ResolveError::OutOfRangeChapter {
            book: book.clone(),
            chapter,
            chapters: content.chapter_count().max(counts.len() as u32),
        })
    }

    /// A missing or malformed blob yields `None`; callers report the book
    /// as unparsable rather than inventing a table.
    fn versification(&self) -> Option<VersificationTable> {
        let blob = self.store.get(StorageKey::Versification)?;
        let decoded = match &blob {
            Value::String(text) => VersificationTable::from_json(text),
            Value::Object(_) => VersificationTable::from_json(&blob.to_string()),
            _ => Err("versification blob is neither a string nor an object".to_string()),
        };
        match decoded {
            Ok(table) => Some(table),
            Err(e) => {
                warn!("resolve: {e}");
                None
            }
        }
    }

    fn extract(
        &self,
        book: &BookId,
        chapter: u32,
        source: ChapterSource<'_>,
        project_dir: &Path,
    ) -> Result<ChapterData, ResolveError> {
        self.extractor
            .extract_chapter(book, chapter, source, project_dir)
            .map_err(|error| ResolveError::Extract {
                book: book.clone(),
                chapter,
                error,
            })
    }
}

fn bound_in(counts: &[u32], chapter: u32) -> Option<u32> {
    let index = (chapter as usize).checked_sub(1)?;
    counts.get(index).copied()
}
