//! Collaborator seams: where parsed books and chapter payloads come from.
//!
//! The resolver only talks to [`BookParser`] and [`ChapterExtractor`]. The
//! defaults here read USFM files from a directory and attach per-verse audio
//! files found under the project directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use log::{debug, info, warn};

use crate::content::{AudioAsset, BookId, ChapterData, ChapterSource, ParsedBook, VerseRecord};
use crate::usfm::parse_usfm;

pub trait BookParser: Send + Sync {
    /// Parse a whole book. `Ok(None)` means no source exists for it.
    fn parse_book(&self, book: &BookId) -> Result<Option<ParsedBook>>;
}

pub trait ChapterExtractor: Send + Sync {
    /// Build the payload for one chapter. Bounds have already been checked.
    fn extract_chapter(
        &self,
        book: &BookId,
        chapter: u32,
        source: ChapterSource<'_>,
        project_dir: &Path,
    ) -> Result<ChapterData>;
}

// ---------------------------------------------------------------------------
// UsfmDirParser
// ---------------------------------------------------------------------------

const USFM_EXTENSIONS: &[&str] = &["usfm", "USFM", "sfm", "SFM"];

/// Reads `<dir>/<BOOK>.usfm` (or `.sfm`).
pub struct UsfmDirParser {
    dir: PathBuf,
}

impl UsfmDirParser {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn find(&self, book: &BookId) -> Option<PathBuf> {
        USFM_EXTENSIONS
            .iter()
            .map(|ext| self.dir.join(format!("{book}.{ext}")))
            .find(|p| p.is_file())
    }
}

impl BookParser for UsfmDirParser {
    fn parse_book(&self, book: &BookId) -> Result<Option<ParsedBook>> {
        let Some(path) = self.find(book) else {
            debug!("usfm: no source for {book} in {}", self.dir.display());
            return Ok(None);
        };
        let start = Instant::now();
        let text = match fs::read(&path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
        };
        let parsed = parse_usfm(&text);
        if !parsed.is_valid() {
            warn!("usfm: {} has no usable chapters", path.display());
            return Ok(None);
        }
        info!(
            "usfm: parsed {book} ({} chapters) in {:.1}ms",
            parsed.chapters.len(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(Some(parsed))
    }
}

// ---------------------------------------------------------------------------
// AudioChapterExtractor
// ---------------------------------------------------------------------------

/// Attaches `<project>/<audio_dir>/<BOOK>/<chapter>/<chapter>_<verse>.<ext>`
/// to each verse. The first extension found on disk wins; otherwise the
/// first configured extension is reported with `exists: false`.
pub struct AudioChapterExtractor {
    audio_dir: PathBuf,
    extensions: Vec<String>,
}

impl AudioChapterExtractor {
    pub fn new(audio_dir: impl Into<PathBuf>, extensions: Vec<String>) -> Self {
        Self {
            audio_dir: audio_dir.into(),
            extensions,
        }
    }

    fn audio_for(&self, base: &Path, chapter: u32, verse: u32) -> Option<AudioAsset> {
        let candidates: Vec<PathBuf> = self
            .extensions
            .iter()
            .map(|ext| base.join(format!("{chapter}_{verse}.{ext}")))
            .collect();
        if let Some(found) = candidates.iter().find(|p| p.is_file()) {
            return Some(AudioAsset {
                path: found.clone(),
                exists: true,
            });
        }
        candidates.into_iter().next().map(|path| AudioAsset {
            path,
            exists: false,
        })
    }
}

impl ChapterExtractor for AudioChapterExtractor {
    fn extract_chapter(
        &self,
        book: &BookId,
        chapter: u32,
        source: ChapterSource<'_>,
        project_dir: &Path,
    ) -> Result<ChapterData> {
        let base = project_dir
            .join(&self.audio_dir)
            .join(book.as_str())
            .join(chapter.to_string());

        let verses: Vec<VerseRecord> = match source {
            ChapterSource::Parsed(parsed) => {
                let Some(verses) = parsed.chapter(chapter) else {
                    bail!("{book} has no chapter {chapter}");
                };
                verses
                    .iter()
                    .map(|(&verse, text)| VerseRecord {
                        verse,
                        text: text.clone(),
                        audio: self.audio_for(&base, chapter, verse),
                    })
                    .collect()
            }
            ChapterSource::Shell { max_verse } => (1..=max_verse)
                .map(|verse| VerseRecord {
                    verse,
                    text: String::new(),
                    audio: self.audio_for(&base, chapter, verse),
                })
                .collect(),
        };

        let recorded = verses
            .iter()
            .filter(|v| v.audio.as_ref().is_some_and(|a| a.exists))
            .count();
        debug!(
            "extract: {book} {chapter}: {} verse(s), {recorded} with audio",
            verses.len()
        );
        Ok(ChapterData {
            book: book.clone(),
            chapter,
            verses,
        })
    }
}
