//! Data model: book identifiers, chapter coordinates, parsed book trees,
//! versification tables and the chapter payload delivered to the panel.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Opaque, case-sensitive book key (e.g. `GEN`, `MAT`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookId(String);

impl BookId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BookId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A (book, chapter) pair. Chapters are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChapterCoordinate {
    #[serde(rename = "bookId")]
    pub book: BookId,
    pub chapter: u32,
}

impl ChapterCoordinate {
    pub fn new(book: impl Into<BookId>, chapter: u32) -> Self {
        Self {
            book: book.into(),
            chapter,
        }
    }
}

impl fmt::Display for ChapterCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.book, self.chapter)
    }
}

// ---------------------------------------------------------------------------
// ParsedBook: chapter → verse → text
// ---------------------------------------------------------------------------

/// Fully parsed book content. Immutable once handed to the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedBook {
    pub chapters: BTreeMap<u32, BTreeMap<u32, String>>,
}

impl ParsedBook {
    pub fn chapter_count(&self) -> u32 {
        self.chapters.keys().next_back().copied().unwrap_or(0)
    }

    pub fn chapter(&self, chapter: u32) -> Option<&BTreeMap<u32, String>> {
        self.chapters.get(&chapter)
    }

    /// A book is valid when it has at least one chapter and no zero-numbered
    /// chapter or verse. Only valid books are ever cached.
    pub fn is_valid(&self) -> bool {
        !self.chapters.is_empty()
            && !self.chapters.contains_key(&0)
            && self.chapters.values().all(|verses| !verses.contains_key(&0))
    }
}

// ---------------------------------------------------------------------------
// VersificationTable
// ---------------------------------------------------------------------------

/// Largest verse count accepted for one chapter. The longest real chapter
/// (Psalm 119) has 176 verses.
pub const MAX_VERSES_PER_CHAPTER: u32 = 1000;

/// Per-book maximum verse counts; index 0 holds chapter 1.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersificationTable {
    max_verses: HashMap<BookId, Vec<u32>>,
}

#[derive(Deserialize)]
struct VersificationBlob {
    #[serde(rename = "maxVerses")]
    max_verses: HashMap<String, Vec<VerseCount>>,
}

/// Versification files in the wild store counts as strings (`"31"`).
#[derive(Deserialize)]
#[serde(untagged)]
enum VerseCount {
    Number(u32),
    Text(String),
}

impl VerseCount {
    fn value(&self) -> Option<u32> {
        match self {
            VerseCount::Number(n) => Some(*n),
            VerseCount::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl VersificationTable {
    /// Decode the `{"maxVerses": {...}}` blob. Any malformed or implausibly
    /// large count rejects the whole table.
    pub fn from_json(text: &str) -> Result<Self, String> {
        let blob: VersificationBlob =
            serde_json::from_str(text).map_err(|e| format!("invalid versification JSON: {e}"))?;
        let mut max_verses = HashMap::with_capacity(blob.max_verses.len());
        for (book, counts) in blob.max_verses {
            let parsed = counts
                .iter()
                .map(VerseCount::value)
                .collect::<Option<Vec<u32>>>()
                .ok_or_else(|| format!("non-numeric verse count for {book}"))?;
            if let Some(&count) = parsed.iter().find(|&&n| n > MAX_VERSES_PER_CHAPTER) {
                return Err(format!(
                    "verse count {count} for {book} exceeds {MAX_VERSES_PER_CHAPTER}"
                ));
            }
            max_verses.insert(BookId(book), parsed);
        }
        Ok(Self { max_verses })
    }

    pub fn insert(&mut self, book: BookId, counts: Vec<u32>) {
        self.max_verses.insert(book, counts);
    }

    pub fn chapters(&self, book: &BookId) -> Option<&[u32]> {
        self.max_verses.get(book).map(Vec::as_slice)
    }
}

// ---------------------------------------------------------------------------
// ChapterData: the unit delivered to the rendering surface
// ---------------------------------------------------------------------------

/// Audio file associated with one verse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioAsset {
    pub path: PathBuf,
    pub exists: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerseRecord {
    pub verse: u32,
    pub text: String,
    pub audio: Option<AudioAsset>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterData {
    pub book: BookId,
    pub chapter: u32,
    pub verses: Vec<VerseRecord>,
}

impl ChapterData {
    /// True when no verse carries text (versification-derived shell).
    pub fn is_shell(&self) -> bool {
        self.verses.iter().all(|v| v.text.is_empty())
    }

    pub fn coordinate(&self) -> ChapterCoordinate {
        ChapterCoordinate::new(self.book.clone(), self.chapter)
    }
}

/// Content handed to the chapter extractor: either a parsed book or the
/// verse bound of the requested chapter taken from versification.
#[derive(Debug, Clone, Copy)]
pub enum ChapterSource<'a> {
    Parsed(&'a ParsedBook),
    Shell { max_verse: u32 },
}
