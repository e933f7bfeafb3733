//! Minimal USFM reader: chapters (`\c`) and verses (`\v`) with plain text.
//!
//! Headings, titles and introduction paragraphs are dropped, footnotes and
//! cross references are removed, character markers are unwrapped and word
//! attributes (`\w grace|strong="G5485"\w*`) are stripped. Anything richer
//! belongs to a real USFM toolkit behind [`crate::source::BookParser`].

use std::sync::LazyLock;

use log::trace;
use regex::Regex;

use crate::content::ParsedBook;

static NOTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\\(f|fe|x)\s.*?\\(f|fe|x)\*").unwrap());

/// `|attr...` directly preceding a closing character marker.
static ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\|[^\\|]*(\\\+?[A-Za-z]+[0-9]*\*)").unwrap());

static MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\\+?([A-Za-z]+)([0-9]*)(\*?)").unwrap());

static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s+(\d+)(?:[-,]\d+)?[a-z]?").unwrap());

/// Paragraph-level markers whose text is not verse content. Skipping lasts
/// until the next paragraph, chapter or verse marker.
const NON_VERSE_MARKERS: &[&str] = &[
    "id", "ide", "h", "toc", "toca", "mt", "mte", "ms", "mr", "s", "sr", "r", "d", "rem", "sts",
    "cl", "cp", "sp", "ip", "is", "imt", "io", "iot", "ili", "ipr", "ib", "usfm",
];

/// Inline markers carrying numbering, not text (`\vp 1b\vp*`). Skipped up to
/// their closing marker.
const INLINE_SKIP_MARKERS: &[&str] = &["ca", "va", "vp"];

/// Character markers: unwrapped, never change paragraph skipping.
const CHARACTER_MARKERS: &[&str] = &[
    "add", "addpn", "bd", "bdit", "bk", "dc", "em", "fig", "ior", "iqt", "it", "jmp", "k", "lit",
    "nd", "no", "ord", "pn", "png", "pro", "qac", "qs", "qt", "rb", "rq", "sc", "sig", "sls",
    "sup", "tl", "w", "wa", "wg", "wh", "wj", "xt",
];

/// Parse USFM text into a chapter → verse tree.
///
/// Chapter or verse numbers of 0 (or too large for `u32`) are ignored along
/// with the text that follows them, so the result never holds a 0 key.
pub fn parse_usfm(source: &str) -> ParsedBook {
    let without_notes = NOTE_RE.replace_all(source, "");
    let text = ATTR_RE.replace_all(&without_notes, "$1");

    let mut book = ParsedBook::default();
    let mut chapter: Option<u32> = None;
    let mut verse: Option<u32> = None;
    let mut skip = false;
    let mut inline_skip = false;
    let mut pos = 0;

    for caps in MARKER_RE.captures_iter(&text) {
        let Some(m) = caps.get(0) else { continue };
        if !skip && !inline_skip {
            append(&mut book, chapter, verse, &text[pos..m.start()]);
        }
        pos = m.end();

        let name = &caps[1];
        let closing = !caps[3].is_empty();
        if closing {
            inline_skip = false;
            continue;
        }
        match name {
            "c" => {
                let (number, consumed) = leading_number(&text[pos..]);
                pos += consumed;
                chapter = number;
                verse = None;
                skip = false;
                inline_skip = false;
                if let Some(c) = chapter {
                    book.chapters.entry(c).or_default();
                }
                trace!("usfm: chapter {chapter:?}");
            }
            "v" => {
                let (number, consumed) = leading_number(&text[pos..]);
                pos += consumed;
                verse = number;
                skip = false;
                inline_skip = false;
                if let (Some(c), Some(v)) = (chapter, verse) {
                    book.chapters.entry(c).or_default().entry(v).or_default();
                }
            }
            _ if INLINE_SKIP_MARKERS.contains(&name) => inline_skip = true,
            _ if CHARACTER_MARKERS.contains(&name) => {}
            _ => skip = NON_VERSE_MARKERS.contains(&name),
        }
    }
    if !skip && !inline_skip {
        append(&mut book, chapter, verse, &text[pos..]);
    }

    for verses in book.chapters.values_mut() {
        for text in verses.values_mut() {
            let trimmed = text.trim_end().len();
            text.truncate(trimmed);
        }
    }
    book
}

/// Returns the parsed number (None for 0 or overflow) and bytes consumed.
fn leading_number(rest: &str) -> (Option<u32>, usize) {
    match NUMBER_RE.captures(rest) {
        Some(caps) => {
            let consumed = caps.get(0).map_or(0, |m| m.end());
            let number = caps[1].parse::<u32>().ok().filter(|&n| n > 0);
            (number, consumed)
        }
        None => (None, 0),
    }
}

fn append(book: &mut ParsedBook, chapter: Option<u32>, verse: Option<u32>, segment: &str) {
    let (Some(c), Some(v)) = (chapter, verse) else {
        return;
    };
    let Some(text) = book.chapters.get_mut(&c).and_then(|vs| vs.get_mut(&v)) else {
        return;
    };
    for word in segment.split_whitespace() {
        if !text.is_empty() && !text.ends_with(' ') {
            text.push(' ');
        }
        text.push_str(word);
    }
    if segment.ends_with(char::is_whitespace) && !text.is_empty() && !text.ends_with(' ') {
        text.push(' ');
    }
}
