//! Replay a fuzz artifact (or any USFM file) through the parser and the
//! cache blob decoder with logging enabled.

use std::time::Instant;

use chapter_panel::cache::decode_blob;
use chapter_panel::usfm::parse_usfm;
use log::info;
use serde_json::Value;

fn main() {
    env_logger::init();

    let path = std::env::args().nth(1).unwrap_or_else(|| {
        eprintln!("Usage: reproduce <artifact-file-or-usfm>");
        std::process::exit(1);
    });

    let data = std::fs::read(&path).unwrap_or_else(|e| {
        eprintln!("Failed to read {path}: {e}");
        std::process::exit(1);
    });
    let text = String::from_utf8_lossy(&data);

    let start = Instant::now();
    let parsed = parse_usfm(&text);
    info!(
        "parse_usfm: {} chapters in {:.1}ms",
        parsed.chapters.len(),
        start.elapsed().as_secs_f64() * 1000.0
    );
    for (chapter, verses) in &parsed.chapters {
        info!("  chapter {chapter}: {} verses", verses.len());
    }

    let start = Instant::now();
    let books = decode_blob(&Value::String(text.into_owned()));
    info!(
        "decode_blob: {} books in {:.1}ms",
        books.len(),
        start.elapsed().as_secs_f64() * 1000.0
    );
}
