#![no_main]

use chapter_panel::usfm::parse_usfm;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    let parsed = parse_usfm(&text);

    for (&chapter, verses) in &parsed.chapters {
        assert!(chapter > 0, "chapter 0 must never be recorded");
        for (&verse, body) in verses {
            assert!(verse > 0, "verse 0 must never be recorded in chapter {chapter}");
            assert_eq!(body.trim(), body, "untrimmed text in {chapter}:{verse}");
        }
    }
    assert!(parsed.chapter_count() as usize >= parsed.chapters.len());
});
