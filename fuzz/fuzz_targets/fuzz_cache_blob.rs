#![no_main]

use chapter_panel::cache::decode_blob;
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    // Both the string-wrapped and the structured form must degrade, not panic.
    let wrapped = decode_blob(&Value::String(text.to_string()));
    for (book, content) in &wrapped {
        assert!(content.is_valid(), "invalid entry for {book} survived decoding");
    }
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        for (book, content) in &decode_blob(&value) {
            assert!(content.is_valid(), "invalid entry for {book} survived decoding");
        }
    }
});
