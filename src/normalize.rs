//! Text canonicalization applied to every extracted document.
//!
//! PDF decoders and HTML scrapers routinely inject spurious spaces into
//! the middle of CJK words; normalization undoes that so downstream
//! keyword matching and storage see consistent text.

use unicode_normalization::UnicodeNormalization;

/// Canonicalize extracted text: NFKC normalization, whitespace runs
/// collapsed to single spaces, ends trimmed, and any remaining space
/// between two adjacent CJK characters removed.
///
/// Pure and idempotent: `normalize(normalize(x)) == normalize(x)`.
pub fn normalize(raw: &str) -> String {
    let folded: String = raw.nfkc().collect();
    let collapsed = folded.split_whitespace().collect::<Vec<_>>().join(" ");

    let chars: Vec<char> = collapsed.chars().collect();
    let mut out = String::with_capacity(collapsed.len());
    for (i, &c) in chars.iter().enumerate() {
        if c == ' ' && i > 0 {
            if let Some(&next) = chars.get(i + 1) {
                if is_cjk(chars[i - 1]) && is_cjk(next) {
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

/// Truncate to at most `max` characters, respecting char boundaries.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

/// Han / Hiragana / Katakana, the scripts where mid-word spaces from
/// text extraction are always spurious.
fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{3040}'..='\u{309F}'   // Hiragana
        | '\u{30A0}'..='\u{30FF}' // Katakana
        | '\u{31F0}'..='\u{31FF}' // Katakana phonetic extensions
        | '\u{3400}'..='\u{4DBF}' // CJK extension A
        | '\u{4E00}'..='\u{9FFF}' // CJK unified ideographs
        | '\u{F900}'..='\u{FAFF}' // CJK compatibility ideographs
    )
}
