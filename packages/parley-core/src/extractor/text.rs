//! Display-text normalization and token extraction.

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

/// Bidi marks and embeddings, zero-width characters, and C0/C1 controls
/// other than newline and tab.
const HIDDEN_CHARACTERS_PATTERN: &str = concat!(
    r"[\x{200E}\x{200F}\x{202A}-\x{202E}\x{2066}-\x{2069}\x{061C}",
    r"\x{200B}-\x{200D}\x{2060}\x{FEFF}",
    r"\x00-\x08\x0B-\x1F\x7F-\x9F]"
);

static HIDDEN_CHARACTERS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(HIDDEN_CHARACTERS_PATTERN).expect("static hidden characters pattern")
});

static MENTION_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@([0-9]+)").expect("static mention pattern"));

static URL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(?:https?://|www\.)[^\s<>"']+"#).expect("static url pattern")
});

/// Characters that end a sentence rather than a link
const URL_TRAILING: &[char] = &['.', ',', ';', ':', '!', '?', ')', ']', '}', '*', '_', '~'];

/// NFC-compose and strip invisible or direction-changing characters
pub fn normalize(raw: &str) -> String {
    let composed: String = raw.nfc().collect();
    HIDDEN_CHARACTERS_REGEX.replace_all(&composed, "").into_owned()
}

/// `@<digits>` tokens, first appearance order, without duplicates
pub fn mentions(text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for capture in MENTION_REGEX.captures_iter(text) {
        let id = &capture[1];
        if !found.iter().any(|seen| seen == id) {
            found.push(id.to_string());
        }
    }
    found
}

/// Links in order of appearance, without duplicates
pub fn urls(text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for m in URL_REGEX.find_iter(text) {
        let url = m.as_str().trim_end_matches(URL_TRAILING);
        if !url.is_empty() && !found.iter().any(|seen| seen == url) {
            found.push(url.to_string());
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_hidden_characters() {
        let raw = "he\u{200B}llo\u{202E} wor\u{FEFF}ld\u{7}";
        assert_eq!(normalize(raw), "hello world");
    }

    #[test]
    fn test_normalize_keeps_newlines_and_tabs() {
        assert_eq!(normalize("a\n\tb"), "a\n\tb");
    }

    #[test]
    fn test_normalize_composes() {
        // e + combining acute
        assert_eq!(normalize("caf\u{0065}\u{0301}"), "caf\u{00E9}");
    }

    #[test]
    fn test_mentions_deduplicated_in_order() {
        assert_eq!(mentions("hi @99 and @12, again @99"), vec!["99", "12"]);
        assert!(mentions("email me at a@b.c").is_empty());
    }

    #[test]
    fn test_mentions_ascii_digits_only() {
        assert!(mentions("@\u{0661}\u{0662}\u{0663}").is_empty());
        assert_eq!(mentions("@12\u{0663}"), vec!["12"]);
    }

    #[test]
    fn test_urls() {
        let text = "see https://example.com/a?b=1. and www.rust-lang.org, or http://x.io)";
        assert_eq!(
            urls(text),
            vec!["https://example.com/a?b=1", "www.rust-lang.org", "http://x.io"]
        );
        assert!(urls("no links here").is_empty());
    }
}
