//! Heuristic token counting for prompt budgeting.
//!
//! Fenced code and prose are counted separately: code is dense in symbols and
//! tokenizes at roughly three characters per token, prose at ~1.3 tokens per word
//! plus extra weight for punctuation, markup and unusual terms.

use regex::Regex;
use shared::agent_api::Message;
use std::sync::LazyLock;

static FENCED_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```.*?```").expect("valid code fence regex"));
static INLINE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"</?[A-Za-z][^<>]*>").expect("valid tag regex"));
static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:https?://|www\.)\S+$").expect("valid url regex"));
static ACRONYM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]{2,}[0-9]*s?$").expect("valid acronym regex"));
static CAMEL_CASE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][a-z0-9]+[A-Z][A-Za-z0-9]*$").expect("valid camel case regex"));

const PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', '"', '\'', '(', ')', '[', ']', '{', '}'];
const MARKDOWN: &[char] = &['*', '_', '`', '#', '>', '-'];

const WORD_WEIGHT: f64 = 1.3;
const CODE_CHARS_PER_TOKEN: f64 = 3.0;
const CODE_LINE_WEIGHT: f64 = 0.5;
const SPECIAL_TERM_WEIGHT: f64 = 2.0;

/// Approximate number of tokens the model will see for `text`
pub fn estimate(text: &str) -> usize {
    if text.trim().is_empty() {
        return 0;
    }

    let mut total = 0.0;
    for block in FENCED_CODE.find_iter(text) {
        total += code_tokens(block.as_str());
    }
    let prose = FENCED_CODE.replace_all(text, " ");
    total += prose_tokens(&prose);

    total.ceil() as usize
}

/// Sum of [`estimate`] over message contents
pub fn estimate_messages(messages: &[Message]) -> usize {
    messages.iter().map(|m| estimate(&m.content)).sum()
}

fn code_tokens(block: &str) -> f64 {
    let chars = block.chars().count() as f64;
    let lines = block.lines().count() as f64;
    (chars / CODE_CHARS_PER_TOKEN).ceil() + lines * CODE_LINE_WEIGHT
}

fn prose_tokens(prose: &str) -> f64 {
    let mut words = 0usize;
    let mut special = 0usize;
    for word in prose.split_whitespace() {
        words += 1;
        if is_special_term(word) {
            special += 1;
        }
    }

    let punctuation = prose.chars().filter(|c| PUNCTUATION.contains(c)).count();
    let markdown = prose.chars().filter(|c| MARKDOWN.contains(c)).count()
        + INLINE_TAG.find_iter(prose).count();

    words as f64 * WORD_WEIGHT
        + punctuation as f64
        + special as f64 * SPECIAL_TERM_WEIGHT
        + markdown as f64
}

fn is_special_term(word: &str) -> bool {
    if URL.is_match(word) {
        return true;
    }
    let bare = word.trim_matches(|c: char| !c.is_alphanumeric());
    !bare.is_empty() && (ACRONYM.is_match(bare) || CAMEL_CASE.is_match(bare))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_zero() {
        assert_eq!(estimate(""), 0);
        assert_eq!(estimate("  \n\t "), 0);
    }

    #[test]
    fn test_plain_prose() {
        // 2 words * 1.3 = 2.6
        assert_eq!(estimate("Hello world"), 3);
        // + comma + bang
        assert_eq!(estimate("Hello, world!"), 5);
    }

    #[test]
    fn test_code_block() {
        // 20 chars -> 7, 3 lines -> 1.5
        assert_eq!(estimate("```\nfn main() {}\n```"), 9);
    }

    #[test]
    fn test_special_terms_weigh_more() {
        let plain = estimate("the quick fox");
        let acronym = estimate("the NASA fox");
        let camel = estimate("the JavaScript fox");
        assert_eq!(acronym, plain + 2);
        assert_eq!(camel, plain + 2);
        assert!(estimate("see https://example.org now") > estimate("see the page now"));
    }

    #[test]
    fn test_markdown_and_tags() {
        // "bold": 1.3, two '*' pairs -> 4
        assert_eq!(estimate("**bold**"), 6);
        assert!(estimate("<b>hi</b>") > estimate("hi"));
    }

    #[test]
    fn test_deterministic_and_summed() {
        let msgs = vec![Message::user("Hello world"), Message::assistant("Hello, world!")];
        assert_eq!(estimate_messages(&msgs), 8);
        assert_eq!(estimate("same text"), estimate("same text"));
    }
}
