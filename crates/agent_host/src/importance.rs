//! Greedy importance heuristic used to decide which history survives truncation.

use regex::Regex;
use shared::agent_api::{Message, Role};
use std::sync::LazyLock;

use crate::token_estimator;

pub const SYSTEM_SCORE: f64 = 100.0;

const RECENCY_WEIGHT: f64 = 20.0;
const LENGTH_CAP: f64 = 10.0;
const TOKENS_PER_LENGTH_POINT: f64 = 20.0;
const QUESTION_BONUS: f64 = 5.0;
const CODE_BONUS: f64 = 8.0;
const LIST_BONUS: f64 = 3.0;
const REQUEST_BONUS: f64 = 4.0;
const KEYWORD_BONUS: f64 = 10.0;
const ENTITY_BONUS: f64 = 2.0;
const ENTITY_CAP: f64 = 6.0;

static LIST_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(?:[-*+]|\d+[.)])\s+\S").expect("valid list regex"));
static REQUEST_PHRASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:please|could you|can you|would you|help me|how do i|how can i|explain)\b")
        .expect("valid request regex")
});
static KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:important|note|remember)\b").expect("valid keyword regex")
});
static NAMED_ENTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Z][a-z]+(?:\s+[A-Z][a-z]+)+\b").expect("valid entity regex")
});

/// A message annotated for one truncation pass
#[derive(Debug, Clone)]
pub struct ScoredMessage {
    pub message: Message,
    pub original_index: usize,
    pub importance: f64,
    pub tokens: usize,
}

impl ScoredMessage {
    pub fn new(all: &[Message], index: usize) -> Self {
        let message = all[index].clone();
        let tokens = token_estimator::estimate(&message.content);
        Self {
            importance: score_with_tokens(&message, all.len(), index, tokens),
            message,
            original_index: index,
            tokens,
        }
    }
}

/// Importance of `all[index]`. Higher survives truncation first.
pub fn score(message: &Message, all: &[Message], index: usize) -> f64 {
    let tokens = token_estimator::estimate(&message.content);
    score_with_tokens(message, all.len(), index, tokens)
}

fn score_with_tokens(message: &Message, len: usize, index: usize, tokens: usize) -> f64 {
    if message.role == Role::System {
        return SYSTEM_SCORE;
    }

    let content = message.content.as_str();
    let mut score = 0.0;

    if len > 0 {
        score += RECENCY_WEIGHT * (index.min(len - 1) + 1) as f64 / len as f64;
    }
    score += (tokens as f64 / TOKENS_PER_LENGTH_POINT).min(LENGTH_CAP);

    if content.contains('?') {
        score += QUESTION_BONUS;
    }
    if content.contains("```") {
        score += CODE_BONUS;
    }
    if LIST_MARKER.is_match(content) {
        score += LIST_BONUS;
    }
    if REQUEST_PHRASE.is_match(content) {
        score += REQUEST_BONUS;
    }
    if KEYWORD.is_match(content) {
        score += KEYWORD_BONUS;
    }

    let entities = NAMED_ENTITY.find_iter(content).count() as f64;
    score += (entities * ENTITY_BONUS).min(ENTITY_CAP);

    score
}
