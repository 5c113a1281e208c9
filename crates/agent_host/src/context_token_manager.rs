//! Context Token Manager
//!
//! Fits a conversation into the model's context window before each request.
//!
//! Strategy:
//! - Reasoning spans are never sent back to the model
//! - System messages and the most recent exchange are always kept
//! - Older history is grouped into exchanges and admitted greedily by importance
//! - When even the protected set is too large, message bodies are shortened

use shared::agent_api::{Message, Role};
use std::cmp::{Ordering, Reverse};

use crate::importance::ScoredMessage;
use crate::token_estimator;

/// Appended to any message body shortened to fit the budget
pub const TRUNCATION_MARKER: &str = "... [truncated]";

const CHARS_PER_TOKEN: usize = 3;
const MIN_KEPT_CHARS: usize = 20;
/// User turns shorter than this, sitting between two assistant turns, are clarifications
const CLARIFICATION_MAX_CHARS: usize = 100;

/// Messages that are kept or dropped together
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    pub indices: Vec<usize>,
    pub importance: f64,
    pub tokens: usize,
}

/// Result of one truncation pass
#[derive(Debug, Clone, Default)]
pub struct TruncationOutcome {
    pub messages: Vec<Message>,
    /// Indices into the input, ascending
    pub kept: Vec<usize>,
    pub estimated_tokens: usize,
    /// Some message bodies were shortened
    pub shortened: bool,
    /// The budget could not be met even after shortening
    pub exhausted: bool,
}

impl TruncationOutcome {
    pub fn dropped(&self, input_len: usize) -> usize {
        input_len - self.kept.len()
    }
}

/// Outgoing message list for `messages` within `max_tokens`.
///
/// The result is a subsequence of the input: kept messages appear in their original
/// relative order, whatever their importance and wherever the system messages sit.
pub fn truncate(messages: &[Message], max_tokens: usize) -> Vec<Message> {
    truncate_with_report(messages, max_tokens).messages
}

/// Like [`truncate`], with the kept input indices (ascending) and token accounting
pub fn truncate_with_report(messages: &[Message], max_tokens: usize) -> TruncationOutcome {
    if messages.is_empty() || max_tokens == 0 {
        return TruncationOutcome::default();
    }

    let stripped: Vec<Message> = messages.iter().map(Message::without_reasoning).collect();
    let scored: Vec<ScoredMessage> = (0..stripped.len())
        .map(|i| ScoredMessage::new(&stripped, i))
        .collect();

    let total: usize = scored.iter().map(|s| s.tokens).sum();
    if total <= max_tokens {
        return assemble(&scored, (0..scored.len()).collect());
    }

    let system: Vec<usize> = scored
        .iter()
        .filter(|s| s.message.role == Role::System)
        .map(|s| s.original_index)
        .collect();
    let system_cost = cost(&scored, &system);
    if system_cost > max_tokens {
        tracing::warn!(
            "System messages alone need {} tokens (budget {}), dropping all history",
            system_cost,
            max_tokens
        );
        return shrink(&scored, system, max_tokens);
    }
    let mut remaining = max_tokens - system_cost;

    let protected = protected_exchange(&stripped);
    let protected_cost = cost(&scored, &protected);
    if protected_cost > remaining {
        let mut keep = system;
        keep.extend(&protected);
        keep.sort_unstable();
        return shrink(&scored, keep, max_tokens);
    }
    remaining -= protected_cost;

    let history: Vec<usize> = (0..scored.len())
        .filter(|i| scored[*i].message.role != Role::System && !protected.contains(i))
        .collect();

    let mut exchanges: Vec<Exchange> = group_exchanges(&stripped, &history)
        .into_iter()
        .map(|indices| Exchange {
            importance: indices.iter().map(|&i| scored[i].importance).sum(),
            tokens: cost(&scored, &indices),
            indices,
        })
        .collect();

    // Most important first; on a tie the more recent exchange wins
    exchanges.sort_by(|a, b| {
        b.importance
            .partial_cmp(&a.importance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.indices[0].cmp(&a.indices[0]))
    });

    let mut kept = system;
    kept.extend(&protected);
    for exchange in exchanges {
        if exchange.tokens <= remaining {
            remaining -= exchange.tokens;
            kept.extend(&exchange.indices);
        } else {
            tracing::debug!(
                "Dropping exchange {:?} ({} tokens, {} left)",
                exchange.indices,
                exchange.tokens,
                remaining
            );
        }
    }
    kept.sort_unstable();

    let outcome = assemble(&scored, kept);
    tracing::debug!(
        "Truncated {} messages to {} ({} of {} tokens)",
        messages.len(),
        outcome.kept.len(),
        outcome.estimated_tokens,
        max_tokens
    );
    outcome
}

/// Group history into exchanges.
///
/// A user turn takes the assistant turn right after it. A short user turn between
/// two assistant turns, where the earlier assistant turn stands alone, joins that
/// turn as a clarification: `[assistant, user, assistant]`. Any other assistant
/// turn forms an exchange of its own.
pub fn group_exchanges(messages: &[Message], indices: &[usize]) -> Vec<Vec<usize>> {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut p = 0;

    while p < indices.len() {
        let idx = indices[p];
        let reply = indices
            .get(p + 1)
            .copied()
            .filter(|&n| messages[n].role == Role::Assistant);

        if messages[idx].role != Role::User {
            groups.push(vec![idx]);
            p += 1;
            continue;
        }

        let follows_lone_assistant = p > 0
            && groups.last().is_some_and(|g| {
                g.len() == 1 && g[0] == indices[p - 1] && messages[g[0]].role == Role::Assistant
            });

        match reply {
            // Only a lone assistant turn is extended, so an exchange never exceeds three messages
            Some(reply) if follows_lone_assistant && is_clarification(&messages[idx]) => {
                if let Some(last) = groups.last_mut() {
                    last.push(idx);
                    last.push(reply);
                }
                p += 2;
            }
            Some(reply) => {
                groups.push(vec![idx, reply]);
                p += 2;
            }
            None => {
                groups.push(vec![idx]);
                p += 1;
            }
        }
    }
    groups
}

fn is_clarification(message: &Message) -> bool {
    message.content.chars().count() < CLARIFICATION_MAX_CHARS
}

/// The last user message and the assistant reply right after it, if any
fn protected_exchange(messages: &[Message]) -> Vec<usize> {
    let Some(user) = messages.iter().rposition(|m| m.role == Role::User) else {
        return Vec::new();
    };
    let mut indices = vec![user];
    if messages
        .get(user + 1)
        .is_some_and(|m| m.role == Role::Assistant)
    {
        indices.push(user + 1);
    }
    indices
}

fn cost(scored: &[ScoredMessage], indices: &[usize]) -> usize {
    indices.iter().map(|&i| scored[i].tokens).sum()
}

fn assemble(scored: &[ScoredMessage], kept: Vec<usize>) -> TruncationOutcome {
    TruncationOutcome {
        messages: kept.iter().map(|&i| scored[i].message.clone()).collect(),
        estimated_tokens: cost(scored, &kept),
        kept,
        shortened: false,
        exhausted: false,
    }
}

fn shrink(scored: &[ScoredMessage], kept: Vec<usize>, budget: usize) -> TruncationOutcome {
    let mut messages: Vec<Message> = kept.iter().map(|&i| scored[i].message.clone()).collect();
    let mut tokens: Vec<usize> = kept.iter().map(|&i| scored[i].tokens).collect();

    let fits = shrink_to_fit(&mut messages, &mut tokens, budget);
    let estimated_tokens = tokens.iter().sum();
    let shortened = messages
        .iter()
        .zip(&kept)
        .any(|(msg, &i)| msg.content != scored[i].message.content);
    if !fits {
        tracing::warn!(
            "Context budget {} unreachable, sending {} tokens",
            budget,
            estimated_tokens
        );
    }
    TruncationOutcome {
        messages,
        kept,
        estimated_tokens,
        shortened,
        exhausted: !fits,
    }
}

/// Shorten the longest messages first until the total fits. Messages are never removed.
fn shrink_to_fit(messages: &mut [Message], tokens: &mut [usize], budget: usize) -> bool {
    let mut spent = vec![false; messages.len()];
    loop {
        let total: usize = tokens.iter().sum();
        if total <= budget {
            return true;
        }
        let Some(i) = (0..messages.len())
            .filter(|&i| !spent[i])
            .max_by_key(|&i| (tokens[i], Reverse(i)))
        else {
            return false;
        };

        match shorten(&messages[i].content, total - budget) {
            Some(content) => {
                // The marker has a cost of its own, so only a cheaper copy replaces the body
                let shortened = token_estimator::estimate(&content);
                if shortened < tokens[i] {
                    tokens[i] = shortened;
                    messages[i].content = content;
                } else {
                    spent[i] = true;
                }
            }
            None => spent[i] = true,
        }
    }
}

/// Drop roughly `overage` tokens worth of trailing characters. `None` when nothing more can go.
fn shorten(content: &str, overage: usize) -> Option<String> {
    let base = content.strip_suffix(TRUNCATION_MARKER).unwrap_or(content);
    let chars = base.chars().count();
    let keep = chars
        .saturating_sub(overage.saturating_mul(CHARS_PER_TOKEN))
        .max(MIN_KEPT_CHARS);
    if keep >= chars {
        return None;
    }
    let mut out: String = base.chars().take(keep).collect();
    out.push_str(TRUNCATION_MARKER);
    Some(out)
}
