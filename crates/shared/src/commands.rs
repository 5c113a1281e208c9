//! Types for shell commands proposed by the assistant and their approval lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

/// Lifecycle of a proposed command
///
/// `Pending -> Approved -> Executed | Failed`, or `Pending -> Denied`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandStatus {
    Pending,
    Approved,
    Denied,
    Executed,
    Failed,
}

impl CommandStatus {
    /// Whether no further transition is possible
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            CommandStatus::Denied | CommandStatus::Executed | CommandStatus::Failed
        )
    }
}

/// A command candidate extracted from assistant text, before it has an id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandCandidate {
    pub command: String,
    pub description: String,
    /// Name of the detection rule that matched
    pub rule: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingCommand {
    /// Time-ordered unique id (milliseconds since the epoch)
    pub id: String,
    pub command: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub status: CommandStatus,
    /// Captured stdout/stderr or error text once resolved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl PendingCommand {
    pub fn new(
        id: impl Into<String>,
        command: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            description: description.into(),
            created_at: Utc::now(),
            status: CommandStatus::Pending,
            output: None,
        }
    }
}

/// Result of asking the execution service to run an approved command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub success: bool,
    pub message: String,
}

/// Hands out strictly increasing millisecond ids, even when called twice within one millisecond
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: AtomicI64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> String {
        self.next_at(Utc::now()).to_string()
    }

    fn next_at(&self, now: DateTime<Utc>) -> i64 {
        let candidate = now.timestamp_millis();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = candidate.max(prev + 1);
            match self
                .last
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}
