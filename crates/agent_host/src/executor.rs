//! Command execution service
//!
//! Approved commands run through a `CommandService`. The in-process
//! implementation here keeps its own queue and runs commands through the shell
//! with a hard timeout, reporting output in the same markdown shape the HTTP
//! bridge uses.

use async_trait::async_trait;
use parking_lot::Mutex;
use shared::commands::{ExecutionReport, IdGenerator, PendingCommand};
use shared::error::CommandError;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Output beyond this many characters is cut before reporting
const MAX_OUTPUT_CHARS: usize = 10_000;

/// Queue and run commands on behalf of the approval flow
#[async_trait]
pub trait CommandService: Send + Sync {
    /// Queue a command for approval. Returns its id.
    async fn queue(&self, command: &str, description: &str) -> Result<String, CommandError>;

    /// Run a queued command and remove it from the queue
    async fn approve(&self, id: &str) -> Result<ExecutionReport, CommandError>;

    async fn deny(&self, id: &str) -> Result<(), CommandError>;

    /// Commands still waiting for a decision
    async fn pending(&self) -> Result<Vec<PendingCommand>, CommandError>;

    /// Drop every queued command. Returns how many were dropped.
    async fn clear_all(&self) -> Result<usize, CommandError>;
}

/// Runs commands in this process
pub struct LocalCommandService {
    ids: IdGenerator,
    queue: Mutex<HashMap<String, PendingCommand>>,
    timeout: Duration,
}

impl LocalCommandService {
    pub fn new(timeout: Duration) -> Self {
        Self {
            ids: IdGenerator::new(),
            queue: Mutex::new(HashMap::new()),
            timeout,
        }
    }
}

impl Default for LocalCommandService {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl CommandService for LocalCommandService {
    async fn queue(&self, command: &str, description: &str) -> Result<String, CommandError> {
        let id = self.ids.next_id();
        let entry = PendingCommand::new(id.clone(), command, description);
        self.queue.lock().insert(id.clone(), entry);
        tracing::info!("Queued command {} for approval: {}", id, command);
        Ok(id)
    }

    async fn approve(&self, id: &str) -> Result<ExecutionReport, CommandError> {
        // Removed before running so a second approval cannot start it again
        let entry = self
            .queue
            .lock()
            .remove(id)
            .ok_or_else(|| CommandError::NotFound(id.to_string()))?;

        let report = match execute_command(&entry.command, self.timeout).await {
            Ok(output) => ExecutionReport {
                success: true,
                message: output.format_success(),
            },
            Err(e) => ExecutionReport {
                success: false,
                message: e.to_string(),
            },
        };
        Ok(report)
    }

    async fn deny(&self, id: &str) -> Result<(), CommandError> {
        match self.queue.lock().remove(id) {
            Some(_) => Ok(()),
            None => Err(CommandError::NotFound(id.to_string())),
        }
    }

    async fn pending(&self) -> Result<Vec<PendingCommand>, CommandError> {
        let mut list: Vec<PendingCommand> = self.queue.lock().values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(list)
    }

    async fn clear_all(&self) -> Result<usize, CommandError> {
        let mut queue = self.queue.lock();
        let count = queue.len();
        queue.clear();
        Ok(count)
    }
}

/// Captured output of a command that exited successfully
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn format_success(&self) -> String {
        let mut result = format!(
            "Command executed successfully!\n\n**Output:**\n```\n{}\n```",
            self.stdout
        );
        if !self.stderr.is_empty() {
            result.push_str(&format!("\n\n**Stderr:**\n```\n{}\n```", self.stderr));
        }
        result
    }
}

/// Run `cmd` through the shell. Non-zero exit, spawn failure and timeout are errors.
pub async fn execute_command(cmd: &str, timeout: Duration) -> Result<CommandOutput, CommandError> {
    let start = Instant::now();

    let (shell, shell_arg) = if cfg!(windows) {
        ("cmd", "/C")
    } else {
        ("bash", "-c")
    };

    let output = tokio::time::timeout(
        timeout,
        Command::new(shell)
            .arg(shell_arg)
            .arg(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output(),
    )
    .await;

    let duration_ms = start.elapsed().as_millis() as u64;

    match output {
        Ok(Ok(output)) => {
            let stdout = cap_output(String::from_utf8_lossy(&output.stdout).trim_end());
            let stderr = cap_output(String::from_utf8_lossy(&output.stderr).trim_end());
            if output.status.success() {
                tracing::info!("Command finished in {}ms: {}", duration_ms, cmd);
                Ok(CommandOutput {
                    stdout,
                    stderr,
                    duration_ms,
                })
            } else {
                let code = output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                tracing::warn!("Command exited with {}: {}", code, cmd);
                let mut message = format!("Command failed: {} (exit code {})", cmd, code);
                if !stderr.is_empty() {
                    message.push('\n');
                    message.push_str(&stderr);
                }
                Err(CommandError::Execution(message))
            }
        }
        Ok(Err(e)) => {
            tracing::warn!("Failed to spawn {}: {}", shell, e);
            Err(CommandError::Execution(format!("Failed to execute: {}", e)))
        }
        Err(_) => {
            tracing::warn!("Command timed out after {:?}: {}", timeout, cmd);
            Err(CommandError::Execution(format!(
                "Command timed out after {} seconds",
                timeout.as_secs()
            )))
        }
    }
}

fn cap_output(text: &str) -> String {
    let total = text.chars().count();
    if total <= MAX_OUTPUT_CHARS {
        return text.to_string();
    }
    let kept: String = text.chars().take(MAX_OUTPUT_CHARS).collect();
    format!("{}...\n[Output truncated, {} characters total]", kept, total)
}
