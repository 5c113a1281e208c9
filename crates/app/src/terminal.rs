//! Prints the two response channels to a terminal as they grow.

use providers::demux::StreamObserver;
use shared::commands::{CommandStatus, PendingCommand};
use shared::error::ChatError;
use std::io::Write;

/// Callbacks deliver whole buffers; only the unseen tail is written
pub struct TerminalObserver<W: Write + Send> {
    out: W,
    show_reasoning: bool,
    reasoning_started: bool,
    reasoning_printed: usize,
    response_printed: usize,
}

impl<W: Write + Send> TerminalObserver<W> {
    pub fn new(out: W, show_reasoning: bool) -> Self {
        Self {
            out,
            show_reasoning,
            reasoning_started: false,
            reasoning_printed: 0,
            response_printed: 0,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_tail(&mut self, full: &str, printed: usize) -> usize {
        let tail = full.get(printed..).unwrap_or(full);
        let _ = self.out.write_all(tail.as_bytes());
        let _ = self.out.flush();
        full.len()
    }
}

impl<W: Write + Send> StreamObserver for TerminalObserver<W> {
    fn on_reasoning(&mut self, reasoning: &str) {
        if !self.show_reasoning {
            return;
        }
        if !self.reasoning_started {
            self.reasoning_started = true;
            let _ = self.out.write_all(b"[thinking] ");
        }
        self.reasoning_printed = self.write_tail(reasoning, self.reasoning_printed);
    }

    fn on_response(&mut self, response: &str) {
        if self.response_printed == 0 && self.reasoning_started {
            let _ = self.out.write_all(b"\n\n");
        }
        self.response_printed = self.write_tail(response, self.response_printed);
    }

    fn on_complete(&mut self, _message: &str) {
        let _ = self.out.write_all(b"\n");
        let _ = self.out.flush();
    }

    fn on_error(&mut self, error: &ChatError) {
        let _ = writeln!(self.out, "\n[error] {}", error);
        let _ = self.out.flush();
    }
}

/// One-line notice for a command awaiting a decision
pub fn describe_pending(cmd: &PendingCommand) -> String {
    let mut line = format!("Command waiting for approval [{}]: {}", cmd.id, cmd.command);
    if !cmd.description.is_empty() && cmd.description != cmd.command {
        line.push_str(&format!(" ({})", cmd.description));
    }
    line.push_str(&format!("\n  /approve {0}  or  /deny {0}", cmd.id));
    line
}

/// Result block for a resolved command
pub fn describe_resolved(cmd: &PendingCommand) -> String {
    let label = match cmd.status {
        CommandStatus::Executed => "executed",
        CommandStatus::Failed => "failed",
        CommandStatus::Denied => "denied",
        CommandStatus::Approved => "still running",
        CommandStatus::Pending => "pending",
    };
    match &cmd.output {
        Some(output) => format!("[{}] {}\n{}", label, cmd.command, output),
        None => format!("[{}] {}", label, cmd.command),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prints_only_new_text() {
        let mut obs = TerminalObserver::new(Vec::new(), true);
        obs.on_reasoning("");
        obs.on_reasoning("hel");
        obs.on_reasoning("hello");
        obs.on_response("wor");
        obs.on_response("world");
        obs.on_complete("<think>hello</think>world");
        let text = String::from_utf8(obs.into_inner()).unwrap();
        assert_eq!(text, "[thinking] hello\n\nworld\n");
    }

    #[test]
    fn test_hidden_reasoning() {
        let mut obs = TerminalObserver::new(Vec::new(), false);
        obs.on_reasoning("secret");
        obs.on_response("answer");
        let text = String::from_utf8(obs.into_inner()).unwrap();
        assert_eq!(text, "answer");
    }

    #[test]
    fn test_error_line() {
        let mut obs = TerminalObserver::new(Vec::new(), true);
        obs.on_error(&ChatError::http_status(503, ""));
        let text = String::from_utf8(obs.into_inner()).unwrap();
        assert_eq!(text, "\n[error] Request failed: HTTP error! Status: 503\n");
    }

    #[test]
    fn test_command_notices() {
        let mut cmd = PendingCommand::new("42", "ls -la", "List files");
        assert_eq!(
            describe_pending(&cmd),
            "Command waiting for approval [42]: ls -la (List files)\n  /approve 42  or  /deny 42"
        );
        cmd.status = CommandStatus::Executed;
        cmd.output = Some("Command executed successfully!".into());
        assert_eq!(
            describe_resolved(&cmd),
            "[executed] ls -la\nCommand executed successfully!"
        );
    }
}
