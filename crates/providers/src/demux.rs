//! Splits a streamed completion into a reasoning channel and a response channel.
//!
//! The two channels are separated by `<think>` / `</think>`, and either marker may be
//! cut across two deltas. Observers always receive the full accumulated text of a
//! channel, so a consumer can simply replace what it rendered last time.

use shared::agent_api::{compose_with_reasoning, StreamChunk, THINK_END, THINK_START};
use shared::error::ChatError;

/// Receives the output of a [`StreamDemultiplexer`]
pub trait StreamObserver: Send {
    /// Full reasoning text so far
    fn on_reasoning(&mut self, _reasoning: &str) {}

    /// Full response text so far
    fn on_response(&mut self, _response: &str) {}

    /// The composed assistant message, once the stream has ended
    fn on_complete(&mut self, _message: &str) {}

    fn on_error(&mut self, _error: &ChatError) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DemuxState {
    Thinking,
    Responding,
}

pub struct StreamDemultiplexer<'a> {
    observer: &'a mut dyn StreamObserver,
    state: DemuxState,
    reasoning: String,
    response: String,
    /// Tail of the last delta that could be the start of a marker
    carry: String,
    /// Set once a reasoning span has been closed; later markers are plain text
    span_closed: bool,
    saw_reasoning: bool,
    closed: bool,
}

impl<'a> StreamDemultiplexer<'a> {
    pub fn new(observer: &'a mut dyn StreamObserver) -> Self {
        Self {
            observer,
            state: DemuxState::Responding,
            reasoning: String::new(),
            response: String::new(),
            carry: String::new(),
            span_closed: false,
            saw_reasoning: false,
            closed: false,
        }
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn response(&self) -> &str {
        &self.response
    }

    /// Route one decoded stream chunk. Returns the composed message on `Done`.
    pub fn push_chunk(&mut self, chunk: StreamChunk) -> Option<String> {
        match chunk {
            StreamChunk::Text(delta) => {
                self.push_delta(&delta);
                None
            }
            StreamChunk::ToolCall {
                id,
                name,
                arguments,
            } => {
                tracing::debug!("tool call {} ({}) folded into response", name, id);
                self.push_tool_call(&name, &arguments);
                None
            }
            StreamChunk::Done { stop_reason } => {
                if let Some(reason) = stop_reason {
                    tracing::debug!("stream finished: {}", reason);
                }
                self.finish()
            }
        }
    }

    pub fn push_delta(&mut self, delta: &str) {
        if self.closed || delta.is_empty() {
            return;
        }

        let mut text = std::mem::take(&mut self.carry);
        text.push_str(delta);

        let mut reasoning_changed = false;
        let mut response_changed = false;
        let mut rest = text.as_str();

        loop {
            let marker = self.next_marker();
            let Some(marker) = marker else {
                self.response.push_str(rest);
                response_changed |= !rest.is_empty();
                break;
            };

            if let Some(pos) = rest.find(marker) {
                let before = &rest[..pos];
                match self.state {
                    DemuxState::Responding => {
                        self.response.push_str(before);
                        response_changed |= !before.is_empty();
                        self.state = DemuxState::Thinking;
                        self.saw_reasoning = true;
                        reasoning_changed = true;
                    }
                    DemuxState::Thinking => {
                        self.reasoning.push_str(before);
                        reasoning_changed |= !before.is_empty();
                        self.state = DemuxState::Responding;
                        self.span_closed = true;
                        response_changed = true;
                    }
                }
                rest = &rest[pos + marker.len()..];
                continue;
            }

            let keep = partial_marker_len(rest, marker);
            let (emit, hold) = rest.split_at(rest.len() - keep);
            self.carry.push_str(hold);
            match self.state {
                DemuxState::Responding => {
                    self.response.push_str(emit);
                    response_changed |= !emit.is_empty();
                }
                DemuxState::Thinking => {
                    self.reasoning.push_str(emit);
                    reasoning_changed |= !emit.is_empty();
                }
            }
            break;
        }

        if reasoning_changed {
            self.observer.on_reasoning(&self.reasoning);
        }
        if response_changed {
            self.observer.on_response(&self.response);
        }
    }

    /// Append a structured tool call to the response channel as readable text
    pub fn push_tool_call(&mut self, name: &str, arguments: &str) {
        if self.closed {
            return;
        }
        self.flush_carry();
        if !self.response.is_empty() && !self.response.ends_with('\n') {
            self.response.push('\n');
        }
        self.response
            .push_str(&format!("[tool call] {}({})\n", name, arguments));
        self.observer.on_response(&self.response);
    }

    /// End of stream: flush the carry, compose the final message and notify the observer
    pub fn finish(&mut self) -> Option<String> {
        if self.closed {
            return None;
        }
        self.flush_carry();
        if self.state == DemuxState::Thinking {
            tracing::debug!("stream ended inside an unterminated reasoning span");
        }
        let reasoning = if self.saw_reasoning {
            self.reasoning.as_str()
        } else {
            ""
        };
        let message = compose_with_reasoning(reasoning, &self.response);
        self.observer.on_complete(&message);
        self.closed = true;
        Some(message)
    }

    /// Report a transport failure once and go quiet
    pub fn fail(&mut self, error: &ChatError) {
        if self.closed {
            return;
        }
        self.observer.on_error(error);
        self.discard();
    }

    /// Caller-initiated cancellation: no further callbacks, buffers discarded
    pub fn abort(&mut self) {
        self.discard();
    }

    fn discard(&mut self) {
        self.closed = true;
        self.reasoning.clear();
        self.response.clear();
        self.carry.clear();
    }

    fn next_marker(&self) -> Option<&'static str> {
        match self.state {
            DemuxState::Thinking => Some(THINK_END),
            DemuxState::Responding if !self.span_closed => Some(THINK_START),
            DemuxState::Responding => None,
        }
    }

    fn flush_carry(&mut self) {
        if self.carry.is_empty() {
            return;
        }
        let carry = std::mem::take(&mut self.carry);
        match self.state {
            DemuxState::Thinking => {
                self.reasoning.push_str(&carry);
                self.observer.on_reasoning(&self.reasoning);
            }
            DemuxState::Responding => {
                self.response.push_str(&carry);
                self.observer.on_response(&self.response);
            }
        }
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of `marker`
fn partial_marker_len(text: &str, marker: &str) -> usize {
    let max = (marker.len() - 1).min(text.len());
    (1..=max)
        .rev()
        .find(|&n| text.is_char_boundary(text.len() - n) && marker.starts_with(&text[text.len() - n..]))
        .unwrap_or(0)
}
