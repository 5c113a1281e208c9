/// Incremental parser for the `data:` event stream of a chat-completions response.
///
/// The local server emits one `data: <json>` line per event and ends the stream
/// with `data: [DONE]`. Blank separator lines are optional.

pub const DONE_SENTINEL: &str = "[DONE]";

/// A single parsed stream event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    /// The `event:` field, if one preceded the data line.
    pub event: Option<String>,
    /// The `data:` field content.
    pub data: String,
}

impl SseEvent {
    pub fn is_done(&self) -> bool {
        self.data.trim() == DONE_SENTINEL
    }
}

/// Buffers incomplete lines across chunk boundaries.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    pending_event: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes from the HTTP response. Returns any complete events found.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            if let Some(event) = self.parse_line(line.trim_end_matches(['\n', '\r'])) {
                events.push(event);
            }
        }
        events
    }

    /// Parse whatever is left once the body ends without a trailing newline.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        self.parse_line(rest.trim_end_matches(['\n', '\r']))
    }

    fn parse_line(&mut self, line: &str) -> Option<SseEvent> {
        if let Some(val) = line.strip_prefix("event:") {
            self.pending_event = Some(val.trim().to_string());
            return None;
        }
        if let Some(val) = line.strip_prefix("data:") {
            return Some(SseEvent {
                event: self.pending_event.take(),
                data: val.trim_start_matches(' ').to_string(),
            });
        }
        // Blank separators, comments (":") and id:/retry: fields carry nothing we use
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_lines() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: hello\n\ndata: world\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "hello");
        assert_eq!(events[1].data, "world");
    }

    #[test]
    fn test_event_types() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"event: message_start\ndata: {\"type\":\"message\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{\"type\":\"message\"}");
    }

    #[test]
    fn test_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: hel").is_empty());
        let events = parser.feed(b"lo\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn test_done_and_unterminated_tail() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b": keep-alive\n").is_empty());
        assert!(parser.feed(b"data: [DONE]").is_empty());
        let tail = parser.finish().unwrap();
        assert!(tail.is_done());
        assert!(parser.finish().is_none());
    }
}
