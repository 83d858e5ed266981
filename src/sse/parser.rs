//! Server-sent-event wire format decoding.
//!
//! The subscribe endpoint returns an infinite `text/event-stream` body. The
//! parser is fed raw chunks as they arrive and yields complete events: lines
//! are LF-terminated (a trailing CR is stripped), fields split on the first
//! colon with one leading space removed from the value, and an empty line
//! dispatches the accumulated event.

/// A decoded server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Event {
    pub id: String,
    pub event: String,
    pub data: String,
    pub retry: Option<u64>,
}

impl Event {
    fn is_empty(&self) -> bool {
        self.event.is_empty() && self.data.is_empty()
    }

    /// Keepalive events are consumed by the connection registry and never
    /// dispatched downstream. A ping is either `event: ping` or a bare
    /// `data: 1` frame.
    pub fn is_ping(&self) -> bool {
        self.event == "ping" || (self.event.is_empty() && self.data.trim() == "1")
    }
}

/// Incremental SSE decoder. Feed it body chunks, collect complete events.
#[derive(Debug, Default)]
pub struct EventParser {
    line_buf: Vec<u8>,
    current: Event,
    data_lines: Vec<String>,
}

impl EventParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk of the response body, returning every event completed
    /// by it. Partial lines are buffered for the next chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Event> {
        let mut events = Vec::new();
        for byte in chunk {
            if *byte != b'\n' {
                self.line_buf.push(*byte);
                continue;
            }
            if self.line_buf.last() == Some(&b'\r') {
                self.line_buf.pop();
            }
            let line = std::mem::take(&mut self.line_buf);
            let line = String::from_utf8_lossy(&line).into_owned();
            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    events.push(event);
                }
            } else {
                self.parse_line(&line);
            }
        }
        events
    }

    fn dispatch(&mut self) -> Option<Event> {
        let mut event = std::mem::take(&mut self.current);
        if !self.data_lines.is_empty() {
            event.data = std::mem::take(&mut self.data_lines).join("\n");
        }
        if event.is_empty() {
            return None;
        }
        Some(event)
    }

    fn parse_line(&mut self, line: &str) {
        // Lines without a colon are ignored; a leading colon is a comment.
        let Some(colon) = line.find(':') else {
            return;
        };
        let field = &line[..colon];
        let mut value = &line[colon + 1..];
        if let Some(stripped) = value.strip_prefix(' ') {
            value = stripped;
        }

        match field {
            "data" => self.data_lines.push(value.to_string()),
            "event" => self.current.event = value.to_string(),
            "id" => self.current.id = value.to_string(),
            "retry" => self.current.retry = value.parse().ok(),
            _ => {}
        }
    }
}
