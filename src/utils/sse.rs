//! Incremental `text/event-stream` parsing shared by MCP transports and the
//! model client.

use memchr::memchr;

/// Splits a byte stream into complete, trimmed, non-empty lines.
#[derive(Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        self.drain_lines(false)
    }

    pub fn finish(&mut self) -> Vec<String> {
        self.drain_lines(true)
    }

    fn drain_lines(&mut self, flush: bool) -> Vec<String> {
        let mut lines = Vec::new();
        let mut search_index = 0;

        while let Some(relative_pos) = memchr(b'\n', &self.buffer[search_index..]) {
            let newline_index = search_index + relative_pos;
            push_trimmed(&mut lines, &self.buffer[search_index..newline_index]);
            search_index = newline_index + 1;
        }

        if flush {
            push_trimmed(&mut lines, &self.buffer[search_index..]);
            self.buffer.clear();
        } else if search_index > 0 {
            self.buffer.drain(..search_index);
        }

        lines
    }
}

fn push_trimmed(lines: &mut Vec<String>, bytes: &[u8]) {
    if let Ok(text) = std::str::from_utf8(bytes) {
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            lines.push(trimmed.to_string());
        }
    }
}

pub fn is_event_stream_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case("text/event-stream"))
}

pub fn sse_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

/// A dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event name, `message` when the stream omitted one.
    pub event: String,
    pub data: String,
}

/// Tracks `event:` fields across lines so each `data:` line can be
/// attributed to the event name that preceded it.
///
/// Blank lines never reach the decoder (the line buffer drops them), so every
/// `data:` line is dispatched on its own and resets the pending name.
#[derive(Default)]
pub struct SseEventDecoder {
    pending_event: Option<String>,
}

impl SseEventDecoder {
    pub fn decode_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.starts_with(':') {
            return None;
        }
        if let Some(name) = line.strip_prefix("event:") {
            self.pending_event = Some(name.trim().to_string());
            return None;
        }
        let data = sse_data_payload(line)?;
        let event = self
            .pending_event
            .take()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "message".to_string());
        Some(SseEvent {
            event,
            data: data.to_string(),
        })
    }
}
