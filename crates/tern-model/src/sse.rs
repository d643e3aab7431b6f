// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! SSE event assembly from a raw byte stream.
//!
//! A single SSE event can be split across multiple TCP chunks, and one chunk
//! can carry multiple events. [`SseEventBuffer`] keeps the trailing
//! incomplete line in a carry-over buffer and only surfaces events whose
//! terminating blank line has arrived. `data:` lines belonging to one event
//! are joined with newlines; an optional `event:` line names the event
//! (the messages protocol uses named events, chat-completions does not).

/// One assembled SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub name: Option<String>,
    pub data: String,
}

#[derive(Default)]
pub(crate) struct SseEventBuffer {
    line_buf: String,
    event_name: Option<String>,
    data_lines: Vec<String>,
}

impl SseEventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network chunk; returns every event completed by it.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.line_buf.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();
        while let Some(nl) = self.line_buf.find('\n') {
            let line = self.line_buf[..nl].trim_end_matches('\r').to_string();
            self.line_buf.drain(..=nl);
            if let Some(event) = self.push_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing event that was never terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        self.take_event()
    }

    fn push_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.take_event();
        }
        if let Some(name) = line.strip_prefix("event:") {
            self.event_name = Some(name.trim().to_string());
            return None;
        }
        if let Some(data) = line.strip_prefix("data:") {
            self.data_lines.push(data.strip_prefix(' ').unwrap_or(data).to_string());
        }
        // Comment lines and unknown fields are ignored.
        None
    }

    fn take_event(&mut self) -> Option<SseEvent> {
        if self.data_lines.is_empty() {
            self.event_name = None;
            return None;
        }
        let data = self.data_lines.join("\n");
        self.data_lines.clear();
        Some(SseEvent { name: self.event_name.take(), data })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_complete_event_is_assembled() {
        let mut buf = SseEventBuffer::new();
        let events = buf.push_chunk(b"data: {\"a\":1}\n\n");
        assert_eq!(events, vec![SseEvent { name: None, data: "{\"a\":1}".into() }]);
    }

    #[test]
    fn named_event_carries_its_name() {
        let mut buf = SseEventBuffer::new();
        let events = buf.push_chunk(b"event: message_start\ndata: {}\n\n");
        assert_eq!(events[0].name.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{}");
    }

    // An SSE event split across two TCP packets used to be dropped entirely
    // when each chunk was parsed in isolation: the first half had no newline,
    // the second half had no `data:` prefix. The carry-over buffer fixes it.
    #[test]
    fn event_split_across_two_chunks_is_assembled() {
        let full = "data: {\"choices\":[{\"delta\":{\"content\":\"hello\"}}]}\n\n";
        let (a, b) = full.as_bytes().split_at(full.len() / 2);

        let mut buf = SseEventBuffer::new();
        assert!(buf.push_chunk(a).is_empty(), "partial line must not emit");
        let events = buf.push_chunk(b);
        assert_eq!(events.len(), 1);
        assert!(events[0].data.contains("hello"));
    }

    #[test]
    fn multiple_events_in_one_chunk_all_emitted() {
        let chunk = b"data: {\"n\":1}\n\ndata: {\"n\":2}\n\n";
        let mut buf = SseEventBuffer::new();
        let events = buf.push_chunk(chunk);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "{\"n\":1}");
        assert_eq!(events[1].data, "{\"n\":2}");
    }

    #[test]
    fn multi_line_data_joined_with_newline() {
        let mut buf = SseEventBuffer::new();
        let events = buf.push_chunk(b"data: first\ndata: second\n\n");
        assert_eq!(events[0].data, "first\nsecond");
    }

    #[test]
    fn crlf_line_endings_are_handled() {
        let mut buf = SseEventBuffer::new();
        let events = buf.push_chunk(b"data: {\"x\":true}\r\n\r\n");
        assert_eq!(events[0].data, "{\"x\":true}");
    }

    #[test]
    fn done_sentinel_passes_through_as_data() {
        let mut buf = SseEventBuffer::new();
        let events = buf.push_chunk(b"data: [DONE]\n\n");
        assert_eq!(events[0].data, "[DONE]");
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut buf = SseEventBuffer::new();
        assert!(buf.push_chunk(b"data: [DONE]\n").is_empty());
        let last = buf.finish().unwrap();
        assert_eq!(last.data, "[DONE]");
        assert!(buf.finish().is_none());
    }

    #[test]
    fn blank_line_without_data_emits_nothing() {
        let mut buf = SseEventBuffer::new();
        assert!(buf.push_chunk(b"\n\n\n").is_empty());
    }

    #[test]
    fn event_name_resets_between_events() {
        let mut buf = SseEventBuffer::new();
        let events = buf.push_chunk(b"event: ping\ndata: {}\n\ndata: {}\n\n");
        assert_eq!(events[0].name.as_deref(), Some("ping"));
        assert_eq!(events[1].name, None);
    }
}
