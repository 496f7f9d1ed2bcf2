//! SSE (Server-Sent Events) decoder for OpenAI-compatible streams.
//!
//! Handles the `data: ` prefix, the `[DONE]` sentinel, line buffering across
//! TCP chunk boundaries, and empty keep-alive lines.

use serde_json::Value;

/// One decoded SSE `data:` payload.
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    /// A JSON payload.
    Data(Value),
    /// The `[DONE]` sentinel.
    Done,
}

/// Line-buffered SSE decoder.
///
/// # Example
///
/// ```
/// use advisor_pipeline::backend::sse::{SseDecoder, SseEvent};
///
/// let mut decoder = SseDecoder::new();
/// let data = b"data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\ndata: [DONE]\n\n";
/// let events = decoder.decode(data);
/// assert_eq!(events.len(), 2);
/// assert_eq!(events[1], SseEvent::Done);
/// ```
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes and return every complete `data:` event.
    ///
    /// `event:` lines, comments and keep-alives are skipped; unparseable
    /// payloads are dropped.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            if let Some(event) = Self::parse_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Drain whatever is left once the body has ended.
    pub fn flush(&mut self) -> Vec<SseEvent> {
        let remaining = std::mem::take(&mut self.buffer);
        remaining.lines().filter_map(Self::parse_line).collect()
    }

    fn parse_line(line: &str) -> Option<SseEvent> {
        let line = line.trim();
        let data = line
            .strip_prefix("data: ")
            .or_else(|| line.strip_prefix("data:"))?
            .trim();
        if data == "[DONE]" {
            return Some(SseEvent::Done);
        }
        serde_json::from_str::<Value>(data).ok().map(SseEvent::Data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_basic_decode() {
        let mut decoder = SseDecoder::new();
        let events = decoder.decode(b"data: {\"x\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], SseEvent::Data(v) if v["x"] == 1));
    }

    #[test]
    fn test_sse_done_reported() {
        let mut decoder = SseDecoder::new();
        let events = decoder.decode(b"data: {\"x\":1}\n\ndata: [DONE]\n\n");
        assert_eq!(events.last(), Some(&SseEvent::Done));
    }

    #[test]
    fn test_sse_event_and_empty_lines_ignored() {
        let mut decoder = SseDecoder::new();
        let events = decoder.decode(b"\n\nevent: message\n: keep-alive\ndata: {\"x\":1}\n\n\n");
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_sse_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.decode(b"data: {\"cho").is_empty());
        let events = decoder.decode(b"ices\":[]}\n\n");
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_sse_flush_trailing_line() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.decode(b"data: [DONE]").is_empty());
        assert_eq!(decoder.flush(), vec![SseEvent::Done]);
    }
}
