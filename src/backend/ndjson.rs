//! Line decoder for newline-delimited JSON bodies (Ollama streaming).
//!
//! Network chunks do not respect line boundaries, so bytes are buffered
//! until a full line is available.

use serde_json::Value;

use crate::decoder::repair::complete_truncated;

/// Buffers NDJSON bytes and yields one [`Value`] per complete line.
///
/// ```
/// use advisor_pipeline::backend::ndjson::NdjsonDecoder;
///
/// let mut decoder = NdjsonDecoder::new();
/// assert!(decoder.decode(b"{\"response\":").is_empty());
/// let values = decoder.decode(b"\"Hel\"}\n");
/// assert_eq!(values[0]["response"], "Hel");
/// ```
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    pending: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns every line completed by this chunk.
    ///
    /// Lines that are not JSON are skipped.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.pending.extend_from_slice(chunk);

        let mut values = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(v) = parse_line(&line) {
                values.push(v);
            }
        }
        values
    }

    /// Parse whatever is left after the body ended.
    ///
    /// A trailing line cut off mid-object is closed before parsing.
    pub fn flush(&mut self) -> Option<Value> {
        let rest = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&rest);
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        serde_json::from_str(text).ok().or_else(|| {
            complete_truncated(text).and_then(|fixed| serde_json::from_str(&fixed).ok())
        })
    }
}

fn parse_line(line: &[u8]) -> Option<Value> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str(text) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::debug!(error = %e, "skipping non-JSON stream line");
            None
        }
    }
}
