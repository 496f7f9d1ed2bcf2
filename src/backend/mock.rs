//! Mock backend for testing without a live LLM.
//!
//! [`MockBackend`] returns canned responses in order and records every
//! request it receives, so tests can assert on what the advisor chain
//! finally sent to the provider.
//!
//! # Example
//!
//! ```
//! use advisor_pipeline::backend::MockBackend;
//!
//! let mock = MockBackend::fixed("Hello, world!").with_chunk_size(5);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream;
use reqwest::Client;

use super::{Backend, LlmRequest, LlmResponse, StreamChunk, TokenStream};
use crate::error::Result;
use crate::PipelineError;

/// A test backend that returns canned responses in order.
///
/// Cycles back to the beginning when all responses have been consumed.
/// Streaming splits the response into chunks of `chunk_size` characters
/// (the whole response by default) followed by a `Done` chunk.
#[derive(Debug)]
pub struct MockBackend {
    responses: Vec<String>,
    index: AtomicUsize,
    chunk_size: Option<usize>,
    truncate_stream: bool,
    failures: AtomicUsize,
    failure_status: u16,
    requests: Mutex<Vec<LlmRequest>>,
}

impl MockBackend {
    /// Create a mock backend with the given canned responses.
    ///
    /// An empty list behaves like a single empty response.
    pub fn new(responses: Vec<String>) -> Self {
        let responses = if responses.is_empty() {
            vec![String::new()]
        } else {
            responses
        };
        Self {
            responses,
            index: AtomicUsize::new(0),
            chunk_size: None,
            truncate_stream: false,
            failures: AtomicUsize::new(0),
            failure_status: 503,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Create a mock that always returns the same response.
    pub fn fixed(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }

    /// Stream responses in chunks of `n` characters.
    pub fn with_chunk_size(mut self, n: usize) -> Self {
        self.chunk_size = Some(n.max(1));
        self
    }

    /// End streams without the `Done` chunk, as a dropped connection would.
    pub fn truncated(mut self) -> Self {
        self.truncate_stream = true;
        self
    }

    /// Fail the first `n` calls with HTTP `status`.
    pub fn failing_first(mut self, n: usize, status: u16) -> Self {
        self.failures = AtomicUsize::new(n);
        self.failure_status = status;
        self
    }

    /// Every request received so far, oldest first.
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn record(&self, request: &LlmRequest) -> Result<()> {
        if let Ok(mut seen) = self.requests.lock() {
            seen.push(request.clone());
        }
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(PipelineError::HttpError {
                status: self.failure_status,
                body: "mock failure".into(),
                retry_after: None,
            });
        }
        Ok(())
    }

    fn next_response(&self) -> String {
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % self.responses.len();
        self.responses[idx].clone()
    }

    fn split(&self, text: &str) -> Vec<String> {
        let Some(size) = self.chunk_size else {
            return vec![text.to_string()];
        };
        let chars: Vec<char> = text.chars().collect();
        chars
            .chunks(size)
            .map(|c| c.iter().collect::<String>())
            .collect()
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn complete(
        &self,
        _client: &Client,
        _base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse> {
        self.record(request)?;
        Ok(LlmResponse {
            text: self.next_response(),
            status: 200,
            metadata: None,
        })
    }

    async fn stream(
        &self,
        _client: &Client,
        _base_url: &str,
        request: &LlmRequest,
    ) -> Result<TokenStream> {
        self.record(request)?;
        let text = self.next_response();
        let mut items: Vec<Result<StreamChunk>> = self
            .split(&text)
            .into_iter()
            .filter(|t| !t.is_empty())
            .map(|t| Ok(StreamChunk::Delta(t)))
            .collect();
        if !self.truncate_stream {
            items.push(Ok(StreamChunk::Done {
                metadata: Some(serde_json::json!({"backend": "mock"})),
            }));
        }
        Ok(Box::pin(stream::iter(items)))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
