//! Provider backends behind [`BackendModel`](crate::model::BackendModel).
//!
//! The [`Backend`] trait translates a normalized [`LlmRequest`] into a
//! provider HTTP API. Unary calls return an [`LlmResponse`]; streaming calls
//! return a lazy [`TokenStream`] that reads the HTTP body only as it is polled.
//!
//! ```text
//! BackendModel ──► LlmRequest ──► Backend::complete() ──► LlmResponse
//!                                 Backend::stream()   ──► TokenStream
//!                                    │
//!                         ┌──────────┴──────────┐
//!                    OllamaBackend         OpenAiBackend
//!                   /api/generate          /v1/chat/completions
//!                   /api/chat              SSE streaming
//!                   NDJSON streaming
//! ```

pub mod backoff;
pub mod mock;
pub mod ndjson;
pub mod ollama;
#[cfg(feature = "openai")]
pub mod openai;
#[cfg(feature = "openai")]
pub mod sse;

pub use backoff::BackoffConfig;
pub use mock::MockBackend;
pub use ollama::OllamaBackend;
#[cfg(feature = "openai")]
pub use openai::OpenAiBackend;

use crate::config::LlmConfig;
use crate::error::Result;
use crate::types::ChatMessage;
use crate::PipelineError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::Client;
use std::future::Future;
use std::time::Duration;

/// A normalized LLM request, provider-agnostic.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// Model identifier (e.g. `"llama3.2:3b"`, `"gpt-4o"`).
    pub model: String,

    /// If `Some` and non-empty, sent as the leading system message.
    pub system_prompt: Option<String>,

    /// The current user prompt, sent after `messages`.
    pub prompt: String,

    /// Prior conversation history, oldest first.
    pub messages: Vec<ChatMessage>,

    /// LLM configuration (temperature, max_tokens, json_mode, etc.).
    pub config: LlmConfig,

    /// Whether to use the streaming endpoint.
    pub stream: bool,
}

/// A normalized LLM response.
#[derive(Debug)]
pub struct LlmResponse {
    /// The generated text content.
    pub text: String,

    /// HTTP status code (for diagnostics/logging).
    pub status: u16,

    /// Provider-specific metadata (token counts, timing, model info).
    pub metadata: Option<serde_json::Value>,
}

/// One decoded item of a provider stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// A text delta.
    Delta(String),
    /// The provider signalled completion.
    Done {
        /// Provider metadata from the final message, if any.
        metadata: Option<serde_json::Value>,
    },
}

/// Lazy stream of decoded provider chunks.
pub type TokenStream = BoxStream<'static, Result<StreamChunk>>;

/// Abstraction over LLM providers.
///
/// This trait is object-safe and designed to be used as `Arc<dyn Backend>`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Execute a non-streaming LLM call.
    async fn complete(
        &self,
        client: &Client,
        base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse>;

    /// Open a streaming LLM call.
    ///
    /// Resolves once the provider accepted the request; the returned stream
    /// yields deltas and, if the provider finished cleanly, one
    /// [`StreamChunk::Done`]. A stream that ends without `Done` was cut off.
    async fn stream(
        &self,
        client: &Client,
        base_url: &str,
        request: &LlmRequest,
    ) -> Result<TokenStream>;

    /// Human-readable name for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Check whether a [`PipelineError`] is retryable based on the backoff config.
///
/// Retryable conditions:
/// - [`PipelineError::HttpError`] with a status in `config.retryable_statuses`
/// - [`PipelineError::Request`] (connection/transport errors)
pub fn is_retryable(error: &PipelineError, config: &BackoffConfig) -> bool {
    match error {
        PipelineError::HttpError { status, .. } => config.retryable_statuses.contains(status),
        PipelineError::Request(_) => true,
        _ => false,
    }
}

/// Run `op` with transport-level retry and exponential backoff.
///
/// Used for unary calls and for the handshake of streaming calls; a stream
/// that already started delivering tokens is never restarted.
pub async fn with_backoff<T, F, Fut>(config: &BackoffConfig, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error: Option<PipelineError> = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let delay = retry_delay(config, attempt, last_error.as_ref());
            tracing::warn!(
                backend = label,
                attempt,
                delay_ms = delay.as_millis() as u64,
                reason = %last_error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                "retrying model call"
            );
            tokio::time::sleep(delay).await;
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt < config.max_retries && is_retryable(&e, config) {
                    last_error = Some(e);
                    continue;
                }
                return Err(e);
            }
        }
    }

    Err(last_error.unwrap_or(PipelineError::Other(
        "backoff loop exited unexpectedly".into(),
    )))
}

fn retry_delay(config: &BackoffConfig, attempt: u32, last: Option<&PipelineError>) -> Duration {
    match last {
        Some(PipelineError::HttpError {
            retry_after: Some(ra),
            ..
        }) if config.respect_retry_after => *ra,
        _ => config.delay_for_attempt(attempt - 1),
    }
}

/// Parse a `Retry-After` header value given in whole seconds.
pub(crate) fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Turn a non-success HTTP response into [`PipelineError::HttpError`].
pub(crate) async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let retry_after = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let body = resp.text().await.unwrap_or_default();
    Err(PipelineError::HttpError {
        status,
        body,
        retry_after,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_retries: u32) -> BackoffConfig {
        BackoffConfig {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter: backoff::JitterStrategy::None,
            ..BackoffConfig::standard()
        }
    }

    #[test]
    fn test_is_retryable_429() {
        let config = BackoffConfig::standard();
        let err = PipelineError::HttpError {
            status: 429,
            body: "rate limited".into(),
            retry_after: None,
        };
        assert!(is_retryable(&err, &config));
    }

    #[test]
    fn test_is_retryable_400_not_retried() {
        let config = BackoffConfig::standard();
        let err = PipelineError::HttpError {
            status: 400,
            body: "bad request".into(),
            retry_after: None,
        };
        assert!(!is_retryable(&err, &config));
    }

    #[test]
    fn test_is_retryable_cancelled_not_retried() {
        let config = BackoffConfig::standard();
        assert!(!is_retryable(&PipelineError::Cancelled, &config));
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after(" 30 "), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015"), None);
    }

    #[tokio::test]
    async fn test_with_backoff_retries_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(&fast_config(3), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(PipelineError::HttpError {
                        status: 503,
                        body: "busy".into(),
                        retry_after: None,
                    })
                } else {
                    Ok("ok")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_backoff_gives_up_on_non_retryable() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_backoff(&fast_config(3), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(PipelineError::Other("fatal".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_backoff_none_makes_single_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_backoff(&BackoffConfig::none(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(PipelineError::HttpError {
                    status: 429,
                    body: String::new(),
                    retry_after: None,
                })
            }
        })
        .await;
        assert!(matches!(result, Err(PipelineError::HttpError { status: 429, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
