//! Terminal model invocation.
//!
//! [`ChatModel`] is the innermost link of every advisor chain: the call that
//! actually produces a response. [`BackendModel`] implements it on top of a
//! provider [`Backend`], carrying the HTTP client, endpoint and generation
//! settings that the rest of the chain never sees.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;

#[cfg(feature = "openai")]
use crate::backend::OpenAiBackend;
use crate::backend::{with_backoff, Backend, BackoffConfig, LlmRequest, OllamaBackend, StreamChunk};
use crate::config::LlmConfig;
use crate::error::Result;
use crate::types::{AdvisedRequest, AdvisedResponse, Fragment};
use crate::PipelineError;

/// Lazy, ordered sequence of fragments.
///
/// A well-formed stream ends with exactly one fragment whose `finished` flag
/// is set. Dropping the stream abandons the invocation.
pub type FragmentStream = BoxStream<'static, Result<Fragment>>;

/// The terminal invocation wrapped by an advisor chain.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Produce a complete response.
    async fn call(&self, request: &AdvisedRequest) -> Result<AdvisedResponse>;

    /// Produce a lazy fragment stream.
    ///
    /// Nothing is sent to the provider until the stream is first polled.
    fn stream(&self, request: AdvisedRequest) -> FragmentStream;

    /// Name used when attributing errors to the terminal call.
    fn name(&self) -> &str;
}

/// A [`ChatModel`] backed by an HTTP [`Backend`].
///
/// # Example
///
/// ```
/// use advisor_pipeline::model::BackendModel;
/// use advisor_pipeline::LlmConfig;
///
/// let model = BackendModel::builder("http://localhost:11434")
///     .model("llama3.2:3b")
///     .config(LlmConfig::default().with_temperature(0.2))
///     .build()
///     .unwrap();
/// assert_eq!(model.base_url(), "http://localhost:11434");
/// ```
pub struct BackendModel {
    client: Client,
    base_url: String,
    backend: Arc<dyn Backend>,
    model: String,
    label: String,
    config: LlmConfig,
    backoff: BackoffConfig,
}

impl BackendModel {
    pub fn builder(base_url: impl Into<String>) -> BackendModelBuilder {
        BackendModelBuilder {
            client: None,
            base_url: base_url.into(),
            backend: None,
            model: None,
            config: LlmConfig::default(),
            backoff: None,
            timeout: None,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    /// Translate an advised request into the provider-agnostic form.
    ///
    /// Placeholders are substituted here, at the last possible moment, so
    /// every advisor sees the template and its parameters separately.
    fn to_llm_request(&self, request: &AdvisedRequest, stream: bool) -> LlmRequest {
        let system = request.rendered_system_text();
        LlmRequest {
            model: self.model.clone(),
            system_prompt: if system.trim().is_empty() {
                None
            } else {
                Some(system)
            },
            prompt: request.rendered_user_text(),
            messages: request.messages().to_vec(),
            config: self.config.clone(),
            stream,
        }
    }
}

impl std::fmt::Debug for BackendModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendModel")
            .field("base_url", &self.base_url)
            .field("backend", &self.backend.name())
            .field("model", &self.model)
            .field("config", &self.config)
            .field("backoff", &self.backoff)
            .finish()
    }
}

#[async_trait]
impl ChatModel for BackendModel {
    async fn call(&self, request: &AdvisedRequest) -> Result<AdvisedResponse> {
        let llm_request = self.to_llm_request(request, false);
        tracing::debug!(model = %self.label, prompt_len = llm_request.prompt.len(), "model call");

        let resp = with_backoff(&self.backoff, self.backend.name(), || {
            self.backend
                .complete(&self.client, &self.base_url, &llm_request)
        })
        .await?;

        let mut response = AdvisedResponse::complete(resp.text);
        response.raw = resp.metadata;
        Ok(response)
    }

    fn stream(&self, request: AdvisedRequest) -> FragmentStream {
        let llm_request = self.to_llm_request(&request, true);
        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let backend = self.backend.clone();
        let backoff = self.backoff.clone();
        let label = self.label.clone();

        let fragments = async_stream::stream! {
            tracing::debug!(model = %label, prompt_len = llm_request.prompt.len(), "model stream");
            let opened = with_backoff(&backoff, backend.name(), || {
                backend.stream(&client, &base_url, &llm_request)
            })
            .await;
            let mut tokens = match opened {
                Ok(tokens) => tokens,
                Err(e) => {
                    let err: Result<Fragment> = Err(e);
                    yield err;
                    return;
                }
            };

            while let Some(chunk) = tokens.next().await {
                match chunk {
                    Ok(StreamChunk::Delta(text)) => yield Ok(Fragment::fragment(text)),
                    Ok(StreamChunk::Done { metadata }) => {
                        let mut last = Fragment::terminal();
                        last.raw = metadata;
                        yield Ok(last);
                        return;
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        };

        Box::pin(fragments)
    }

    fn name(&self) -> &str {
        &self.label
    }
}

/// Builder for [`BackendModel`].
pub struct BackendModelBuilder {
    client: Option<Client>,
    base_url: String,
    backend: Option<Arc<dyn Backend>>,
    model: Option<String>,
    config: LlmConfig,
    backoff: Option<BackoffConfig>,
    timeout: Option<Duration>,
}

impl BackendModelBuilder {
    /// Set the HTTP client. If not set, a default client is created.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Set the provider backend. Default: [`OllamaBackend`].
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Use the OpenAI-compatible backend with `Authorization: Bearer {key}`.
    #[cfg(feature = "openai")]
    pub fn openai_with_key(mut self, api_key: impl Into<String>) -> Self {
        self.backend = Some(Arc::new(OpenAiBackend::new().with_api_key(api_key)));
        self
    }

    /// Model identifier sent to the provider. Required.
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn config(mut self, config: LlmConfig) -> Self {
        self.config = config;
        self
    }

    /// Transport retry for the provider call. Default: [`BackoffConfig::none()`].
    pub fn backoff(mut self, config: BackoffConfig) -> Self {
        self.backoff = Some(config);
        self
    }

    /// Request timeout for the default client. Default: 60 seconds.
    ///
    /// Ignored when a custom client is supplied.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<BackendModel> {
        let model = self
            .model
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| PipelineError::InvalidConfig("model id is required".to_string()))?;

        self.config.validate()?;

        let client = match self.client {
            Some(client) => client,
            None => Client::builder()
                .timeout(self.timeout.unwrap_or(Duration::from_secs(60)))
                .build()?,
        };
        let backend = self.backend.unwrap_or_else(|| Arc::new(OllamaBackend));
        let label = format!("{}:{}", backend.name(), model);

        Ok(BackendModel {
            client,
            base_url: normalize_base_url(&self.base_url),
            backend,
            model,
            label,
            config: self.config,
            backoff: self.backoff.unwrap_or_else(BackoffConfig::none),
        })
    }
}

/// Strip provider path suffixes; backends append their own paths.
fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    ["/v1/chat/completions", "/v1/chat", "/v1", "/api/generate", "/api/chat", "/api"]
        .iter()
        .find_map(|suffix| trimmed.strip_suffix(suffix))
        .unwrap_or(trimmed)
        .to_string()
}
