//! Backend for OpenAI-compatible APIs (OpenAI, vLLM, llama.cpp server,
//! LM Studio, Groq, Together, Ollama's `/v1/` endpoint, ...).
//!
//! Endpoint: `/v1/chat/completions`. Streaming is SSE with
//! `data: {"choices": [{"delta": {"content": "token"}}]}` and a final
//! `data: [DONE]`.

use super::sse::{SseDecoder, SseEvent};
use super::{check_status, Backend, LlmRequest, LlmResponse, StreamChunk, TokenStream};
use crate::error::Result;
use crate::types::Role;
use crate::PipelineError;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};

/// Backend for any OpenAI-compatible API.
///
/// # Example
///
/// ```
/// use advisor_pipeline::backend::OpenAiBackend;
///
/// let backend = OpenAiBackend::new().with_api_key("sk-...");
/// assert!(backend.has_api_key());
/// ```
#[derive(Clone, Default)]
pub struct OpenAiBackend {
    api_key: Option<String>,
    organization: Option<String>,
}

impl std::fmt::Debug for OpenAiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiBackend")
            .field(
                "api_key",
                &self.api_key.as_ref().map(|k| match k.get(..6) {
                    Some(prefix) if k.len() > 6 => format!("{}***", prefix),
                    _ => "***".to_string(),
                }),
            )
            .field("organization", &self.organization)
            .finish()
    }
}

impl OpenAiBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send `Authorization: Bearer {key}` with every request.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Send `OpenAI-Organization: {org}` with every request.
    pub fn with_organization(mut self, org: impl Into<String>) -> Self {
        self.organization = Some(org.into());
        self
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn build_messages(request: &LlmRequest) -> Vec<Value> {
        let mut messages = Vec::new();

        if let Some(ref sys) = request.system_prompt {
            if !sys.is_empty() {
                messages.push(json!({"role": "system", "content": sys}));
            }
        }

        for msg in &request.messages {
            let role = match msg.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            messages.push(json!({"role": role, "content": msg.content}));
        }

        messages.push(json!({"role": "user", "content": request.prompt}));
        messages
    }

    fn build_body(request: &LlmRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": request.model,
            "messages": Self::build_messages(request),
            "temperature": request.config.temperature,
            "max_tokens": request.config.max_tokens,
            "stream": stream,
        });

        if let Some(top_p) = request.config.top_p {
            body["top_p"] = json!(top_p);
        }
        if !request.config.stop.is_empty() {
            body["stop"] = json!(request.config.stop);
        }
        if request.config.json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }
        // `thinking` and custom options are Ollama-specific and not sent.
        body
    }

    fn build_http_request(
        &self,
        client: &Client,
        url: &str,
        body: &Value,
    ) -> reqwest::RequestBuilder {
        let mut req = client.post(url).json(body);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }
        if let Some(ref org) = self.organization {
            req = req.header("OpenAI-Organization", org.as_str());
        }
        req
    }

    async fn send(&self, client: &Client, base_url: &str, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/v1/chat/completions", base_url.trim_end_matches('/'));
        let resp = self
            .build_http_request(client, &url, body)
            .send()
            .await
            .map_err(|e| {
                PipelineError::Other(format!("Failed to connect to LLM at {}: {}", url, e))
            })?;
        check_status(resp).await
    }

    fn extract_metadata(json_resp: &Value) -> Option<Value> {
        let mut meta = serde_json::Map::new();
        for key in ["usage", "model", "id"] {
            if let Some(v) = json_resp.get(key) {
                meta.insert(key.into(), v.clone());
            }
        }
        if meta.is_empty() {
            None
        } else {
            Some(Value::Object(meta))
        }
    }

    fn delta_of(json_val: &Value) -> Option<&str> {
        json_val
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(|v| v.as_str())
    }
}

#[async_trait]
impl Backend for OpenAiBackend {
    async fn complete(
        &self,
        client: &Client,
        base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse> {
        let body = Self::build_body(request, false);
        let resp = self.send(client, base_url, &body).await?;
        let status = resp.status().as_u16();
        let json_resp: Value = resp.json().await?;

        let text = json_resp
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        Ok(LlmResponse {
            text,
            status,
            metadata: Self::extract_metadata(&json_resp),
        })
    }

    async fn stream(
        &self,
        client: &Client,
        base_url: &str,
        request: &LlmRequest,
    ) -> Result<TokenStream> {
        let body = Self::build_body(request, true);
        let resp = self.send(client, base_url, &body).await?;

        let tokens = async_stream::stream! {
            let mut bytes = resp.bytes_stream();
            let mut decoder = SseDecoder::new();
            let mut metadata: Option<Value> = None;

            loop {
                let (events, body_ended) = match bytes.next().await {
                    Some(Ok(chunk)) => (decoder.decode(&chunk), false),
                    Some(Err(e)) => {
                        let err: Result<StreamChunk> = Err(PipelineError::Request(e));
                        yield err;
                        return;
                    }
                    None => (decoder.flush(), true),
                };

                for event in events {
                    match event {
                        SseEvent::Data(json_val) => {
                            if let Some(content) = Self::delta_of(&json_val) {
                                if !content.is_empty() {
                                    yield Ok(StreamChunk::Delta(content.to_string()));
                                }
                            }
                            if let Some(meta) = Self::extract_metadata(&json_val) {
                                metadata = Some(meta);
                            }
                        }
                        SseEvent::Done => {
                            yield Ok(StreamChunk::Done { metadata: metadata.take() });
                            return;
                        }
                    }
                }

                if body_ended {
                    return;
                }
            }
        };

        Ok(Box::pin(tokens))
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}
