//! Backend for Ollama's native API.
//!
//! [`OllamaBackend`] translates normalized [`LlmRequest`]s into Ollama's
//! `/api/generate` and `/api/chat` endpoints. Streaming responses are NDJSON
//! lines with `{"response": "token"}` (or `{"message": {"content": ..}}` for
//! chat), the last one carrying `"done": true`.

use super::ndjson::NdjsonDecoder;
use super::{check_status, Backend, LlmRequest, LlmResponse, StreamChunk, TokenStream};
use crate::error::Result;
use crate::types::Role;
use crate::PipelineError;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};

/// Backend for Ollama's native API.
///
/// Uses `/api/chat` when a non-empty system prompt or message history is
/// present, `/api/generate` otherwise. This is the default backend.
#[derive(Debug, Clone)]
pub struct OllamaBackend;

impl OllamaBackend {
    /// Build the Ollama `options` object from the LlmConfig.
    fn build_options(request: &LlmRequest) -> Value {
        let mut opts = json!({
            "temperature": request.config.temperature,
            "num_predict": request.config.max_tokens,
        });
        if let Some(top_p) = request.config.top_p {
            opts["top_p"] = json!(top_p);
        }
        if !request.config.stop.is_empty() {
            opts["stop"] = json!(request.config.stop);
        }
        if request.config.thinking {
            opts["extended_thinking"] = json!(true);
        }
        if let Some(ref custom) = request.config.options {
            if let (Some(base), Some(extra)) = (opts.as_object_mut(), custom.as_object()) {
                for (k, v) in extra {
                    base.insert(k.clone(), v.clone());
                }
            }
        }
        opts
    }

    /// Whether this request should use `/api/chat` (vs `/api/generate`).
    fn use_chat(request: &LlmRequest) -> bool {
        request
            .system_prompt
            .as_ref()
            .is_some_and(|s| !s.is_empty())
            || !request.messages.is_empty()
    }

    fn build_generate_body(request: &LlmRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": request.model,
            "prompt": request.prompt,
            "stream": stream,
            "options": Self::build_options(request),
        });
        if request.config.json_mode {
            body["format"] = json!("json");
        }
        body
    }

    fn build_chat_body(request: &LlmRequest, stream: bool) -> Value {
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

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": stream,
            "options": Self::build_options(request),
        });
        if request.config.json_mode {
            body["format"] = json!("json");
        }
        body
    }

    fn endpoint(base_url: &str, request: &LlmRequest, stream: bool) -> (String, Value, bool) {
        let base = base_url.trim_end_matches('/');
        if Self::use_chat(request) {
            (
                format!("{}/api/chat", base),
                Self::build_chat_body(request, stream),
                true,
            )
        } else {
            (
                format!("{}/api/generate", base),
                Self::build_generate_body(request, stream),
                false,
            )
        }
    }

    /// Pull the text out of one response object (unary or one NDJSON line).
    fn text_of(json_val: &Value, chat: bool) -> Option<&str> {
        if chat {
            json_val
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_str())
        } else {
            json_val.get("response").and_then(|r| r.as_str())
        }
    }

    /// Translate one NDJSON line into zero, one, or two stream chunks.
    ///
    /// An `{"error": ..}` line fails the stream with the provider's message.
    fn chunks_of(json_val: &Value, chat: bool) -> Result<Vec<StreamChunk>> {
        if let Some(err) = json_val.get("error") {
            let message = err.as_str().map_or_else(|| err.to_string(), str::to_string);
            return Err(PipelineError::Other(format!("ollama stream error: {}", message)));
        }
        let mut out = Vec::new();
        if let Some(t) = Self::text_of(json_val, chat) {
            if !t.is_empty() {
                out.push(StreamChunk::Delta(t.to_string()));
            }
        }
        if json_val.get("done").and_then(|v| v.as_bool()) == Some(true) {
            out.push(StreamChunk::Done {
                metadata: Self::extract_metadata(json_val),
            });
        }
        Ok(out)
    }

    /// Extract metadata fields from an Ollama response.
    fn extract_metadata(json_resp: &Value) -> Option<Value> {
        let mut meta = serde_json::Map::new();
        for key in [
            "total_duration",
            "eval_count",
            "eval_duration",
            "prompt_eval_count",
            "model",
        ] {
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

    async fn send(client: &Client, url: &str, body: &Value) -> Result<reqwest::Response> {
        let resp = client.post(url).json(body).send().await.map_err(|e| {
            PipelineError::Other(format!("Failed to connect to LLM at {}: {}", url, e))
        })?;
        check_status(resp).await
    }
}

#[async_trait]
impl Backend for OllamaBackend {
    async fn complete(
        &self,
        client: &Client,
        base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse> {
        let (url, body, chat) = Self::endpoint(base_url, request, false);
        let resp = Self::send(client, &url, &body).await?;
        let status = resp.status().as_u16();
        let json_resp: Value = resp.json().await?;

        Ok(LlmResponse {
            text: Self::text_of(&json_resp, chat).unwrap_or("").to_string(),
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
        let (url, body, chat) = Self::endpoint(base_url, request, true);
        let resp = Self::send(client, &url, &body).await?;

        let tokens = async_stream::stream! {
            let mut bytes = resp.bytes_stream();
            let mut decoder = NdjsonDecoder::new();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let err: Result<StreamChunk> = Err(PipelineError::Request(e));
                        yield err;
                        return;
                    }
                };
                for json_val in decoder.decode(&chunk) {
                    let items = match Self::chunks_of(&json_val, chat) {
                        Ok(items) => items,
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    };
                    for item in items {
                        let done = matches!(item, StreamChunk::Done { .. });
                        yield Ok(item);
                        if done {
                            return;
                        }
                    }
                }
            }

            if let Some(json_val) = decoder.flush() {
                match Self::chunks_of(&json_val, chat) {
                    Ok(items) => {
                        for item in items {
                            yield Ok(item);
                        }
                    }
                    Err(e) => yield Err(e),
                }
            }
        };

        Ok(Box::pin(tokens))
    }

    fn name(&self) -> &'static str {
        "ollama"
    }
}
