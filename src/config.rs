use serde_json::Value;

use crate::error::{PipelineError, Result};

/// Generation settings a [`BackendModel`](crate::model::BackendModel) sends
/// with every request.
///
/// Advisors never see these; they shape the provider call only.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmConfig {
    /// Sampling temperature in `0.0..=2.0`.
    pub temperature: f64,

    /// Nucleus sampling cutoff in `(0.0, 1.0]`; provider default when unset.
    pub top_p: Option<f64>,

    pub max_tokens: u32,

    /// Generation stops before any of these sequences.
    pub stop: Vec<String>,

    /// Ask reasoning models to emit `<think>` blocks.
    pub thinking: bool,

    /// Ask the provider for a JSON-only reply.
    pub json_mode: bool,

    /// Provider-specific options merged into the request body (Ollama only).
    pub options: Option<Value>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: None,
            max_tokens: 2048,
            stop: Vec::new(),
            thinking: false,
            json_mode: false,
            options: None,
        }
    }
}

impl LlmConfig {
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_p(mut self, top_p: f64) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = tokens;
        self
    }

    pub fn with_stop(mut self, sequence: impl Into<String>) -> Self {
        self.stop.push(sequence.into());
        self
    }

    pub fn with_thinking(mut self, enabled: bool) -> Self {
        self.thinking = enabled;
        self
    }

    pub fn with_json_mode(mut self, enabled: bool) -> Self {
        self.json_mode = enabled;
        self
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.options = Some(options);
        self
    }

    /// Reject settings no provider accepts.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(PipelineError::InvalidConfig(format!(
                "temperature {} outside 0.0..=2.0",
                self.temperature
            )));
        }
        if let Some(top_p) = self.top_p {
            if !(top_p > 0.0 && top_p <= 1.0) {
                return Err(PipelineError::InvalidConfig(format!(
                    "top_p {} outside (0.0, 1.0]",
                    top_p
                )));
            }
        }
        if self.max_tokens == 0 {
            return Err(PipelineError::InvalidConfig("max_tokens must be positive".into()));
        }
        if matches!(self.options, Some(ref o) if !o.is_object()) {
            return Err(PipelineError::InvalidConfig("options must be a JSON object".into()));
        }
        Ok(())
    }
}
