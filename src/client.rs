//! # Fluent chat client
//!
//! [`ChatClient`] bundles a model, default prompt texts and default advisors.
//! Each [`prompt`](ChatClient::prompt) starts a [`PromptSpec`] seeded with
//! those defaults; per-request advisors are merged in and the combined list
//! is order-sorted before dispatch.
//!
//! ```no_run
//! use advisor_pipeline::advisor::memory::{CHAT_MEMORY_CONVERSATION_ID_KEY, CHAT_MEMORY_RETRIEVE_SIZE_KEY};
//! use advisor_pipeline::advisor::{InMemoryChatMemory, LoggingAdvisor, MessageMemoryAdvisor, RegisteredAdvisor};
//! use advisor_pipeline::model::BackendModel;
//! use advisor_pipeline::ChatClient;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let model = BackendModel::builder("http://localhost:11434").model("llama3.2:3b").build()?;
//!     let client = ChatClient::builder(Arc::new(model))
//!         .default_system("You are a relationship coach.")
//!         .default_advisor(RegisteredAdvisor::both(MessageMemoryAdvisor::new(Arc::new(
//!             InMemoryChatMemory::new(),
//!         ))))
//!         .build()?;
//!
//!     let reply = client
//!         .prompt()
//!         .user("We keep arguing about chores.")
//!         .advisor_param(CHAT_MEMORY_CONVERSATION_ID_KEY, "chat-1")
//!         .advisor_param(CHAT_MEMORY_RETRIEVE_SIZE_KEY, 10)
//!         .advisor(RegisteredAdvisor::both(LoggingAdvisor::new()))
//!         .call()
//!         .await?;
//!     println!("{}", reply.content());
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::advisor::RegisteredAdvisor;
use crate::chain::AdvisorChain;
use crate::decoder::{Shape, StructuredDecoder};
use crate::error::Result;
use crate::model::{ChatModel, FragmentStream};
use crate::types::{AdvisedRequest, AdvisedResponse, ChatMessage};

/// A configured, shareable entry point for chat invocations.
#[derive(Clone, Debug)]
pub struct ChatClient {
    chain: AdvisorChain,
    template: AdvisedRequest,
}

impl ChatClient {
    pub fn builder(model: Arc<dyn ChatModel>) -> ChatClientBuilder {
        ChatClientBuilder {
            model,
            template: AdvisedRequest::default(),
            advisors: Vec::new(),
        }
    }

    /// Start a request seeded with the client defaults.
    pub fn prompt(&self) -> PromptSpec<'_> {
        PromptSpec {
            client: self,
            request: self.template.clone(),
            advisors: Vec::new(),
        }
    }

    /// The chain built from the default advisors.
    pub fn chain(&self) -> &AdvisorChain {
        &self.chain
    }
}

/// Builder for [`ChatClient`].
pub struct ChatClientBuilder {
    model: Arc<dyn ChatModel>,
    template: AdvisedRequest,
    advisors: Vec<RegisteredAdvisor>,
}

impl ChatClientBuilder {
    pub fn default_system(mut self, text: impl Into<String>) -> Self {
        self.template = self.template.with_system(text);
        self
    }

    pub fn default_system_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.template = self.template.with_system_param(key, value);
        self
    }

    pub fn default_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.template = self.template.with_param(key, value);
        self
    }

    pub fn default_advisor(mut self, advisor: RegisteredAdvisor) -> Self {
        self.advisors.push(advisor);
        self
    }

    pub fn default_advisors(mut self, advisors: impl IntoIterator<Item = RegisteredAdvisor>) -> Self {
        self.advisors.extend(advisors);
        self
    }

    pub fn build(self) -> Result<ChatClient> {
        let chain = AdvisorChain::builder(self.model)
            .advisors(self.advisors)
            .build()?;
        Ok(ChatClient {
            chain,
            template: self.template,
        })
    }
}

/// One request being assembled.
pub struct PromptSpec<'a> {
    client: &'a ChatClient,
    request: AdvisedRequest,
    advisors: Vec<RegisteredAdvisor>,
}

impl<'a> PromptSpec<'a> {
    /// Replace the system text for this request.
    pub fn system(mut self, text: impl Into<String>) -> Self {
        self.request = self.request.with_system(text);
        self
    }

    pub fn system_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.request = self.request.with_system_param(key, value);
        self
    }

    pub fn user(mut self, text: impl Into<String>) -> Self {
        self.request = self.request.with_user_text(text);
        self
    }

    /// Add a `{key}` substitution for the user text.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.request = self.request.with_param(key, value);
        self
    }

    /// Prior conversation messages sent ahead of the user text.
    pub fn messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.request = self.request.with_messages(messages);
        self
    }

    /// Put a value into the advisor context of this invocation.
    pub fn advisor_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.request = self.request.with_context(key, value);
        self
    }

    /// Add an advisor for this request only.
    pub fn advisor(mut self, advisor: RegisteredAdvisor) -> Self {
        self.advisors.push(advisor);
        self
    }

    pub fn advisors(mut self, advisors: impl IntoIterator<Item = RegisteredAdvisor>) -> Self {
        self.advisors.extend(advisors);
        self
    }

    /// The request as it will enter the chain.
    pub fn request(&self) -> &AdvisedRequest {
        &self.request
    }

    fn resolve(self) -> Result<(AdvisorChain, AdvisedRequest)> {
        let chain = if self.advisors.is_empty() {
            self.client.chain.clone()
        } else {
            self.client.chain.to_builder().advisors(self.advisors).build()?
        };
        Ok((chain, self.request))
    }

    /// Unary invocation.
    pub async fn call(self) -> Result<CallResponse> {
        let (chain, request) = self.resolve()?;
        let response = chain.call(request).await?;
        Ok(CallResponse { response })
    }

    /// Unary invocation decoded into `T`.
    ///
    /// Format instructions for `shape` are appended to the system text
    /// before dispatch.
    pub async fn entity<T: DeserializeOwned>(self, shape: Shape) -> Result<T> {
        let decoder = StructuredDecoder::new(shape);
        let system = decoder.augment_system(self.request.system_text());
        let (chain, request) = self.system(system).resolve()?;
        let response = chain.call(request).await?;
        Ok(decoder.decode(&response.text)?)
    }

    /// Streaming invocation.
    pub fn stream(self) -> FragmentStream {
        match self.resolve() {
            Ok((chain, request)) => chain.stream(request),
            Err(e) => Box::pin(futures::stream::once(async move { Err(e) })),
        }
    }

    /// Streaming invocation yielding only non-empty text deltas.
    pub fn stream_content(self) -> BoxStream<'static, Result<String>> {
        Box::pin(self.stream().filter_map(|item| async move {
            match item {
                Ok(fragment) if fragment.text.is_empty() => None,
                Ok(fragment) => Some(Ok(fragment.text)),
                Err(e) => Some(Err(e)),
            }
        }))
    }
}

/// Result of [`PromptSpec::call`].
#[derive(Debug, Clone)]
pub struct CallResponse {
    response: AdvisedResponse,
}

impl CallResponse {
    pub fn content(&self) -> &str {
        &self.response.text
    }

    pub fn response(&self) -> &AdvisedResponse {
        &self.response
    }

    pub fn into_response(self) -> AdvisedResponse {
        self.response
    }

    /// Decode the content into `T` without having sent format instructions.
    pub fn entity<T: DeserializeOwned>(&self, shape: Shape) -> Result<T> {
        Ok(StructuredDecoder::new(shape).decode(&self.response.text)?)
    }

    /// Metadata attached by advisors.
    pub fn context(&self) -> &HashMap<String, Value> {
        &self.response.context
    }
}
