//! Conversation memory.
//!
//! [`MessageMemoryAdvisor`] prepends stored history to each request and
//! records the exchange once the response is complete. Where history lives
//! is up to the [`ChatMemory`] implementation; [`InMemoryChatMemory`] keeps
//! it in process.
//!
//! The conversation is selected per invocation through the advisor context:
//!
//! ```
//! use advisor_pipeline::advisor::memory::{
//!     CHAT_MEMORY_CONVERSATION_ID_KEY, CHAT_MEMORY_RETRIEVE_SIZE_KEY,
//! };
//! use advisor_pipeline::AdvisedRequest;
//!
//! let request = AdvisedRequest::new("Where did we leave off?")
//!     .with_context(CHAT_MEMORY_CONVERSATION_ID_KEY, "chat-42")
//!     .with_context(CHAT_MEMORY_RETRIEVE_SIZE_KEY, 10);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use super::{Advisor, CallAdvisor, StreamAdvisor};
use crate::aggregator::StreamAggregator;
use crate::chain::{CallNext, StreamNext};
use crate::error::Result;
use crate::model::FragmentStream;
use crate::types::{AdvisedRequest, AdvisedResponse, ChatMessage};

/// Advisor context key selecting the conversation.
pub const CHAT_MEMORY_CONVERSATION_ID_KEY: &str = "chat_memory_conversation_id";

/// Advisor context key limiting how many past messages are retrieved.
pub const CHAT_MEMORY_RETRIEVE_SIZE_KEY: &str = "chat_memory_response_size";

pub const DEFAULT_CONVERSATION_ID: &str = "default";
pub const DEFAULT_RETRIEVE_SIZE: usize = 100;

/// Storage for conversation history.
pub trait ChatMemory: Send + Sync {
    /// Append messages to a conversation.
    fn add(&self, conversation_id: &str, messages: Vec<ChatMessage>);

    /// The last `last_n` messages of a conversation, oldest first.
    fn get(&self, conversation_id: &str, last_n: usize) -> Vec<ChatMessage>;

    /// Forget a conversation.
    fn clear(&self, conversation_id: &str);
}

/// Process-local [`ChatMemory`].
#[derive(Debug, Default)]
pub struct InMemoryChatMemory {
    conversations: RwLock<HashMap<String, Vec<ChatMessage>>>,
}

impl InMemoryChatMemory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChatMemory for InMemoryChatMemory {
    fn add(&self, conversation_id: &str, messages: Vec<ChatMessage>) {
        let mut conversations = self
            .conversations
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        conversations
            .entry(conversation_id.to_string())
            .or_default()
            .extend(messages);
    }

    fn get(&self, conversation_id: &str, last_n: usize) -> Vec<ChatMessage> {
        let conversations = self
            .conversations
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        conversations
            .get(conversation_id)
            .map(|all| all[all.len().saturating_sub(last_n)..].to_vec())
            .unwrap_or_default()
    }

    fn clear(&self, conversation_id: &str) {
        let mut conversations = self
            .conversations
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        conversations.remove(conversation_id);
    }
}

/// Replays conversation history into requests and records each exchange.
///
/// Runs early by default (order `i32::MIN + 1000`) so the stored user
/// message is the caller's text, before other advisors rewrite it.
pub struct MessageMemoryAdvisor {
    memory: Arc<dyn ChatMemory>,
    order: i32,
    default_conversation_id: String,
    default_retrieve_size: usize,
}

impl MessageMemoryAdvisor {
    pub fn new(memory: Arc<dyn ChatMemory>) -> Self {
        Self {
            memory,
            order: i32::MIN + 1000,
            default_conversation_id: DEFAULT_CONVERSATION_ID.to_string(),
            default_retrieve_size: DEFAULT_RETRIEVE_SIZE,
        }
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// Conversation used when the request names none.
    pub fn with_default_conversation_id(mut self, id: impl Into<String>) -> Self {
        self.default_conversation_id = id.into();
        self
    }

    pub fn with_default_retrieve_size(mut self, size: usize) -> Self {
        self.default_retrieve_size = size;
        self
    }

    fn conversation_id(&self, request: &AdvisedRequest) -> String {
        match request.context_value(CHAT_MEMORY_CONVERSATION_ID_KEY) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => self.default_conversation_id.clone(),
        }
    }

    fn retrieve_size(&self, request: &AdvisedRequest) -> usize {
        match request.context_value(CHAT_MEMORY_RETRIEVE_SIZE_KEY) {
            Some(Value::Number(n)) => n.as_u64().map_or(self.default_retrieve_size, |n| n as usize),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(self.default_retrieve_size),
            _ => self.default_retrieve_size,
        }
    }

    /// Prepend history; returns the derived request, the conversation id and
    /// the user message to record on completion.
    fn before(&self, request: AdvisedRequest) -> (AdvisedRequest, String, ChatMessage) {
        let conversation_id = self.conversation_id(&request);
        let mut messages = self.memory.get(&conversation_id, self.retrieve_size(&request));
        tracing::debug!(
            conversation_id = %conversation_id,
            history = messages.len(),
            "replaying conversation memory"
        );
        let user = ChatMessage::user(request.rendered_user_text());
        messages.extend(request.messages().iter().cloned());
        (request.with_messages(messages), conversation_id, user)
    }
}

fn record(memory: &dyn ChatMemory, conversation_id: &str, user: ChatMessage, response: &AdvisedResponse) {
    memory.add(
        conversation_id,
        vec![user, ChatMessage::assistant(response.text.clone())],
    );
}

impl Advisor for MessageMemoryAdvisor {
    fn name(&self) -> &str {
        "MessageMemoryAdvisor"
    }

    fn order(&self) -> i32 {
        self.order
    }
}

#[async_trait]
impl CallAdvisor for MessageMemoryAdvisor {
    async fn around_call(&self, request: AdvisedRequest, next: CallNext) -> Result<AdvisedResponse> {
        let (request, conversation_id, user) = self.before(request);
        let response = next.call(request).await?;
        record(self.memory.as_ref(), &conversation_id, user, &response);
        Ok(response)
    }
}

impl StreamAdvisor for MessageMemoryAdvisor {
    fn around_stream(&self, request: AdvisedRequest, next: StreamNext) -> FragmentStream {
        let (request, conversation_id, user) = self.before(request);
        let memory = self.memory.clone();
        StreamAggregator::new(move |response: AdvisedResponse| {
            record(memory.as_ref(), &conversation_id, user, &response);
        })
        .aggregate(next.stream(request))
    }
}
