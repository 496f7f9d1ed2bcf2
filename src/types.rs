//! Request and response values that flow through an advisor chain.
//!
//! Both types are owned values. An advisor receives a request by value and
//! hands a *derived* request to its continuation via the `with_*` methods;
//! nothing is shared between hops or between concurrent invocations.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::prompt;

/// The role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// User input.
    User,
    /// Assistant (model) response.
    Assistant,
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The role of the message author.
    pub role: Role,
    /// The message content.
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// A chat invocation as seen by advisors.
///
/// `user_text` and `system_text` may contain `{key}` placeholders that are
/// substituted from `user_params` / `system_params` by the terminal model.
/// `context` is per-invocation scratch space visible to every advisor.
///
/// # Example
///
/// ```
/// use advisor_pipeline::AdvisedRequest;
///
/// let req = AdvisedRequest::new("Hello {name}")
///     .with_system("Be brief.")
///     .with_param("name", "Ada");
/// assert_eq!(req.rendered_user_text(), "Hello Ada");
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdvisedRequest {
    user_text: String,
    system_text: String,
    user_params: HashMap<String, Value>,
    system_params: HashMap<String, Value>,
    messages: Vec<ChatMessage>,
    context: HashMap<String, Value>,
}

impl AdvisedRequest {
    /// Create a request with the given user text.
    pub fn new(user_text: impl Into<String>) -> Self {
        Self {
            user_text: user_text.into(),
            ..Self::default()
        }
    }

    pub fn user_text(&self) -> &str {
        &self.user_text
    }

    pub fn system_text(&self) -> &str {
        &self.system_text
    }

    pub fn user_params(&self) -> &HashMap<String, Value> {
        &self.user_params
    }

    pub fn system_params(&self) -> &HashMap<String, Value> {
        &self.system_params
    }

    /// Prior conversation messages, oldest first.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Advisor context shared by all advisors of this invocation.
    pub fn context(&self) -> &HashMap<String, Value> {
        &self.context
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.user_params.get(key)
    }

    pub fn context_value(&self, key: &str) -> Option<&Value> {
        self.context.get(key)
    }

    /// Replace the user text.
    pub fn with_user_text(mut self, text: impl Into<String>) -> Self {
        self.user_text = text.into();
        self
    }

    /// Replace the system text.
    pub fn with_system(mut self, text: impl Into<String>) -> Self {
        self.system_text = text.into();
        self
    }

    /// Insert a single user parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.user_params.insert(key.into(), value.into());
        self
    }

    /// Replace all user parameters.
    pub fn with_params(mut self, params: HashMap<String, Value>) -> Self {
        self.user_params = params;
        self
    }

    /// Insert a single system parameter.
    pub fn with_system_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.system_params.insert(key.into(), value.into());
        self
    }

    /// Replace the message history.
    pub fn with_messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.messages = messages;
        self
    }

    /// Insert a single advisor context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Derive a request whose context has been transformed by `f`.
    pub fn update_context<F>(mut self, f: F) -> Self
    where
        F: FnOnce(HashMap<String, Value>) -> HashMap<String, Value>,
    {
        self.context = f(std::mem::take(&mut self.context));
        self
    }

    /// User text with `user_params` substituted.
    pub fn rendered_user_text(&self) -> String {
        prompt::render(&self.user_text, &self.user_params)
    }

    /// System text with `system_params` substituted.
    pub fn rendered_system_text(&self) -> String {
        prompt::render(&self.system_text, &self.system_params)
    }
}

/// Result of a chat invocation, or one fragment of a streamed result.
///
/// For streams, every fragment but the last has `finished == false`; the
/// terminal fragment has `finished == true` and may carry empty text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdvisedResponse {
    /// Generated text (a delta when this is a non-terminal fragment).
    pub text: String,
    /// Terminal marker.
    pub finished: bool,
    /// Provider-specific payload (token counts, model info). Opaque here.
    pub raw: Option<Value>,
    /// Metadata advisors attach on the way out (latency, ids, ...).
    pub context: HashMap<String, Value>,
}

/// One incremental piece of a streamed response.
pub type Fragment = AdvisedResponse;

impl AdvisedResponse {
    /// A complete (finished) response.
    pub fn complete(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            finished: true,
            ..Self::default()
        }
    }

    /// A non-terminal streaming fragment.
    pub fn fragment(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            finished: false,
            ..Self::default()
        }
    }

    /// An empty terminal fragment.
    pub fn terminal() -> Self {
        Self::complete("")
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = Some(raw);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_with_methods_derive_new_values() {
        let original = AdvisedRequest::new("hi").with_param("a", 1);
        let derived = original.clone().with_user_text("bye").with_param("b", 2);

        assert_eq!(original.user_text(), "hi");
        assert!(original.param("b").is_none());
        assert_eq!(derived.user_text(), "bye");
        assert_eq!(derived.param("a"), Some(&json!(1)));
        assert_eq!(derived.param("b"), Some(&json!(2)));
    }

    #[test]
    fn test_update_context() {
        let req = AdvisedRequest::new("x")
            .with_context("k", "v")
            .update_context(|mut ctx| {
                ctx.insert("n".into(), json!(3));
                ctx
            });
        assert_eq!(req.context_value("k"), Some(&json!("v")));
        assert_eq!(req.context_value("n"), Some(&json!(3)));
    }

    #[test]
    fn test_rendered_texts() {
        let req = AdvisedRequest::new("Tell {who} a joke")
            .with_param("who", "Bob")
            .with_system("You are {persona}.")
            .with_system_param("persona", "a clown");
        assert_eq!(req.rendered_user_text(), "Tell Bob a joke");
        assert_eq!(req.rendered_system_text(), "You are a clown.");
    }

    #[test]
    fn test_response_constructors() {
        assert!(AdvisedResponse::complete("x").is_finished());
        assert!(!AdvisedResponse::fragment("x").is_finished());
        let t = AdvisedResponse::terminal();
        assert!(t.finished);
        assert!(t.text.is_empty());
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let msg = ChatMessage::assistant("ok");
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["role"], "assistant");
    }
}
