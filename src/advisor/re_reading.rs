//! Re-reading (RE2) prompt re-emphasis.
//!
//! Asking the model to read the question twice improves reasoning on many
//! tasks. The advisor stores the original user text under
//! [`RE2_INPUT_QUERY_KEY`] and rewrites the user text to repeat it.

use async_trait::async_trait;

use super::{Advisor, CallAdvisor, StreamAdvisor};
use crate::chain::{CallNext, StreamNext};
use crate::error::Result;
use crate::model::FragmentStream;
use crate::prompt::value_to_text;
use crate::types::{AdvisedRequest, AdvisedResponse};

/// User parameter holding the original question.
pub const RE2_INPUT_QUERY_KEY: &str = "re2_input_query";

/// Default rewrite template.
pub const DEFAULT_RE2_TEMPLATE: &str =
    "{re2_input_query}\nRead the question again: {re2_input_query}\n";

/// Request-only advisor that repeats the question.
///
/// Any [`RE2_INPUT_QUERY_KEY`] value already on the request is replaced by
/// the current user text.
///
/// ```
/// use advisor_pipeline::advisor::ReReadingAdvisor;
/// use advisor_pipeline::AdvisedRequest;
///
/// let rewritten = ReReadingAdvisor::new().rewrite(AdvisedRequest::new("What is X?"));
/// assert_eq!(
///     rewritten.user_text(),
///     "What is X?\nRead the question again: What is X?\n"
/// );
/// ```
#[derive(Debug, Clone)]
pub struct ReReadingAdvisor {
    order: i32,
    template: String,
}

impl ReReadingAdvisor {
    pub fn new() -> Self {
        Self {
            order: 0,
            template: DEFAULT_RE2_TEMPLATE.to_string(),
        }
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// Use a custom template; `{re2_input_query}` marks the question.
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    /// The request-side transform.
    pub fn rewrite(&self, request: AdvisedRequest) -> AdvisedRequest {
        if let Some(stale) = request.param(RE2_INPUT_QUERY_KEY) {
            tracing::debug!(previous = %stale, "overwriting existing re2 parameter");
        }
        let original = request.user_text().to_string();
        let placeholder = format!("{{{}}}", RE2_INPUT_QUERY_KEY);
        let rewritten = self.template.replace(&placeholder, &original);
        request
            .with_param(RE2_INPUT_QUERY_KEY, original)
            .with_user_text(rewritten)
    }
}

impl Default for ReReadingAdvisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Advisor for ReReadingAdvisor {
    fn name(&self) -> &str {
        "ReReadingAdvisor"
    }

    fn order(&self) -> i32 {
        self.order
    }
}

#[async_trait]
impl CallAdvisor for ReReadingAdvisor {
    async fn around_call(&self, request: AdvisedRequest, next: CallNext) -> Result<AdvisedResponse> {
        next.call(self.rewrite(request)).await
    }
}

impl StreamAdvisor for ReReadingAdvisor {
    fn around_stream(&self, request: AdvisedRequest, next: StreamNext) -> FragmentStream {
        next.stream(self.rewrite(request))
    }
}

/// The original question stored by [`ReReadingAdvisor`], if any.
pub fn original_query(request: &AdvisedRequest) -> Option<String> {
    request.param(RE2_INPUT_QUERY_KEY).map(value_to_text)
}
