//! Request/response logging advisor.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Advisor, CallAdvisor, InvocationMode, StreamAdvisor};
use crate::aggregator::StreamAggregator;
use crate::chain::{CallNext, StreamNext};
use crate::error::Result;
use crate::events::{emit, Event, EventHandler};
use crate::model::FragmentStream;
use crate::types::{AdvisedRequest, AdvisedResponse};

/// Logs the user text before delegating and the completed response text
/// after, via `tracing::info!`.
///
/// Exactly one request and one response observation is made per invocation.
/// In streaming mode the response is observed once, after the stream has
/// been aggregated; failed or cancelled streams produce no response
/// observation.
///
/// # Example
///
/// ```
/// use advisor_pipeline::advisor::{LoggingAdvisor, RegisteredAdvisor};
/// use advisor_pipeline::events::{Event, FnEventHandler};
/// use std::sync::Arc;
///
/// let advisor = LoggingAdvisor::new()
///     .with_order(-10)
///     .with_event_handler(Arc::new(FnEventHandler(|e: Event| println!("{:?}", e))));
/// let registered = RegisteredAdvisor::both(advisor);
/// assert_eq!(registered.order(), -10);
/// ```
#[derive(Clone)]
pub struct LoggingAdvisor {
    name: String,
    order: i32,
    handler: Option<Arc<dyn EventHandler>>,
}

impl LoggingAdvisor {
    pub fn new() -> Self {
        Self {
            name: "LoggingAdvisor".to_string(),
            order: 0,
            handler: None,
        }
    }

    /// Override the name (needed to register two loggers in one chain).
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// Also deliver observations to `handler`.
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    fn observe_request(&self, request: &AdvisedRequest, mode: InvocationMode) {
        tracing::info!(advisor = %self.name, %mode, "AI Request: {}", request.user_text());
        emit(
            &self.handler,
            Event::Request {
                advisor: self.name.clone(),
                mode,
                text: request.user_text().to_string(),
            },
        );
    }
}

impl Default for LoggingAdvisor {
    fn default() -> Self {
        Self::new()
    }
}

fn observe_response(
    name: &str,
    handler: &Option<Arc<dyn EventHandler>>,
    mode: InvocationMode,
    response: &AdvisedResponse,
) {
    tracing::info!(advisor = %name, %mode, "AI Response: {}", response.text);
    emit(
        handler,
        Event::Response {
            advisor: name.to_string(),
            mode,
            text: response.text.clone(),
        },
    );
}

impl Advisor for LoggingAdvisor {
    fn name(&self) -> &str {
        &self.name
    }

    fn order(&self) -> i32 {
        self.order
    }
}

#[async_trait]
impl CallAdvisor for LoggingAdvisor {
    async fn around_call(&self, request: AdvisedRequest, next: CallNext) -> Result<AdvisedResponse> {
        self.observe_request(&request, InvocationMode::Call);
        let response = next.call(request).await?;
        observe_response(&self.name, &self.handler, InvocationMode::Call, &response);
        Ok(response)
    }
}

impl StreamAdvisor for LoggingAdvisor {
    fn around_stream(&self, request: AdvisedRequest, next: StreamNext) -> FragmentStream {
        self.observe_request(&request, InvocationMode::Stream);
        let name = self.name.clone();
        let handler = self.handler.clone();
        StreamAggregator::new(move |response: AdvisedResponse| {
            observe_response(&name, &handler, InvocationMode::Stream, &response);
        })
        .aggregate(next.stream(request))
    }
}
