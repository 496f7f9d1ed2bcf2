//! Observation sink for advisors.
//!
//! Observing advisors (such as [`LoggingAdvisor`](crate::advisor::LoggingAdvisor))
//! always log through `tracing`; an [`EventHandler`] additionally receives the
//! same observations as values, for UIs, audit trails, or tests.

use std::sync::Arc;

use crate::advisor::InvocationMode;

/// Observations emitted by advisors.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The prompt an advisor saw on the request path.
    Request {
        /// Name of the emitting advisor.
        advisor: String,
        /// Unary or streaming invocation.
        mode: InvocationMode,
        /// The user text as seen by the advisor.
        text: String,
    },
    /// The completed response an advisor saw on the response path.
    ///
    /// For streaming invocations this is emitted once, after aggregation.
    Response {
        /// Name of the emitting advisor.
        advisor: String,
        /// Unary or streaming invocation.
        mode: InvocationMode,
        /// Full response text.
        text: String,
    },
}

impl Event {
    pub fn advisor(&self) -> &str {
        match self {
            Event::Request { advisor, .. } | Event::Response { advisor, .. } => advisor,
        }
    }
}

/// Handler for advisor observations.
///
/// # Example
///
/// ```
/// use advisor_pipeline::events::{Event, EventHandler};
///
/// struct PrintHandler;
///
/// impl EventHandler for PrintHandler {
///     fn on_event(&self, event: Event) {
///         match event {
///             Event::Request { text, .. } => println!("> {}", text),
///             Event::Response { text, .. } => println!("< {}", text),
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    /// Called when an advisor emits an observation.
    fn on_event(&self, event: Event);
}

/// Emit an event if a handler is present. No-op otherwise.
pub(crate) fn emit(handler: &Option<Arc<dyn EventHandler>>, event: Event) {
    if let Some(ref h) = handler {
        h.on_event(event);
    }
}

/// An [`EventHandler`] backed by a closure.
///
/// # Example
///
/// ```
/// use advisor_pipeline::events::{Event, FnEventHandler};
/// use std::sync::Arc;
///
/// let handler = Arc::new(FnEventHandler(|event: Event| {
///     if let Event::Response { text, .. } = event {
///         println!("{}", text);
///     }
/// }));
/// ```
pub struct FnEventHandler<F: Fn(Event) + Send + Sync>(pub F);

impl<F: Fn(Event) + Send + Sync> EventHandler for FnEventHandler<F> {
    fn on_event(&self, event: Event) {
        (self.0)(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_emit_without_handler_is_noop() {
        emit(
            &None,
            Event::Request {
                advisor: "a".into(),
                mode: InvocationMode::Call,
                text: "t".into(),
            },
        );
    }

    #[test]
    fn test_fn_handler_receives_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: Option<Arc<dyn EventHandler>> =
            Some(Arc::new(FnEventHandler(move |e: Event| {
                sink.lock().unwrap().push(e.advisor().to_string());
            })));

        emit(
            &handler,
            Event::Response {
                advisor: "logger".into(),
                mode: InvocationMode::Stream,
                text: "done".into(),
            },
        );
        assert_eq!(*seen.lock().unwrap(), vec!["logger".to_string()]);
    }
}
