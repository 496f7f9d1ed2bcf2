//! # Advisors
//!
//! An advisor wraps the rest of a chain: it sees the request on the way in,
//! hands a (possibly derived) request to its continuation, and sees the
//! response on the way out.
//!
//! Capabilities are split into two traits so an advisor only implements the
//! invocation modes it understands:
//!
//! - [`CallAdvisor`] for unary calls (`around_call`)
//! - [`StreamAdvisor`] for streaming calls (`around_stream`)
//!
//! Both extend [`Advisor`], which carries identity and precedence. Advisors
//! are registered in a chain as a [`RegisteredAdvisor`], which records the
//! capability set explicitly.
//!
//! ## Continuation discipline
//!
//! `next` must be invoked at most once. Not invoking it short-circuits the
//! model; invoking it twice fails the invocation with
//! [`PipelineError::ProtocolViolation`](crate::PipelineError::ProtocolViolation).
//!
//! ## Example
//!
//! ```
//! use advisor_pipeline::advisor::{Advisor, CallAdvisor};
//! use advisor_pipeline::chain::CallNext;
//! use advisor_pipeline::{AdvisedRequest, AdvisedResponse, Result};
//! use async_trait::async_trait;
//!
//! struct Shout;
//!
//! impl Advisor for Shout {
//!     fn name(&self) -> &str { "shout" }
//! }
//!
//! #[async_trait]
//! impl CallAdvisor for Shout {
//!     async fn around_call(&self, request: AdvisedRequest, next: CallNext) -> Result<AdvisedResponse> {
//!         let response = next.call(request).await?;
//!         let text = response.text.to_uppercase();
//!         Ok(response.with_text(text))
//!     }
//! }
//! ```

pub mod logging;
pub mod memory;
pub mod re_reading;

pub use logging::LoggingAdvisor;
pub use memory::{ChatMemory, InMemoryChatMemory, MessageMemoryAdvisor};
pub use re_reading::ReReadingAdvisor;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::chain::{CallNext, StreamNext};
use crate::error::Result;
use crate::model::FragmentStream;
use crate::types::{AdvisedRequest, AdvisedResponse};

/// Identity and precedence shared by every advisor.
pub trait Advisor: Send + Sync {
    /// Stable name, unique within a chain.
    fn name(&self) -> &str;

    /// Lower values run earlier on the request path and later on the
    /// response path. Ties keep registration order.
    fn order(&self) -> i32 {
        0
    }
}

/// Unary-mode capability.
#[async_trait]
pub trait CallAdvisor: Advisor {
    /// Wrap the rest of the chain for one unary call.
    ///
    /// Errors returned by `next` should be propagated (or translated into an
    /// equivalent error); they are never wrapped again by the executor.
    async fn around_call(&self, request: AdvisedRequest, next: CallNext)
        -> Result<AdvisedResponse>;
}

/// Streaming-mode capability.
///
/// `around_stream` runs synchronously when the chain is assembled and must
/// return a lazy stream; the continuation should be subscribed inside it.
/// The returned stream must end with exactly one terminal fragment.
pub trait StreamAdvisor: Advisor {
    /// Wrap the rest of the chain for one streaming call.
    fn around_stream(&self, request: AdvisedRequest, next: StreamNext) -> FragmentStream;
}

/// Which invocation modes an advisor supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Call,
    Stream,
    Both,
}

impl Capability {
    pub fn supports(self, mode: InvocationMode) -> bool {
        matches!(
            (self, mode),
            (Capability::Both, _)
                | (Capability::Call, InvocationMode::Call)
                | (Capability::Stream, InvocationMode::Stream)
        )
    }
}

/// Unary or streaming invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvocationMode {
    Call,
    Stream,
}

impl fmt::Display for InvocationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationMode::Call => f.write_str("call"),
            InvocationMode::Stream => f.write_str("stream"),
        }
    }
}

/// An advisor as registered in a chain, tagged with its capabilities.
///
/// # Example
///
/// ```
/// use advisor_pipeline::advisor::{Capability, LoggingAdvisor, ReReadingAdvisor, RegisteredAdvisor};
///
/// let logging = RegisteredAdvisor::both(LoggingAdvisor::new());
/// let re2 = RegisteredAdvisor::both(ReReadingAdvisor::new());
/// assert_eq!(logging.capability(), Capability::Both);
/// assert_eq!(re2.name(), "ReReadingAdvisor");
/// ```
#[derive(Clone)]
pub enum RegisteredAdvisor {
    Call(Arc<dyn CallAdvisor>),
    Stream(Arc<dyn StreamAdvisor>),
    Both {
        call: Arc<dyn CallAdvisor>,
        stream: Arc<dyn StreamAdvisor>,
    },
}

impl RegisteredAdvisor {
    /// Register a unary-only advisor.
    pub fn call<A: CallAdvisor + 'static>(advisor: A) -> Self {
        RegisteredAdvisor::Call(Arc::new(advisor))
    }

    /// Register a streaming-only advisor.
    pub fn stream<A: StreamAdvisor + 'static>(advisor: A) -> Self {
        RegisteredAdvisor::Stream(Arc::new(advisor))
    }

    /// Register an advisor implementing both modes; one instance serves both.
    pub fn both<A: CallAdvisor + StreamAdvisor + 'static>(advisor: A) -> Self {
        let shared = Arc::new(advisor);
        RegisteredAdvisor::Both {
            call: shared.clone(),
            stream: shared,
        }
    }

    pub fn capability(&self) -> Capability {
        match self {
            RegisteredAdvisor::Call(_) => Capability::Call,
            RegisteredAdvisor::Stream(_) => Capability::Stream,
            RegisteredAdvisor::Both { .. } => Capability::Both,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            RegisteredAdvisor::Call(a) | RegisteredAdvisor::Both { call: a, .. } => a.name(),
            RegisteredAdvisor::Stream(a) => a.name(),
        }
    }

    pub fn order(&self) -> i32 {
        match self {
            RegisteredAdvisor::Call(a) | RegisteredAdvisor::Both { call: a, .. } => a.order(),
            RegisteredAdvisor::Stream(a) => a.order(),
        }
    }

    pub(crate) fn as_call(&self) -> Option<Arc<dyn CallAdvisor>> {
        match self {
            RegisteredAdvisor::Call(a) | RegisteredAdvisor::Both { call: a, .. } => Some(a.clone()),
            RegisteredAdvisor::Stream(_) => None,
        }
    }

    pub(crate) fn as_stream(&self) -> Option<Arc<dyn StreamAdvisor>> {
        match self {
            RegisteredAdvisor::Stream(a) | RegisteredAdvisor::Both { stream: a, .. } => {
                Some(a.clone())
            }
            RegisteredAdvisor::Call(_) => None,
        }
    }
}

impl fmt::Debug for RegisteredAdvisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredAdvisor")
            .field("name", &self.name())
            .field("order", &self.order())
            .field("capability", &self.capability())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_supports() {
        assert!(Capability::Both.supports(InvocationMode::Call));
        assert!(Capability::Both.supports(InvocationMode::Stream));
        assert!(Capability::Call.supports(InvocationMode::Call));
        assert!(!Capability::Call.supports(InvocationMode::Stream));
        assert!(!Capability::Stream.supports(InvocationMode::Call));
    }

    #[test]
    fn test_registered_views() {
        let call_only = RegisteredAdvisor::call(LoggingAdvisor::new());
        assert!(call_only.as_call().is_some());
        assert!(call_only.as_stream().is_none());

        let stream_only = RegisteredAdvisor::stream(LoggingAdvisor::new());
        assert!(stream_only.as_call().is_none());
        assert_eq!(stream_only.capability(), Capability::Stream);

        let both = RegisteredAdvisor::both(ReReadingAdvisor::new());
        assert!(both.as_call().is_some() && both.as_stream().is_some());
        assert_eq!(both.order(), 0);
    }

    #[test]
    fn test_debug_shows_identity() {
        let reg = RegisteredAdvisor::both(LoggingAdvisor::new());
        let out = format!("{:?}", reg);
        assert!(out.contains("LoggingAdvisor"));
        assert!(out.contains("Both"));
    }
}
