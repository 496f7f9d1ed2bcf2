//! # Advisor Pipeline
//!
//! Interceptor chains around chat-model calls.
//!
//! An **advisor** wraps a model invocation: it may rewrite the request on the
//! way in, observe or transform the response on the way out, or answer the
//! request itself without contacting the model. Advisors are registered on an
//! [`AdvisorChain`], sorted by their order value, and nested like an onion:
//! the first advisor's pre-hook runs first and its post-hook runs last.
//!
//! Both invocation modes are covered:
//!
//! - **Unary**: [`AdvisorChain::call`] returns one complete [`AdvisedResponse`].
//! - **Streaming**: [`AdvisorChain::stream`] returns a [`FragmentStream`] of
//!   partial responses ending in a terminal fragment. Advisors that need the
//!   whole response attach a [`StreamAggregator`](aggregator::StreamAggregator).
//!
//! The chain checks the continuation protocol at every hop: continuing twice,
//! emitting past the terminal fragment or ending a stream early are reported
//! as [`PipelineError`]s that name the offending advisor.
//!
//! ## Modules
//!
//! - [`advisor`]: advisor traits plus the logging, re-reading and memory advisors
//! - [`chain`]: the chain executor and continuations
//! - [`aggregator`]: whole-response views over fragment streams
//! - [`decoder`]: typed results from free-form replies
//! - [`model`] and [`backend`]: the model seam and its HTTP providers
//! - [`client`]: fluent request building on top of a chain
//!
//! ## Quick Start
//!
//! ```no_run
//! use advisor_pipeline::advisor::{LoggingAdvisor, ReReadingAdvisor, RegisteredAdvisor};
//! use advisor_pipeline::model::BackendModel;
//! use advisor_pipeline::{AdvisedRequest, AdvisorChain};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let model = BackendModel::builder("http://localhost:11434")
//!         .model("llama3.2:3b")
//!         .build()?;
//!
//!     let chain = AdvisorChain::builder(Arc::new(model))
//!         .advisor(RegisteredAdvisor::both(LoggingAdvisor::new()))
//!         .advisor(RegisteredAdvisor::both(ReReadingAdvisor::new().with_order(10)))
//!         .build()?;
//!
//!     let response = chain.call(AdvisedRequest::new("Why is the sky blue?")).await?;
//!     println!("{}", response.text);
//!     Ok(())
//! }
//! ```

pub mod advisor;
pub mod aggregator;
pub mod backend;
pub mod chain;
pub mod client;
pub mod config;
pub mod decoder;
pub mod error;
pub mod events;
pub mod model;
pub mod prompt;
pub mod types;

pub use advisor::{Advisor, CallAdvisor, Capability, InvocationMode, RegisteredAdvisor, StreamAdvisor};
pub use aggregator::{collect_response, with_completion, StreamAggregator};
pub use backend::{BackoffConfig, MockBackend, OllamaBackend};
#[cfg(feature = "openai")]
pub use backend::OpenAiBackend;
pub use chain::{AdvisorChain, CallNext, ChainBuilder, StreamNext};
pub use client::{CallResponse, ChatClient, ChatClientBuilder, PromptSpec};
pub use config::LlmConfig;
pub use decoder::{DecodeError, FieldKind, Shape, StructuredDecoder};
pub use error::{Phase, PipelineError, Result};
pub use model::{BackendModel, ChatModel, FragmentStream};
pub use types::{AdvisedRequest, AdvisedResponse, ChatMessage, Fragment, Role};
