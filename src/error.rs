use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::decoder::DecodeError;

/// Where in an advisor hop a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Request side, before the continuation was invoked.
    Before,
    /// Response side, after the continuation returned.
    After,
    /// Inside the terminal model invocation.
    Model,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Before => f.write_str("before"),
            Phase::After => f.write_str("after"),
            Phase::Model => f.write_str("model"),
        }
    }
}

/// Errors produced by the advisor chain and its components.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// An advisor broke the continuation contract (called `next` more than
    /// once, emitted fragments after the terminal one, or returned an
    /// unfinished response from a unary call).
    #[error("protocol violation in advisor '{advisor}' ({phase}): {message}")]
    ProtocolViolation {
        advisor: String,
        phase: Phase,
        message: String,
    },

    /// An advisor's own code failed. Errors coming out of the continuation
    /// are never wrapped here; they pass through unchanged.
    #[error("advisor '{advisor}' failed ({phase}): {source}")]
    AdvisorFailed {
        advisor: String,
        phase: Phase,
        #[source]
        source: Box<PipelineError>,
    },

    /// Structured decoding could not map the reply onto the target shape.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// A fragment stream ended without its terminal fragment.
    #[error("stream from '{advisor}' ended without a terminal fragment")]
    StreamInterrupted { advisor: String },

    /// The invocation was cancelled by the caller.
    #[error("invocation was cancelled")]
    Cancelled,

    /// Low-level HTTP transport failure (connection refused, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON parsing failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration detected at build time.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// HTTP error with status code, response body, and optional Retry-After hint.
    ///
    /// Returned by [`Backend`](crate::backend::Backend) implementations when
    /// the provider returns a non-success status code.
    #[error("HTTP {status}: {body}")]
    HttpError {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text.
        body: String,
        /// Parsed `Retry-After` header value, if present.
        retry_after: Option<Duration>,
    },

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl PipelineError {
    pub(crate) fn violation(
        advisor: impl Into<String>,
        phase: Phase,
        message: impl Into<String>,
    ) -> Self {
        PipelineError::ProtocolViolation {
            advisor: advisor.into(),
            phase,
            message: message.into(),
        }
    }

    /// Name of the advisor this error is attributed to, if any.
    pub fn advisor(&self) -> Option<&str> {
        match self {
            PipelineError::ProtocolViolation { advisor, .. }
            | PipelineError::AdvisorFailed { advisor, .. }
            | PipelineError::StreamInterrupted { advisor } => Some(advisor),
            _ => None,
        }
    }

    /// Whether this is a contract violation rather than an ordinary failure.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, PipelineError::ProtocolViolation { .. })
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_display_names_advisor_and_phase() {
        let err = PipelineError::violation("ReReadingAdvisor", Phase::Before, "next called twice");
        let msg = err.to_string();
        assert!(msg.contains("ReReadingAdvisor"));
        assert!(msg.contains("before"));
        assert!(err.is_protocol_violation());
        assert_eq!(err.advisor(), Some("ReReadingAdvisor"));
    }

    #[test]
    fn test_advisor_failed_keeps_source() {
        let err = PipelineError::AdvisorFailed {
            advisor: "audit".into(),
            phase: Phase::After,
            source: Box::new(PipelineError::Other("disk full".into())),
        };
        assert!(err.to_string().contains("disk full"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_anyhow_converts_to_other() {
        let err: PipelineError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, PipelineError::Other(ref m) if m == "boom"));
    }
}
