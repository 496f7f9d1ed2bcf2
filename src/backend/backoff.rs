//! Transport-level retry delays for the terminal model call.
//!
//! Retries live inside [`BackendModel`](crate::model::BackendModel), below the
//! advisor chain. The chain executor itself never retries.

use std::time::Duration;

/// Exponential backoff settings for transient provider failures.
///
/// # Example
///
/// ```
/// use advisor_pipeline::backend::BackoffConfig;
///
/// assert_eq!(BackoffConfig::none().max_retries, 0);
/// assert_eq!(BackoffConfig::standard().max_retries, 3);
/// ```
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Maximum number of retries after the first attempt. Default: 0.
    pub max_retries: u32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Growth factor between consecutive delays.
    pub multiplier: f64,

    /// Upper bound for a single delay.
    pub max_delay: Duration,

    /// Randomization applied to each delay.
    pub jitter: JitterStrategy,

    /// HTTP statuses treated as transient.
    pub retryable_statuses: Vec<u16>,

    /// Use the provider's `Retry-After` hint instead of the computed delay.
    pub respect_retry_after: bool,
}

/// Jitter strategy to spread retries from concurrent callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterStrategy {
    /// Use the computed delay as is.
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// `delay/2` plus uniform in `[0, delay/2]`.
    Equal,
}

const TRANSIENT_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

impl BackoffConfig {
    /// No retry. Suitable for a local Ollama.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::standard()
        }
    }

    /// Cloud defaults: 3 retries starting at 1s, doubling, capped at 60s.
    pub fn standard() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: JitterStrategy::Full,
            retryable_statuses: TRANSIENT_STATUSES.to_vec(),
            respect_retry_after: true,
        }
    }

    /// A user is waiting: 2 retries starting at 500ms, capped at 10s.
    pub fn interactive() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            multiplier: 1.5,
            max_delay: Duration::from_secs(10),
            ..Self::standard()
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let secs = match self.jitter {
            JitterStrategy::None => capped,
            JitterStrategy::Full => fastrand::f64() * capped,
            JitterStrategy::Equal => capped / 2.0 + fastrand::f64() * (capped / 2.0),
        };
        Duration::from_secs_f64(secs)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::none()
    }
}
