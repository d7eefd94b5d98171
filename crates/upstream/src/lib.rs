//! Upstream generative-text API access
//!
//! Defines the `Upstream` trait (one generation attempt), the Gemini
//! implementation, the bounded retry loop that absorbs transient overload,
//! and the classifier that maps an upstream failure onto the relay's outward
//! error taxonomy.
//!
//! An attempt never returns a Rust error: every result is an
//! `UpstreamOutcome`, and failures carry enough of the upstream response
//! (status, upstream status code, message) for classification and logging.

pub mod classify;
pub mod gemini;
pub mod retry;

pub use classify::{Classification, classify};
pub use gemini::{GeminiClient, NO_REPLY, extract_generation};
pub use retry::{RetryPolicy, Sleeper, TokioSleeper, generate_with_retry};
#[cfg(any(test, feature = "test-util"))]
pub use retry::RecordingSleeper;

use std::future::Future;
use std::pin::Pin;

/// Text and token usage from a successful call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Upstream calls made to obtain this result, retries included
    pub attempts: u32,
}

/// A failed call as seen from the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamFailure {
    /// HTTP status, or `None` when no response arrived at all
    pub status: Option<u16>,
    /// Upstream status code from a structured error body, e.g. `RESOURCE_EXHAUSTED`
    pub code: Option<String>,
    pub message: String,
    /// Whether the body parsed as the upstream's error envelope
    pub structured: bool,
    /// The request could not be built (never reached the network)
    pub internal: bool,
    pub attempts: u32,
    /// Retries ran out while the upstream was still overloaded
    pub overload_exhausted: bool,
}

impl UpstreamFailure {
    /// Failure with an HTTP response.
    pub fn http(status: u16, code: Option<String>, message: impl Into<String>, structured: bool) -> Self {
        Self {
            status: Some(status),
            code,
            message: message.into(),
            structured,
            internal: false,
            attempts: 1,
            overload_exhausted: false,
        }
    }

    /// No response: connect error, timeout, reset.
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: None,
            message: message.into(),
            structured: false,
            internal: false,
            attempts: 1,
            overload_exhausted: false,
        }
    }

    /// The request could not be constructed.
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            internal: true,
            ..Self::network(message)
        }
    }

    /// Transient overload: HTTP 503 or a message saying so.
    pub fn is_overload(&self) -> bool {
        self.status == Some(503) || self.message.to_lowercase().contains("overloaded")
    }
}

/// Tagged result of one logical generate operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamOutcome {
    Success(Generation),
    Failure(UpstreamFailure),
}

/// A generative-text backend.
///
/// `generate` performs exactly one attempt; retrying is the caller's
/// business (see `generate_with_retry`). Uses `Pin<Box<dyn Future>>` so the
/// relay can hold an `Arc<dyn Upstream>` and tests can swap in scripted
/// backends.
pub trait Upstream: Send + Sync {
    /// Identifier for logging (e.g. "gemini")
    fn id(&self) -> &str;

    fn generate<'a>(
        &'a self,
        prompt: &'a str,
    ) -> Pin<Box<dyn Future<Output = UpstreamOutcome> + Send + 'a>>;
}
