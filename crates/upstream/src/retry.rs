//! Bounded exponential backoff on upstream overload
//!
//! Only overload (HTTP 503 or an "overloaded" message) is retried. Every
//! other failure, and every success, returns immediately. Waiting goes
//! through a `Sleeper` so the backoff suspends only the calling task and
//! tests can skip the real wait.

use std::future::Future;
use std::pin::Pin;
#[cfg(any(test, feature = "test-util"))]
use std::sync::Mutex;
use std::time::Duration;

use tracing::{error, warn};

use crate::{Upstream, UpstreamOutcome};

/// Retry budget for overload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each one after
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    /// 5 retries: 1s, 2s, 4s, 8s, 16s.
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(retry))
    }
}

/// Non-blocking wait primitive.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Sleeps on the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Records requested delays and returns at once.
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

#[cfg(any(test, feature = "test-util"))]
impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn total(&self) -> Duration {
        self.delays().iter().sum()
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.delays
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(duration);
        Box::pin(async {})
    }
}

/// Generate text, retrying while the upstream reports overload.
///
/// The returned outcome carries the number of attempts made. When retries
/// run out during overload the failure is marked `overload_exhausted`.
pub async fn generate_with_retry(
    upstream: &dyn Upstream,
    prompt: &str,
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
) -> UpstreamOutcome {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match upstream.generate(prompt).await {
            UpstreamOutcome::Success(mut generation) => {
                generation.attempts = attempt;
                return UpstreamOutcome::Success(generation);
            }
            UpstreamOutcome::Failure(mut failure) => {
                failure.attempts = attempt;
                if !failure.is_overload() {
                    return UpstreamOutcome::Failure(failure);
                }

                let retry = attempt - 1;
                if retry >= policy.max_retries {
                    failure.overload_exhausted = true;
                    error!(
                        upstream = upstream.id(),
                        attempts = attempt,
                        status = ?failure.status,
                        message = %failure.message,
                        "upstream still overloaded after all retries"
                    );
                    return UpstreamOutcome::Failure(failure);
                }

                let delay = policy.delay_for(retry);
                warn!(
                    upstream = upstream.id(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    status = ?failure.status,
                    "upstream overloaded, backing off"
                );
                metrics::counter!("relay_upstream_retries_total").increment(1);
                sleeper.sleep(delay).await;
            }
        }
    }
}
