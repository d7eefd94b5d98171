//! Quota-gated relay
//!
//! One inbound prompt runs: body validation, local admission check, upstream
//! call with overload retry, then either usage recording (success) or window
//! refresh plus classification (failure). The outcome is always a JSON body;
//! nothing propagates as a Rust error past this module.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::Json;
use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use common::ErrorKind;
use quota::{Admission, QuotaTracker, UsageWarning};
use serde::Serialize;
use tracing::{error, info, instrument, warn};
use upstream::{RetryPolicy, Sleeper, Upstream, UpstreamOutcome, classify, generate_with_retry};

use crate::error::RelayError;
use crate::metrics;

/// Shared state passed to the relay handler via axum State extractor
#[derive(Clone)]
pub struct RelayState {
    pub tracker: Arc<QuotaTracker>,
    pub upstream: Arc<dyn Upstream>,
    pub retry: RetryPolicy,
    pub sleeper: Arc<dyn Sleeper>,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
}

impl RelayState {
    pub fn new(
        tracker: Arc<QuotaTracker>,
        upstream: Arc<dyn Upstream>,
        retry: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            tracker,
            upstream,
            retry,
            sleeper,
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// `200` body.
#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RelaySuccess {
    pub response: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning_type: Option<&'static str>,
}

impl RelaySuccess {
    fn new(response: String, warning: Option<UsageWarning>) -> Self {
        Self {
            response,
            kind: "success",
            warning: warning.map(|w| w.message()),
            warning_type: warning.map(|w| w.as_str()),
        }
    }
}

/// Pull a non-empty string `prompt` out of a JSON body. Anything else
/// (invalid JSON, non-object, wrong type, empty string) counts as missing.
/// Whitespace is a prompt like any other.
pub fn extract_prompt(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let prompt = value.get("prompt")?.as_str()?;
    if prompt.is_empty() {
        return None;
    }
    Some(prompt.to_string())
}

/// Handle one inbound prompt and build the HTTP response.
///
/// A body axum could not buffer (too large, broken stream) has no readable
/// prompt and gets the same JSON `missing_prompt` reply as a malformed one.
#[instrument(skip_all, fields(request_id = %request_id))]
pub async fn relay_prompt(
    state: &RelayState,
    body: Result<Bytes, BytesRejection>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    state.requests_total.fetch_add(1, Ordering::Relaxed);

    let result = match body {
        Ok(body) => relay(state, &body).await,
        Err(rejection) => {
            warn!(
                rejection_status = rejection.status().as_u16(),
                reason = %rejection.body_text(),
                "request rejected: body could not be read"
            );
            Err(RelayError::from_kind(ErrorKind::MissingPrompt))
        }
    };

    let (status, kind, response) = match result {
        Ok(success) => (StatusCode::OK, "success", Json(success).into_response()),
        Err(err) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            (err.status_code(), err.kind.as_str(), err.into_response())
        }
    };

    metrics::record_request(status.as_u16(), kind, started.elapsed().as_secs_f64());
    metrics::set_quota_usage(&state.tracker.snapshot());
    response
}

/// Relay semantics without the HTTP wrapping.
pub async fn relay(state: &RelayState, body: &[u8]) -> Result<RelaySuccess, RelayError> {
    let Some(prompt) = extract_prompt(body) else {
        warn!("request rejected: prompt missing or empty");
        return Err(RelayError::from_kind(ErrorKind::MissingPrompt));
    };

    if let Admission::Blocked { reason, .. } = state.tracker.check_admission() {
        metrics::record_quota_rejection(reason.label());
        return Err(RelayError::from_kind(reason.error_kind()));
    }

    let outcome = generate_with_retry(
        state.upstream.as_ref(),
        &prompt,
        &state.retry,
        state.sleeper.as_ref(),
    )
    .await;

    match outcome {
        UpstreamOutcome::Success(generation) => {
            let warning = state
                .tracker
                .record_usage(generation.prompt_tokens, generation.completion_tokens);
            info!(
                attempts = generation.attempts,
                prompt_tokens = generation.prompt_tokens,
                completion_tokens = generation.completion_tokens,
                "prompt relayed"
            );
            Ok(RelaySuccess::new(generation.text, warning))
        }
        UpstreamOutcome::Failure(failure) => {
            state.tracker.refresh();
            let mut classification = classify(&failure);

            // Pin an upstream quota failure to a local window when our own
            // counters say that window is spent.
            if classification.kind == ErrorKind::QuotaExceeded {
                if state.tracker.daily_requests_exhausted() {
                    classification.kind = ErrorKind::DailyRequestsExceeded;
                    classification.message = ErrorKind::DailyRequestsExceeded
                        .default_message()
                        .to_string();
                } else if state.tracker.minute_requests_exhausted() {
                    classification.kind = ErrorKind::MinuteRequestsExceeded;
                    classification.message = ErrorKind::MinuteRequestsExceeded
                        .default_message()
                        .to_string();
                }
            }

            error!(
                upstream = state.upstream.id(),
                error_type = classification.kind.as_str(),
                upstream_status = ?failure.status,
                upstream_code = ?failure.code,
                upstream_message = %failure.message,
                attempts = failure.attempts,
                overload_exhausted = failure.overload_exhausted,
                "upstream call failed"
            );
            metrics::record_upstream_error(classification.kind.as_str());
            Err(classification.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use quota::{ManualClock, QuotaLimits};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;
    use upstream::{Generation, RecordingSleeper, UpstreamFailure};

    /// Upstream that returns a fixed outcome and counts calls. An optional
    /// hook runs before each reply to simulate concurrent traffic.
    struct Fixed {
        outcome: UpstreamOutcome,
        calls: AtomicU32,
        before_reply: Mutex<Option<Box<dyn Fn() + Send>>>,
    }

    impl Fixed {
        fn new(outcome: UpstreamOutcome) -> Self {
            Self {
                outcome,
                calls: AtomicU32::new(0),
                before_reply: Mutex::new(None),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Upstream for Fixed {
        fn id(&self) -> &str {
            "fixed"
        }

        fn generate<'a>(
            &'a self,
            _prompt: &'a str,
        ) -> Pin<Box<dyn Future<Output = UpstreamOutcome> + Send + 'a>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(hook) = self.before_reply.lock().unwrap().as_ref() {
                hook();
            }
            let outcome = self.outcome.clone();
            Box::pin(async move { outcome })
        }
    }

    fn success(text: &str, prompt_tokens: u64, completion_tokens: u64) -> UpstreamOutcome {
        UpstreamOutcome::Success(Generation {
            text: text.into(),
            prompt_tokens,
            completion_tokens,
            attempts: 1,
        })
    }

    fn state_with(upstream: Arc<Fixed>, limits: QuotaLimits) -> (RelayState, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 20, 15, 0, 0).unwrap(),
        ));
        let tracker = Arc::new(QuotaTracker::with_clock(limits, clock.clone()));
        let state = RelayState::new(
            tracker,
            upstream,
            RetryPolicy::default(),
            Arc::new(RecordingSleeper::new()),
        );
        (state, clock)
    }

    fn limits(rpm: u64, rpd: u64) -> QuotaLimits {
        QuotaLimits::new(rpm, 1_000, rpd, 100_000).unwrap()
    }

    #[test]
    fn extract_prompt_accepts_string() {
        assert_eq!(
            extract_prompt(br#"{"prompt":"hello"}"#),
            Some("hello".to_string())
        );
    }

    #[test]
    fn extract_prompt_keeps_whitespace_only_prompt() {
        assert_eq!(
            extract_prompt(br#"{"prompt":"   "}"#),
            Some("   ".to_string())
        );
    }

    #[test]
    fn extract_prompt_rejects_missing_empty_and_wrong_type() {
        assert_eq!(extract_prompt(br#"{}"#), None);
        assert_eq!(extract_prompt(br#"{"prompt":""}"#), None);
        assert_eq!(extract_prompt(br#"{"prompt":42}"#), None);
        assert_eq!(extract_prompt(br#"["prompt"]"#), None);
        assert_eq!(extract_prompt(b"not json"), None);
        assert_eq!(extract_prompt(b""), None);
    }

    #[tokio::test]
    async fn success_returns_text_and_records_usage() {
        let upstream = Arc::new(Fixed::new(success("hi there", 3, 4)));
        let (state, _clock) = state_with(upstream.clone(), limits(5, 100));

        let ok = relay(&state, br#"{"prompt":"hi"}"#).await.unwrap();
        assert_eq!(ok.response, "hi there");
        assert_eq!(ok.kind, "success");
        assert_eq!(ok.warning, None);

        let snap = state.tracker.snapshot();
        assert_eq!(snap.minute_requests, 1);
        assert_eq!(snap.daily_tokens, 7);
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test]
    async fn missing_prompt_wins_over_exhausted_quota() {
        let upstream = Arc::new(Fixed::new(success("x", 0, 0)));
        let (state, _clock) = state_with(upstream.clone(), limits(1, 100));
        relay(&state, br#"{"prompt":"a"}"#).await.unwrap();

        let err = relay(&state, br#"{"text":"a"}"#).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::MissingPrompt);
        assert_eq!(err.status, 400);
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test]
    async fn rpm_plus_one_is_rejected_without_upstream_call() {
        let upstream = Arc::new(Fixed::new(success("x", 1, 1)));
        let (state, clock) = state_with(upstream.clone(), limits(3, 100));

        for _ in 0..3 {
            relay(&state, br#"{"prompt":"a"}"#).await.unwrap();
        }
        let err = relay(&state, br#"{"prompt":"a"}"#).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::MinuteRequestsExceeded);
        assert_eq!(err.status, 429);
        assert_eq!(upstream.calls(), 3, "blocked request must not reach upstream");

        clock.advance(chrono::Duration::seconds(60));
        relay(&state, br#"{"prompt":"a"}"#).await.unwrap();
        assert_eq!(upstream.calls(), 4);
    }

    #[tokio::test]
    async fn daily_block_reported_before_minute_block() {
        let upstream = Arc::new(Fixed::new(success("x", 1, 1)));
        let (state, _clock) = state_with(upstream, limits(2, 2));

        relay(&state, br#"{"prompt":"a"}"#).await.unwrap();
        relay(&state, br#"{"prompt":"a"}"#).await.unwrap();
        let err = relay(&state, br#"{"prompt":"a"}"#).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::DailyRequestsExceeded);
    }

    #[tokio::test]
    async fn token_overrun_adds_warning() {
        let upstream = Arc::new(Fixed::new(success("long answer", 600, 500)));
        let (state, _clock) = state_with(upstream, limits(10, 100));

        let ok = relay(&state, br#"{"prompt":"a"}"#).await.unwrap();
        assert_eq!(ok.warning_type, Some("minute_tokens_exceeded"));
        assert!(ok.warning.is_some());
    }

    #[tokio::test]
    async fn failures_are_not_recorded() {
        let upstream = Arc::new(Fixed::new(UpstreamOutcome::Failure(
            UpstreamFailure::http(400, Some("INVALID_ARGUMENT".into()), "bad", true),
        )));
        let (state, _clock) = state_with(upstream, limits(10, 100));

        let err = relay(&state, br#"{"prompt":"a"}"#).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequestArgument);
        assert_eq!(err.message, "bad");
        assert_eq!(state.tracker.snapshot().minute_requests, 0);
    }

    #[tokio::test]
    async fn upstream_quota_is_pinned_to_exhausted_local_window() {
        let upstream = Arc::new(Fixed::new(UpstreamOutcome::Failure(
            UpstreamFailure::http(
                429,
                Some("RESOURCE_EXHAUSTED".into()),
                "Resource has been exhausted (e.g. check quota).",
                true,
            ),
        )));
        let (state, _clock) = state_with(upstream.clone(), limits(10, 1));

        // A concurrent request uses the last daily slot while this one is
        // in flight.
        let tracker = state.tracker.clone();
        *upstream.before_reply.lock().unwrap() = Some(Box::new(move || {
            tracker.record_usage(1, 1);
        }));

        let err = relay(&state, br#"{"prompt":"a"}"#).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::DailyRequestsExceeded);
        assert_eq!(err.status, 429);
    }

    #[tokio::test]
    async fn upstream_quota_without_local_exhaustion_stays_quota_exceeded() {
        let upstream = Arc::new(Fixed::new(UpstreamOutcome::Failure(
            UpstreamFailure::http(429, Some("RESOURCE_EXHAUSTED".into()), "quota", true),
        )));
        let (state, _clock) = state_with(upstream, limits(10, 100));

        let err = relay(&state, br#"{"prompt":"a"}"#).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::QuotaExceeded);
        assert!(err.kind.is_quota_exceeded());
    }

    #[tokio::test]
    async fn relay_prompt_counts_requests_and_errors() {
        let upstream = Arc::new(Fixed::new(success("x", 1, 1)));
        let (state, _clock) = state_with(upstream, limits(10, 100));

        let ok = relay_prompt(
            &state,
            Ok(Bytes::from_static(br#"{"prompt":"a"}"#)),
            "req_1".into(),
        )
        .await;
        assert_eq!(ok.status(), StatusCode::OK);
        let bad = relay_prompt(&state, Ok(Bytes::from_static(b"{}")), "req_2".into()).await;
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        assert_eq!(state.requests_total.load(Ordering::Relaxed), 2);
        assert_eq!(state.errors_total.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn success_body_omits_absent_warning() {
        let json = serde_json::to_value(RelaySuccess::new("t".into(), None)).unwrap();
        assert_eq!(json, serde_json::json!({ "response": "t", "type": "success" }));

        let warning = UsageWarning::DailyTokens { used: 11, limit: 10 };
        let json = serde_json::to_value(RelaySuccess::new("t".into(), Some(warning))).unwrap();
        assert_eq!(json["warningType"], "daily_tokens_exceeded");
        assert!(json["warning"].as_str().unwrap().contains("11/10"));
    }
}
