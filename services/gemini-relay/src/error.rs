//! Per-request error responses
//!
//! Every failure leaves the relay as `{error, type, isQuotaExceeded?}` with a
//! stable `type` from `ErrorKind`. Upstream detail stays in the logs.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use common::ErrorKind;
use serde::Serialize;
use thiserror::Error;
use upstream::Classification;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct RelayError {
    pub kind: ErrorKind,
    pub status: u16,
    pub message: String,
}

impl RelayError {
    /// Error with the kind's default status and message.
    pub fn from_kind(kind: ErrorKind) -> Self {
        Self {
            kind,
            status: kind.default_status(),
            message: kind.default_message().to_string(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl From<Classification> for RelayError {
    fn from(c: Classification) -> Self {
        Self {
            kind: c.kind,
            status: c.status,
            message: c.message,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody<'a> {
    error: &'a str,
    #[serde(rename = "type")]
    kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    is_quota_exceeded: Option<bool>,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: &self.message,
            kind: self.kind,
            is_quota_exceeded: self.kind.is_quota_exceeded().then_some(true),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn missing_prompt_response_shape() {
        let response = RelayError::from_kind(ErrorKind::MissingPrompt).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"], "prompt required");
        assert_eq!(json["type"], "missing_prompt");
        assert!(
            json.get("isQuotaExceeded").is_none(),
            "flag must be omitted for non-quota errors, got: {json}"
        );
    }

    #[tokio::test]
    async fn quota_errors_carry_flag() {
        let response = RelayError::from_kind(ErrorKind::DailyRequestsExceeded).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let json = body_json(response).await;
        assert_eq!(json["type"], "daily_requests_exceeded");
        assert_eq!(json["isQuotaExceeded"], true);
    }

    #[test]
    fn classification_converts_with_mirrored_status() {
        let err = RelayError::from(Classification {
            kind: ErrorKind::UpstreamApiError,
            status: 404,
            message: "not found".into(),
        });
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.to_string(), "upstream_api_error: not found");
    }

    #[test]
    fn invalid_status_falls_back_to_500() {
        let err = RelayError {
            kind: ErrorKind::ServerError,
            status: 42,
            message: "x".into(),
        };
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
