//! Outward error taxonomy
//!
//! Callers only ever see one of these codes in the `type` field of an error
//! body. The upstream's own vocabulary (status strings, raw messages) is
//! mapped onto this set and never leaks past the relay.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingPrompt,
    MinuteRequestsExceeded,
    DailyRequestsExceeded,
    ModelOverloaded,
    QuotaExceeded,
    /// 429 quota exhaustion whose sub-cause cannot be pinned to a window
    GenericQuotaExceeded,
    RateLimitTemporary,
    BillingRequiredOrGeoRestricted,
    InvalidRequestArgument,
    PermissionDeniedQuotaRelated,
    PermissionDeniedGeneric,
    UpstreamApiError,
    NetworkError,
    ServerError,
}

impl ErrorKind {
    /// Wire name used in the `type` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MissingPrompt => "missing_prompt",
            ErrorKind::MinuteRequestsExceeded => "minute_requests_exceeded",
            ErrorKind::DailyRequestsExceeded => "daily_requests_exceeded",
            ErrorKind::ModelOverloaded => "model_overloaded",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::GenericQuotaExceeded => "generic_quota_exceeded",
            ErrorKind::RateLimitTemporary => "rate_limit_temporary",
            ErrorKind::BillingRequiredOrGeoRestricted => "billing_required_or_geo_restricted",
            ErrorKind::InvalidRequestArgument => "invalid_request_argument",
            ErrorKind::PermissionDeniedQuotaRelated => "permission_denied_quota_related",
            ErrorKind::PermissionDeniedGeneric => "permission_denied_generic",
            ErrorKind::UpstreamApiError => "upstream_api_error",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::ServerError => "server_error",
        }
    }

    /// Default outward HTTP status. `UpstreamApiError` mirrors the upstream
    /// status instead; 502 is only its fallback.
    pub fn default_status(&self) -> u16 {
        match self {
            ErrorKind::MissingPrompt
            | ErrorKind::BillingRequiredOrGeoRestricted
            | ErrorKind::InvalidRequestArgument => 400,
            ErrorKind::PermissionDeniedQuotaRelated | ErrorKind::PermissionDeniedGeneric => 403,
            ErrorKind::MinuteRequestsExceeded
            | ErrorKind::DailyRequestsExceeded
            | ErrorKind::QuotaExceeded
            | ErrorKind::GenericQuotaExceeded
            | ErrorKind::RateLimitTemporary => 429,
            ErrorKind::ModelOverloaded => 503,
            ErrorKind::UpstreamApiError => 502,
            ErrorKind::NetworkError | ErrorKind::ServerError => 500,
        }
    }

    /// Whether the caller should treat this as a spent budget rather than a
    /// transient condition. Drives the `isQuotaExceeded` flag.
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(
            self,
            ErrorKind::MinuteRequestsExceeded
                | ErrorKind::DailyRequestsExceeded
                | ErrorKind::QuotaExceeded
                | ErrorKind::GenericQuotaExceeded
                | ErrorKind::PermissionDeniedQuotaRelated
        )
    }

    /// Caller-facing message for kinds that do not echo upstream text.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorKind::MissingPrompt => "prompt required",
            ErrorKind::MinuteRequestsExceeded => {
                "Too many requests this minute. Please wait a moment and try again."
            }
            ErrorKind::DailyRequestsExceeded => {
                "The daily request limit has been reached. Please try again tomorrow."
            }
            ErrorKind::ModelOverloaded => {
                "The model is currently overloaded. Please try again in a few moments."
            }
            ErrorKind::QuotaExceeded | ErrorKind::GenericQuotaExceeded => {
                "The API usage quota has been exhausted. Please try again later."
            }
            ErrorKind::RateLimitTemporary => {
                "The upstream service is rate limiting requests. Please retry shortly."
            }
            ErrorKind::BillingRequiredOrGeoRestricted => {
                "The API is not available for this region or requires billing to be enabled."
            }
            ErrorKind::InvalidRequestArgument => "The request was rejected as invalid.",
            ErrorKind::PermissionDeniedQuotaRelated => {
                "The API key or its quota project is misconfigured."
            }
            ErrorKind::PermissionDeniedGeneric => "Permission denied by the upstream API.",
            ErrorKind::UpstreamApiError => "The upstream API returned an error.",
            ErrorKind::NetworkError => "Could not reach the upstream API.",
            ErrorKind::ServerError => "An unexpected server error occurred.",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_name_matches_wire_name() {
        for kind in [
            ErrorKind::MissingPrompt,
            ErrorKind::MinuteRequestsExceeded,
            ErrorKind::GenericQuotaExceeded,
            ErrorKind::BillingRequiredOrGeoRestricted,
            ErrorKind::PermissionDeniedQuotaRelated,
            ErrorKind::ServerError,
        ] {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, kind.as_str(), "serde and as_str disagree for {kind:?}");
        }
    }

    #[test]
    fn local_window_blocks_are_429_and_quota() {
        for kind in [
            ErrorKind::MinuteRequestsExceeded,
            ErrorKind::DailyRequestsExceeded,
        ] {
            assert_eq!(kind.default_status(), 429);
            assert!(kind.is_quota_exceeded());
        }
    }

    #[test]
    fn transient_kinds_are_not_quota() {
        assert!(!ErrorKind::RateLimitTemporary.is_quota_exceeded());
        assert!(!ErrorKind::ModelOverloaded.is_quota_exceeded());
        assert!(!ErrorKind::NetworkError.is_quota_exceeded());
    }

    #[test]
    fn missing_prompt_message_is_stable() {
        assert_eq!(ErrorKind::MissingPrompt.default_message(), "prompt required");
        assert_eq!(ErrorKind::MissingPrompt.default_status(), 400);
    }
}
