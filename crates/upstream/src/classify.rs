//! Upstream failure classification
//!
//! Maps a failure onto one outward `ErrorKind` and HTTP status so callers
//! never need the upstream's vocabulary. Rules are checked in order and the
//! first match wins. Phrase matching is a case-insensitive substring test.

use common::ErrorKind;

use crate::UpstreamFailure;

/// Message fragments that mean the account's quota is spent, as opposed to a
/// short-lived rate limit.
const QUOTA_PATTERNS: &[&str] = &[
    "resource has been exhausted",
    "resource_exhausted",
    "you exceeded your current quota",
    "quota exceeded",
    "billing account not configured",
    "the request was blocked due to quota limits",
];

/// FAILED_PRECONDITION messages about region or billing availability.
const GEO_BILLING_PATTERNS: &[&str] = &[
    "user location is not supported",
    "location is not supported",
    "not available in your country",
    "region",
    "billing",
];

/// PERMISSION_DENIED messages about the key or its quota project.
const KEY_PROJECT_PATTERNS: &[&str] = &[
    "api key",
    "api_key",
    "quota project",
    "consumer",
    "project has been denied",
    "billing",
];

const CODE_RESOURCE_EXHAUSTED: &str = "RESOURCE_EXHAUSTED";
const CODE_FAILED_PRECONDITION: &str = "FAILED_PRECONDITION";
const CODE_PERMISSION_DENIED: &str = "PERMISSION_DENIED";

/// Outward view of a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: ErrorKind,
    /// HTTP status to send to the caller
    pub status: u16,
    /// Caller-facing message
    pub message: String,
}

impl Classification {
    fn of(kind: ErrorKind) -> Self {
        Self {
            kind,
            status: kind.default_status(),
            message: kind.default_message().to_string(),
        }
    }
}

fn matches_any(message: &str, patterns: &[&str]) -> bool {
    let lower = message.to_lowercase();
    patterns.iter().any(|p| lower.contains(p))
}

fn code_is(failure: &UpstreamFailure, code: &str) -> bool {
    failure
        .code
        .as_deref()
        .is_some_and(|c| c.eq_ignore_ascii_case(code))
}

/// Classify an upstream failure.
pub fn classify(failure: &UpstreamFailure) -> Classification {
    if failure.internal {
        return Classification::of(ErrorKind::ServerError);
    }

    if failure.is_overload() {
        return Classification::of(ErrorKind::ModelOverloaded);
    }

    let Some(status) = failure.status else {
        return Classification::of(ErrorKind::NetworkError);
    };

    match status {
        429 => {
            let exhausted = code_is(failure, CODE_RESOURCE_EXHAUSTED)
                || matches_any(&failure.message, QUOTA_PATTERNS);
            if !exhausted {
                Classification::of(ErrorKind::RateLimitTemporary)
            } else if failure.structured {
                Classification::of(ErrorKind::QuotaExceeded)
            } else {
                Classification::of(ErrorKind::GenericQuotaExceeded)
            }
        }
        400 => {
            if code_is(failure, CODE_FAILED_PRECONDITION)
                && matches_any(&failure.message, GEO_BILLING_PATTERNS)
            {
                Classification::of(ErrorKind::BillingRequiredOrGeoRestricted)
            } else {
                let mut c = Classification::of(ErrorKind::InvalidRequestArgument);
                if !failure.message.is_empty() {
                    c.message = failure.message.clone();
                }
                c
            }
        }
        403 => {
            if code_is(failure, CODE_PERMISSION_DENIED)
                && matches_any(&failure.message, KEY_PROJECT_PATTERNS)
            {
                Classification::of(ErrorKind::PermissionDeniedQuotaRelated)
            } else {
                Classification::of(ErrorKind::PermissionDeniedGeneric)
            }
        }
        _ => {
            let mut c = Classification::of(ErrorKind::UpstreamApiError);
            // Mirror real error statuses; anything else (a stray 1xx/3xx)
            // falls back to 502.
            if (400..=599).contains(&status) {
                c.status = status;
            }
            c
        }
    }
}
