//! Window counters and the admission decision
//!
//! `QuotaState` is plain data plus pure transitions over an explicit `now`.
//! The tracker owns the locking and the clock; everything here can be driven
//! directly from tests.

use chrono::{DateTime, NaiveTime, Utc};
use common::ErrorKind;
use serde::Serialize;

use crate::error::{Error, Result};

/// Length of the short window in seconds.
const MINUTE_WINDOW_SECS: i64 = 60;

/// Static ceilings for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaLimits {
    pub requests_per_minute: u64,
    pub tokens_per_minute: u64,
    pub requests_per_day: u64,
    pub tokens_per_day: u64,
}

impl QuotaLimits {
    /// Build limits, rejecting zero ceilings (a zero ceiling would block
    /// every request forever).
    pub fn new(
        requests_per_minute: u64,
        tokens_per_minute: u64,
        requests_per_day: u64,
        tokens_per_day: u64,
    ) -> Result<Self> {
        if requests_per_minute == 0 {
            return Err(Error::InvalidLimit("requests_per_minute"));
        }
        if tokens_per_minute == 0 {
            return Err(Error::InvalidLimit("tokens_per_minute"));
        }
        if requests_per_day == 0 {
            return Err(Error::InvalidLimit("requests_per_day"));
        }
        if tokens_per_day == 0 {
            return Err(Error::InvalidLimit("tokens_per_day"));
        }
        Ok(Self {
            requests_per_minute,
            tokens_per_minute,
            requests_per_day,
            tokens_per_day,
        })
    }
}

/// Why a request was refused before reaching upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    DailyRequests,
    MinuteRequests,
}

impl BlockReason {
    pub fn label(&self) -> &'static str {
        match self {
            BlockReason::DailyRequests => "daily_requests",
            BlockReason::MinuteRequests => "minute_requests",
        }
    }

    pub fn error_kind(&self) -> ErrorKind {
        match self {
            BlockReason::DailyRequests => ErrorKind::DailyRequestsExceeded,
            BlockReason::MinuteRequests => ErrorKind::MinuteRequestsExceeded,
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Blocked {
        reason: BlockReason,
        used: u64,
        limit: u64,
    },
}

/// Token ceiling overrun noticed after a successful call. Informational:
/// the request that caused it has already succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageWarning {
    DailyTokens { used: u64, limit: u64 },
    MinuteTokens { used: u64, limit: u64 },
}

impl UsageWarning {
    /// Wire name for the `warningType` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageWarning::DailyTokens { .. } => "daily_tokens_exceeded",
            UsageWarning::MinuteTokens { .. } => "minute_tokens_exceeded",
        }
    }

    pub fn message(&self) -> String {
        match self {
            UsageWarning::DailyTokens { used, limit } => format!(
                "Daily token budget exceeded ({used}/{limit}). Further requests may be rejected upstream."
            ),
            UsageWarning::MinuteTokens { used, limit } => format!(
                "Per-minute token budget exceeded ({used}/{limit}). Slow down to avoid upstream rate limiting."
            ),
        }
    }
}

/// Which windows a refresh reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rollover {
    pub minute: bool,
    pub day: bool,
}

/// Process-wide usage counters.
///
/// Invariant: callers run `refresh_windows` before comparing counts against
/// limits, so the counts always describe the current windows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaState {
    pub minute_requests: u64,
    pub minute_tokens: u64,
    pub daily_requests: u64,
    pub daily_tokens: u64,
    pub minute_window_start: DateTime<Utc>,
    pub day_window_start: DateTime<Utc>,
}

/// Midnight UTC of the day containing `now`.
pub fn start_of_utc_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

impl QuotaState {
    /// Zeroed counters. The minute window starts at `now`, the day window at
    /// midnight of `now`'s UTC date.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            minute_requests: 0,
            minute_tokens: 0,
            daily_requests: 0,
            daily_tokens: 0,
            minute_window_start: now,
            day_window_start: start_of_utc_day(now),
        }
    }

    /// Reset any window that `now` has moved past.
    ///
    /// The minute window resets once 60s have elapsed since it started and
    /// re-anchors at `now`. The day window resets when `now` falls on a later
    /// UTC calendar date and re-anchors at that date's midnight. Calling this
    /// twice with the same `now` resets at most once.
    pub fn refresh_windows(&mut self, now: DateTime<Utc>) -> Rollover {
        let mut rollover = Rollover::default();

        if (now - self.minute_window_start).num_seconds() >= MINUTE_WINDOW_SECS {
            self.minute_requests = 0;
            self.minute_tokens = 0;
            self.minute_window_start = now;
            rollover.minute = true;
        }

        if now.date_naive() > self.day_window_start.date_naive() {
            self.daily_requests = 0;
            self.daily_tokens = 0;
            self.day_window_start = start_of_utc_day(now);
            rollover.day = true;
        }

        rollover
    }

    /// Decide whether another request fits. Daily exhaustion wins over
    /// minute exhaustion. Token ceilings never block here.
    pub fn admit(&self, limits: &QuotaLimits) -> Admission {
        if self.daily_requests >= limits.requests_per_day {
            return Admission::Blocked {
                reason: BlockReason::DailyRequests,
                used: self.daily_requests,
                limit: limits.requests_per_day,
            };
        }
        if self.minute_requests >= limits.requests_per_minute {
            return Admission::Blocked {
                reason: BlockReason::MinuteRequests,
                used: self.minute_requests,
                limit: limits.requests_per_minute,
            };
        }
        Admission::Admitted
    }

    /// Count one successful upstream call and the tokens it reported.
    pub fn record_usage(&mut self, prompt_tokens: u64, completion_tokens: u64) {
        let tokens = prompt_tokens.saturating_add(completion_tokens);
        self.minute_requests = self.minute_requests.saturating_add(1);
        self.daily_requests = self.daily_requests.saturating_add(1);
        self.minute_tokens = self.minute_tokens.saturating_add(tokens);
        self.daily_tokens = self.daily_tokens.saturating_add(tokens);
    }

    /// Token ceiling overrun, daily first.
    pub fn token_warning(&self, limits: &QuotaLimits) -> Option<UsageWarning> {
        if self.daily_tokens > limits.tokens_per_day {
            return Some(UsageWarning::DailyTokens {
                used: self.daily_tokens,
                limit: limits.tokens_per_day,
            });
        }
        if self.minute_tokens > limits.tokens_per_minute {
            return Some(UsageWarning::MinuteTokens {
                used: self.minute_tokens,
                limit: limits.tokens_per_minute,
            });
        }
        None
    }
}
