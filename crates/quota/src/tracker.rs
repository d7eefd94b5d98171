//! Shared quota tracker
//!
//! One `QuotaTracker` per process, handed to the request layer behind an
//! `Arc`. Each operation takes the lock, refreshes the windows against the
//! injected clock, and releases the lock before returning, so the lock is
//! never held across the upstream call.
//!
//! Admission and recording are separate critical sections: two requests that
//! pass admission together in the last free slot of a window can both
//! succeed upstream and both be counted. The overrun is bounded by the
//! number of requests in flight.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::window::{Admission, QuotaLimits, QuotaState, UsageWarning};

/// Point-in-time copy of the counters for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaSnapshot {
    pub minute_requests: u64,
    pub minute_tokens: u64,
    pub daily_requests: u64,
    pub daily_tokens: u64,
    pub minute_window_start: DateTime<Utc>,
    pub day_window_start: DateTime<Utc>,
    pub limits: QuotaLimits,
}

pub struct QuotaTracker {
    limits: QuotaLimits,
    state: Mutex<QuotaState>,
    clock: Arc<dyn Clock>,
}

impl QuotaTracker {
    /// Tracker on the wall clock.
    pub fn new(limits: QuotaLimits) -> Self {
        Self::with_clock(limits, Arc::new(SystemClock))
    }

    pub fn with_clock(limits: QuotaLimits, clock: Arc<dyn Clock>) -> Self {
        let state = QuotaState::new(clock.now());
        Self {
            limits,
            state: Mutex::new(state),
            clock,
        }
    }

    /// Lock the state and bring both windows up to date.
    fn current(&self) -> MutexGuard<'_, QuotaState> {
        // A panic while holding the lock cannot leave counters half-written
        // (every mutation is a plain field store), so poisoning is ignored.
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let rollover = state.refresh_windows(self.clock.now());
        if rollover.minute || rollover.day {
            debug!(
                minute = rollover.minute,
                day = rollover.day,
                "quota window rolled over"
            );
        }
        state
    }

    /// Refresh windows without otherwise touching the counters. Run before
    /// interpreting an upstream failure against local state.
    pub fn refresh(&self) {
        drop(self.current());
    }

    /// Pre-flight check: may another request go upstream?
    pub fn check_admission(&self) -> Admission {
        let state = self.current();
        let admission = state.admit(&self.limits);
        if let Admission::Blocked {
            reason,
            used,
            limit,
        } = admission
        {
            warn!(
                reason = reason.label(),
                used,
                limit,
                minute_requests = state.minute_requests,
                daily_requests = state.daily_requests,
                "request blocked by local quota"
            );
        }
        admission
    }

    /// Record a successful upstream call and report any token ceiling it
    /// pushed us past.
    pub fn record_usage(&self, prompt_tokens: u64, completion_tokens: u64) -> Option<UsageWarning> {
        let mut state = self.current();
        state.record_usage(prompt_tokens, completion_tokens);
        let warning = state.token_warning(&self.limits);
        if let Some(w) = warning {
            warn!(
                warning = w.as_str(),
                minute_tokens = state.minute_tokens,
                daily_tokens = state.daily_tokens,
                "token ceiling exceeded"
            );
        }
        warning
    }

    /// Whether the local daily request ceiling is reached right now.
    pub fn daily_requests_exhausted(&self) -> bool {
        self.current().daily_requests >= self.limits.requests_per_day
    }

    /// Whether the local minute request ceiling is reached right now.
    pub fn minute_requests_exhausted(&self) -> bool {
        self.current().minute_requests >= self.limits.requests_per_minute
    }

    pub fn snapshot(&self) -> QuotaSnapshot {
        let state = self.current();
        QuotaSnapshot {
            minute_requests: state.minute_requests,
            minute_tokens: state.minute_tokens,
            daily_requests: state.daily_requests,
            daily_tokens: state.daily_tokens,
            minute_window_start: state.minute_window_start,
            day_window_start: state.day_window_start,
            limits: self.limits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::window::BlockReason;
    use chrono::{Duration, TimeZone};

    fn tracker(rpm: u64, rpd: u64) -> (QuotaTracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 10, 9, 0, 0).unwrap(),
        ));
        let limits = QuotaLimits::new(rpm, 1_000, rpd, 10_000).unwrap();
        (QuotaTracker::with_clock(limits, clock.clone()), clock)
    }

    #[test]
    fn rpm_plus_one_request_is_blocked() {
        let (tracker, _clock) = tracker(5, 100);
        for _ in 0..5 {
            assert_eq!(tracker.check_admission(), Admission::Admitted);
            tracker.record_usage(10, 10);
        }
        assert!(matches!(
            tracker.check_admission(),
            Admission::Blocked {
                reason: BlockReason::MinuteRequests,
                ..
            }
        ));
    }

    #[test]
    fn minute_block_clears_after_sixty_seconds() {
        let (tracker, clock) = tracker(2, 100);
        tracker.record_usage(1, 1);
        tracker.record_usage(1, 1);
        assert!(matches!(
            tracker.check_admission(),
            Admission::Blocked { .. }
        ));

        clock.advance(Duration::seconds(60));
        assert_eq!(tracker.check_admission(), Admission::Admitted);
        assert_eq!(tracker.snapshot().minute_requests, 0);
        assert_eq!(tracker.snapshot().daily_requests, 2);
    }

    #[test]
    fn daily_block_clears_at_utc_midnight() {
        let (tracker, clock) = tracker(100, 3);
        for _ in 0..3 {
            tracker.record_usage(1, 1);
        }
        clock.advance(Duration::hours(2));
        assert!(matches!(
            tracker.check_admission(),
            Admission::Blocked {
                reason: BlockReason::DailyRequests,
                ..
            }
        ));
        assert!(tracker.daily_requests_exhausted());

        clock.set(Utc.with_ymd_and_hms(2024, 6, 11, 0, 0, 1).unwrap());
        assert_eq!(tracker.check_admission(), Admission::Admitted);
        assert!(!tracker.daily_requests_exhausted());
    }

    #[test]
    fn failed_admission_does_not_count() {
        let (tracker, _clock) = tracker(1, 100);
        tracker.record_usage(1, 1);
        for _ in 0..3 {
            let _ = tracker.check_admission();
        }
        assert_eq!(tracker.snapshot().minute_requests, 1);
    }

    #[test]
    fn record_usage_returns_token_warning() {
        let (tracker, _clock) = tracker(100, 100);
        assert_eq!(tracker.record_usage(400, 400), None);
        let warning = tracker.record_usage(200, 100).unwrap();
        assert_eq!(warning.as_str(), "minute_tokens_exceeded");
    }

    #[test]
    fn minute_exhaustion_reflects_refresh() {
        let (tracker, clock) = tracker(1, 100);
        tracker.record_usage(1, 1);
        assert!(tracker.minute_requests_exhausted());
        clock.advance(Duration::seconds(61));
        assert!(!tracker.minute_requests_exhausted());
    }

    #[test]
    fn snapshot_serializes_limits() {
        let (tracker, _clock) = tracker(7, 70);
        let json = serde_json::to_value(tracker.snapshot()).unwrap();
        assert_eq!(json["limits"]["requests_per_minute"], 7);
        assert_eq!(json["limits"]["requests_per_day"], 70);
        assert_eq!(json["minute_requests"], 0);
    }

    #[test]
    fn concurrent_records_are_not_lost() {
        let (tracker, _clock) = tracker(10_000, 10_000);
        let tracker = Arc::new(tracker);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        tracker.record_usage(1, 0);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snap = tracker.snapshot();
        assert_eq!(snap.daily_requests, 800);
        assert_eq!(snap.daily_tokens, 800);
    }
}
