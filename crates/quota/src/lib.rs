//! In-memory quota tracking for the relay
//!
//! Counts requests and tokens over two windows (one minute, one UTC calendar
//! day) and decides whether a new request may be sent upstream. State is
//! volatile: a restart clears all history, and every process instance tracks
//! its own budget.
//!
//! Lifecycle of a request against the tracker:
//! 1. `check_admission` refreshes both windows, then blocks if the daily or
//!    minute request ceiling is reached (daily first)
//! 2. The caller performs the upstream call
//! 3. On success, `record_usage` adds one request and the reported tokens and
//!    returns a warning when a token ceiling has been overrun
//! 4. Failures are never recorded

pub mod clock;
pub mod error;
pub mod tracker;
pub mod window;

pub use clock::{Clock, SystemClock};
#[cfg(any(test, feature = "test-util"))]
pub use clock::ManualClock;
pub use error::{Error, Result};
pub use tracker::{QuotaSnapshot, QuotaTracker};
pub use window::{Admission, BlockReason, QuotaLimits, QuotaState, Rollover, UsageWarning};
