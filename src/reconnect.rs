//! Reconnect decision policy.
//!
//! A pure function of attempt state and configuration: no timers, no I/O.
//! Delay for attempt `n` (zero-based) is `min(base_delay * 2^n, max_delay)`.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use session_link::reconnect::{ReconnectAttemptState, ReconnectDecision, ReconnectPolicy};
//!
//! let policy = ReconnectPolicy::new(Duration::from_secs(1), Duration::from_secs(10))
//!     .with_max_attempts(Some(2));
//! let mut state = ReconnectAttemptState::default();
//!
//! assert_eq!(state.record_failure(&policy), ReconnectDecision::Retry(Duration::from_secs(1)));
//! assert_eq!(state.record_failure(&policy), ReconnectDecision::Retry(Duration::from_secs(2)));
//! assert_eq!(state.record_failure(&policy), ReconnectDecision::GiveUp);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default upper bound on the retry delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default number of retries before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Exponent ceiling; `2^31` seconds already exceeds any sane `max_delay`.
const MAX_EXPONENT: u32 = 31;

// ============================================================================
// ReconnectPolicy
// ============================================================================

/// Bounded exponential backoff configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    #[serde(rename = "base_delay_ms", with = "crate::client::options::millis")]
    pub base_delay: Duration,

    /// Upper bound on any retry delay.
    #[serde(rename = "max_delay_ms", with = "crate::client::options::millis")]
    pub max_delay: Duration,

    /// Retries allowed before [`ReconnectDecision::GiveUp`]; `None` is unlimited.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
        }
    }
}

impl ReconnectPolicy {
    /// Creates a policy with the given delays and the default attempt limit.
    #[inline]
    #[must_use]
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            ..Self::default()
        }
    }

    /// Sets the attempt limit.
    #[inline]
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay to wait after `attempt_count` previous failures.
    #[must_use]
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        let factor = 1u32 << attempt_count.min(MAX_EXPONENT);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Decides what to do given the current attempt state.
    #[must_use]
    pub fn decide(&self, state: &ReconnectAttemptState) -> ReconnectDecision {
        if state.exhausted {
            return ReconnectDecision::GiveUp;
        }
        match self.max_attempts {
            Some(max) if state.attempt_count >= max => ReconnectDecision::GiveUp,
            _ => ReconnectDecision::Retry(self.delay_for(state.attempt_count)),
        }
    }
}

// ============================================================================
// ReconnectDecision
// ============================================================================

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Try again after the delay.
    Retry(Duration),
    /// Stop until a manual reconnect.
    GiveUp,
}

// ============================================================================
// ReconnectAttemptState
// ============================================================================

/// Failure counter feeding the policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconnectAttemptState {
    /// Failed or dropped attempts since the last successful open.
    pub attempt_count: u32,
    /// Delay chosen by the last evaluation.
    pub next_delay: Duration,
    exhausted: bool,
}

impl ReconnectAttemptState {
    /// Evaluates the policy for this failure and counts it.
    ///
    /// Once this returns [`ReconnectDecision::GiveUp`] it keeps doing so
    /// until [`reset`](Self::reset).
    pub fn record_failure(&mut self, policy: &ReconnectPolicy) -> ReconnectDecision {
        let decision = policy.decide(self);
        match decision {
            ReconnectDecision::Retry(delay) => {
                self.next_delay = delay;
                self.attempt_count = self.attempt_count.saturating_add(1);
            }
            ReconnectDecision::GiveUp => {
                self.exhausted = true;
                self.next_delay = Duration::ZERO;
            }
        }
        decision
    }

    /// Clears the counter after a successful open or a manual reconnect.
    #[inline]
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Returns `true` once the policy has given up.
    #[inline]
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

// ============================================================================
// Tests
// ============================================================================
