//! Bounded retry with exponential backoff.
//!
//! Every network-bound step (login, listing page load, document fetch,
//! storage upload) runs its own loop over a [`RetryPolicy`]: classify the
//! failure, ask [`RetryPolicy::should_retry`], sleep, try again. Nothing here
//! raises; callers demote an exhausted budget into their own typed outcome.
//!
//! ```
//! use caseharvest_core::retry::{FailureType, RetryDecision, RetryPolicy};
//!
//! let policy = RetryPolicy::default();
//! match policy.should_retry(FailureType::Transient, 1) {
//!     RetryDecision::Retry { delay, attempt } => println!("attempt {attempt} in {delay:?}"),
//!     RetryDecision::DoNotRetry { reason } => println!("giving up: {reason}"),
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument, warn};

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);

/// Default cap on a single backoff delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default upper bound on random jitter added to each delay.
pub const DEFAULT_MAX_JITTER: Duration = Duration::from_millis(500);

const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Retry-After values above this are clamped.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// How a failed network step should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Timeouts, connection resets, 5xx: worth another try.
    Transient,
    /// Retrying cannot help (malformed URL, 4xx other than 408/429).
    Permanent,
    /// HTTP 429; retried, preferring the server's Retry-After.
    RateLimited,
}

/// Outcome of asking the policy about a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for `delay`, then run attempt number `attempt`.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// 1-indexed number of the upcoming attempt.
        attempt: u32,
    },
    /// Stop retrying.
    DoNotRetry {
        /// Human-readable reason.
        reason: String,
    },
}

/// Exponential backoff configuration.
///
/// `delay(n) = min(base * 2^(n-1), max) + jitter` for the retry following
/// failed attempt `n`. With the defaults: ~2s, 4s, 8s, then give up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_retries(
            DEFAULT_MAX_RETRIES,
            DEFAULT_BASE_DELAY,
            DEFAULT_MAX_DELAY,
            DEFAULT_MAX_JITTER,
        )
    }
}

impl RetryPolicy {
    /// Builds a policy allowing `max_retries` retries after the first attempt.
    #[must_use]
    pub fn from_retries(
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
        max_jitter: Duration,
    ) -> Self {
        Self {
            max_attempts: max_retries.saturating_add(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            max_jitter,
        }
    }

    /// A policy with no sleeping at all; handy for tests and dry runs.
    #[must_use]
    pub fn immediate(max_retries: u32) -> Self {
        Self::from_retries(max_retries, Duration::ZERO, Duration::ZERO, Duration::ZERO)
    }

    /// Total attempts allowed, including the first.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides whether attempt number `attempt` (1-indexed) that just failed
    /// with `failure_type` should be retried.
    #[instrument(level = "trace", skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure - retry would not help".to_string(),
            };
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "retry budget exhausted");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        RetryDecision::Retry {
            delay: self.delay_for(attempt),
            attempt: attempt + 1,
        }
    }

    /// Backoff delay after failed attempt `attempt`, jitter included.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let base_ms = self.base_delay.as_millis() as f64;
        #[allow(clippy::cast_precision_loss)]
        let max_ms = self.max_delay.as_millis() as f64;
        let delay_ms = (base_ms * BACKOFF_MULTIPLIER.powi(exponent)).min(max_ms);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let capped = Duration::from_millis(delay_ms as u64);
        capped + self.jitter()
    }

    fn jitter(&self) -> Duration {
        let max_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

/// Classifies an HTTP status from the platform.
///
/// 401/403/404/410 are handled by callers before reaching here (they are
/// session or not-found signals), so they land in the generic 4xx arm.
#[must_use]
pub fn classify_http_status(status: u16) -> FailureType {
    match status {
        408 => FailureType::Transient,
        429 => FailureType::RateLimited,
        500..=599 => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

/// Parses a `Retry-After` header (delta-seconds or HTTP-date).
///
/// Values in the past or negative are ignored; values above one hour are
/// clamped to one hour.
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        let seconds = u64::try_from(seconds).ok()?;
        return Some(clamp_retry_after(Duration::from_secs(seconds)));
    }

    let when = httpdate::parse_http_date(header_value).ok()?;
    let delay = when.duration_since(std::time::SystemTime::now()).ok()?;
    Some(clamp_retry_after(delay))
}

fn clamp_retry_after(delay: Duration) -> Duration {
    if delay > MAX_RETRY_AFTER {
        warn!(
            delay_secs = delay.as_secs(),
            "Retry-After exceeds one hour, clamping"
        );
        MAX_RETRY_AFTER
    } else {
        delay
    }
}
