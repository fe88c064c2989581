//! Retry predicates and backoff functions.
//!
//! Retries assume the call is idempotent. Streams are never retried.

use std::sync::Arc;
use std::time::Duration;

use orbkit_errors::OrbError;
use rand::Rng as _;

/// Decides whether a failed attempt should be retried.
pub type RetryFn = Arc<dyn Fn(&OrbError) -> bool + Send + Sync>;

/// Delay before retry number `attempt` (1-based).
pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Retries when the peer could not be reached or answered 503/504.
#[must_use]
pub fn on_connection_error() -> RetryFn {
    Arc::new(|err| matches!(err.code(), 503 | 504))
}

/// Retries timeouts (408, 504) and connection errors.
#[must_use]
pub fn on_timeout_error() -> RetryFn {
    Arc::new(|err| matches!(err.code(), 408 | 503 | 504))
}

/// Retries every error except client cancellation.
#[must_use]
pub fn on_any_error() -> RetryFn {
    Arc::new(|err| !err.is_canceled())
}

/// Never retries.
#[must_use]
pub fn never() -> RetryFn {
    Arc::new(|_| false)
}

/// Looks a predicate up by its configured name.
#[must_use]
pub fn retry_by_name(name: &str) -> Option<RetryFn> {
    match name {
        "on_connection_error" => Some(on_connection_error()),
        "on_timeout_error" | "" => Some(on_timeout_error()),
        "on_any_error" => Some(on_any_error()),
        "never" => Some(never()),
        _ => None,
    }
}

/// `base * 2^(attempt-1)` capped at `max`, with full jitter.
#[must_use]
pub fn exponential(base: Duration, max: Duration) -> BackoffFn {
    Arc::new(move |attempt| {
        let ceiling = exponential_ceiling(base, max, attempt);
        if ceiling.is_zero() {
            return ceiling;
        }
        let nanos = u64::try_from(ceiling.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(rand::rng().random_range(0..=nanos))
    })
}

/// The same delay for every attempt.
#[must_use]
pub fn constant(delay: Duration) -> BackoffFn {
    Arc::new(move |_| delay)
}

fn exponential_ceiling(base: Duration, max: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << shift).map_or(max, |d| d.min(max))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        let timeout = on_timeout_error();
        assert!(timeout(&OrbError::TIMEOUT));
        assert!(timeout(&OrbError::REQUEST_TIMEOUT));
        assert!(timeout(&OrbError::UNAVAILABLE));
        assert!(!timeout(&OrbError::UNAUTHORIZED));

        let conn = on_connection_error();
        assert!(conn(&OrbError::UNAVAILABLE));
        assert!(!conn(&OrbError::REQUEST_TIMEOUT));

        let any = on_any_error();
        assert!(any(&OrbError::BAD_REQUEST));
        assert!(!any(&OrbError::CANCELED));
    }

    #[test]
    fn test_exponential_ceiling_is_capped() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(5);
        assert_eq!(exponential_ceiling(base, max, 1), base);
        assert_eq!(exponential_ceiling(base, max, 3), Duration::from_millis(400));
        assert_eq!(exponential_ceiling(base, max, 20), max);
        assert_eq!(exponential_ceiling(base, max, u32::MAX), max);
    }

    #[test]
    fn test_exponential_jitter_stays_below_ceiling() {
        let backoff = exponential(Duration::from_millis(10), Duration::from_millis(50));
        for attempt in 1..10 {
            assert!(backoff(attempt) <= Duration::from_millis(50));
        }
    }

    #[test]
    fn test_by_name() {
        assert!(retry_by_name("on_any_error").is_some());
        assert!(retry_by_name("whatever").is_none());
    }
}
