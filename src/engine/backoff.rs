//! Capped exponential backoff for the attempt loops.

use std::time::Duration;

/// First wait, in seconds.
pub const BACKOFF_BASE_SECS: f64 = 2.0;
/// Ceiling for retries of HTTP-status failures.
pub const HTTP_BACKOFF_CAP_SECS: f64 = 30.0;
/// Ceiling for retries of raw transport failures inside a backend client.
pub const TRANSPORT_BACKOFF_CAP_SECS: f64 = 20.0;

/// Wait before retry number `attempt` (1-based):
/// `min(base * 2^(attempt-1), cap)`.
pub fn backoff_delay(attempt: u32, base_secs: f64, cap_secs: f64) -> Duration {
    let attempt = attempt.max(1);
    let exp = (attempt - 1).min(16); // past this the cap always wins
    let secs = (base_secs * f64::from(1u32 << exp)).min(cap_secs);
    Duration::from_secs_f64(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_exponential_formula() {
        assert_eq!(
            backoff_delay(1, BACKOFF_BASE_SECS, HTTP_BACKOFF_CAP_SECS),
            Duration::from_secs(2)
        );
        assert_eq!(
            backoff_delay(2, BACKOFF_BASE_SECS, HTTP_BACKOFF_CAP_SECS),
            Duration::from_secs(4)
        );
        assert_eq!(
            backoff_delay(3, BACKOFF_BASE_SECS, HTTP_BACKOFF_CAP_SECS),
            Duration::from_secs(8)
        );
        assert_eq!(
            backoff_delay(4, BACKOFF_BASE_SECS, HTTP_BACKOFF_CAP_SECS),
            Duration::from_secs(16)
        );
    }

    #[test]
    fn is_monotonically_non_decreasing_and_capped() {
        let mut previous = Duration::ZERO;
        for attempt in 1..64 {
            let delay = backoff_delay(attempt, BACKOFF_BASE_SECS, HTTP_BACKOFF_CAP_SECS);
            assert!(delay >= previous, "backoff decreased at attempt {attempt}");
            assert!(
                delay <= Duration::from_secs_f64(HTTP_BACKOFF_CAP_SECS),
                "backoff exceeded cap at attempt {attempt}"
            );
            previous = delay;
        }
    }

    #[test]
    fn transport_cap_is_lower() {
        let delay = backoff_delay(10, BACKOFF_BASE_SECS, TRANSPORT_BACKOFF_CAP_SECS);
        assert_eq!(delay, Duration::from_secs(20));
    }

    #[test]
    fn attempt_zero_is_treated_as_first() {
        assert_eq!(
            backoff_delay(0, BACKOFF_BASE_SECS, HTTP_BACKOFF_CAP_SECS),
            backoff_delay(1, BACKOFF_BASE_SECS, HTTP_BACKOFF_CAP_SECS)
        );
    }
}
