//! Retry backoff curve for failed schedule applications.
//!
//! `delay = 2^(attempt + 1)` minutes plus a uniform jitter in `[0, 30s)`, where
//! `attempt` is the schedule's `retry_count` *before* it is incremented. The
//! first failure therefore waits ~2 minutes, the third ~8 minutes.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;

/// Upper bound (exclusive) of the jitter added on top of the base delay, in milliseconds.
pub const MAX_JITTER_MS: i64 = 30_000;

/// Exponent ceiling; 2^20 minutes is roughly two years.
const MAX_EXPONENT: u32 = 20;

/// Deterministic part of the delay for a given attempt.
pub fn base_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_add(1).min(MAX_EXPONENT);
    Duration::minutes(1_i64 << exponent)
}

/// Base delay plus jitter drawn from the thread-local RNG.
pub fn backoff(attempt: u32) -> Duration {
    backoff_with_rng(attempt, &mut rand::thread_rng())
}

/// Base delay plus jitter drawn from `rng`.
pub fn backoff_with_rng<R: Rng + ?Sized>(attempt: u32, rng: &mut R) -> Duration {
    let jitter_ms = rng.gen_range(0..MAX_JITTER_MS);
    base_delay(attempt) + Duration::milliseconds(jitter_ms)
}

/// When the next attempt becomes eligible, counted from `now`.
pub fn next_retry_at(now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
    now + backoff(attempt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn first_failure_waits_two_minutes() {
        assert_eq!(base_delay(0), Duration::minutes(2));
    }

    #[test]
    fn third_failure_waits_eight_minutes() {
        assert_eq!(base_delay(2), Duration::minutes(8));
    }

    #[test]
    fn exponent_saturates() {
        assert_eq!(base_delay(40), base_delay(MAX_EXPONENT));
        assert_eq!(base_delay(u32::MAX), base_delay(MAX_EXPONENT));
    }

    #[test]
    fn seeded_rng_is_reproducible() {
        let a = backoff_with_rng(1, &mut StdRng::seed_from_u64(7));
        let b = backoff_with_rng(1, &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
    }

    proptest! {
        #[test]
        fn delay_stays_inside_jitter_window(attempt in 0u32..12) {
            let base = base_delay(attempt);
            let delay = backoff(attempt);

            prop_assert!(delay >= base);
            prop_assert!(delay < base + Duration::milliseconds(MAX_JITTER_MS));
        }

        #[test]
        fn base_delay_doubles_per_attempt(attempt in 0u32..12) {
            prop_assert_eq!(base_delay(attempt + 1), base_delay(attempt) * 2);
        }

        #[test]
        fn next_retry_is_in_the_future(attempt in 0u32..12) {
            let now = Utc::now();
            let at = next_retry_at(now, attempt);
            prop_assert!(at >= now + base_delay(attempt));
            prop_assert!(at < now + base_delay(attempt) + Duration::milliseconds(MAX_JITTER_MS));
        }
    }
}
