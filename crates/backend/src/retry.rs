//! Backoff schedule for transient start failures.

use std::time::Duration;

use rand::Rng;

/// Base delay for the first retry.
const BASE_DELAY_MS: u64 = 1000;
/// Upper bound on any single delay, before jitter.
const MAX_DELAY_MS: u64 = 60_000;
/// Jitter factor: the delay is scaled uniformly into [0.8, 1.2].
const JITTER: f64 = 0.2;

/// Delay before retry number `attempt` (1-based).
///
/// `1000 * 2^(attempt-1)` ms with ±20 % jitter, capped at 60 s:
/// attempt 1 draws from [800, 1200] ms, attempt 2 from [1600, 2400] ms.
#[must_use]
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let base = BASE_DELAY_MS.saturating_mul(1u64 << exp).min(MAX_DELAY_MS);
    let factor = rand::thread_rng().gen_range(1.0 - JITTER..=1.0 + JITTER);
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Duration::from_millis((base as f64 * factor).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_retries_stay_within_jitter_bounds() {
        for _ in 0..200 {
            let first = backoff_delay(1).as_millis();
            assert!((800..=1200).contains(&first), "attempt 1 drew {first}ms");

            let second = backoff_delay(2).as_millis();
            assert!((1600..=2400).contains(&second), "attempt 2 drew {second}ms");
        }
    }

    #[test]
    fn delay_is_capped() {
        for _ in 0..50 {
            let long = backoff_delay(30).as_millis();
            assert!(long <= 72_000, "capped delay drew {long}ms");
            assert!(long >= 48_000, "capped delay drew {long}ms");
        }
    }
}
