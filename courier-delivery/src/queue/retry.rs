//! Exponential backoff

use std::time::Duration;

use rand::Rng;

/// Delay before attempt `attempt` (1-indexed)
///
/// # Formula
/// `delay = min(base * 2^(attempt - 1), max)`
///
/// Doubling is done on whole milliseconds and saturates, so large attempt
/// counts simply settle on `max`.
#[must_use]
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);

    let delay = if exponent >= 63 {
        max_ms
    } else {
        base_ms.saturating_mul(1u64 << exponent).min(max_ms)
    };

    Duration::from_millis(delay)
}

/// Spread `delay` by up to `± jitter_factor` of itself
#[must_use]
pub fn with_jitter(delay: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || delay.is_zero() {
        return delay;
    }

    let delay = delay.as_secs_f64();
    let range = delay * jitter_factor.min(1.0);
    let jitter: f64 = rand::rng().random_range(-range..=range);
    Duration::from_secs_f64((delay + jitter).max(0.0))
}
