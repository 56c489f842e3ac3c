//! Poll scheduling: jittered intervals and capped exponential backoff

use rand::Rng;
use std::time::Duration;

/// Base delay for the first retry after a failure
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Uniformly random delay in `[min, max]`
pub fn jittered_interval(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let min_ms = min.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
}

/// Exponential backoff after `retries` consecutive failures, capped at `max`.
///
/// The delay doubles from [`BACKOFF_BASE`] and is jittered to between half
/// and all of its nominal value.
pub fn backoff(retries: u32, max: Duration) -> Duration {
    if retries == 0 {
        return Duration::ZERO;
    }
    let factor = 2u64.saturating_pow(retries - 1);
    let nominal_ms = (BACKOFF_BASE.as_millis() as u64)
        .saturating_mul(factor)
        .min(max.as_millis() as u64);
    let jittered = rand::thread_rng().gen_range(nominal_ms / 2..=nominal_ms);
    Duration::from_millis(jittered)
}
