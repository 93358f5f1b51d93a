//! Retry delay schedule.

use std::time::Duration;

/// Delay before retrying after the `retry_count`-th failure:
/// `base * 2^retry_count`, never more than `cap`.
///
/// With the default one-second base and 30 second cap this gives
/// 2 s, 4 s, 8 s, 16 s, 30 s, 30 s, ...
#[must_use]
pub fn backoff_delay(retry_count: u32, base: Duration, cap: Duration) -> Duration {
    2u32.checked_pow(retry_count)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(cap, |delay| delay.min(cap))
}
