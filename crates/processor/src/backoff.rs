//! Retry delay policy.

use std::time::Duration;

/// Delay before the `retry`-th retry (1-indexed): `min * 2^(retry-1)`.
///
/// Saturates at `Duration::MAX` instead of overflowing.
pub fn exponential_backoff(min: Duration, retry: u32) -> Duration {
    let shift = retry.saturating_sub(1).min(31);
    min.checked_mul(1u32 << shift).unwrap_or(Duration::MAX)
}
