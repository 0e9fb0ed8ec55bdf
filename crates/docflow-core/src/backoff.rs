//! Retry delay schedules shared by the upload queue, the dispatcher and the
//! synchronizer.

use std::time::Duration;

/// `min(base * 2^attempt, cap)`, with `attempt` counted from zero.
pub fn exponential(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

/// `attempt * base`, with `attempt` counted from one.
pub fn linear(base: Duration, attempt: u32) -> Duration {
    base.checked_mul(attempt).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_until_cap() {
        let base = Duration::from_secs(2);
        let cap = Duration::from_secs(30);
        let delays: Vec<u64> = (0..6).map(|n| exponential(base, cap, n).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn exponential_saturates_on_huge_attempts() {
        let cap = Duration::from_secs(30);
        assert_eq!(exponential(Duration::from_secs(1), cap, 200), cap);
    }

    #[test]
    fn linear_grows_per_attempt() {
        let base = Duration::from_millis(500);
        assert_eq!(linear(base, 1), Duration::from_millis(500));
        assert_eq!(linear(base, 3), Duration::from_millis(1500));
    }
}
