//! Exponential backoff with an upper cap and optional full jitter.

use rand::Rng;
use std::time::Duration;

/// `delay(n) = min(cap, base * 2^n)`. `n` is the zero-based retry number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Backoff {
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Update source reconnects: base 1s, cap 60s.
    pub const fn reconnect() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }

    /// Outbound delivery retries: base 500ms, cap 30s.
    pub const fn delivery() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }

    pub fn delay(&self, retry: u32) -> Duration {
        // 2^31 * base overflows long before; saturate the shift.
        let factor = 1u32.checked_shl(retry.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |d| d.min(self.cap))
    }

    /// Full jitter: uniform in `[0, delay(retry)]`.
    pub fn jittered(&self, retry: u32) -> Duration {
        let max = self.delay(retry);
        if max.is_zero() {
            return max;
        }
        let millis = rand::thread_rng().gen_range(0..=max.as_millis() as u64);
        Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_cap() {
        let b = Backoff::delivery();
        assert_eq!(b.delay(0), Duration::from_millis(500));
        assert_eq!(b.delay(1), Duration::from_millis(1000));
        assert_eq!(b.delay(3), Duration::from_millis(4000));
        assert_eq!(b.delay(6), Duration::from_secs(30));
        assert_eq!(b.delay(100), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_within_bounds() {
        let b = Backoff::reconnect();
        for retry in 0..10 {
            let d = b.jittered(retry);
            assert!(d <= b.delay(retry));
            assert!(d <= Duration::from_secs(60));
        }
    }
}
