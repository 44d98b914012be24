//! Retry backoff.
//!
//! Used by the job processor for transient storage failures and by sync
//! channels for transport failures.

use std::time::Duration;

/// Exponential backoff with random jitter.
///
/// Formula: `min(max, base * 2^(attempt-1)) + random(0..=jitter)`.
/// Jitter spreads retries of many callers that failed at the same moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: Duration,
}

impl Backoff {
    /// Create a backoff with the given base and cap and no jitter.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: Duration::ZERO,
        }
    }

    /// Add up to `jitter` of random delay to every step.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let scaled = self.base.saturating_mul(1u32 << exponent);
        let capped = scaled.min(self.max);

        if self.jitter.is_zero() {
            return capped;
        }
        let jitter_ms = random_below(self.jitter.as_millis() as u64 + 1);
        capped + Duration::from_millis(jitter_ms)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(5))
    }
}

/// Random value in `0..bound`. Falls back to 0 when the OS RNG is unavailable.
fn random_below(bound: u64) -> u64 {
    let mut bytes = [0u8; 8];
    if getrandom::getrandom(&mut bytes).is_err() || bound == 0 {
        return 0;
    }
    u64::from_le_bytes(bytes) % bound
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_until_cap() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(500));
        assert_eq!(backoff.delay(40), Duration::from_millis(500));
    }

    #[test]
    fn attempt_zero_uses_base() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
    }

    #[test]
    fn jitter_stays_in_range() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30))
            .with_jitter(Duration::from_millis(50));
        for attempt in 1..10 {
            let delay = backoff.delay(attempt);
            let floor = Backoff::new(Duration::from_secs(1), Duration::from_secs(30)).delay(attempt);
            assert!(delay >= floor);
            assert!(delay <= floor + Duration::from_millis(50));
        }
    }
}
