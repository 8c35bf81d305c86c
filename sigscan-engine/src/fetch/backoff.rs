//! Exponential backoff with full jitter
//!
//! Delay ceiling doubles from `initial` per attempt, capped at `max`; the
//! actual delay is drawn uniformly from `[0, ceiling]` so synchronized
//! callers spread out.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            attempt: 0,
        }
    }

    /// Upper bound for the delay after `attempt` failures (0-based)
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Jittered delay for the next retry
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        if ceiling.is_zero() {
            return ceiling;
        }
        let nanos = rand::thread_rng().gen_range(0..=ceiling.as_nanos().min(u64::MAX as u128) as u64);
        Duration::from_nanos(nanos)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_doubles_then_caps() {
        let backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(1000));
        assert_eq!(backoff.ceiling(0), Duration::from_millis(10));
        assert_eq!(backoff.ceiling(1), Duration::from_millis(20));
        assert_eq!(backoff.ceiling(3), Duration::from_millis(80));
        assert_eq!(backoff.ceiling(7), Duration::from_millis(1000));
        assert_eq!(backoff.ceiling(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_jittered_delay_within_ceiling() {
        let mut backoff = Backoff::new(Duration::from_millis(5), Duration::from_millis(200));
        for attempt in 0..12 {
            let ceiling = backoff.ceiling(attempt);
            let delay = backoff.next_delay();
            assert!(delay <= ceiling, "attempt {}: {:?} > {:?}", attempt, delay, ceiling);
        }
        assert_eq!(backoff.attempts(), 12);
    }

    #[test]
    fn test_zero_initial_never_sleeps() {
        let mut backoff = Backoff::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(backoff.next_delay(), Duration::ZERO);
    }
}
