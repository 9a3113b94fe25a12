//! Exponential backoff with jitter

use rand::Rng;
use std::time::Duration;

use crate::config::FetchConfig;

/// Retry delay policy
///
/// Delay for attempt `n` (1-based) is `min(max, base * 2^(n-1))`, then
/// jittered into `[50%, 100%]` of that value so concurrent retries spread out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            max: max.max(base),
        }
    }

    pub fn from_config(config: &FetchConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }

    /// Un-jittered delay after failed attempt `attempt` (1-based)
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Jittered delay after failed attempt `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        let ceiling_ms = ceiling.as_millis() as u64;
        if ceiling_ms < 2 {
            return ceiling;
        }
        let jittered = rand::thread_rng().gen_range(ceiling_ms / 2..=ceiling_ms);
        Duration::from_millis(jittered)
    }

    /// Whether another attempt is allowed after `attempt` failures
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(5, Duration::from_millis(100), Duration::from_millis(1000))
    }

    #[test]
    fn test_ceiling_doubles_then_caps() {
        let p = policy();
        assert_eq!(p.ceiling(1), Duration::from_millis(100));
        assert_eq!(p.ceiling(2), Duration::from_millis(200));
        assert_eq!(p.ceiling(3), Duration::from_millis(400));
        assert_eq!(p.ceiling(4), Duration::from_millis(800));
        assert_eq!(p.ceiling(5), Duration::from_millis(1000));
        assert_eq!(p.ceiling(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_delay_within_jitter_band() {
        let p = policy();
        for attempt in 1..=6 {
            let ceiling = p.ceiling(attempt);
            for _ in 0..50 {
                let delay = p.delay(attempt);
                assert!(delay <= ceiling);
                assert!(delay >= ceiling / 2);
            }
        }
    }

    #[test]
    fn test_retry_budget() {
        let p = policy();
        assert!(p.should_retry(1));
        assert!(p.should_retry(4));
        assert!(!p.should_retry(5));

        let single = BackoffPolicy::new(0, Duration::ZERO, Duration::ZERO);
        assert_eq!(single.max_attempts, 1);
        assert!(!single.should_retry(1));
        assert_eq!(single.delay(1), Duration::ZERO);
    }
}
