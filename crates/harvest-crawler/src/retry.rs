use std::time::Duration;

use crate::config::CrawlerConfig;
use crate::error::FetchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the delay.
    Backoff(Duration),
    /// Try again right away with a different identity.
    Rotate,
    GiveUp,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_retries,
            base,
            cap,
        }
    }

    pub fn from_config(config: &CrawlerConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_cap_ms),
        )
    }

    /// `base * 2^retries`, capped.
    pub fn delay(&self, retries: u32) -> Duration {
        let factor = 2u32.checked_pow(retries).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |d| d.min(self.cap))
    }

    /// `retries` is how many retries the failed attempt had already used.
    pub fn decide(&self, retries: u32, err: &FetchError) -> RetryDecision {
        if !err.is_retryable() || retries >= self.max_retries {
            return RetryDecision::GiveUp;
        }
        match err {
            FetchError::Blocked(_) => RetryDecision::Rotate,
            _ => RetryDecision::Backoff(self.delay(retries)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(100), Duration::from_millis(350))
    }

    #[test]
    fn delay_doubles_until_capped() {
        let p = policy();
        assert_eq!(p.delay(0), Duration::from_millis(100));
        assert_eq!(p.delay(1), Duration::from_millis(200));
        assert_eq!(p.delay(2), Duration::from_millis(350));
        assert_eq!(p.delay(40), Duration::from_millis(350));
    }

    #[test]
    fn transient_retries_stop_at_the_cap() {
        let p = policy();
        let err = FetchError::Transient("timeout".into());
        assert_eq!(p.decide(0, &err), RetryDecision::Backoff(Duration::from_millis(100)));
        assert_eq!(p.decide(2, &err), RetryDecision::Backoff(Duration::from_millis(350)));
        assert_eq!(p.decide(3, &err), RetryDecision::GiveUp);
    }

    #[test]
    fn blocked_rotates_without_delay_but_counts() {
        let p = policy();
        let err = FetchError::Blocked("403".into());
        assert_eq!(p.decide(1, &err), RetryDecision::Rotate);
        assert_eq!(p.decide(3, &err), RetryDecision::GiveUp);
    }

    #[test]
    fn permanent_is_never_retried() {
        let err = FetchError::Permanent("404".into());
        assert_eq!(policy().decide(0, &err), RetryDecision::GiveUp);
    }
}
