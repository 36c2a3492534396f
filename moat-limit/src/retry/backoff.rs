use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use super::BackoffConfig;

/// A backoff wait was cut short. Never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("backoff sleep interrupted")]
pub struct Interrupted;

/// Blocks the calling thread between attempts.
pub trait Sleeper: Send + Sync + Debug {
    fn sleep(&self, duration: Duration) -> Result<(), Interrupted>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        std::thread::sleep(duration);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    config: BackoffConfig,
    sleeper: Arc<dyn Sleeper>,
}

impl BackoffPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self::with_sleeper(config, Arc::new(ThreadSleeper))
    }

    pub fn with_sleeper(config: BackoffConfig, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { config, sleeper }
    }

    /// The wait before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let BackoffConfig {
            delay,
            max_delay,
            multiplier,
        } = self.config;
        if delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = delay.as_secs_f64() * multiplier.powi(exponent);
        if !max_delay.is_zero() && (scaled.is_nan() || scaled >= max_delay.as_secs_f64()) {
            return max_delay;
        }
        Duration::try_from_secs_f64(scaled).unwrap_or(Duration::MAX)
    }

    /// Waits out `delay` on the calling thread.
    pub fn sleep(&self, delay: Duration) -> Result<(), Interrupted> {
        if delay.is_zero() {
            return Ok(());
        }
        self.sleeper.sleep(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_delay_never_grows() {
        let policy = BackoffPolicy::new(BackoffConfig::fixed(Duration::from_millis(20)));
        assert_eq!(policy.delay_for(1), Duration::from_millis(20));
        assert_eq!(policy.delay_for(5), Duration::from_millis(20));
    }

    #[test]
    fn zero_delay_stays_zero_at_any_retry() {
        let policy = BackoffPolicy::new(BackoffConfig::exponential(
            Duration::ZERO,
            10.0,
            Duration::from_secs(30),
        ));
        assert_eq!(policy.delay_for(1_000), Duration::ZERO);
    }

    #[test]
    fn exponential_delay_is_capped() {
        let policy = BackoffPolicy::new(BackoffConfig::exponential(
            Duration::from_millis(10),
            2.0,
            Duration::from_millis(50),
        ));
        assert_eq!(policy.delay_for(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for(3), Duration::from_millis(40));
        assert_eq!(policy.delay_for(4), Duration::from_millis(50));
        assert_eq!(policy.delay_for(60), Duration::from_millis(50));
    }

    #[test]
    fn steep_growth_saturates_at_the_cap() {
        let policy = BackoffPolicy::new(BackoffConfig::exponential(
            Duration::from_secs(1),
            10.0,
            Duration::from_secs(30),
        ));
        assert_eq!(policy.delay_for(25), Duration::from_secs(30));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn uncapped_growth_saturates_at_duration_max() {
        let policy = BackoffPolicy::new(BackoffConfig::exponential(
            Duration::from_secs(1),
            10.0,
            Duration::ZERO,
        ));
        assert_eq!(policy.delay_for(3), Duration::from_secs(100));
        assert_eq!(policy.delay_for(25), Duration::MAX);
        assert_eq!(policy.delay_for(400), Duration::MAX);
    }
}
