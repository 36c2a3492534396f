use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use quanta::Clock;
use quanta::Instant;

use super::ConfigError;
use super::Reason;

const TAG_SHIFT: u32 = 32;
const REMAINING_MASK: u64 = 0xFFFF_FFFF;

/// A fixed-window limiter: `limit_for_period` permits every `period`.
///
/// The window index and the permits left in it share one atomic word, so a
/// refresh and a consumption can never interleave. A new limit is only read
/// when a window refreshes and so never applies retroactively.
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    limit_for_period: AtomicUsize,
    period_ns: u64,
    /// `(window tag << 32) | remaining`
    state: AtomicU64,
    waiting: AtomicUsize,
    clock: Clock,
    anchor: Instant,
}

/// A point-in-time view of a [`RateLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateMetrics {
    pub limit_for_period: usize,
    pub period: Duration,
    pub available_permits: usize,
    pub waiting_threads: usize,
    /// Time left until the next window opens.
    pub retry_after: Duration,
}

impl fmt::Display for RateMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} permits per {:?}, {} available, retry after {:?}",
            self.limit_for_period, self.period, self.available_permits, self.retry_after
        )
    }
}

fn pack(tag: u32, remaining: u32) -> u64 {
    ((tag as u64) << TAG_SHIFT) | remaining as u64
}

fn unpack(packed: u64) -> (u32, u32) {
    ((packed >> TAG_SHIFT) as u32, (packed & REMAINING_MASK) as u32)
}

impl RateLimiter {
    /// Creates a new `RateLimiter`.
    ///
    /// # Arguments
    ///
    /// * `limit_for_period` - The number of permits handed out per window.
    /// * `period` - The length of a window.
    pub fn new(
        name: impl Into<String>,
        limit_for_period: usize,
        period: Duration,
    ) -> Result<Self, ConfigError> {
        Self::with_clock(name, limit_for_period, period, Clock::new())
    }

    pub fn with_clock(
        name: impl Into<String>,
        limit_for_period: usize,
        period: Duration,
        clock: Clock,
    ) -> Result<Self, ConfigError> {
        let period_ns = period.as_nanos() as u64;
        if period_ns == 0 {
            return Err(ConfigError::Zero("limit refresh period"));
        }
        let anchor = clock.now();
        Ok(Self {
            name: name.into(),
            limit_for_period: AtomicUsize::new(limit_for_period),
            period_ns,
            state: AtomicU64::new(pack(0, clamp(limit_for_period))),
            waiting: AtomicUsize::new(0),
            clock,
            anchor,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> Duration {
        Duration::from_nanos(self.period_ns)
    }

    pub fn limit_for_period(&self) -> usize {
        self.limit_for_period.load(Ordering::Acquire)
    }

    /// Changes the number of permits per window, starting with the next window.
    pub fn change_limit_for_period(&self, limit_for_period: usize) {
        self.limit_for_period
            .store(limit_for_period, Ordering::Release);
    }

    /// Attempts to take one permit.
    ///
    /// When the current window is exhausted and `timeout` is long enough to
    /// reach the next window, the calling thread sleeps until that boundary
    /// and tries exactly once more.
    ///
    /// # Errors
    ///
    /// Breaks with [`Reason::RateOverflow`] if no permit could be taken.
    pub fn acquire_permission(&self, timeout: Duration) -> ControlFlow<Reason> {
        let wait = match self.try_consume() {
            Ok(()) => return ControlFlow::Continue(()),
            Err(wait) => wait,
        };

        if timeout.is_zero() || wait > timeout {
            return ControlFlow::Break(Reason::RateOverflow(self.metrics()));
        }

        self.waiting.fetch_add(1, Ordering::AcqRel);
        std::thread::sleep(wait);
        self.waiting.fetch_sub(1, Ordering::AcqRel);

        match self.try_consume() {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(Reason::RateOverflow(self.metrics())),
        }
    }

    /// Returns the time until the next window when no permit is left.
    fn try_consume(&self) -> Result<(), Duration> {
        let now = self.elapsed_ns();
        let window = now / self.period_ns;
        let tag = window as u32;
        let limit = clamp(self.limit_for_period());

        let consumed = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |packed| {
                let (tag, remaining) = self.current(packed, tag, limit);
                if remaining == 0 {
                    None
                } else {
                    Some(pack(tag, remaining - 1))
                }
            });

        match consumed {
            Ok(_) => Ok(()),
            Err(_) => Err(Duration::from_nanos(
                (window + 1) * self.period_ns - now,
            )),
        }
    }

    /// Resolves the permits of the window `tag` given the stored state.
    ///
    /// A thread that read the clock before another thread refreshed the
    /// window must not refresh it a second time.
    fn current(&self, packed: u64, tag: u32, limit: u32) -> (u32, u32) {
        let (stored_tag, remaining) = unpack(packed);
        if stored_tag == tag {
            (tag, remaining)
        } else if (tag.wrapping_sub(stored_tag) as i32) > 0 {
            (tag, limit)
        } else {
            (stored_tag, remaining)
        }
    }

    fn elapsed_ns(&self) -> u64 {
        self.clock.now().duration_since(self.anchor).as_nanos() as u64
    }

    pub fn metrics(&self) -> RateMetrics {
        let now = self.elapsed_ns();
        let window = now / self.period_ns;
        let limit = self.limit_for_period();
        let (_, available) = self.current(
            self.state.load(Ordering::Acquire),
            window as u32,
            clamp(limit),
        );
        RateMetrics {
            limit_for_period: limit,
            period: self.period(),
            available_permits: available as usize,
            waiting_threads: self.waiting.load(Ordering::Acquire),
            retry_after: Duration::from_nanos((window + 1) * self.period_ns - now),
        }
    }
}

fn clamp(limit: usize) -> u32 {
    limit.min(u32::MAX as usize) as u32
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use more_asserts::assert_lt;

    use super::*;

    fn mocked(limit: usize, period: Duration) -> (RateLimiter, Arc<quanta::Mock>) {
        let (clock, mock) = Clock::mock();
        let rl = RateLimiter::with_clock("test", limit, period, clock).unwrap();
        (rl, mock)
    }

    #[test]
    fn it_enforces_limits_per_window() {
        let (rl, mock) = mocked(3, Duration::from_millis(100));

        for _ in 0..3 {
            assert!(rl.acquire_permission(Duration::ZERO).is_continue());
        }
        assert!(rl.acquire_permission(Duration::ZERO).is_break());

        mock.increment(Duration::from_millis(100));

        for _ in 0..3 {
            assert!(rl.acquire_permission(Duration::ZERO).is_continue());
        }
        assert!(rl.acquire_permission(Duration::ZERO).is_break());
    }

    #[test]
    fn test_idle_windows_do_not_accumulate() {
        let (rl, mock) = mocked(2, Duration::from_millis(10));

        mock.increment(Duration::from_millis(55));

        assert!(rl.acquire_permission(Duration::ZERO).is_continue());
        assert!(rl.acquire_permission(Duration::ZERO).is_continue());
        assert!(rl.acquire_permission(Duration::ZERO).is_break());
    }

    #[test]
    fn limit_change_applies_at_next_window() {
        let (rl, mock) = mocked(1, Duration::from_millis(100));

        assert!(rl.acquire_permission(Duration::ZERO).is_continue());
        rl.change_limit_for_period(3);
        assert!(rl.acquire_permission(Duration::ZERO).is_break());

        mock.increment(Duration::from_millis(100));
        for _ in 0..3 {
            assert!(rl.acquire_permission(Duration::ZERO).is_continue());
        }
        assert!(rl.acquire_permission(Duration::ZERO).is_break());
    }

    #[test]
    fn overflow_reports_metrics() {
        let (rl, mock) = mocked(1, Duration::from_millis(100));
        mock.increment(Duration::from_millis(40));

        assert!(rl.acquire_permission(Duration::ZERO).is_continue());
        match rl.acquire_permission(Duration::ZERO) {
            ControlFlow::Break(Reason::RateOverflow(metrics)) => {
                assert_eq!(metrics.limit_for_period, 1);
                assert_eq!(metrics.available_permits, 0);
                assert_eq!(metrics.retry_after, Duration::from_millis(60));
            }
            other => panic!("expected rate overflow, got {other:?}"),
        }
    }

    #[test]
    fn short_timeout_fails_without_waiting() {
        let (rl, _mock) = mocked(1, Duration::from_secs(10));

        assert!(rl.acquire_permission(Duration::ZERO).is_continue());
        assert!(rl.acquire_permission(Duration::from_millis(1)).is_break());
        assert_eq!(rl.metrics().waiting_threads, 0);
    }

    #[test]
    fn blocking_acquire_waits_for_next_window() {
        let rl = RateLimiter::new("test", 1, Duration::from_millis(30)).unwrap();

        assert!(rl.acquire_permission(Duration::ZERO).is_continue());
        let start = std::time::Instant::now();
        assert!(
            rl.acquire_permission(Duration::from_millis(200))
                .is_continue()
        );
        assert_lt!(start.elapsed(), Duration::from_millis(200));
        assert_eq!(rl.metrics().waiting_threads, 0);
    }

    #[test]
    fn zero_period_is_rejected() {
        assert_eq!(
            RateLimiter::new("test", 1, Duration::ZERO).unwrap_err(),
            ConfigError::Zero("limit refresh period")
        );
    }

    #[test]
    fn test_actual_concurrency() {
        let capacity = 100;
        let (rl, _mock) = mocked(capacity, Duration::from_secs(1));
        let rl = Arc::new(rl);

        let handles: Vec<_> = (0..capacity + 10)
            .map(|_| {
                let rl = Arc::clone(&rl);
                std::thread::spawn(move || rl.acquire_permission(Duration::ZERO))
            })
            .collect();

        let success_count = handles
            .into_iter()
            .filter_map(|h| h.join().ok())
            .filter(|r| r.is_continue())
            .count();

        assert_eq!(success_count, capacity);
    }
}
