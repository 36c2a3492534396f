use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use super::Reason;

/// Bounds the number of calls in flight.
///
/// Acquiring increments the shared counter first and only then compares it
/// against the threshold. A caller that overshoots decrements again, so no
/// compare-and-swap loop is needed and the counter self-corrects.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    name: String,
    threshold: AtomicUsize,
    current: AtomicUsize,
}

/// A point-in-time view of a [`ConcurrencyLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyMetrics {
    pub threshold: usize,
    pub current_calls: usize,
}

impl fmt::Display for ConcurrencyMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} permits in use",
            self.current_calls, self.threshold
        )
    }
}

impl ConcurrencyLimiter {
    pub fn new(name: impl Into<String>, threshold: usize) -> Self {
        Self {
            name: name.into(),
            threshold: AtomicUsize::new(threshold),
            current: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attempts to take one permit.
    ///
    /// # Errors
    ///
    /// Breaks with [`Reason::ConcurrencyOverflow`] when the threshold is reached.
    pub fn acquire_permission(&self) -> ControlFlow<Reason> {
        let current = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        if current > self.threshold.load(Ordering::Acquire) {
            self.current.fetch_sub(1, Ordering::AcqRel);
            ControlFlow::Break(Reason::ConcurrencyOverflow(self.metrics()))
        } else {
            ControlFlow::Continue(())
        }
    }

    /// Returns a permit taken by a successful [`acquire_permission`](Self::acquire_permission).
    pub fn release(&self) {
        let previous = self.current.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "released more permits than acquired");
    }

    /// Changes the threshold. Permits already handed out stay valid.
    pub fn change_threshold(&self, threshold: usize) {
        self.threshold.store(threshold, Ordering::Release);
    }

    pub fn threshold(&self) -> usize {
        self.threshold.load(Ordering::Acquire)
    }

    pub fn current_calls(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> ConcurrencyMetrics {
        ConcurrencyMetrics {
            threshold: self.threshold(),
            current_calls: self.current_calls(),
        }
    }
}
