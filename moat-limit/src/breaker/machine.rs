use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use quanta::Clock;
use quanta::Instant;
use tracing::info;

use super::BreakerConfig;
use super::BreakerState;
use super::ForcedState;
use super::ring_bit_set::RingBitSet;
use crate::ConfigError;
use crate::Reason;

/// The circuit breaker state machine for one resource.
///
/// Reconfiguration replaces the whole instance; only forced-state changes
/// are applied in place.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    not_permitted: AtomicU64,
    clock: Clock,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    ring: RingBitSet,
    opened_at: Option<Instant>,
    /// Trial calls admitted since entering `HalfOpen`.
    trial_calls: usize,
}

/// A point-in-time view of a [`CircuitBreaker`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerMetrics {
    pub state: BreakerState,
    pub failure_rate_threshold: f32,
    /// `None` until the current ring buffer is full.
    pub failure_rate: Option<f32>,
    pub max_buffered_calls: usize,
    pub buffered_calls: usize,
    pub failed_calls: usize,
    pub successful_calls: usize,
    pub not_permitted_calls: u64,
}

impl fmt::Display for BreakerMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "state {}, {}/{} failed of {} buffered (threshold {}%), {} not permitted",
            self.state,
            self.failed_calls,
            self.buffered_calls,
            self.max_buffered_calls,
            self.failure_rate_threshold,
            self.not_permitted_calls
        )
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Result<Self, ConfigError> {
        Self::with_clock(name, config, Clock::new())
    }

    pub fn with_clock(
        name: impl Into<String>,
        config: BreakerConfig,
        clock: Clock,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let state = match config.forced_state {
            Some(ForcedState::Open) => BreakerState::ForcedOpen,
            Some(ForcedState::Disabled) => BreakerState::ForcedDisabled,
            None => BreakerState::Closed,
        };
        Ok(Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                state,
                ring: RingBitSet::new(config.ring_buffer_size_in_closed_state),
                opened_at: None,
                trial_calls: 0,
            }),
            config,
            not_permitted: AtomicU64::new(0),
            clock,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configuration this instance was built with.
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Checks whether a call may proceed.
    ///
    /// An open breaker whose wait has elapsed moves to `HalfOpen` here, and
    /// the triggering call becomes the first trial call.
    ///
    /// # Errors
    ///
    /// Breaks with [`Reason::CircuitOpen`] while open or out of trial calls.
    pub fn try_acquire_permission(&self) -> ControlFlow<Reason> {
        let mut inner = self.inner.lock();
        let permitted = match inner.state {
            BreakerState::Closed | BreakerState::ForcedDisabled => true,
            BreakerState::ForcedOpen => false,
            BreakerState::Open => {
                let waited = inner
                    .opened_at
                    .map(|at| self.clock.now().duration_since(at))
                    .unwrap_or_default();
                if waited >= self.config.wait_duration_in_open_state {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.trial_calls = 1;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_calls < self.config.ring_buffer_size_in_half_open_state {
                    inner.trial_calls += 1;
                    true
                } else {
                    false
                }
            }
        };

        if permitted {
            ControlFlow::Continue(())
        } else {
            self.not_permitted.fetch_add(1, Ordering::Relaxed);
            ControlFlow::Break(Reason::CircuitOpen(self.snapshot(&inner)))
        }
    }

    /// Gives back a permission that was acquired but never used.
    ///
    /// Nothing is recorded; a half-open trial slot is returned.
    pub fn release_permission(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.trial_calls = inner.trial_calls.saturating_sub(1);
        }
    }

    pub fn on_success(&self) {
        self.record(false);
    }

    pub fn on_failure(&self) {
        self.record(true);
    }

    fn record(&self, failure: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.ring.set_next(failure);
                if self.over_threshold(&inner) {
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                inner.ring.set_next(failure);
                if inner.ring.is_full() {
                    let next = if self.over_threshold(&inner) {
                        BreakerState::Open
                    } else {
                        BreakerState::Closed
                    };
                    self.transition(&mut inner, next);
                }
            }
            BreakerState::Open | BreakerState::ForcedOpen | BreakerState::ForcedDisabled => {}
        }
    }

    fn over_threshold(&self, inner: &Inner) -> bool {
        inner
            .ring
            .failure_rate()
            .is_some_and(|rate| rate >= self.config.failure_rate_threshold)
    }

    pub fn transition_to_forced_open(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, BreakerState::ForcedOpen);
    }

    pub fn transition_to_disabled(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, BreakerState::ForcedDisabled);
    }

    /// Leaves any state for a freshly buffered `Closed`.
    pub fn transition_to_closed(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, BreakerState::Closed);
    }

    /// Applies an operator state, `None` meaning "not forced".
    pub fn apply_forced_state(&self, forced: Option<ForcedState>) {
        match forced {
            Some(ForcedState::Open) => self.transition_to_forced_open(),
            Some(ForcedState::Disabled) => self.transition_to_disabled(),
            None if self.state().is_forced() => self.transition_to_closed(),
            None => {}
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        let from = inner.state;
        inner.state = to;
        inner.trial_calls = 0;
        match to {
            BreakerState::Closed => {
                inner.ring = RingBitSet::new(self.config.ring_buffer_size_in_closed_state);
                inner.opened_at = None;
            }
            BreakerState::HalfOpen => {
                inner.ring = RingBitSet::new(self.config.ring_buffer_size_in_half_open_state);
            }
            BreakerState::Open => {
                inner.opened_at = Some(self.clock.now());
            }
            BreakerState::ForcedOpen | BreakerState::ForcedDisabled => {
                inner.opened_at = None;
            }
        }
        if from != to {
            info!(breaker = %self.name, %from, %to, "circuit breaker state transition");
        }
    }

    pub fn metrics(&self) -> BreakerMetrics {
        self.snapshot(&self.inner.lock())
    }

    fn snapshot(&self, inner: &Inner) -> BreakerMetrics {
        BreakerMetrics {
            state: inner.state,
            failure_rate_threshold: self.config.failure_rate_threshold,
            failure_rate: inner.ring.failure_rate(),
            max_buffered_calls: inner.ring.size(),
            buffered_calls: inner.ring.length(),
            failed_calls: inner.ring.cardinality(),
            successful_calls: inner.ring.length() - inner.ring.cardinality(),
            not_permitted_calls: self.not_permitted.load(Ordering::Relaxed),
        }
    }
}
