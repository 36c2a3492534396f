//! Moats: one admission rule for one resource.
//!
//! A call passes the moats of its cluster in ascending [`MoatType`] order and
//! leaves them in reverse. Every admitted moat hands out a [`Permit`] that is
//! given back to the same moat on exit, so an exit always reaches the limiter
//! or breaker instance that admitted the call, even if that instance has been
//! replaced in the meantime.

use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;

use moat_limit::BreakerMetrics;
use moat_limit::ConcurrencyLimiter;
use moat_limit::ConcurrencyMetrics;
use moat_limit::RateMetrics;
use moat_limit::Reason;
use moat_limit::breaker::BreakerConfig;
use moat_limit::breaker::CircuitBreaker;
use moat_limit::breaker::PredicateStrategy;

use crate::config::ConcurrentLimitConfig;
use crate::config::ExternalConfig;
use crate::config::RateLimitConfig;
use crate::context::Context;
use crate::resource::ResourceId;

mod breaker;
mod concurrent;
mod lifecycle;
mod rate;

pub use breaker::BreakerMoat;
pub use concurrent::ConcurrentMoat;
pub use lifecycle::LifeCycle;
pub use lifecycle::LifeCycleType;
pub use lifecycle::refresh;
pub use rate::RateMoat;

pub(crate) use lifecycle::ConfigState;

/// Moat kinds in admission order.
///
/// Concurrency comes first so that a call rejected further down never holds
/// a concurrency slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MoatType {
    Concurrent,
    CircuitBreaker,
    Rate,
}

impl MoatType {
    pub const ALL: [MoatType; 3] = [
        MoatType::Concurrent,
        MoatType::CircuitBreaker,
        MoatType::Rate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MoatType::Concurrent => "concurrent",
            MoatType::CircuitBreaker => "circuit_breaker",
            MoatType::Rate => "rate",
        }
    }

    /// The kind of moat that produced `reason`.
    pub fn of(reason: &Reason) -> Self {
        match reason {
            Reason::ConcurrencyOverflow(_) => MoatType::Concurrent,
            Reason::CircuitOpen(_) => MoatType::CircuitBreaker,
            Reason::RateOverflow(_) => MoatType::Rate,
        }
    }
}

impl fmt::Display for MoatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Proof of admission, returned to the moat that issued it.
#[derive(Debug)]
pub enum Permit {
    Concurrent(Arc<ConcurrencyLimiter>),
    CircuitBreaker {
        breaker: Arc<CircuitBreaker>,
        predicate: Arc<dyn PredicateStrategy>,
    },
    Rate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MoatMetrics {
    Concurrent(ConcurrencyMetrics),
    CircuitBreaker(BreakerMetrics),
    Rate(RateMetrics),
}

/// The fond config a moat currently runs on.
#[derive(Debug, Clone, PartialEq)]
pub enum FondConfig {
    Concurrent(ConcurrentLimitConfig),
    CircuitBreaker(BreakerConfig),
    Rate(RateLimitConfig),
}

/// One admission rule for one resource.
pub trait Moat: Send + Sync + fmt::Debug {
    fn moat_type(&self) -> MoatType;

    fn resource_id(&self) -> &ResourceId;

    /// Asks for admission.
    ///
    /// # Errors
    ///
    /// Breaks with the [`Reason`] of the rejection. A rejecting moat is never
    /// exited.
    fn try_through(&self, ctx: &Context) -> ControlFlow<Reason, Permit>;

    /// Leaves the moat with the permit it issued, reading the call's outcome
    /// from `ctx`.
    fn exit(&self, ctx: &Context, permit: Permit);

    /// Applies the latest override (or its absence).
    fn refresh(&self, external: Option<&ExternalConfig>);

    fn lifecycle_type(&self) -> LifeCycleType;

    /// Set once a temporary moat lost its override; the next sweep removes it.
    fn is_deleted(&self) -> bool;

    fn fond_config(&self) -> FondConfig;

    fn metrics(&self) -> MoatMetrics;

    /// Unregisters the moat's algorithm instance from its registry.
    fn close(&self);
}
