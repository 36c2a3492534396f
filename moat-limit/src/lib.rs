//! # moat-limit
//!
//! `moat-limit` provides the admission algorithms that sit underneath a moat:
//! concurrency limiting, fixed-window rate limiting, circuit breaking and
//! bounded retry.
//!
//! ## Core Philosophy
//!
//! Admission checks run on every protected call, so the limiters avoid locks
//! entirely: a concurrency permit is a single `fetch_add`, a rate permit is a
//! single compare-and-swap over a packed `(window, remaining)` word. The
//! circuit breaker is the one place that takes a short critical section,
//! because a state transition and its ring buffer must be observed together.
//!
//! ## Key Concepts
//!
//! * **Lazy Evaluation**: Windows refresh and open breakers half-open at the
//!   moment of the request. There are no background timers.
//! * **Injected Registries**: Limiters are shared by name through a
//!   [`Registry`] owned by the caller, never through process globals.
//! * **Typed Rejections**: Every rejection is a [`Reason`] carrying a metrics
//!   snapshot of the limiter that refused the call.
//!
//! ## Example
//!
//! ```rust
//! use moat_limit::ConcurrencyLimiter;
//!
//! let limiter = ConcurrencyLimiter::new("orders", 2);
//!
//! if limiter.acquire_permission().is_continue() {
//!     // Request allowed
//!     limiter.release();
//! }
//! ```

use std::error::Error;
use std::sync::Arc;

pub mod breaker;
mod concurrent;
mod errors;
mod rate;
mod registry;
pub mod retry;

pub use breaker::BreakerMetrics;
pub use concurrent::ConcurrencyLimiter;
pub use concurrent::ConcurrencyMetrics;
pub use errors::ErrorCatalog;
pub use errors::ErrorMatcher;
pub use errors::ErrorSet;
pub use rate::RateLimiter;
pub use rate::RateMetrics;
pub use registry::Registry;
pub use retry::RetryError;

/// An owned, type-erased error. Identical in shape to `tower::BoxError`.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// A shareable, type-erased error.
pub type SharedError = Arc<dyn Error + Send + Sync>;

/// Reasons why an admission check might reject a call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Reason {
    /// Too many calls are in flight.
    #[error("concurrency limit reached: {0}")]
    ConcurrencyOverflow(ConcurrencyMetrics),

    /// The current rate window has no permits left.
    #[error("rate limit reached: {0}")]
    RateOverflow(RateMetrics),

    /// The circuit breaker does not permit calls.
    #[error("circuit breaker rejected the call: {0}")]
    CircuitOpen(BreakerMetrics),
}

/// Invalid parameters for a limiter, breaker or retry policy.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("failure rate threshold must be within (0, 100], got {0}")]
    FailureRateThreshold(f32),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("multiplier must be at least 1.0, got {0}")]
    Multiplier(f64),
}
