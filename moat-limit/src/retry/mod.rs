//! Bounded retry with backoff.
//!
//! The first attempt never waits. Every failure is classified by a
//! [`RetryPredicate`]; a retryable failure with budget left backs off and
//! tries again, anything else ends the episode with a [`RetryError`].

mod backoff;
mod config;
mod executor;
mod predicate;

pub use backoff::BackoffPolicy;
pub use backoff::Interrupted;
pub use backoff::Sleeper;
pub use backoff::ThreadSleeper;
pub use config::BackoffConfig;
pub use config::RetryConfig;
pub use executor::Exhaustion;
pub use executor::RetryContext;
pub use executor::RetryError;
pub use executor::RetryMetrics;
pub use executor::RetryOperations;
pub use predicate::RetryPredicate;
