//! A ring-buffer circuit breaker.
//!
//! The breaker moves between five states:
//!
//! * `Closed`: every call is permitted. Outcomes fill a ring buffer of the
//!   last `ring_buffer_size_in_closed_state` calls. Once the buffer is full and
//!   the failure rate reaches the threshold, the breaker opens.
//! * `Open`: every call is rejected until `wait_duration_in_open_state` has
//!   passed. The next admission check after that moves to `HalfOpen`.
//! * `HalfOpen`: up to `ring_buffer_size_in_half_open_state` trial calls are
//!   permitted. When their outcomes fill the buffer the breaker closes again
//!   or re-opens depending on the failure rate.
//! * `ForcedOpen` / `ForcedDisabled`: set by an operator. The former rejects
//!   everything, the latter permits everything and records nothing.
//!
//! Whether an outcome counts as a failure is decided by a
//! [`PredicateStrategy`].

mod config;
mod machine;
mod predicate;
mod ring_bit_set;
mod state;

pub use config::BreakerConfig;
pub use config::ForcedState;
pub use machine::BreakerMetrics;
pub use machine::CircuitBreaker;
pub use predicate::CompositePredicate;
pub use predicate::Outcome;
pub use predicate::PredicateByException;
pub use predicate::PredicateBySpendTime;
pub use predicate::PredicateStrategy;
pub use predicate::predicate_for;
pub use state::BreakerState;
