use std::error::Error;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use super::BreakerConfig;
use crate::ErrorSet;

/// What a finished call looked like to the breaker.
#[derive(Debug, Clone, Copy)]
pub struct Outcome<'a> {
    pub error: Option<&'a (dyn Error + 'static)>,
    pub spend_time: Duration,
}

impl<'a> Outcome<'a> {
    pub fn success(spend_time: Duration) -> Self {
        Self {
            error: None,
            spend_time,
        }
    }

    pub fn failure(error: &'a (dyn Error + 'static), spend_time: Duration) -> Self {
        Self {
            error: Some(error),
            spend_time,
        }
    }
}

/// Decides whether an [`Outcome`] counts as a success.
pub trait PredicateStrategy: Send + Sync + Debug {
    fn is_success(&self, outcome: &Outcome<'_>) -> bool;
}

/// Any error is a failure unless it is on the ignore-list.
#[derive(Debug, Clone, Default)]
pub struct PredicateByException {
    ignore: ErrorSet,
}

impl PredicateByException {
    pub fn new(ignore: ErrorSet) -> Self {
        Self { ignore }
    }
}

impl PredicateStrategy for PredicateByException {
    fn is_success(&self, outcome: &Outcome<'_>) -> bool {
        match outcome.error {
            None => true,
            Some(err) => self.ignore.matches(err),
        }
    }
}

/// A call is a success iff it finished within `max_spend_time`.
#[derive(Debug, Clone, Copy)]
pub struct PredicateBySpendTime {
    max_spend_time: Duration,
}

impl PredicateBySpendTime {
    pub fn new(max_spend_time: Duration) -> Self {
        Self { max_spend_time }
    }
}

impl PredicateStrategy for PredicateBySpendTime {
    fn is_success(&self, outcome: &Outcome<'_>) -> bool {
        outcome.spend_time <= self.max_spend_time
    }
}

/// Success only when every inner predicate agrees.
#[derive(Debug, Clone, Default)]
pub struct CompositePredicate {
    predicates: Vec<Arc<dyn PredicateStrategy>>,
}

impl CompositePredicate {
    pub fn new(predicates: Vec<Arc<dyn PredicateStrategy>>) -> Self {
        Self { predicates }
    }
}

impl PredicateStrategy for CompositePredicate {
    fn is_success(&self, outcome: &Outcome<'_>) -> bool {
        self.predicates.iter().all(|p| p.is_success(outcome))
    }
}

/// Builds the predicate a breaker config asks for.
pub fn predicate_for(config: &BreakerConfig) -> Arc<dyn PredicateStrategy> {
    let by_exception = PredicateByException::new(config.ignore_errors.clone());
    match config.max_spend_time {
        None => Arc::new(by_exception),
        Some(max) => Arc::new(CompositePredicate::new(vec![
            Arc::new(by_exception),
            Arc::new(PredicateBySpendTime::new(max)),
        ])),
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("not found")]
    struct NotFound;

    #[test]
    fn by_exception_honours_ignore_list() {
        let predicate = PredicateByException::new(ErrorSet::of::<NotFound>());
        let ignored = NotFound;
        let counted = io::Error::other("boom");

        assert!(predicate.is_success(&Outcome::success(Duration::ZERO)));
        assert!(predicate.is_success(&Outcome::failure(&ignored, Duration::ZERO)));
        assert!(!predicate.is_success(&Outcome::failure(&counted, Duration::ZERO)));
    }

    #[test]
    fn by_spend_time_compares_elapsed() {
        let predicate = PredicateBySpendTime::new(Duration::from_millis(10));

        assert!(predicate.is_success(&Outcome::success(Duration::from_millis(10))));
        assert!(!predicate.is_success(&Outcome::success(Duration::from_millis(11))));
    }

    #[test]
    fn config_with_spend_time_builds_conjunction() {
        let config = BreakerConfig::default().with_max_spend_time(Duration::from_millis(5));
        let predicate = predicate_for(&config);
        let err = io::Error::other("boom");

        assert!(predicate.is_success(&Outcome::success(Duration::from_millis(1))));
        assert!(!predicate.is_success(&Outcome::success(Duration::from_millis(6))));
        assert!(!predicate.is_success(&Outcome::failure(&err, Duration::from_millis(1))));
    }
}
