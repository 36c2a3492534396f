use std::error::Error;

use super::RetryConfig;
use crate::ErrorSet;

/// Classifies failures as retryable.
///
/// With no filters everything is retryable. With only excludes, everything
/// not excluded is. With includes, only included errors that are not also
/// excluded are.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPredicate {
    max_attempts: u32,
    includes: ErrorSet,
    excludes: ErrorSet,
}

impl RetryPredicate {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            includes: config.includes.clone(),
            excludes: config.excludes.clone(),
        }
    }

    pub fn is_retryable(&self, err: &(dyn Error + 'static)) -> bool {
        let included = self.includes.is_empty() || self.includes.matches(err);
        included && !self.excludes.matches(err)
    }

    pub fn has_budget(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("transient")]
    struct Transient;

    fn predicate(includes: ErrorSet, excludes: ErrorSet) -> RetryPredicate {
        RetryPredicate::new(
            &RetryConfig::default()
                .with_includes(includes)
                .with_excludes(excludes),
        )
    }

    #[test]
    fn everything_is_retryable_by_default() {
        let p = predicate(ErrorSet::new(), ErrorSet::new());
        assert!(p.is_retryable(&Transient));
        assert!(p.is_retryable(&io::Error::other("x")));
    }

    #[test]
    fn excludes_alone_carve_out() {
        let p = predicate(ErrorSet::new(), ErrorSet::of::<io::Error>());
        assert!(p.is_retryable(&Transient));
        assert!(!p.is_retryable(&io::Error::other("x")));
    }

    #[test]
    fn includes_restrict_and_excludes_win() {
        let p = predicate(ErrorSet::of::<Transient>(), ErrorSet::new());
        assert!(p.is_retryable(&Transient));
        assert!(!p.is_retryable(&io::Error::other("x")));

        let p = predicate(ErrorSet::of::<Transient>(), ErrorSet::of::<Transient>());
        assert!(!p.is_retryable(&Transient));
    }

    #[test]
    fn budget_counts_every_attempt() {
        let p = RetryPredicate::new(&RetryConfig::default().with_max_attempts(2));
        assert!(p.has_budget(1));
        assert!(!p.has_budget(2));
    }
}
