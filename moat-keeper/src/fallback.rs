//! Fallbacks: recovering a failed or rejected call into a value.
//!
//! A [`FallbackDispatcher`] holds handlers keyed by the cause they accept.
//! When a call fails, the most specific handler for the cause wins:
//!
//! 1. a handler that also takes the call's arguments beats one that takes
//!    only the cause;
//! 2. then the handler whose declared cause is the closest ancestor of the
//!    actual cause, following
//!    `CircuitBreaker | Rate | Concurrent -> NotPermitted -> Moat`,
//!    `RetryExhausted -> Moat`, and for business errors the `source()`
//!    chain depth of the matching [`ErrorMatcher`];
//! 3. then registration order.
//!
//! The candidate order for every moat category is computed once when the
//! dispatcher is built.

use std::any::Any;
use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use moat_limit::BoxError;
use moat_limit::ErrorMatcher;
use moat_limit::SharedError;

use crate::context::Args;
use crate::error::MoatError;
use crate::moat::MoatType;

/// A type-erased fallback result.
pub type FallbackValue = Box<dyn Any + Send>;

type HandlerFn =
    Arc<dyn Fn(Option<&Args>, &MoatError) -> Option<Result<FallbackValue, BoxError>> + Send + Sync>;

/// A node of the cause hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CauseCategory {
    CircuitBreaker,
    Rate,
    Concurrent,
    /// Any moat rejection.
    NotPermitted,
    RetryExhausted,
    /// Any rejection or exhausted retry.
    Moat,
    /// Any failure of the protected call itself.
    Biz,
}

impl CauseCategory {
    const LEAVES: [CauseCategory; 5] = [
        CauseCategory::CircuitBreaker,
        CauseCategory::Rate,
        CauseCategory::Concurrent,
        CauseCategory::RetryExhausted,
        CauseCategory::Biz,
    ];

    /// The leaf category of `err`; `None` for errors no fallback may recover.
    pub fn of(err: &MoatError) -> Option<Self> {
        match err {
            MoatError::NotPermitted { reason, .. } => Some(match MoatType::of(reason) {
                MoatType::CircuitBreaker => CauseCategory::CircuitBreaker,
                MoatType::Rate => CauseCategory::Rate,
                MoatType::Concurrent => CauseCategory::Concurrent,
            }),
            MoatError::RetryExhausted { .. } => Some(CauseCategory::RetryExhausted),
            MoatError::Biz(_) => Some(CauseCategory::Biz),
            MoatError::Interrupted { .. }
            | MoatError::IllegalState(_)
            | MoatError::Fallback(_) => None,
        }
    }

    fn parent(self) -> Option<Self> {
        match self {
            CauseCategory::CircuitBreaker | CauseCategory::Rate | CauseCategory::Concurrent => {
                Some(CauseCategory::NotPermitted)
            }
            CauseCategory::NotPermitted | CauseCategory::RetryExhausted => Some(CauseCategory::Moat),
            CauseCategory::Moat | CauseCategory::Biz => None,
        }
    }

    /// Steps from `self` up to `ancestor`, if it is one.
    fn distance_to(self, ancestor: CauseCategory) -> Option<usize> {
        let mut current = Some(self);
        let mut distance = 0;
        while let Some(category) = current {
            if category == ancestor {
                return Some(distance);
            }
            current = category.parent();
            distance += 1;
        }
        None
    }
}

/// The cause a fallback handler declares it accepts.
#[derive(Debug, Clone)]
pub enum CauseType {
    Category(CauseCategory),
    /// Business errors of one kind, anywhere in the `source()` chain.
    Biz(ErrorMatcher),
    Any,
}

impl CauseType {
    pub fn biz<E: std::error::Error + 'static>() -> Self {
        CauseType::Biz(ErrorMatcher::of::<E>())
    }

    /// Rank of this declaration against a leaf category, ignoring business
    /// error kinds.
    fn static_distance(&self, leaf: CauseCategory) -> Option<usize> {
        match self {
            CauseType::Category(category) => leaf.distance_to(*category),
            // resolved per error at dispatch time
            CauseType::Biz(_) => (leaf == CauseCategory::Biz).then_some(0),
            CauseType::Any => Some(usize::MAX),
        }
    }

    fn distance(&self, leaf: CauseCategory, err: &MoatError) -> Option<usize> {
        match (self, leaf, err) {
            (CauseType::Biz(matcher), CauseCategory::Biz, MoatError::Biz(cause)) => {
                matcher.depth_in(cause.as_ref())
            }
            (CauseType::Biz(_), _, _) => None,
            // a bare `Biz` category sits above every business error kind
            (CauseType::Category(CauseCategory::Biz), CauseCategory::Biz, _) => {
                Some(usize::MAX - 1)
            }
            _ => self.static_distance(leaf),
        }
    }
}

struct Candidate {
    cause: CauseType,
    with_args: bool,
    handler: HandlerFn,
}

impl fmt::Debug for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Candidate")
            .field("cause", &self.cause)
            .field("with_args", &self.with_args)
            .finish_non_exhaustive()
    }
}

/// Selects and runs the best fallback handler for a cause.
#[derive(Debug)]
pub struct FallbackDispatcher {
    candidates: Vec<Candidate>,
    /// Applicable candidate indexes per leaf category, best first.
    table: HashMap<CauseCategory, Vec<usize>>,
}

impl FallbackDispatcher {
    pub fn builder() -> FallbackDispatcherBuilder {
        FallbackDispatcherBuilder::default()
    }

    fn build_table(candidates: &[Candidate]) -> HashMap<CauseCategory, Vec<usize>> {
        CauseCategory::LEAVES
            .into_iter()
            .map(|leaf| {
                let mut ranked: Vec<(bool, usize, usize)> = candidates
                    .iter()
                    .enumerate()
                    .filter_map(|(index, candidate)| {
                        candidate
                            .cause
                            .static_distance(leaf)
                            .map(|distance| (!candidate.with_args, distance, index))
                    })
                    .collect();
                ranked.sort_unstable();
                (leaf, ranked.into_iter().map(|(_, _, index)| index).collect())
            })
            .collect()
    }

    /// Runs the best handler for `err`.
    ///
    /// Returns `None` when no handler accepts the cause, or every accepting
    /// handler needs arguments of a type the call did not carry.
    pub fn dispatch(
        &self,
        err: &MoatError,
        args: Option<&Args>,
    ) -> Option<Result<FallbackValue, MoatError>> {
        let leaf = CauseCategory::of(err)?;
        let applicable = self.table.get(&leaf)?;

        let mut ranked: Vec<(bool, usize, usize)> = applicable
            .iter()
            .filter_map(|&index| {
                let candidate = &self.candidates[index];
                candidate
                    .cause
                    .distance(leaf, err)
                    .map(|distance| (!candidate.with_args, distance, index))
            })
            .collect();
        if leaf == CauseCategory::Biz {
            ranked.sort_unstable();
        }

        ranked.into_iter().find_map(|(_, _, index)| {
            (self.candidates[index].handler)(args, err)
                .map(|result| result.map_err(|err| MoatError::Fallback(Arc::from(err))))
        })
    }
}

#[derive(Default)]
pub struct FallbackDispatcherBuilder {
    candidates: Vec<Candidate>,
}

impl fmt::Debug for FallbackDispatcherBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackDispatcherBuilder")
            .field("candidates", &self.candidates)
            .finish()
    }
}

impl FallbackDispatcherBuilder {
    /// Registers a handler taking only the cause.
    pub fn on<T, F>(mut self, cause: CauseType, handler: F) -> Self
    where
        T: Send + 'static,
        F: Fn(&MoatError) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        self.candidates.push(Candidate {
            cause,
            with_args: false,
            handler: Arc::new(move |_, err| {
                Some(handler(err).map(|value| Box::new(value) as FallbackValue))
            }),
        });
        self
    }

    /// Registers a handler that also rebinds the call's arguments.
    ///
    /// Skipped for calls whose arguments are not an `A`.
    pub fn on_with_args<A, T, F>(mut self, cause: CauseType, handler: F) -> Self
    where
        A: Any + Send + Sync,
        T: Send + 'static,
        F: Fn(&A, &MoatError) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        self.candidates.push(Candidate {
            cause,
            with_args: true,
            handler: Arc::new(move |args, err| {
                let args = args?.downcast_ref::<A>()?;
                Some(handler(args, err).map(|value| Box::new(value) as FallbackValue))
            }),
        });
        self
    }

    pub fn build(self) -> FallbackDispatcher {
        let table = FallbackDispatcher::build_table(&self.candidates);
        FallbackDispatcher {
            candidates: self.candidates,
            table,
        }
    }
}

/// What a resource falls back to.
#[derive(Clone)]
pub enum FallbackHandler {
    Function(Arc<FallbackDispatcher>),
    /// A fixed value, produced fresh for every call.
    Value(Arc<dyn Fn() -> FallbackValue + Send + Sync>),
    /// A fixed error, surfaced as [`MoatError::Fallback`].
    Error(SharedError),
}

impl fmt::Debug for FallbackHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackHandler::Function(dispatcher) => {
                f.debug_tuple("Function").field(dispatcher).finish()
            }
            FallbackHandler::Value(_) => f.write_str("Value(..)"),
            FallbackHandler::Error(err) => f.debug_tuple("Error").field(err).finish(),
        }
    }
}

impl FallbackHandler {
    pub fn function(dispatcher: FallbackDispatcher) -> Self {
        FallbackHandler::Function(Arc::new(dispatcher))
    }

    pub fn value<T: Clone + Send + Sync + 'static>(value: T) -> Self {
        FallbackHandler::Value(Arc::new(move || Box::new(value.clone()) as FallbackValue))
    }

    pub fn error<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        FallbackHandler::Error(Arc::new(err))
    }

    pub fn handle(
        &self,
        err: &MoatError,
        args: Option<&Args>,
    ) -> Option<Result<FallbackValue, MoatError>> {
        match self {
            FallbackHandler::Function(dispatcher) => dispatcher.dispatch(err, args),
            FallbackHandler::Value(make) => Some(Ok(make())),
            FallbackHandler::Error(err) => Some(Err(MoatError::Fallback(Arc::clone(err)))),
        }
    }
}

/// Whether a fallback may recover `err` at all.
///
/// Rejections and exhausted retries always qualify, business failures only
/// when the resource opted in.
pub fn is_applicable(err: &MoatError, apply_to_biz: bool) -> bool {
    match CauseCategory::of(err) {
        Some(CauseCategory::Biz) => apply_to_biz,
        Some(_) => true,
        None => false,
    }
}

/// Unboxes a fallback result as the type the caller expects.
pub fn downcast<T: Any>(value: FallbackValue) -> Result<T, MoatError> {
    value.downcast::<T>().map(|value| *value).map_err(|_| {
        MoatError::IllegalState(format!(
            "fallback value is not a {}",
            type_name::<T>()
        ))
    })
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::time::Duration;

    use moat_limit::ConcurrencyMetrics;
    use moat_limit::RateMetrics;
    use moat_limit::Reason;
    use moat_limit::breaker::BreakerState;
    use moat_limit::retry::Exhaustion;

    use super::*;
    use crate::resource::ResourceId;

    #[derive(Debug, thiserror::Error)]
    #[error("wrapped")]
    struct Wrapped(#[source] io::Error);

    fn rate() -> MoatError {
        MoatError::NotPermitted {
            resource: ResourceId::method("m"),
            reason: Reason::RateOverflow(RateMetrics {
                limit_for_period: 1,
                period: Duration::from_secs(1),
                available_permits: 0,
                waiting_threads: 0,
                retry_after: Duration::from_millis(300),
            }),
        }
    }

    fn concurrency() -> MoatError {
        MoatError::NotPermitted {
            resource: ResourceId::method("m"),
            reason: Reason::ConcurrencyOverflow(ConcurrencyMetrics {
                threshold: 1,
                current_calls: 1,
            }),
        }
    }

    fn label(result: Option<Result<FallbackValue, MoatError>>) -> &'static str {
        downcast::<&'static str>(result.unwrap().unwrap()).unwrap()
    }

    #[test]
    fn most_specific_category_wins() {
        let dispatcher = FallbackDispatcher::builder()
            .on(CauseType::Any, |_| Ok("any"))
            .on(CauseType::Category(CauseCategory::Moat), |_| Ok("moat"))
            .on(CauseType::Category(CauseCategory::NotPermitted), |_| {
                Ok("not permitted")
            })
            .on(CauseType::Category(CauseCategory::Rate), |_| Ok("rate"))
            .build();

        assert_eq!(label(dispatcher.dispatch(&rate(), None)), "rate");
        assert_eq!(label(dispatcher.dispatch(&concurrency(), None)), "not permitted");

        let exhausted = MoatError::RetryExhausted {
            resource: ResourceId::method("m"),
            attempts: 3,
            exhaustion: Exhaustion::MaxAttempts,
            cause: Arc::new(io::Error::other("boom")),
        };
        assert_eq!(label(dispatcher.dispatch(&exhausted, None)), "moat");

        let biz = MoatError::Biz(Arc::new(io::Error::other("boom")));
        assert_eq!(label(dispatcher.dispatch(&biz, None)), "any");
    }

    #[test]
    fn handlers_with_args_win_when_args_fit() {
        let dispatcher = FallbackDispatcher::builder()
            .on(CauseType::Category(CauseCategory::Rate), |_| Ok("cause only".to_owned()))
            .on_with_args::<u64, _, _>(CauseType::Category(CauseCategory::Moat), |id, _| {
                Ok(format!("order {id}"))
            })
            .build();

        let with_args: &Args = &7u64;
        let value = dispatcher.dispatch(&rate(), Some(with_args)).unwrap().unwrap();
        assert_eq!(downcast::<String>(value).unwrap(), "order 7");

        let wrong_args: &Args = &"seven";
        let value = dispatcher.dispatch(&rate(), Some(wrong_args)).unwrap().unwrap();
        assert_eq!(downcast::<String>(value).unwrap(), "cause only");
    }

    #[test]
    fn closest_biz_error_kind_wins() {
        let dispatcher = FallbackDispatcher::builder()
            .on(CauseType::Category(CauseCategory::Biz), |_| Ok("biz"))
            .on(CauseType::biz::<io::Error>(), |_| Ok("io"))
            .on(CauseType::biz::<Wrapped>(), |_| Ok("wrapped"))
            .build();

        let wrapped = MoatError::Biz(Arc::new(Wrapped(io::Error::other("boom"))));
        assert_eq!(label(dispatcher.dispatch(&wrapped, None)), "wrapped");

        let plain = MoatError::Biz(Arc::new(io::Error::other("boom")));
        assert_eq!(label(dispatcher.dispatch(&plain, None)), "io");

        let fmt = MoatError::Biz(Arc::new(fmt::Error));
        assert_eq!(label(dispatcher.dispatch(&fmt, None)), "biz");
    }

    #[test]
    fn unmatched_and_unrecoverable_causes_dispatch_nothing() {
        let dispatcher = FallbackDispatcher::builder()
            .on(CauseType::Category(CauseCategory::CircuitBreaker), |_| Ok(()))
            .build();
        assert!(dispatcher.dispatch(&rate(), None).is_none());

        let open = MoatError::NotPermitted {
            resource: ResourceId::method("m"),
            reason: Reason::CircuitOpen(moat_limit::BreakerMetrics {
                state: BreakerState::Open,
                failure_rate_threshold: 50.0,
                failure_rate: Some(100.0),
                max_buffered_calls: 2,
                buffered_calls: 2,
                failed_calls: 2,
                successful_calls: 0,
                not_permitted_calls: 1,
            }),
        };
        assert!(dispatcher.dispatch(&open, None).is_some());

        let any = FallbackDispatcher::builder().on(CauseType::Any, |_| Ok(())).build();
        assert!(any.dispatch(&MoatError::IllegalState("twice".into()), None).is_none());
    }

    #[test]
    fn failing_handlers_surface_as_fallback_errors() {
        let dispatcher = FallbackDispatcher::builder()
            .on::<(), _>(CauseType::Any, |_| Err("no luck".into()))
            .build();
        assert!(matches!(
            dispatcher.dispatch(&rate(), None),
            Some(Err(MoatError::Fallback(_)))
        ));

        let fixed = FallbackHandler::error(io::Error::other("down"));
        assert!(matches!(
            fixed.handle(&rate(), None),
            Some(Err(MoatError::Fallback(_)))
        ));
    }

    #[test]
    fn value_mismatch_is_illegal_state() {
        let handler = FallbackHandler::value(5u32);
        let value = handler.handle(&rate(), None).unwrap().unwrap();
        assert!(matches!(downcast::<String>(value), Err(MoatError::IllegalState(_))));
    }

    #[test]
    fn biz_failures_need_opt_in() {
        let biz = MoatError::Biz(Arc::new(io::Error::other("boom")));
        assert!(!is_applicable(&biz, false));
        assert!(is_applicable(&biz, true));
        assert!(is_applicable(&rate(), false));
    }
}
