use std::any::Any;
use std::fmt;
use std::sync::Arc;

use moat_limit::SharedError;
use quanta::Clock;
use quanta::Instant;
use tracing::warn;

use crate::cluster::MoatCluster;
use crate::context::Context;
use crate::error::MoatError;
use crate::fallback;
use crate::fallback::FallbackValue;
use crate::metrics::Instruments;
use crate::moat::Moat;
use crate::moat::Permit;

enum State {
    Allowed {
        start: Instant,
    },
    NotAllowed {
        cause: MoatError,
        fallback: Option<Result<FallbackValue, MoatError>>,
    },
    Ended,
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Allowed { start } => f.debug_struct("Allowed").field("start", start).finish(),
            State::NotAllowed { cause, fallback } => f
                .debug_struct("NotAllowed")
                .field("cause", cause)
                .field("has_fallback", &fallback.is_some())
                .finish(),
            State::Ended => f.write_str("Ended"),
        }
    }
}

/// The outcome of an admission attempt.
///
/// An allowed handle must be ended exactly once with [`end_with_success`],
/// [`end_with_result`] or [`end_with_error`]; ending leaves every moat that
/// admitted the call, in reverse order. A handle dropped without being
/// ended leaves them too, without recording an outcome.
///
/// [`end_with_success`]: Self::end_with_success
/// [`end_with_result`]: Self::end_with_result
/// [`end_with_error`]: Self::end_with_error
#[derive(Debug)]
pub struct Handle {
    ctx: Context,
    cluster: Arc<MoatCluster>,
    entered: Vec<(Arc<dyn Moat>, Permit)>,
    state: State,
    clock: Clock,
    instruments: Instruments,
}

impl Handle {
    pub(crate) fn allowed(
        ctx: Context,
        cluster: Arc<MoatCluster>,
        entered: Vec<(Arc<dyn Moat>, Permit)>,
        clock: Clock,
        instruments: Instruments,
    ) -> Self {
        let start = clock.now();
        Self {
            ctx,
            cluster,
            entered,
            state: State::Allowed { start },
            clock,
            instruments,
        }
    }

    pub(crate) fn not_allowed(
        ctx: Context,
        cluster: Arc<MoatCluster>,
        cause: MoatError,
        fallback: Option<Result<FallbackValue, MoatError>>,
        clock: Clock,
        instruments: Instruments,
    ) -> Self {
        Self {
            ctx,
            cluster,
            entered: Vec::new(),
            state: State::NotAllowed { cause, fallback },
            clock,
            instruments,
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self.state, State::Allowed { .. })
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Why the call was rejected, for a handle that was not allowed.
    pub fn not_allowed_cause(&self) -> Option<&MoatError> {
        match &self.state {
            State::NotAllowed { cause, .. } => Some(cause),
            _ => None,
        }
    }

    /// The fallback computed at rejection, if the resource has an applicable one.
    pub fn take_fallback(&mut self) -> Option<Result<FallbackValue, MoatError>> {
        match &mut self.state {
            State::NotAllowed { fallback, .. } => fallback.take(),
            _ => None,
        }
    }

    /// Turns a rejection into the caller's result: the fallback value if
    /// there is one, the rejection cause otherwise.
    ///
    /// # Errors
    ///
    /// The fallback's error, the rejection cause, or
    /// [`MoatError::IllegalState`] for an allowed handle or a fallback value
    /// of another type.
    pub fn into_rejection<T: Any>(mut self) -> Result<T, MoatError> {
        let state = std::mem::replace(&mut self.state, State::Ended);
        match state {
            State::NotAllowed {
                fallback: Some(fallback),
                ..
            } => fallback.and_then(fallback::downcast),
            State::NotAllowed { cause, .. } => Err(cause),
            other => {
                self.state = other;
                Err(MoatError::IllegalState(
                    "handle was allowed, not rejected".to_owned(),
                ))
            }
        }
    }

    /// Recovers a failure of the admitted call through the resource's
    /// fallback, if one is configured and applies to business errors.
    pub fn recover(&self, err: &MoatError) -> Option<Result<FallbackValue, MoatError>> {
        let recovered = self.cluster.fallback_for(err, self.ctx.args());
        if recovered.is_some() {
            self.instruments.fallback(self.ctx.resource_id());
        }
        recovered
    }

    pub fn end_with_success(&mut self) -> Result<(), MoatError> {
        self.end(None, None)
    }

    /// Ends the call, keeping `value` on the context for the moats to read.
    pub fn end_with_result<T: Any + Send>(&mut self, value: T) -> Result<(), MoatError> {
        self.end(None, Some(Box::new(value)))
    }

    pub fn end_with_error(&mut self, err: SharedError) -> Result<(), MoatError> {
        self.end(Some(err), None)
    }

    fn end(
        &mut self,
        biz_error: Option<SharedError>,
        result: Option<Box<dyn Any + Send>>,
    ) -> Result<(), MoatError> {
        let start = match &self.state {
            State::Allowed { start } => *start,
            State::Ended => {
                return Err(MoatError::IllegalState(format!(
                    "repeat end of the handle for {}",
                    self.ctx.resource_id()
                )));
            }
            State::NotAllowed { .. } => {
                return Err(MoatError::IllegalState(format!(
                    "end of a handle for {} that was never allowed",
                    self.ctx.resource_id()
                )));
            }
        };
        self.state = State::Ended;
        let spend_time = self.clock.now().duration_since(start);
        self.ctx.mark_executed();
        self.ctx.record(spend_time, biz_error, result);
        self.exit_all();
        Ok(())
    }

    fn exit_all(&mut self) {
        for (moat, permit) in self.entered.drain(..).rev() {
            moat.exit(&self.ctx, permit);
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if let State::Allowed { .. } = self.state {
            warn!(resource = %self.ctx.resource_id(), "handle dropped without being ended");
            self.state = State::Ended;
            self.exit_all();
        }
    }
}
