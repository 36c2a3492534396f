use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context as TaskContext;
use std::task::Poll;
use std::task::ready;

use moat_limit::SharedError;
use pin_project_lite::pin_project;
use tower::BoxError;
use tower::Service;

use crate::context::Args;
use crate::context::Context;
use crate::error::MoatError;
use crate::fallback;
use crate::handle::Handle;
use crate::keeper::MoatKeeper;
use crate::resource::ResourceId;

/// Guards an inner service with the moats of one resource.
///
/// Admission happens in `call` and never blocks: a rate moat rejects at
/// once instead of waiting for its next window. A rejected request never
/// reaches the inner service: it resolves to the fallback value when one
/// applies and to the boxed [`MoatError`] otherwise. An admitted request ends its handle when
/// the inner future completes; dropping the future releases the moats
/// without recording an outcome.
#[derive(Debug, Clone)]
pub struct MoatService<S> {
    inner: S,
    keeper: MoatKeeper,
    resource: ResourceId,
    args: Option<Arc<Args>>,
}

impl<S> MoatService<S> {
    pub fn new(inner: S, keeper: MoatKeeper, resource: ResourceId) -> Self {
        Self {
            inner,
            keeper,
            resource,
            args: None,
        }
    }

    /// Arguments handed to argument-aware fallbacks of every request.
    pub fn with_args<A: Any + Send + Sync>(mut self, args: A) -> Self {
        self.args = Some(Arc::new(args));
        self
    }

    pub(crate) fn with_shared_args(mut self, args: Option<Arc<Args>>) -> Self {
        self.args = args;
        self
    }

    fn context(&self) -> Context {
        let ctx = Context::new(self.resource.clone()).without_blocking();
        match &self.args {
            Some(args) => ctx.with_shared_args(Arc::clone(args)),
            None => ctx,
        }
    }
}

pin_project! {
    #[project = ResponseFutureProj]
    pub enum ResponseFuture<F, T> {
        Admitted {
            #[pin]
            inner: F,
            handle: Option<Handle>,
        },
        Rejected {
            outcome: Option<Result<T, MoatError>>,
        },
    }
}

impl<F, T, E> Future for ResponseFuture<F, T>
where
    F: Future<Output = Result<T, E>>,
    E: Into<BoxError>,
    T: Any,
{
    type Output = Result<T, BoxError>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        match self.project() {
            ResponseFutureProj::Rejected { outcome } => Poll::Ready(match outcome.take() {
                Some(outcome) => outcome.map_err(BoxError::from),
                None => Err(polled_after_completion()),
            }),
            ResponseFutureProj::Admitted { inner, handle } => {
                let result = ready!(inner.poll(cx));
                let Some(handle) = handle.take() else {
                    return Poll::Ready(Err(polled_after_completion()));
                };
                Poll::Ready(complete(handle, result.map_err(Into::into)))
            }
        }
    }
}

fn polled_after_completion() -> BoxError {
    Box::new(MoatError::IllegalState(
        "response future polled after completion".to_owned(),
    ))
}

fn complete<T: Any>(mut handle: Handle, result: Result<T, BoxError>) -> Result<T, BoxError> {
    match result {
        Ok(response) => {
            handle.end_with_success()?;
            Ok(response)
        }
        Err(err) => {
            let cause: SharedError = Arc::from(err);
            handle.end_with_error(Arc::clone(&cause))?;
            let err = MoatError::Biz(cause);
            match handle.recover(&err) {
                Some(recovered) => Ok(recovered.and_then(fallback::downcast)?),
                None => Err(Box::new(err)),
            }
        }
    }
}

impl<S, Req> Service<Req> for MoatService<S>
where
    S: Service<Req>,
    S::Error: Into<BoxError>,
    S::Response: Any,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = ResponseFuture<S::Future, S::Response>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let handle = self.keeper.try_to_execute(self.context());
        if !handle.is_allowed() {
            return ResponseFuture::Rejected {
                outcome: Some(handle.into_rejection()),
            };
        }
        ResponseFuture::Admitted {
            inner: self.inner.call(req),
            handle: Some(handle),
        }
    }
}
