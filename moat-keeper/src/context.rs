use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use moat_limit::SharedError;

use crate::resource::ResourceId;

/// Type-erased arguments of a protected call, handed to fallbacks.
pub type Args = dyn Any + Send + Sync;

/// Per-call state carried through the moats.
///
/// Termination of a [`Handle`](crate::Handle) records the outcome here
/// before the moats are exited, so every moat judges the same outcome.
pub struct Context {
    resource_id: ResourceId,
    args: Option<Arc<Args>>,
    executed: bool,
    may_block: bool,
    spend_time: Duration,
    biz_error: Option<SharedError>,
    result: Option<Box<dyn Any + Send>>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("resource_id", &self.resource_id)
            .field("has_args", &self.args.is_some())
            .field("executed", &self.executed)
            .field("may_block", &self.may_block)
            .field("spend_time", &self.spend_time)
            .field("biz_error", &self.biz_error)
            .field("has_result", &self.result.is_some())
            .finish()
    }
}

impl Context {
    pub fn new(resource_id: ResourceId) -> Self {
        Self {
            resource_id,
            args: None,
            executed: false,
            may_block: true,
            spend_time: Duration::ZERO,
            biz_error: None,
            result: None,
        }
    }

    /// Attaches the call's arguments for fallbacks that rebind them.
    pub fn with_args<A: Any + Send + Sync>(mut self, args: A) -> Self {
        self.args = Some(Arc::new(args));
        self
    }

    pub(crate) fn with_shared_args(mut self, args: Arc<Args>) -> Self {
        self.args = Some(args);
        self
    }

    /// Admission of this call must not block the thread.
    pub(crate) fn without_blocking(mut self) -> Self {
        self.may_block = false;
        self
    }

    /// Whether a moat may block the calling thread during admission.
    pub fn may_block(&self) -> bool {
        self.may_block
    }

    pub fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }

    pub fn args(&self) -> Option<&Args> {
        self.args.as_deref()
    }

    /// Whether the call was admitted and ended with an outcome.
    pub fn is_executed(&self) -> bool {
        self.executed
    }

    pub fn spend_time(&self) -> Duration {
        self.spend_time
    }

    pub fn biz_error(&self) -> Option<&SharedError> {
        self.biz_error.as_ref()
    }

    pub fn result<T: Any>(&self) -> Option<&T> {
        self.result.as_ref().and_then(|result| result.downcast_ref())
    }

    pub(crate) fn mark_executed(&mut self) {
        self.executed = true;
    }

    pub(crate) fn record(
        &mut self,
        spend_time: Duration,
        biz_error: Option<SharedError>,
        result: Option<Box<dyn Any + Send>>,
    ) {
        self.spend_time = spend_time;
        self.biz_error = biz_error;
        self.result = result;
    }
}
