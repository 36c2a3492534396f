use std::any::Any;
use std::sync::Arc;

use tower::Layer;

use crate::context::Args;
use crate::keeper::MoatKeeper;
use crate::resource::ResourceId;
use crate::service::MoatService;

/// Applies the moats of one resource to requests.
#[derive(Debug, Clone)]
pub struct MoatLayer {
    keeper: MoatKeeper,
    resource: ResourceId,
    args: Option<Arc<Args>>,
}

impl MoatLayer {
    /// Create a MoatLayer guarding `resource` with the clusters of `keeper`.
    pub fn new(keeper: MoatKeeper, resource: ResourceId) -> Self {
        MoatLayer {
            keeper,
            resource,
            args: None,
        }
    }

    /// Set the arguments handed to argument-aware fallbacks.
    ///
    /// They are shared by every service this layer builds.
    pub fn with_args<A: Any + Send + Sync>(mut self, args: A) -> Self {
        self.args = Some(Arc::new(args));
        self
    }
}

impl<S> Layer<S> for MoatLayer {
    type Service = MoatService<S>;

    fn layer(&self, service: S) -> Self::Service {
        MoatService::new(service, self.keeper.clone(), self.resource.clone())
            .with_shared_args(self.args.clone())
    }
}
