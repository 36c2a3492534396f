//! # Moat Keeper
//!
//! `moat-keeper` guards calls to named resources with a per-resource pipeline
//! of admission checks ("moats"), a retry policy and a fallback.
//!
//! ## The Pipeline
//! Every resource (a method, one argument value of a method, or a group of
//! methods) owns a [`MoatCluster`] holding at most one moat of each kind,
//! tried in a fixed order:
//!
//! 1. **Concurrent**: caps calls in flight.
//! 2. **Circuit breaker**: fails fast while the resource is unhealthy.
//! 3. **Rate**: caps calls per refresh period.
//!
//! [`MoatKeeper::try_to_execute`] returns a [`Handle`]. An allowed handle
//! must be ended exactly once; ending leaves every moat that admitted the
//! call in reverse order, so each one sees the same outcome. A rejected
//! handle carries the cause and, when one applies, the fallback result.
//! [`MoatKeeper::execute`] and [`MoatKeeper::execute_async`] wrap the whole
//! protocol, including retries.
//!
//! ## Reconfiguration
//! Baselines are registered once through [`MoatKeeper::builder`]. A
//! [`ConfigSource`](config::ConfigSource) supplies overrides that a
//! [`ConfigRefresher`] pushes into every live moat on each tick: moats
//! configured by a baseline reset to it when their override goes away, and
//! moats created only by an override are deleted with it.
//!
//! ## Feature Flags
//!
//! - `axum`: Enables `IntoResponse` for [`MoatError`], allowing automatic
//!   conversion to HTTP status codes (429, 503, 500).

mod cache;
mod chain;
mod cluster;
pub mod config;
mod context;
mod error;
mod factory;
pub mod fallback;
mod handle;
mod keeper;
mod layer;
mod limit;
mod metrics;
pub mod moat;
mod refresh;
mod resource;
mod retry;
mod service;


pub use cache::MoatClusterCache;
pub use cache::RemovalCause;
pub use cache::RemovalListener;
pub use cluster::MoatCluster;
pub use context::Args;
pub use context::Context;
pub use error::MoatError;
pub use factory::Registries;
pub use handle::Handle;
pub use keeper::KeeperOptions;
pub use keeper::MoatKeeper;
pub use keeper::MoatKeeperBuilder;
pub use layer::MoatLayer;
pub use metrics::ClusterMetrics;
pub use refresh::ConfigRefresher;
pub use refresh::RefreshSummary;
pub use resource::ArgConfigKey;
pub use resource::ArgResourceId;
pub use resource::ArgValue;
pub use resource::ResourceId;
pub use retry::RetryExecutor;
pub use service::MoatService;
pub use service::ResponseFuture;

pub use moat_limit::BoxError;
pub use moat_limit::Reason;
pub use moat_limit::SharedError;
