use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use moat_limit::Reason;
use quanta::Clock;
use tracing::debug;

use crate::cluster::MoatCluster;
use crate::context::Context;
use crate::error::MoatError;
use crate::handle::Handle;
use crate::metrics::Instruments;
use crate::moat::Moat;
use crate::moat::MoatType;
use crate::moat::Permit;

type Entered = Vec<(Arc<dyn Moat>, Permit)>;

/// Enters the moats of `cluster` in admission order.
///
/// On the first rejection every moat already passed is exited in reverse
/// order.
fn pass(cluster: &MoatCluster, ctx: &Context) -> Result<Entered, Reason> {
    let moats = cluster.moats();
    let mut entered = Vec::with_capacity(moats.len());
    for moat in moats.iter() {
        match moat.try_through(ctx) {
            ControlFlow::Continue(permit) => entered.push((Arc::clone(moat), permit)),
            ControlFlow::Break(reason) => {
                for (moat, permit) in entered.into_iter().rev() {
                    moat.exit(ctx, permit);
                }
                return Err(reason);
            }
        }
    }
    Ok(entered)
}

fn reject(
    cluster: Arc<MoatCluster>,
    ctx: Context,
    reason: Reason,
    clock: &Clock,
    instruments: &Instruments,
) -> Handle {
    let kind = MoatType::of(&reason);
    debug!(resource = %ctx.resource_id(), moat = %kind, %reason, "call not permitted");
    instruments.rejected(ctx.resource_id(), kind);

    let cause = MoatError::NotPermitted {
        resource: ctx.resource_id().clone(),
        reason,
    };
    let fallback = cluster.fallback_for(&cause, ctx.args());
    if fallback.is_some() {
        instruments.fallback(ctx.resource_id());
    }
    Handle::not_allowed(
        ctx,
        cluster,
        cause,
        fallback,
        clock.clone(),
        instruments.clone(),
    )
}

/// Passes `ctx` through the moats of `cluster` in admission order.
///
/// A rejected handle carries the cause together with the fallback result,
/// if one applies.
pub(crate) fn try_to_execute(
    cluster: Arc<MoatCluster>,
    ctx: Context,
    clock: &Clock,
    instruments: &Instruments,
) -> Handle {
    match pass(&cluster, &ctx) {
        Ok(entered) => Handle::allowed(ctx, cluster, entered, clock.clone(), instruments.clone()),
        Err(reason) => reject(cluster, ctx, reason, clock, instruments),
    }
}

/// The async counterpart of [`try_to_execute`].
///
/// Moats never block the thread. A rate rejection whose next window opens
/// within `wait` sleeps on the tokio timer and passes the moats once more.
pub(crate) async fn try_to_execute_async(
    cluster: Arc<MoatCluster>,
    ctx: Context,
    wait: Duration,
    clock: &Clock,
    instruments: &Instruments,
) -> Handle {
    let ctx = ctx.without_blocking();
    let reason = match pass(&cluster, &ctx) {
        Ok(entered) => {
            return Handle::allowed(ctx, cluster, entered, clock.clone(), instruments.clone());
        }
        Err(reason) => reason,
    };
    let reason = match reason {
        Reason::RateOverflow(metrics) if !wait.is_zero() && metrics.retry_after <= wait => {
            tokio::time::sleep(metrics.retry_after).await;
            match pass(&cluster, &ctx) {
                Ok(entered) => {
                    return Handle::allowed(ctx, cluster, entered, clock.clone(), instruments.clone());
                }
                Err(reason) => reason,
            }
        }
        reason => reason,
    };
    reject(cluster, ctx, reason, clock, instruments)
}

#[cfg(test)]
mod tests {
    use moat_limit::ConcurrencyMetrics;
    use parking_lot::Mutex;

    use super::*;
    use crate::config::ConcurrentLimitConfig;
    use crate::config::ExternalConfig;
    use crate::moat::FondConfig;
    use crate::moat::LifeCycleType;
    use crate::moat::MoatMetrics;
    use crate::resource::ResourceId;

    type Events = Arc<Mutex<Vec<String>>>;

    #[derive(Debug)]
    struct Recording {
        kind: MoatType,
        resource: ResourceId,
        admit: bool,
        events: Events,
    }

    impl Moat for Recording {
        fn moat_type(&self) -> MoatType {
            self.kind
        }

        fn resource_id(&self) -> &ResourceId {
            &self.resource
        }

        fn try_through(&self, _ctx: &Context) -> ControlFlow<Reason, Permit> {
            self.events.lock().push(format!("enter {}", self.kind));
            if self.admit {
                ControlFlow::Continue(Permit::Rate)
            } else {
                ControlFlow::Break(Reason::ConcurrencyOverflow(ConcurrencyMetrics {
                    threshold: 0,
                    current_calls: 0,
                }))
            }
        }

        fn exit(&self, ctx: &Context, _permit: Permit) {
            let outcome = if ctx.is_executed() { "executed" } else { "rolled back" };
            self.events
                .lock()
                .push(format!("exit {} ({outcome})", self.kind));
        }

        fn refresh(&self, _external: Option<&ExternalConfig>) {}

        fn lifecycle_type(&self) -> LifeCycleType {
            LifeCycleType::Permanent
        }

        fn is_deleted(&self) -> bool {
            false
        }

        fn fond_config(&self) -> FondConfig {
            FondConfig::Concurrent(ConcurrentLimitConfig::new(0))
        }

        fn metrics(&self) -> MoatMetrics {
            MoatMetrics::Concurrent(ConcurrencyMetrics {
                threshold: 0,
                current_calls: 0,
            })
        }

        fn close(&self) {}
    }

    fn cluster(rejecting: Option<MoatType>, events: &Events) -> Arc<MoatCluster> {
        let id = ResourceId::method("m");
        let cluster = MoatCluster::new(id.clone(), None);
        // added out of order on purpose
        for kind in [MoatType::Rate, MoatType::Concurrent, MoatType::CircuitBreaker] {
            cluster.add_on_absence(Arc::new(Recording {
                kind,
                resource: id.clone(),
                admit: Some(kind) != rejecting,
                events: Arc::clone(events),
            }));
        }
        Arc::new(cluster)
    }

    fn run(rejecting: Option<MoatType>) -> (Handle, Events) {
        let events = Events::default();
        let handle = try_to_execute(
            cluster(rejecting, &events),
            Context::new(ResourceId::method("m")),
            &Clock::new(),
            &Instruments::default(),
        );
        (handle, events)
    }

    #[test]
    fn rejected_moat_is_never_exited() {
        let (handle, events) = run(Some(MoatType::CircuitBreaker));

        assert!(!handle.is_allowed());
        assert!(matches!(
            handle.not_allowed_cause(),
            Some(MoatError::NotPermitted { .. })
        ));
        assert_eq!(
            *events.lock(),
            vec![
                "enter concurrent",
                "enter circuit_breaker",
                "exit concurrent (rolled back)",
            ]
        );
    }

    #[test]
    fn admitted_moats_exit_once_in_reverse() {
        let (mut handle, events) = run(None);
        assert!(handle.is_allowed());

        handle.end_with_success().unwrap();
        assert!(matches!(
            handle.end_with_success(),
            Err(MoatError::IllegalState(_))
        ));
        drop(handle);

        assert_eq!(
            *events.lock(),
            vec![
                "enter concurrent",
                "enter circuit_breaker",
                "enter rate",
                "exit rate (executed)",
                "exit circuit_breaker (executed)",
                "exit concurrent (executed)",
            ]
        );
    }

    #[test]
    fn dropped_handle_rolls_back() {
        let (handle, events) = run(None);
        drop(handle);

        assert_eq!(
            events.lock()[3..].to_vec(),
            vec![
                "exit rate (rolled back)",
                "exit circuit_breaker (rolled back)",
                "exit concurrent (rolled back)",
            ]
        );
    }

    #[test]
    fn rejected_handle_cannot_be_ended() {
        let (mut handle, _events) = run(Some(MoatType::Concurrent));
        assert!(matches!(
            handle.end_with_error(Arc::new(std::fmt::Error)),
            Err(MoatError::IllegalState(_))
        ));
        assert!(matches!(
            handle.into_rejection::<()>(),
            Err(MoatError::NotPermitted { .. })
        ));
    }
}
