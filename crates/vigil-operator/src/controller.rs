//! MonitoringAgent controller
//!
//! Each reconcile runs every enabled capability in turn on a private copy of
//! the agent, so an image status recorded by the first capability is seen by
//! the next. The first failure aborts the cycle and is handed to
//! [`error_policy`].

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use vigil_capability::{Capability, CapabilityReconciler, ClusterClient, RegistryClient};
use vigil_common::crd::MonitoringAgent;
use vigil_common::Error;

/// Requeue delay after an error that may clear up on its own
pub const RETRY_DELAY: Duration = Duration::from_secs(15);

/// Requeue delay after an error that needs an upstream fix
pub const BLOCKED_DELAY: Duration = Duration::from_secs(300);

/// Default interval between successful reconciles
pub const DEFAULT_REQUEUE_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Controller settings
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Resolve new gateway images from the registry
    pub enable_updates: bool,
    /// Interval between successful reconciles
    pub requeue_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            enable_updates: false,
            requeue_interval: DEFAULT_REQUEUE_INTERVAL,
        }
    }
}

/// Shared state for the controller
pub struct Context {
    reconcilers: Vec<CapabilityReconciler>,
    config: ControllerConfig,
}

impl Context {
    /// Create a context with a reconciler for every capability
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        registry: Arc<dyn RegistryClient>,
        config: ControllerConfig,
    ) -> Self {
        let reconcilers = Capability::all()
            .into_iter()
            .map(|capability| {
                CapabilityReconciler::new(
                    cluster.clone(),
                    registry.clone(),
                    capability,
                    config.enable_updates,
                )
            })
            .collect();
        Self {
            reconcilers,
            config,
        }
    }
}

/// Reconcile a MonitoringAgent
#[instrument(skip(agent, ctx), fields(agent = %agent.name_any()))]
pub async fn reconcile(agent: Arc<MonitoringAgent>, ctx: Arc<Context>) -> Result<Action, Error> {
    let mut agent = (*agent).clone();

    let mut changed = false;
    for reconciler in &ctx.reconcilers {
        let capability = reconciler.capability();
        if !capability.spec(&agent.spec).enabled {
            debug!(capability = %capability.kind, "capability disabled, skipping");
            continue;
        }
        changed |= reconciler.reconcile(&mut agent).await?;
    }

    if changed {
        info!("MonitoringAgent reconciled with changes");
    } else {
        debug!("MonitoringAgent up to date");
    }
    Ok(Action::requeue(ctx.config.requeue_interval))
}

/// Requeue delay for a failed reconcile
pub fn requeue_delay(error: &Error) -> Duration {
    if error.is_retryable() {
        RETRY_DELAY
    } else {
        BLOCKED_DELAY
    }
}

/// Error policy for the MonitoringAgent controller
pub fn error_policy(agent: Arc<MonitoringAgent>, error: &Error, _ctx: Arc<Context>) -> Action {
    let delay = requeue_delay(error);
    warn!(
        agent = %agent.name_any(),
        error = %error,
        retryable = error.is_retryable(),
        requeue_secs = delay.as_secs(),
        "MonitoringAgent reconcile failed"
    );
    Action::requeue(delay)
}
