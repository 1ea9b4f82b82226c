//! Capability descriptors
//!
//! A capability is one gateway role deployed as its own StatefulSet. The
//! variants differ only in data (module suffix, enable token, service
//! account owner) and in the post-build hooks they apply to the manifest.

use std::fmt;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::ContainerPort;

use vigil_common::crd::{CapabilitySpec, MonitoringAgentSpec};

use crate::statefulset::{CONTAINER_NAME, GATEWAY_PORT};

/// Prefix of default service account names
pub const SERVICE_ACCOUNT_PREFIX: &str = "vigil-";

/// Post-build edit applied to a manifest before it is fingerprinted
pub type ManifestHook = fn(&mut StatefulSet);

const ROUTING_HOOKS: &[ManifestHook] = &[expose_gateway_port];

/// Which capability of the agent spec a descriptor refers to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    /// Message routing through the gateway
    Routing,
    /// Kubernetes API monitoring
    KubernetesMonitoring,
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityKind::Routing => write!(f, "routing"),
            CapabilityKind::KubernetesMonitoring => write!(f, "kubernetes-monitoring"),
        }
    }
}

/// Static description of a capability
#[derive(Clone, Copy, Debug)]
pub struct Capability {
    /// Which spec section configures this capability
    pub kind: CapabilityKind,
    /// Suffix of the StatefulSet name and value of the `module` label
    pub module: &'static str,
    /// Token passed to the gateway to enable the capability
    pub capability_name: &'static str,
    /// Name used for the default service account and materialized secrets
    pub service_account_owner: &'static str,
    /// Edits applied after the manifest is built, in order
    pub hooks: &'static [ManifestHook],
}

impl Capability {
    /// Routing capability
    pub const fn routing() -> Self {
        Self {
            kind: CapabilityKind::Routing,
            module: "routing",
            capability_name: "MSGrouter",
            service_account_owner: "routing",
            hooks: ROUTING_HOOKS,
        }
    }

    /// Kubernetes monitoring capability
    pub const fn kubernetes_monitoring() -> Self {
        Self {
            kind: CapabilityKind::KubernetesMonitoring,
            module: "kubemon",
            capability_name: "kubernetes_monitoring",
            service_account_owner: "kubernetes-monitoring",
            hooks: &[],
        }
    }

    /// Every known capability
    pub const fn all() -> [Self; 2] {
        [Self::routing(), Self::kubernetes_monitoring()]
    }

    /// Settings for this capability in an agent spec
    pub fn spec<'a>(&self, agent: &'a MonitoringAgentSpec) -> &'a CapabilitySpec {
        match self.kind {
            CapabilityKind::Routing => &agent.routing,
            CapabilityKind::KubernetesMonitoring => &agent.kubernetes_monitoring,
        }
    }

    /// Name of this capability's StatefulSet for an agent
    pub fn statefulset_name(&self, agent_name: &str) -> String {
        format!("{agent_name}-{}", self.module)
    }

    /// Service account used when the agent does not override it
    pub fn default_service_account(&self) -> String {
        format!("{SERVICE_ACCOUNT_PREFIX}{}", self.service_account_owner)
    }
}

/// Declare the gateway's HTTPS port on the gateway container
fn expose_gateway_port(sts: &mut StatefulSet) {
    let Some(pod) = sts.spec.as_mut().and_then(|s| s.template.spec.as_mut()) else {
        return;
    };
    if let Some(container) = pod.containers.iter_mut().find(|c| c.name == CONTAINER_NAME) {
        container.ports.get_or_insert_with(Vec::new).push(ContainerPort {
            name: Some("https".to_string()),
            container_port: GATEWAY_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        });
    }
}
